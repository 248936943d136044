pub mod listener;
pub mod stream;

pub use listener::{create_tcp_server_socket, TcpListener};
pub use stream::{create_tcp_client_socket, TcpStream};
