//! A self-wake pipe, used to interrupt a blocked `poll(2)` call whenever a
//! registration's interest changes from another task on the same thread.
//!
//! Grounded on `tokio-rs-mio`'s `sys/unix/waker/pipe.rs`: a unix pipe with
//! both ends non-blocking, `notify()` writes one byte, `drain()` empties
//! whatever accumulated before the next tick.

use std::io;
use std::os::unix::io::RawFd;

pub(crate) struct WakePipe {
    sender: RawFd,
    receiver: RawFd,
}

impl WakePipe {
    pub(crate) fn new() -> io::Result<WakePipe> {
        let mut fds: [RawFd; 2] = [0, 0];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let [receiver, sender] = fds;
        set_nonblocking(receiver)?;
        set_nonblocking(sender)?;
        Ok(WakePipe { sender, receiver })
    }

    pub(crate) fn receiver_fd(&self) -> RawFd {
        self.receiver
    }

    /// Writes one byte, waking a blocked `poll(2)` call. Safe to call from
    /// anywhere on the owning thread; a full pipe buffer is not an error,
    /// since it just means a wake-up is already pending.
    pub(crate) fn notify(&self) {
        let byte: u8 = 1;
        unsafe {
            libc::write(self.sender, &byte as *const u8 as *const libc::c_void, 1);
        }
    }

    /// Drains whatever accumulated since the last tick.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.receiver, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.sender);
            libc::close(self.receiver);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
