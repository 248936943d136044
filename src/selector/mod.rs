//! The readiness selector: a `libc::poll(2)` loop over a flat array of
//! registered descriptors, grounded on `tokio-rs-mio`'s
//! `sys/unix/selector/poll.rs` backend.
//!
//! Unlike `mio`'s `Poll`/`Registry` split (which hands events back to the
//! caller as a batch to iterate), this selector dispatches inline: every
//! ready descriptor resolves its own armed waiter or re-invokes its own
//! continuous callback as part of the same `tick()` call.

mod wake_pipe;
pub mod registration;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::SokError;
use crate::interest::Direction;

use registration::{DirState, Registration, RegistrationInner};
use wake_pipe::WakePipe;

const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLRDHUP;
const WRITE_EVENTS: libc::c_short = libc::POLLOUT;
const ERROR_EVENTS: libc::c_short = libc::POLLERR | libc::POLLHUP;

pub(crate) struct SelectorInner {
    poll_fds: RefCell<Vec<libc::pollfd>>,
    fd_index: RefCell<HashMap<RawFd, usize>>,
    registry: RefCell<HashMap<RawFd, Rc<RegistrationInner>>>,
    wake: WakePipe,
}

impl SelectorInner {
    fn new() -> io::Result<Rc<SelectorInner>> {
        let wake = WakePipe::new()?;
        let poll_fds = vec![libc::pollfd {
            fd: wake.receiver_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        Ok(Rc::new(SelectorInner {
            poll_fds: RefCell::new(poll_fds),
            fd_index: RefCell::new(HashMap::new()),
            registry: RefCell::new(HashMap::new()),
            wake,
        }))
    }

    fn register(self_rc: &Rc<SelectorInner>, fd: RawFd) -> Registration {
        let inner = Rc::new(RegistrationInner {
            fd,
            selector: Rc::downgrade(self_rc),
            read: RefCell::new(DirState::Idle),
            write: RefCell::new(DirState::Idle),
            closed: std::cell::Cell::new(false),
            close_cause: RefCell::new(None),
        });

        let idx = {
            let mut poll_fds = self_rc.poll_fds.borrow_mut();
            let idx = poll_fds.len();
            poll_fds.push(libc::pollfd {
                fd,
                events: 0,
                revents: 0,
            });
            idx
        };
        self_rc.fd_index.borrow_mut().insert(fd, idx);
        self_rc.registry.borrow_mut().insert(fd, inner.clone());

        log::trace!("selector: registered fd {}", fd);
        Registration { inner }
    }

    fn set_interest(&self, fd: RawFd, direction: Direction, want: bool) {
        let idx = match self.fd_index.borrow().get(&fd) {
            Some(&idx) => idx,
            None => return,
        };
        let bit = match direction {
            Direction::Readable => READ_EVENTS,
            Direction::Writable => WRITE_EVENTS,
        };
        {
            let mut poll_fds = self.poll_fds.borrow_mut();
            if want {
                poll_fds[idx].events |= bit;
            } else {
                poll_fds[idx].events &= !bit;
            }
        }
        self.wake.notify();
    }

    fn deregister(&self, fd: RawFd) {
        let idx = match self.fd_index.borrow_mut().remove(&fd) {
            Some(idx) => idx,
            None => return,
        };
        self.registry.borrow_mut().remove(&fd);
        {
            let mut poll_fds = self.poll_fds.borrow_mut();
            poll_fds.swap_remove(idx);
            if let Some(moved) = poll_fds.get(idx) {
                self.fd_index.borrow_mut().insert(moved.fd, idx);
            }
        }
        self.wake.notify();
        log::trace!("selector: deregistered fd {}", fd);
    }

    /// Runs one iteration of the loop: block in `poll(2)` for up to
    /// `timeout`, then dispatch every ready descriptor. Returns once
    /// something has been dispatched, or the timeout has elapsed, or
    /// `EINTR` has been transparently retried.
    fn tick(&self, timeout: Option<Duration>) -> io::Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let timeout_ms: i32 = match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    remaining.as_millis().min(i32::MAX as u128) as i32
                }
                None => -1,
            };

            let n = {
                let mut poll_fds = self.poll_fds.borrow_mut();
                let res = unsafe {
                    libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as libc::nfds_t, timeout_ms)
                };
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                res
            };

            if n == 0 {
                return Ok(());
            }

            let woken = self.poll_fds.borrow()[0].revents != 0;
            if woken {
                self.wake.drain();
            }

            // Snapshot before dispatch: dispatch callbacks arm/disarm
            // interest and may add or remove registrations, which would
            // otherwise invalidate an in-progress iteration over poll_fds.
            let ready: Vec<(RawFd, libc::c_short)> = {
                let poll_fds = self.poll_fds.borrow();
                poll_fds
                    .iter()
                    .skip(1)
                    .filter(|p| p.revents != 0)
                    .map(|p| (p.fd, p.revents))
                    .collect()
            };

            for (fd, revents) in ready {
                let reg = match self.registry.borrow().get(&fd) {
                    Some(r) => r.clone(),
                    None => continue,
                };
                self.dispatch_fd(&reg, revents);
            }

            return Ok(());
        }
    }

    fn dispatch_fd(&self, reg: &Rc<RegistrationInner>, revents: libc::c_short) {
        if revents & ERROR_EVENTS != 0 {
            let pending_error = socket_error(reg.fd);
            let cause = SokError::from_hangup(pending_error);
            log::debug!("selector: fd {} hung up ({:?})", reg.fd, cause);
            Registration { inner: reg.clone() }.close(Some(cause));
            return;
        }
        if revents & libc::POLLIN != 0 {
            self.dispatch_direction(reg, Direction::Readable);
        }
        if revents & libc::POLLOUT != 0 {
            self.dispatch_direction(reg, Direction::Writable);
        }
    }

    /// Resolves whichever waiter is armed on `direction`. The armed state is
    /// always taken out of the cell (replaced with `Idle`) *before* a
    /// continuous callback runs: the callback may itself close the
    /// registration or re-arm this same direction, and either would
    /// deadlock against a `RefCell` borrow still held across the call.
    fn dispatch_direction(&self, reg: &Rc<RegistrationInner>, direction: Direction) {
        let cell = reg.dir_cell(direction);
        let state = std::mem::replace(&mut *cell.borrow_mut(), DirState::Idle);

        let (slot, mut cb, keep_going) = match state {
            DirState::Idle => return,
            DirState::OneShot(slot) => (slot, None, false),
            DirState::Continuous { mut cb, slot } => {
                let keep_going = cb();
                (slot, Some(cb), keep_going)
            }
        };

        if reg.closed.get() {
            // The callback closed the registration (or re-entrantly
            // triggered a close) while we held it out of the cell, so
            // `Registration::close`'s own sweep found this direction
            // already `Idle` and couldn't wake it. Do it here instead.
            let cause = reg.close_cause.borrow().clone().unwrap_or(SokError::Cancelled);
            let waker = {
                let mut s = slot.borrow_mut();
                s.result = Some(Err(cause));
                s.waker.take()
            };
            if let Some(w) = waker {
                w.wake();
            }
            return;
        }

        if keep_going {
            // Put the callback back, unless the callback itself already
            // armed a fresh state for this direction (e.g. by calling
            // `select`/`select_always` again), in which case that wins.
            let mut current = cell.borrow_mut();
            if matches!(&*current, DirState::Idle) {
                *current = DirState::Continuous {
                    cb: cb.take().expect("keep_going is only set for Continuous"),
                    slot,
                };
            }
            return;
        }

        self.set_interest(reg.fd, direction, false);
        let waker = {
            let mut s = slot.borrow_mut();
            s.result = Some(Ok(()));
            s.waker.take()
        };
        if let Some(w) = waker {
            w.wake();
        }
    }
}

pub(crate) fn socket_error(fd: RawFd) -> Option<i32> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret == 0 {
        Some(err)
    } else {
        None
    }
}

/// A cheaply-cloned handle to the selector; every clone shares the same
/// registry and poll array — one Selector per Runtime.
#[derive(Clone)]
pub struct Selector(Rc<SelectorInner>);

impl Selector {
    pub fn new() -> io::Result<Selector> {
        Ok(Selector(SelectorInner::new()?))
    }

    /// Registers `fd` (which must already be non-blocking) and returns a
    /// handle sockets use to suspend on its readiness.
    pub fn register(&self, fd: RawFd) -> Registration {
        SelectorInner::register(&self.0, fd)
    }

    pub(crate) fn tick(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.0.tick(timeout)
    }
}
