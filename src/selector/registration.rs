//! `Registration` and its two suspending operations, `select`/`select_always`.
//!
//! The per-direction state machine below is expressed with `Future`s instead
//! of callbacks: arming a direction stores a waker (and, for
//! `select_always`, a callback) in a shared `WaitSlot`; the Selector's tick
//! resolves it from the other side by filling in `slot.result` and calling
//! `waker.wake()`. A waker is registered on first `WouldBlock` and resumed
//! on the next dispatch pass, keyed off one-shot vs. continuous state
//! instead of a single boolean.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use std::cell::Cell;
use std::os::unix::io::RawFd;

use crate::error::{SokError, SokResult};
use crate::interest::Direction;

use super::SelectorInner;

pub(crate) struct WaitSlot {
    pub(crate) waker: Option<Waker>,
    pub(crate) result: Option<Result<(), SokError>>,
}

pub(crate) enum DirState {
    Idle,
    OneShot(Rc<RefCell<WaitSlot>>),
    Continuous {
        cb: Box<dyn FnMut() -> bool>,
        slot: Rc<RefCell<WaitSlot>>,
    },
}

pub(crate) struct RegistrationInner {
    pub(crate) fd: RawFd,
    pub(crate) selector: Weak<SelectorInner>,
    pub(crate) read: RefCell<DirState>,
    pub(crate) write: RefCell<DirState>,
    pub(crate) closed: Cell<bool>,
    pub(crate) close_cause: RefCell<Option<SokError>>,
}

impl RegistrationInner {
    pub(crate) fn dir_cell(&self, direction: Direction) -> &RefCell<DirState> {
        match direction {
            Direction::Readable => &self.read,
            Direction::Writable => &self.write,
        }
    }
}

/// A registered, non-blocking file descriptor that sockets suspend on.
///
/// Cloning a `Registration` shares the same underlying fd/state; this is
/// how a TCP client socket hands both its reader half and its writer task
/// a handle to the same descriptor's readiness state, jointly owned.
#[derive(Clone)]
pub struct Registration {
    pub(crate) inner: Rc<RegistrationInner>,
}

impl Registration {
    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Suspends the calling task until `direction` becomes ready exactly
    /// once, or the registration is closed.
    pub fn select(&self, direction: Direction) -> Select<'_> {
        Select {
            reg: self,
            direction,
            slot: None,
        }
    }

    /// Suspends the calling task, re-invoking `cb` every time `direction`
    /// becomes ready, until `cb` returns `false`.
    pub fn select_always<F>(&self, direction: Direction, cb: F) -> SelectAlways<'_>
    where
        F: FnMut() -> bool + 'static,
    {
        SelectAlways {
            reg: self,
            direction,
            slot: None,
            cb: Some(Box::new(cb)),
        }
    }

    /// Tears the registration down: deregisters the fd from the Selector,
    /// then resolves every pending one-shot/continuous waiter on both
    /// directions with `cause` (defaulting to `NormalClose`). Idempotent.
    pub fn close(&self, cause: Option<SokError>) {
        if self.inner.closed.replace(true) {
            return;
        }
        let cause = cause.unwrap_or(SokError::NormalClose);
        *self.inner.close_cause.borrow_mut() = Some(cause.clone());

        if let Some(selector) = self.inner.selector.upgrade() {
            selector.deregister(self.inner.fd);
        }

        for direction in [Direction::Readable, Direction::Writable] {
            let cell = self.inner.dir_cell(direction);
            let previous = std::mem::replace(&mut *cell.borrow_mut(), DirState::Idle);
            let slot = match previous {
                DirState::Idle => None,
                DirState::OneShot(slot) => Some(slot),
                DirState::Continuous { slot, .. } => Some(slot),
            };
            if let Some(slot) = slot {
                let waker = {
                    let mut s = slot.borrow_mut();
                    s.result = Some(Err(cause.clone()));
                    s.waker.take()
                };
                if let Some(w) = waker {
                    w.wake();
                }
            }
        }
    }

    /// Arms `direction` with a single waiter, superseding whatever was
    /// previously armed on that direction.
    pub(crate) fn arm_oneshot(&self, direction: Direction, slot: Rc<RefCell<WaitSlot>>) {
        self.supersede(direction);
        *self.inner.dir_cell(direction).borrow_mut() = DirState::OneShot(slot);
        if let Some(selector) = self.inner.selector.upgrade() {
            selector.set_interest(self.inner.fd, direction, true);
        }
    }

    pub(crate) fn arm_continuous(
        &self,
        direction: Direction,
        cb: Box<dyn FnMut() -> bool>,
        slot: Rc<RefCell<WaitSlot>>,
    ) {
        self.supersede(direction);
        *self.inner.dir_cell(direction).borrow_mut() = DirState::Continuous { cb, slot };
        if let Some(selector) = self.inner.selector.upgrade() {
            selector.set_interest(self.inner.fd, direction, true);
        }
    }

    /// Resolves whatever was previously armed on `direction` with
    /// `Cancelled`: a later `select`/`select_always` call on the same
    /// direction supersedes whatever was armed before it.
    fn supersede(&self, direction: Direction) {
        let cell = self.inner.dir_cell(direction);
        let previous = std::mem::replace(&mut *cell.borrow_mut(), DirState::Idle);
        let slot = match previous {
            DirState::Idle => None,
            DirState::OneShot(slot) => Some(slot),
            DirState::Continuous { slot, .. } => Some(slot),
        };
        if let Some(slot) = slot {
            let waker = {
                let mut s = slot.borrow_mut();
                s.result = Some(Err(SokError::Cancelled));
                s.waker.take()
            };
            if let Some(w) = waker {
                w.wake();
            }
        }
    }

    /// Cancels a one-shot waiter on `drop`, but only if it's still the
    /// current armed waiter for that direction (it may have already been
    /// resolved, or superseded by a later call).
    fn cancel_oneshot_if_current(&self, direction: Direction, slot: &Rc<RefCell<WaitSlot>>) {
        if self.inner.closed.get() {
            return;
        }
        let cell = self.inner.dir_cell(direction);
        let mut state = cell.borrow_mut();
        let is_current = matches!(&*state, DirState::OneShot(s) if Rc::ptr_eq(s, slot));
        if is_current {
            *state = DirState::Idle;
            drop(state);
            if let Some(selector) = self.inner.selector.upgrade() {
                selector.set_interest(self.inner.fd, direction, false);
            }
        }
    }

    fn cancel_continuous_if_current(&self, direction: Direction, slot: &Rc<RefCell<WaitSlot>>) {
        if self.inner.closed.get() {
            return;
        }
        let cell = self.inner.dir_cell(direction);
        let mut state = cell.borrow_mut();
        let is_current = matches!(&*state, DirState::Continuous { slot: s, .. } if Rc::ptr_eq(s, slot));
        if is_current {
            *state = DirState::Idle;
            drop(state);
            if let Some(selector) = self.inner.selector.upgrade() {
                selector.set_interest(self.inner.fd, direction, false);
            }
        }
    }
}

/// The future returned by [`Registration::select`].
pub struct Select<'a> {
    reg: &'a Registration,
    direction: Direction,
    slot: Option<Rc<RefCell<WaitSlot>>>,
}

impl<'a> Future for Select<'a> {
    type Output = SokResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(slot) = &this.slot {
            let mut s = slot.borrow_mut();
            if let Some(result) = s.result.take() {
                return Poll::Ready(result);
            }
            s.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        if this.reg.inner.closed.get() {
            let cause = this
                .reg
                .inner
                .close_cause
                .borrow()
                .clone()
                .unwrap_or(SokError::Cancelled);
            return Poll::Ready(Err(cause));
        }

        let slot = Rc::new(RefCell::new(WaitSlot {
            waker: Some(cx.waker().clone()),
            result: None,
        }));
        this.reg.arm_oneshot(this.direction, slot.clone());
        this.slot = Some(slot);
        Poll::Pending
    }
}

impl<'a> Drop for Select<'a> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if slot.borrow().result.is_none() {
                self.reg.cancel_oneshot_if_current(self.direction, &slot);
            }
        }
    }
}

/// The future returned by [`Registration::select_always`].
pub struct SelectAlways<'a> {
    reg: &'a Registration,
    direction: Direction,
    slot: Option<Rc<RefCell<WaitSlot>>>,
    cb: Option<Box<dyn FnMut() -> bool>>,
}

impl<'a> Future for SelectAlways<'a> {
    type Output = SokResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(slot) = &this.slot {
            let mut s = slot.borrow_mut();
            if let Some(result) = s.result.take() {
                return Poll::Ready(result);
            }
            s.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        if this.reg.inner.closed.get() {
            let cause = this
                .reg
                .inner
                .close_cause
                .borrow()
                .clone()
                .unwrap_or(SokError::Cancelled);
            return Poll::Ready(Err(cause));
        }

        let slot = Rc::new(RefCell::new(WaitSlot {
            waker: Some(cx.waker().clone()),
            result: None,
        }));
        let cb = this.cb.take().expect("SelectAlways polled after arming without a slot");
        this.reg.arm_continuous(this.direction, cb, slot.clone());
        this.slot = Some(slot);
        Poll::Pending
    }
}

impl<'a> Drop for SelectAlways<'a> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if slot.borrow().result.is_none() {
                self.reg.cancel_continuous_if_current(self.direction, &slot);
            }
        }
    }
}
