//! The single-threaded task scheduler that drives every suspending call in
//! this crate to completion.
//!
//! A `block_on` loop alternates between draining the ready queue and ticking
//! the Selector, expressed with native `Future`/`Waker` rather than a
//! hand-rolled waiting queue. Tasks are `Rc`-scheduled rather than
//! `Arc`+`std::task::Wake`: a `Task` is not `Send`, so moving a
//! `Registration` or a spawned future across threads is a compile error
//! instead of an unenforced runtime contract.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::selector::Selector;

type ReadyQueue = Rc<RefCell<VecDeque<Rc<Task>>>>;

struct Task {
    future: RefCell<Option<Pin<Box<dyn Future<Output = ()>>>>>,
    ready: ReadyQueue,
}

impl Task {
    fn schedule(self: &Rc<Task>) {
        self.ready.borrow_mut().push_back(self.clone());
    }

    fn run(self: &Rc<Task>) {
        let mut slot = self.future.borrow_mut();
        let mut fut = match slot.take() {
            Some(fut) => fut,
            None => return,
        };
        drop(slot);

        let waker = make_waker(self.clone());
        let mut cx = Context::from_waker(&waker);
        match fut.as_mut().poll(&mut cx) {
            Poll::Pending => *self.future.borrow_mut() = Some(fut),
            Poll::Ready(()) => {}
        }
    }
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

fn make_waker(task: Rc<Task>) -> Waker {
    unsafe { Waker::from_raw(raw_waker(task)) }
}

fn raw_waker(task: Rc<Task>) -> RawWaker {
    RawWaker::new(Rc::into_raw(task) as *const (), &VTABLE)
}

unsafe fn clone_raw(ptr: *const ()) -> RawWaker {
    let task = Rc::from_raw(ptr as *const Task);
    let cloned = task.clone();
    std::mem::forget(task);
    raw_waker(cloned)
}

unsafe fn wake_raw(ptr: *const ()) {
    let task = Rc::from_raw(ptr as *const Task);
    task.schedule();
}

unsafe fn wake_by_ref_raw(ptr: *const ()) {
    let task = Rc::from_raw(ptr as *const Task);
    task.schedule();
    std::mem::forget(task);
}

unsafe fn drop_raw(ptr: *const ()) {
    drop(Rc::from_raw(ptr as *const Task));
}

struct PromiseState<T> {
    value: Option<T>,
    waker: Option<Waker>,
}

/// The receiving half of a spawned background operation's result — what
/// `asynchronousRead`-style methods hand back instead of suspending the
/// caller. Grounded on the same shared-cell-plus-waker shape as
/// `Registration`'s `WaitSlot`, generalized to an arbitrary payload.
pub struct Promise<T> {
    state: Rc<RefCell<PromiseState<T>>>,
}

pub(crate) struct PromiseSetter<T> {
    state: Rc<RefCell<PromiseState<T>>>,
}

impl<T> Promise<T> {
    pub(crate) fn new_pair() -> (PromiseSetter<T>, Promise<T>) {
        let state = Rc::new(RefCell::new(PromiseState {
            value: None,
            waker: None,
        }));
        (PromiseSetter { state: state.clone() }, Promise { state })
    }
}

impl<T> PromiseSetter<T> {
    pub(crate) fn fulfill(self, value: T) {
        let mut s = self.state.borrow_mut();
        s.value = Some(value);
        if let Some(w) = s.waker.take() {
            w.wake();
        }
    }
}

impl<T> Future for Promise<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut s = self.state.borrow_mut();
        if let Some(value) = s.value.take() {
            return Poll::Ready(value);
        }
        s.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Owns the Selector and the ready queue. The single thread that drives all
/// scheduling is whichever thread calls [`Runtime::block_on`].
#[derive(Clone)]
pub struct Runtime {
    selector: Selector,
    ready: ReadyQueue,
}

impl Runtime {
    pub fn new() -> io::Result<Runtime> {
        Ok(Runtime {
            selector: Selector::new()?,
            ready: Rc::new(RefCell::new(VecDeque::new())),
        })
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Schedules `fut` to run on this runtime's executor without blocking
    /// the caller on its completion. Used for the per-socket writer task
    /// and for `bulk_read`'s background loop.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let task = Rc::new(Task {
            future: RefCell::new(Some(Box::pin(fut))),
            ready: self.ready.clone(),
        });
        self.ready.borrow_mut().push_back(task);
    }

    fn run_ready(&self) {
        loop {
            let task = self.ready.borrow_mut().pop_front();
            match task {
                Some(t) => t.run(),
                None => return,
            }
        }
    }

    /// Drives `fut` to completion on the calling thread, alternating
    /// between draining the ready queue and ticking the Selector whenever
    /// nothing is immediately runnable.
    pub fn block_on<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let result: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let wrapped = async move {
            let value = fut.await;
            *result2.borrow_mut() = Some(value);
        };
        self.spawn(wrapped);

        loop {
            self.run_ready();
            if let Some(value) = result.borrow_mut().take() {
                return value;
            }
            self.selector
                .tick(None)
                .expect("selector tick failed");
        }
    }
}
