//! A per-rank work queue drained through a user work function at every
//! barrier.
//!
//! Inserts are purely local. The first insert since the last drain
//! registers a pre-barrier callback; when the rank next enters a barrier,
//! the callback drains the queue through the work function. The work
//! function may insert more items (processed in the same drain) or ship
//! items to other ranks with [`Comm::async_to`] plus a
//! [`WorkQueueHandle`] (processed there before the same barrier releases,
//! courtesy of the barrier's quiescence loop).

use crate::comm::{Comm, MirrorPtr};
use crate::container::policy::{Comparator, Fifo, Lifo, NaturalOrder, Priority, QueuePolicy};
use std::cell::RefCell;
use std::rc::Rc;

/// Work queue ordered by the policy `P`.
///
/// No `Clone`: a queue is owned by its rank. A collective `size()` is
/// deliberately absent (ambiguous while items are in flight), as is `swap`
/// (it would require a matched collective on every rank).
pub struct WorkQueue<T, P: QueuePolicy<T>> {
    comm: Comm,
    inner: Rc<RefCell<Inner<T, P>>>,
    ptr: MirrorPtr<Inner<T, P>>,
    owned: bool,
}

struct Inner<T, P: QueuePolicy<T>> {
    queue: P,
    work_fn: Rc<dyn Fn(&WorkQueue<T, P>, T)>,
    callback_registered: bool,
}

/// Removal in insertion order.
pub type FifoWorkQueue<T> = WorkQueue<T, Fifo<T>>;
/// Removal in reverse insertion order.
pub type LifoWorkQueue<T> = WorkQueue<T, Lifo<T>>;
/// Removal in comparator order (maximum first).
pub type PriorityWorkQueue<T, C = NaturalOrder> = WorkQueue<T, Priority<T, C>>;

impl<T: 'static> WorkQueue<T, Fifo<T>> {
    pub fn fifo(comm: &Comm, work_fn: impl Fn(&Self, T) + 'static) -> Self {
        Self::with_policy(comm, work_fn)
    }
}

impl<T: 'static> WorkQueue<T, Lifo<T>> {
    pub fn lifo(comm: &Comm, work_fn: impl Fn(&Self, T) + 'static) -> Self {
        Self::with_policy(comm, work_fn)
    }
}

impl<T: 'static, C: Comparator<T> + 'static> WorkQueue<T, Priority<T, C>> {
    pub fn priority(comm: &Comm, work_fn: impl Fn(&Self, T) + 'static) -> Self {
        Self::with_policy(comm, work_fn)
    }
}

impl<T: 'static, P: QueuePolicy<T> + 'static> WorkQueue<T, P> {
    /// Construct a queue with an explicit policy type.
    ///
    /// Collective: every rank must construct its replica in the same order
    /// relative to other mirrored objects.
    pub fn with_policy(comm: &Comm, work_fn: impl Fn(&Self, T) + 'static) -> Self {
        tracing::info!(rank = comm.rank(), "creating work queue");
        let inner = Rc::new(RefCell::new(Inner {
            queue: P::default(),
            work_fn: Rc::new(work_fn),
            callback_registered: false,
        }));
        let ptr = comm.mirror(Rc::clone(&inner));
        Self {
            comm: comm.clone(),
            inner,
            ptr,
            owned: true,
        }
    }

    /// Insert a work item into the local queue. Registers the pre-barrier
    /// processing callback on the first insert of a batch; never
    /// communicates.
    pub fn local_insert(&self, item: T) {
        let register = {
            let mut inner = self.inner.borrow_mut();
            inner.queue.push(item);
            !std::mem::replace(&mut inner.callback_registered, true)
        };
        if register {
            let ptr = self.ptr;
            self.comm.register_pre_barrier_callback(move |comm| {
                let queue = WorkQueueHandle { ptr }.bind(comm);
                queue.local_process_all();
                queue.inner.borrow_mut().callback_registered = false;
            });
        }
    }

    /// Drain the local queue through the work function, in policy order.
    ///
    /// Items the work function inserts during the drain are processed by
    /// the same drain; the loop exits only once the queue is empty. Does
    /// not communicate and does not barrier.
    pub fn local_process_all(&self) {
        let work_fn = Rc::clone(&self.inner.borrow().work_fn);
        loop {
            let item = self.inner.borrow_mut().queue.pop();
            match item {
                Some(item) => (*work_fn)(self, item),
                None => break,
            }
        }
    }

    /// Whether the local queue holds pending work.
    pub fn local_has_work(&self) -> bool {
        !self.inner.borrow().queue.is_empty()
    }

    /// Number of pending items in the local queue.
    pub fn local_size(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Discard pending local items without invoking the work function.
    ///
    /// The explicit escape hatch for dropping a queue that still holds
    /// work.
    pub fn local_clear(&self) {
        self.inner.borrow_mut().queue = P::default();
    }

    /// Collective clear: discard local items everywhere, then barrier.
    pub fn clear(&self) {
        self.local_clear();
        self.comm.barrier();
    }

    /// Token for enqueueing on this queue's replica from an active message.
    pub fn handle(&self) -> WorkQueueHandle<T, P> {
        WorkQueueHandle { ptr: self.ptr }
    }

    /// The communicator this queue is bound to.
    pub fn comm(&self) -> &Comm {
        &self.comm
    }
}

impl<T, P: QueuePolicy<T>> Drop for WorkQueue<T, P> {
    /// Dropping the owning handle is collective: a final barrier drains
    /// anything still in flight, then an always-on assert enforces that
    /// unfinished work is a program bug (`local_clear()` first to discard
    /// deliberately).
    fn drop(&mut self) {
        if !self.owned || std::thread::panicking() {
            return;
        }
        tracing::info!(rank = self.comm.rank(), "destroying work queue");
        self.comm.barrier();
        let leftover = self.inner.borrow().queue.len();
        assert!(
            leftover == 0,
            "rank {}: work queue dropped with {leftover} unprocessed items \
             (call local_clear() to discard)",
            self.comm.rank()
        );
        self.comm.unmirror(self.ptr);
    }
}

/// `Copy + Send` token resolving to the receiving rank's replica of a work
/// queue. Capture it into an active message and [`bind`](Self::bind) it on
/// arrival.
pub struct WorkQueueHandle<T, P: QueuePolicy<T>> {
    ptr: MirrorPtr<Inner<T, P>>,
}

impl<T, P: QueuePolicy<T>> Clone for WorkQueueHandle<T, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, P: QueuePolicy<T>> Copy for WorkQueueHandle<T, P> {}

impl<T: 'static, P: QueuePolicy<T> + 'static> WorkQueueHandle<T, P> {
    /// Reconstruct a (non-owning) queue bound to `comm`'s rank.
    pub fn bind(&self, comm: &Comm) -> WorkQueue<T, P> {
        WorkQueue {
            comm: comm.clone(),
            inner: comm.resolve(self.ptr),
            ptr: self.ptr,
            owned: false,
        }
    }
}
