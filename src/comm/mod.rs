//! The per-rank communicator: identity, active messages, and the
//! quiescence barrier.
//!
//! Every rank owns exactly one [`Comm`]. All user code, pre-barrier
//! callbacks, and incoming active messages run on the rank's own thread;
//! the only suspension points are collective calls. A `Comm` is cheap to
//! clone and deliberately not `Send` — cross-rank traffic goes through
//! [`Comm::async_to`], never by sharing the handle.

mod registry;
pub mod world;

pub use registry::MirrorPtr;

use crate::types::Rank;
use crossbeam_channel::{Receiver, Sender};
use registry::ObjectPool;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// An active message: executed once on the destination rank, with that
/// rank's communicator.
pub(crate) type Envelope = Box<dyn FnOnce(&Comm) + Send + 'static>;

type PreBarrierCallback = Box<dyn FnOnce(&Comm) + 'static>;

/// Panic message used when a failed rank poisons the rendezvous; the world
/// launcher filters these out when picking the primary failure to report.
pub(crate) const POISONED: &str = "collective rendezvous poisoned by a failed rank";

/// Reusable sense-counting barrier with poisoning.
///
/// `std::sync::Barrier` cannot wake peers when a rank dies mid-run; this
/// one can, so a single failed assertion unwinds the whole world instead of
/// deadlocking it.
pub(crate) struct Rendezvous {
    state: Mutex<RendezvousState>,
    cv: Condvar,
    n: usize,
}

struct RendezvousState {
    arrived: usize,
    generation: u64,
    poisoned: bool,
}

impl Rendezvous {
    fn new(n: usize) -> Self {
        Self {
            state: Mutex::new(RendezvousState {
                arrived: 0,
                generation: 0,
                poisoned: false,
            }),
            cv: Condvar::new(),
            n,
        }
    }

    pub(crate) fn wait(&self) {
        let mut state = self.state.lock().expect("rendezvous mutex");
        if state.poisoned {
            drop(state);
            panic!("{POISONED}");
        }
        state.arrived += 1;
        if state.arrived == self.n {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cv.notify_all();
            return;
        }
        let generation = state.generation;
        while state.generation == generation && !state.poisoned {
            state = self.cv.wait(state).expect("rendezvous mutex");
        }
        if state.poisoned {
            drop(state);
            panic!("{POISONED}");
        }
    }

    pub(crate) fn poison(&self) {
        let mut state = self.state.lock().expect("rendezvous mutex");
        state.poisoned = true;
        self.cv.notify_all();
    }
}

/// State shared by every rank of one world.
pub(crate) struct Shared {
    pub(crate) senders: Vec<Sender<Envelope>>,
    /// Messages handed to `async_to` across the whole world.
    pub(crate) sent: AtomicU64,
    /// Messages executed across the whole world.
    pub(crate) delivered: AtomicU64,
    pub(crate) rendezvous: Rendezvous,
    /// One deposit slot per rank for collective exchanges.
    pub(crate) slots: Mutex<Vec<Option<Box<dyn Any + Send>>>>,
}

impl Shared {
    pub(crate) fn new(senders: Vec<Sender<Envelope>>) -> Self {
        let n = senders.len();
        let mut slots = Vec::with_capacity(n);
        slots.resize_with(n, || None);
        Self {
            senders,
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            rendezvous: Rendezvous::new(n),
            slots: Mutex::new(slots),
        }
    }
}

/// Rank-local state; never leaves the rank's thread.
struct RankLocal {
    mailbox: Receiver<Envelope>,
    objects: RefCell<ObjectPool>,
    callbacks: RefCell<Vec<PreBarrierCallback>>,
    barrier_epoch: Cell<u64>,
}

/// Handle to one rank of a running world.
#[derive(Clone)]
pub struct Comm {
    rank: Rank,
    size: u32,
    shared: Arc<Shared>,
    local: Rc<RankLocal>,
}

impl Comm {
    pub(crate) fn new(rank: Rank, size: u32, shared: Arc<Shared>, mailbox: Receiver<Envelope>) -> Self {
        Self {
            rank,
            size,
            shared,
            local: Rc::new(RankLocal {
                mailbox,
                objects: RefCell::new(ObjectPool::new()),
                callbacks: RefCell::new(Vec::new()),
                barrier_epoch: Cell::new(0),
            }),
        }
    }

    /// This rank's id, in `0..size()`.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks in the world.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Convenience predicate for "am I rank 0".
    pub fn rank0(&self) -> bool {
        self.rank == 0
    }

    /// Fire-and-forget active message to `dest` (which may be this rank).
    ///
    /// The closure runs on the destination rank's thread, with the
    /// destination's communicator, before the destination's next barrier
    /// completes. Messages from one sender to one receiver are executed in
    /// send order; nothing is guaranteed across sender pairs.
    ///
    /// Active messages must not issue collective calls.
    pub fn async_to<F>(&self, dest: Rank, message: F)
    where
        F: FnOnce(&Comm) + Send + 'static,
    {
        assert!(
            dest < self.size,
            "rank {}: active-message destination {dest} out of range (world size {})",
            self.rank,
            self.size
        );
        self.shared.sent.fetch_add(1, Ordering::SeqCst);
        self.shared.senders[dest as usize]
            .send(Box::new(message))
            .expect("destination mailbox closed");
    }

    /// Install a callback to run on this rank during the next barrier,
    /// before quiescence is tested. Consumed once; re-register to run at a
    /// later barrier. Callbacks may send active messages and register
    /// further callbacks; the barrier keeps cycling until no rank produces
    /// new work.
    pub fn register_pre_barrier_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Comm) + 'static,
    {
        self.local.callbacks.borrow_mut().push(Box::new(callback));
    }

    /// Execute everything currently in the mailbox. Returns the number of
    /// messages executed.
    fn drain_mailbox(&self) -> usize {
        let mut drained = 0;
        while let Ok(envelope) = self.local.mailbox.try_recv() {
            envelope(self);
            self.shared.delivered.fetch_add(1, Ordering::SeqCst);
            drained += 1;
        }
        drained
    }

    /// Collective quiescence point.
    ///
    /// Runs registered pre-barrier callbacks, executes incoming active
    /// messages (which may themselves send messages and register
    /// callbacks), and releases only once the world-wide sent and delivered
    /// counters agree — i.e. no message anywhere is still in flight.
    pub fn barrier(&self) {
        let epoch = self.local.barrier_epoch.get() + 1;
        self.local.barrier_epoch.set(epoch);

        let mut rounds = 0u32;
        loop {
            rounds += 1;
            loop {
                let callbacks: Vec<PreBarrierCallback> =
                    self.local.callbacks.borrow_mut().drain(..).collect();
                let mut progressed = !callbacks.is_empty();
                for callback in callbacks {
                    callback(self);
                }
                progressed |= self.drain_mailbox() > 0;
                if !progressed {
                    break;
                }
            }

            // Two rendezvous bracket the counter snapshot: no rank runs
            // user code in between, so every rank reads the same values and
            // reaches the same verdict.
            self.shared.rendezvous.wait();
            let sent = self.shared.sent.load(Ordering::SeqCst);
            let delivered = self.shared.delivered.load(Ordering::SeqCst);
            self.shared.rendezvous.wait();

            if sent == delivered {
                break;
            }
        }
        tracing::trace!(rank = self.rank, epoch, rounds, "barrier released");
    }

    /// Register a rank-local replica of a distributed object, yielding the
    /// [`MirrorPtr`] under which active messages resolve it on any rank.
    ///
    /// Collective: replicas must be registered in the same order on every
    /// rank, and this is asserted.
    pub fn mirror<T: 'static>(&self, object: Rc<RefCell<T>>) -> MirrorPtr<T> {
        let ptr = self.local.objects.borrow_mut().register(object);
        let agreed = crate::collective::is_same(ptr.id(), self, |a, b| a == b);
        assert!(
            agreed,
            "rank {}: mirrored objects must be registered in the same order on every rank",
            self.rank
        );
        ptr
    }

    /// Resolve a mirrored pointer to this rank's replica.
    pub fn resolve<T: 'static>(&self, ptr: MirrorPtr<T>) -> Rc<RefCell<T>> {
        self.local.objects.borrow().resolve(ptr)
    }

    /// Remove this rank's replica from the pool. Local; the caller is
    /// responsible for quiescing (barrier) first so no in-flight message
    /// still resolves the pointer.
    pub fn unmirror<T>(&self, ptr: MirrorPtr<T>) {
        self.local.objects.borrow_mut().unregister(ptr.id());
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn poison_world(&self) {
        self.shared.rendezvous.poison();
    }
}
