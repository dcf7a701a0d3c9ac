//! # rumor
//!
//! Active-message containers on top of a rank-based communicator.
//!
//! A *world* of `n` ranks runs one thread per rank. Ranks talk through
//! fire-and-forget active messages (closures executed on the destination
//! rank) and synchronise through a quiescence barrier: the barrier releases
//! only once every in-flight message everywhere has been delivered and
//! executed, and pre-barrier callbacks have stopped generating new work.
//!
//! On that substrate the crate provides two containers:
//!
//! * [`WorkQueue`] — a per-rank buffer of work items drained through a user
//!   work function at every barrier. The work function may enqueue more
//!   items locally (processed in the same drain) or ship items to other
//!   ranks (processed before the same barrier completes).
//! * [`AliasTable`] — distributed weighted sampling. Construction rebalances
//!   `(id, weight)` pairs so every rank owns an equal slice of the total
//!   probability mass, then builds a per-rank Vose alias table;
//!   [`AliasTable::async_sample`] draws from the full global distribution in
//!   O(1) by picking a uniformly random rank first.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use rumor::{FifoWorkQueue, World};
//!
//! World::new(4).run(|comm| {
//!     let wq = FifoWorkQueue::fifo(comm, |_wq, item: u64| {
//!         println!("rank {} got {item}", _wq.comm().rank());
//!     });
//!     wq.local_insert(comm.rank() as u64);
//!     comm.barrier(); // drains every rank's queue
//! })
//! .unwrap();
//! ```

pub mod collective;
pub mod comm;
pub mod config;
pub mod container;
pub mod error;
pub mod random;
pub mod types;

pub use comm::world::World;
pub use comm::{Comm, MirrorPtr};
pub use config::WorldConfig;
pub use container::policy::{
    Comparator, Fifo, Lifo, NaturalOrder, Priority, QueuePolicy, ReverseOrder,
};
pub use container::work_queue::{
    FifoWorkQueue, LifoWorkQueue, PriorityWorkQueue, WorkQueue, WorkQueueHandle,
};
pub use error::{Result, RumorError};
pub use random::{AliasTable, Bucket, SampleId};
pub use types::Rank;
