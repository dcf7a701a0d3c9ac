//! Distributed weighted sampling through a two-level alias table.
//!
//! Construction ingests each rank's local `(id, weight)` pairs, rebalances
//! weight across ranks so every rank owns exactly `total / nranks` of the
//! global probability mass (splitting items across rank boundaries where
//! needed), and builds a per-rank Vose alias table over the rebalanced
//! fragments. Because per-rank totals are equal, sampling reduces to a
//! uniform rank choice followed by a uniform bucket choice and one coin
//! flip — an unbiased O(1) draw from the full global distribution.
//!
//! Ids may repeat, both across ranks and after splitting: each fragment is
//! an independent draw target, and per-id probabilities aggregate over
//! fragments, so the input distribution is preserved exactly.

use crate::collective;
use crate::comm::{Comm, MirrorPtr};
use crate::types::Rank;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use std::cell::RefCell;
use std::rc::Rc;

/// Requirements on a sampled id.
///
/// `Default` supplies the unreachable alias slot of boundary buckets; wrap
/// ids without a meaningful default in `Option` or a newtype.
pub trait SampleId: Clone + Default + Send + 'static {}

impl<T: Clone + Default + Send + 'static> SampleId for T {}

#[derive(Debug, Clone)]
struct WeightedItem<I> {
    id: I,
    weight: f64,
}

/// One alias-table entry: with probability `share / avg_weight` a uniform
/// draw of this bucket yields `primary`, otherwise `alias`. When
/// `share == avg_weight` the alias slot is the id type's default and is
/// never selected.
#[derive(Debug, Clone)]
pub struct Bucket<I> {
    pub share: f64,
    pub primary: I,
    pub alias: I,
}

struct TableInner<I> {
    items: Vec<WeightedItem<I>>,
    /// Fragments shipped here by the balancer; swapped into `items` after
    /// the delivery barrier.
    incoming: Vec<WeightedItem<I>>,
    buckets: Vec<Bucket<I>>,
    avg_weight: f64,
    local_weight: f64,
    rng: Pcg64Mcg,
}

/// Distributed alias table over ids of type `I`.
///
/// Immutable after construction; rebuild to change weights. No `Clone`.
pub struct AliasTable<I: SampleId> {
    comm: Comm,
    inner: Rc<RefCell<TableInner<I>>>,
    ptr: MirrorPtr<TableInner<I>>,
    owned: bool,
}

impl<I: SampleId> AliasTable<I> {
    /// Build from each rank's local `(id, weight)` pairs.
    ///
    /// Collective. Weights must be finite and non-negative (zero
    /// contributes nothing); the global total must be positive. A rank may
    /// pass an empty shard as long as some rank does not — rank-0-only
    /// input is fine, the balancer populates everyone.
    pub fn new(comm: &Comm, items: impl IntoIterator<Item = (I, f64)>) -> Self {
        let rng = Pcg64Mcg::from_rng(&mut rand::rng());
        Self::build(comm, items, rng)
    }

    /// Like [`new`](Self::new), but rank and bucket selection are
    /// deterministic per rank: each rank's engine is seeded from `seed`
    /// strided by its rank.
    pub fn with_seed(comm: &Comm, items: impl IntoIterator<Item = (I, f64)>, seed: u32) -> Self {
        let stream = u64::from(comm.rank()).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let rng = Pcg64Mcg::seed_from_u64(u64::from(seed).wrapping_add(stream));
        Self::build(comm, items, rng)
    }

    fn build(comm: &Comm, items: impl IntoIterator<Item = (I, f64)>, rng: Pcg64Mcg) -> Self {
        tracing::info!(rank = comm.rank(), "creating alias table");
        let items: Vec<WeightedItem<I>> = items
            .into_iter()
            .map(|(id, weight)| WeightedItem { id, weight })
            .collect();
        let inner = Rc::new(RefCell::new(TableInner {
            items,
            incoming: Vec::new(),
            buckets: Vec::new(),
            avg_weight: 0.0,
            local_weight: 0.0,
            rng,
        }));
        let ptr = comm.mirror(Rc::clone(&inner));
        let table = Self {
            comm: comm.clone(),
            inner,
            ptr,
            owned: true,
        };
        table.comm.barrier();
        table.balance_weight();
        table.comm.barrier();
        table.build_local_buckets();
        table.inner.borrow_mut().items.clear();
        table
    }

    /// Redistribute items so this rank ends up holding exactly
    /// `global / nranks` weight.
    ///
    /// Rank `r`'s input occupies the global weight interval
    /// `[prefix − local, prefix)`; after balancing it owns
    /// `[r·target, (r+1)·target)`. Items are walked in input order, filling
    /// the current destination's remaining capacity and flushing one
    /// fragment batch per saturation event.
    fn balance_weight(&self) {
        let rank = self.comm.rank();
        let size = self.comm.size();

        let local_weight: f64 = self.inner.borrow().items.iter().map(|it| it.weight).sum();
        let global_weight = collective::sum(local_weight, &self.comm);
        assert!(
            global_weight > 0.0,
            "rank {rank}: alias table needs positive global weight (got {global_weight})"
        );
        let prefix_weight = collective::prefix_sum(local_weight, &self.comm);
        let target_weight = global_weight / f64::from(size);

        let start = prefix_weight - local_weight;
        let mut dest_rank = (start / target_weight) as Rank;
        let mut curr_weight = start % target_weight;

        let mut outgoing: Vec<WeightedItem<I>> = Vec::new();
        // The item list grows while we walk it when a single item spans
        // several ranks, so index with a live length check.
        let mut i = 0;
        while i < self.inner.borrow().items.len() {
            let item = self.inner.borrow().items[i].clone();
            if curr_weight + item.weight >= target_weight {
                let remaining = curr_weight + item.weight - target_weight;
                outgoing.push(WeightedItem {
                    id: item.id.clone(),
                    weight: item.weight - remaining,
                });
                self.send_fragments(dest_rank.min(size - 1), std::mem::take(&mut outgoing));

                if remaining >= target_weight {
                    // Still more than one rank's worth: requeue the rest of
                    // the item and let later iterations split it again.
                    self.inner.borrow_mut().items.push(WeightedItem {
                        id: item.id,
                        weight: remaining,
                    });
                    curr_weight = 0.0;
                } else {
                    curr_weight = remaining;
                    if curr_weight != 0.0 {
                        outgoing.push(WeightedItem {
                            id: item.id,
                            weight: curr_weight,
                        });
                    }
                }
                dest_rank += 1;
            } else {
                curr_weight += item.weight;
                outgoing.push(item);
            }
            i += 1;
        }
        // Leftovers below one capacity; rounding may have pushed dest_rank
        // past the end, in which case the last rank absorbs them.
        if !outgoing.is_empty() {
            self.send_fragments(dest_rank.min(size - 1), outgoing);
        }

        self.comm.barrier();
        {
            let mut inner = self.inner.borrow_mut();
            let received = std::mem::take(&mut inner.incoming);
            inner.items = received;
        }

        assert!(
            !self.inner.borrow().items.is_empty(),
            "rank {rank}: weight balancing left this rank without items"
        );
        self.assert_balanced(target_weight);
    }

    fn send_fragments(&self, dest: Rank, batch: Vec<WeightedItem<I>>) {
        let ptr = self.ptr;
        self.comm.async_to(dest, move |comm| {
            comm.resolve(ptr).borrow_mut().incoming.extend(batch);
        });
    }

    fn assert_balanced(&self, target_weight: f64) {
        let rank = self.comm.rank();
        let local_weight: f64 = self.inner.borrow().items.iter().map(|it| it.weight).sum();
        assert!(
            (target_weight - local_weight).abs() < 1e-6,
            "rank {rank}: post-balance weight {local_weight} misses target {target_weight}"
        );
        let balanced = collective::is_same(local_weight, &self.comm, |a, b| (a - b).abs() < 1e-6);
        assert!(balanced, "rank {rank}: ranks disagree on post-balance weight");
    }

    /// Vose's construction over the rebalanced fragments, in Keith
    /// Schwarz's numerically stable form
    /// (<https://www.keithschwarz.com/darts-dice-coins/>).
    fn build_local_buckets(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            let local_weight: f64 = inner.items.iter().map(|it| it.weight).sum();
            let avg_weight = local_weight / inner.items.len() as f64;

            let mut light: Vec<WeightedItem<I>> = Vec::new();
            let mut heavy: Vec<WeightedItem<I>> = Vec::new();
            for item in inner.items.iter().cloned() {
                if item.weight < avg_weight {
                    light.push(item);
                } else {
                    heavy.push(item);
                }
            }

            let mut buckets = Vec::with_capacity(inner.items.len());
            while let Some(l) = light.pop() {
                let Some(h) = heavy.last_mut() else {
                    light.push(l);
                    break;
                };
                buckets.push(Bucket {
                    share: l.weight,
                    primary: l.id,
                    alias: h.id.clone(),
                });
                // Written so accumulated error tracks the item magnitudes,
                // not avg_weight alone.
                h.weight = (h.weight + l.weight) - avg_weight;
                if h.weight < avg_weight {
                    if let Some(demoted) = heavy.pop() {
                        light.push(demoted);
                    }
                }
            }
            // One side is exhausted; leftovers fill a whole bucket each and
            // the alias slot is never reachable.
            for item in heavy.into_iter().chain(light) {
                buckets.push(Bucket {
                    share: avg_weight,
                    primary: item.id,
                    alias: I::default(),
                });
            }

            inner.buckets = buckets;
            inner.avg_weight = avg_weight;
            inner.local_weight = local_weight;
        }
        self.comm.barrier();
    }

    fn draw_local(&self) -> I {
        let mut inner = self.inner.borrow_mut();
        let TableInner {
            buckets,
            avg_weight,
            rng,
            ..
        } = &mut *inner;
        let avg = *avg_weight;
        let bucket = &buckets[rng.random_range(0..buckets.len())];
        if bucket.share < avg {
            let flip = rng.random_range(0.0..avg);
            if flip > bucket.share {
                return bucket.alias.clone();
            }
        }
        bucket.primary.clone()
    }

    /// Draw one sample from the global distribution and deliver it to
    /// `visitor` on the sampling rank.
    ///
    /// Non-blocking: picks a uniformly random rank (possibly this one) and
    /// ships an active message there; the recipient draws a uniform bucket,
    /// resolves the `share / avg_weight` coin flip, and invokes the visitor
    /// with a bound (non-owning) table handle and the chosen id. Delivery
    /// is guaranteed by the next barrier. No ordering between samples;
    /// extra visitor arguments travel as closure captures.
    pub fn async_sample<V>(&self, visitor: V)
    where
        V: FnOnce(&AliasTable<I>, I) + Send + 'static,
    {
        let dest = {
            let mut inner = self.inner.borrow_mut();
            inner.rng.random_range(0..self.comm.size())
        };
        let ptr = self.ptr;
        self.comm.async_to(dest, move |comm| {
            let table = AliasTable {
                comm: comm.clone(),
                inner: comm.resolve(ptr),
                ptr,
                owned: false,
            };
            let id = table.draw_local();
            visitor(&table, id);
        });
    }

    /// Number of buckets on this rank (equals the rank's post-balance
    /// fragment count).
    pub fn local_len(&self) -> usize {
        self.inner.borrow().buckets.len()
    }

    /// The constant per-bucket weight on this rank.
    pub fn avg_weight(&self) -> f64 {
        self.inner.borrow().avg_weight
    }

    /// Total fragment weight held by this rank
    /// (≈ global total / number of ranks).
    pub fn local_weight(&self) -> f64 {
        self.inner.borrow().local_weight
    }

    /// Snapshot of this rank's buckets, for inspection and tests.
    pub fn local_buckets(&self) -> Vec<Bucket<I>> {
        self.inner.borrow().buckets.clone()
    }

    /// The communicator this table is bound to.
    pub fn comm(&self) -> &Comm {
        &self.comm
    }
}

impl<I: SampleId> Drop for AliasTable<I> {
    /// Dropping the owning handle is collective: a barrier quiesces
    /// in-flight samples before the replica is unregistered.
    fn drop(&mut self) {
        if !self.owned || std::thread::panicking() {
            return;
        }
        tracing::info!(rank = self.comm.rank(), "destroying alias table");
        self.comm.barrier();
        self.comm.unmirror(self.ptr);
    }
}
