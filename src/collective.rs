//! Collective reductions over a world.
//!
//! Every function here is collective: all ranks must call it, with matching
//! types, in the same order. Exchange happens through per-rank deposit
//! slots bracketed by rendezvous; no active messages are processed while a
//! collective runs (delivery is a barrier concern, not a reduction one).

use crate::comm::Comm;

/// Gather one value from every rank, ordered by rank.
pub fn all_gather<T>(value: T, comm: &Comm) -> Vec<T>
where
    T: Clone + Send + 'static,
{
    if comm.size() <= 1 {
        return vec![value];
    }
    let shared = comm.shared();
    let rank = comm.rank() as usize;

    {
        let mut slots = shared.slots.lock().expect("collective slots");
        slots[rank] = Some(Box::new(value));
    }
    shared.rendezvous.wait();

    let gathered: Vec<T> = {
        let slots = shared.slots.lock().expect("collective slots");
        slots
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .expect("collective slot missing a deposit")
                    .downcast_ref::<T>()
                    .expect("mismatched collective value types across ranks")
                    .clone()
            })
            .collect()
    };
    shared.rendezvous.wait();

    // Everyone has read; reclaim our own slot for the next collective.
    {
        let mut slots = shared.slots.lock().expect("collective slots");
        slots[rank] = None;
    }
    gathered
}

/// Sum of `value` over all ranks.
pub fn sum<T>(value: T, comm: &Comm) -> T
where
    T: Clone + Send + 'static + std::iter::Sum,
{
    all_gather(value, comm).into_iter().sum()
}

/// Inclusive prefix sum: rank `r` receives the sum over ranks `0..=r`.
pub fn prefix_sum<T>(value: T, comm: &Comm) -> T
where
    T: Clone + Send + 'static + std::iter::Sum,
{
    let rank = comm.rank() as usize;
    all_gather(value, comm).into_iter().take(rank + 1).sum()
}

/// True iff every rank's value is equal under `eq`.
pub fn is_same<T>(value: T, comm: &Comm, eq: impl Fn(&T, &T) -> bool) -> bool
where
    T: Clone + Send + 'static,
{
    let all = all_gather(value, comm);
    all.windows(2).all(|pair| eq(&pair[0], &pair[1]))
}

/// True iff any rank's value is true.
pub fn logical_or(value: bool, comm: &Comm) -> bool {
    all_gather(value, comm).into_iter().any(|b| b)
}
