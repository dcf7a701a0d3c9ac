//! Work-queue tests: policy ordering under the barrier drain, re-entrant
//! work functions, remote insertion, batching, and move behaviour.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use rumor::{FifoWorkQueue, LifoWorkQueue, PriorityWorkQueue, ReverseOrder, World};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn shuffled(n: usize, seed: u64) -> Vec<usize> {
    let mut items: Vec<usize> = (0..n).collect();
    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    items.shuffle(&mut rng);
    items
}

#[test]
fn test_priority_queue_drains_in_comparator_order() {
    World::new(4)
        .run(|comm| {
            let remaining = Rc::new(Cell::new(64usize));
            let work_remaining = Rc::clone(&remaining);
            let wq = PriorityWorkQueue::priority(comm, move |wq: &PriorityWorkQueue<usize>, item| {
                work_remaining.set(work_remaining.get() - 1);
                assert_eq!(work_remaining.get(), item);
                assert_eq!(wq.local_size(), work_remaining.get());
            });

            for item in shuffled(64, 100 + u64::from(comm.rank())) {
                wq.local_insert(item);
            }
            assert!(wq.local_has_work());
            assert_eq!(wq.local_size(), 64);

            comm.barrier();

            assert_eq!(remaining.get(), 0);
            assert_eq!(wq.local_size(), 0);
            assert!(!wq.local_has_work());
        })
        .unwrap();
}

#[test]
fn test_fifo_queue_drains_in_insertion_order() {
    World::new(4)
        .run(|comm| {
            let remaining = Rc::new(Cell::new(64usize));
            let work_remaining = Rc::clone(&remaining);
            let wq = FifoWorkQueue::fifo(comm, move |wq: &FifoWorkQueue<usize>, item| {
                work_remaining.set(work_remaining.get() - 1);
                assert_eq!(work_remaining.get(), item);
                assert_eq!(wq.local_size(), work_remaining.get());
            });

            // Insert 63, 62, .., 0 so pops count down with the size.
            for item in (0..64).rev() {
                wq.local_insert(item);
            }
            assert!(wq.local_has_work());
            assert_eq!(wq.local_size(), 64);

            comm.barrier();

            assert_eq!(remaining.get(), 0);
            assert!(!wq.local_has_work());
        })
        .unwrap();
}

#[test]
fn test_lifo_queue_drains_in_reverse_insertion_order() {
    World::new(4)
        .run(|comm| {
            let remaining = Rc::new(Cell::new(64usize));
            let work_remaining = Rc::clone(&remaining);
            let wq = LifoWorkQueue::lifo(comm, move |wq: &LifoWorkQueue<usize>, item| {
                work_remaining.set(work_remaining.get() - 1);
                assert_eq!(work_remaining.get(), item);
                assert_eq!(wq.local_size(), work_remaining.get());
            });

            for item in 0..64 {
                wq.local_insert(item);
            }
            comm.barrier();

            assert_eq!(remaining.get(), 0);
            assert!(!wq.local_has_work());
        })
        .unwrap();
}

#[test]
fn test_local_clear_discards_without_processing() {
    World::new(2)
        .run(|comm| {
            let processed = Rc::new(Cell::new(0usize));
            let work_processed = Rc::clone(&processed);
            let wq = FifoWorkQueue::fifo(comm, move |_wq: &FifoWorkQueue<usize>, _item| {
                work_processed.set(work_processed.get() + 1);
            });

            for item in 0..64 {
                wq.local_insert(item);
            }
            assert_eq!(wq.local_size(), 64);
            assert!(wq.local_has_work());

            wq.local_clear();
            assert_eq!(wq.local_size(), 0);
            assert!(!wq.local_has_work());

            comm.barrier();
            assert_eq!(processed.get(), 0);
        })
        .unwrap();
}

#[test]
fn test_collective_clear_discards_everywhere() {
    World::new(4)
        .run(|comm| {
            let processed = Rc::new(Cell::new(0usize));
            let work_processed = Rc::clone(&processed);
            let wq = FifoWorkQueue::fifo(comm, move |_wq: &FifoWorkQueue<usize>, _item| {
                work_processed.set(work_processed.get() + 1);
            });

            for item in 0..10 {
                wq.local_insert(item);
            }
            wq.clear();
            assert_eq!(wq.local_size(), 0);
            assert_eq!(processed.get(), 0);
        })
        .unwrap();
}

#[test]
fn test_priority_recursion_visits_strictly_ascending() {
    World::new(2)
        .run(|comm| {
            let cutoff = 64usize;
            let next = Rc::new(Cell::new(0usize));
            let found_cutoff = Rc::new(Cell::new(false));

            let work_next = Rc::clone(&next);
            let work_found = Rc::clone(&found_cutoff);
            let wq = PriorityWorkQueue::<usize, ReverseOrder>::priority(comm, move |wq, item| {
                assert_eq!(work_next.get(), item);
                work_next.set(work_next.get() + 1);

                if item < cutoff {
                    assert!(!work_found.get());
                    wq.local_insert(item + cutoff + 1);
                    wq.local_insert(item + 1);
                } else {
                    work_found.set(true);
                }
            });

            wq.local_insert(0);
            comm.barrier();

            assert!(found_cutoff.get());
            assert_eq!(next.get(), 2 * cutoff + 1);
        })
        .unwrap();
}

#[test]
fn test_fifo_recursion_keeps_insertion_order() {
    World::new(2)
        .run(|comm| {
            let cutoff = 64usize;
            let stride = 8usize;
            let next = Rc::new(Cell::new(0usize));

            let work_next = Rc::clone(&next);
            let wq = FifoWorkQueue::fifo(comm, move |wq: &FifoWorkQueue<usize>, item| {
                assert_eq!(work_next.get(), item);
                if item == cutoff {
                    return;
                }
                if item % stride == 0 {
                    for i in 1..=stride {
                        wq.local_insert(item + i);
                    }
                }
                work_next.set(work_next.get() + 1);
            });

            wq.local_insert(0);
            comm.barrier();

            assert_eq!(next.get(), cutoff);
        })
        .unwrap();
}

#[test]
fn test_lifo_recursion_keeps_reverse_order() {
    World::new(2)
        .run(|comm| {
            let cutoff = 64usize;
            let stride = 8usize;
            let next = Rc::new(Cell::new(0usize));

            let work_next = Rc::clone(&next);
            let wq = LifoWorkQueue::lifo(comm, move |wq: &LifoWorkQueue<usize>, item| {
                assert_eq!(work_next.get(), item);
                if item == cutoff {
                    return;
                }
                if item % stride == 0 {
                    for i in (1..=stride).rev() {
                        wq.local_insert(item + i);
                    }
                }
                work_next.set(work_next.get() + 1);
            });

            wq.local_insert(0);
            comm.barrier();

            assert_eq!(next.get(), cutoff);
        })
        .unwrap();
}

#[test]
fn test_multiple_batches_drain_at_successive_barriers() {
    World::new(4)
        .run(|comm| {
            let processed = Rc::new(Cell::new(0usize));
            let work_processed = Rc::clone(&processed);
            let wq = FifoWorkQueue::fifo(comm, move |_wq: &FifoWorkQueue<usize>, _item| {
                work_processed.set(work_processed.get() + 1);
            });

            for item in 0..10 {
                wq.local_insert(item);
            }
            comm.barrier();
            assert_eq!(processed.get(), 10);
            assert_eq!(wq.local_size(), 0);

            for item in 0..20 {
                wq.local_insert(item);
            }
            comm.barrier();
            assert_eq!(processed.get(), 30);
            assert_eq!(wq.local_size(), 0);
        })
        .unwrap();
}

#[test]
fn test_moved_queue_keeps_pending_items_and_drains() {
    World::new(2)
        .run(|comm| {
            let processed = Rc::new(Cell::new(0usize));
            let work_processed = Rc::clone(&processed);
            let wq = FifoWorkQueue::fifo(comm, move |_wq: &FifoWorkQueue<usize>, _item| {
                work_processed.set(work_processed.get() + 1);
            });

            for item in 0..64 {
                wq.local_insert(item);
            }

            let moved = wq;
            assert!(moved.local_has_work());
            assert_eq!(moved.local_size(), 64);

            comm.barrier();

            assert_eq!(processed.get(), 64);
            assert_eq!(moved.local_size(), 0);
            assert!(!moved.local_has_work());
        })
        .unwrap();
}

/// Chain traversal across ranks: a 64-cell array is sharded cyclically;
/// visiting cell `i` zeroes it on its owner and enqueues `i + 1` there.
/// After one barrier the whole array must be zero.
#[test]
fn test_traversal_chains_across_ranks_within_one_barrier() {
    World::new(4)
        .run(|comm| {
            let cells = 64usize;
            let world = comm.size() as usize;
            let shard: Vec<usize> = (0..cells / world)
                .map(|slot| comm.rank() as usize + slot * world)
                .collect();
            let shard = comm.mirror(Rc::new(RefCell::new(shard)));

            let wq = FifoWorkQueue::fifo(comm, move |wq: &FifoWorkQueue<usize>, item| {
                let owner = (item % world) as u32;
                let slot = item / world;
                let queue = wq.handle();
                wq.comm().async_to(owner, move |comm| {
                    let shard = comm.resolve(shard);
                    let value = shard.borrow()[slot];
                    shard.borrow_mut()[slot] = 0;
                    if value < cells - 1 {
                        queue.bind(comm).local_insert(value + 1);
                    }
                });
            });

            if comm.rank0() {
                wq.local_insert(0);
            }
            comm.barrier();

            for &cell in comm.resolve(shard).borrow().iter() {
                assert_eq!(cell, 0);
            }
        })
        .unwrap();
}
