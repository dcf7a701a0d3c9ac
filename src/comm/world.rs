//! Thread-per-rank world launcher.
//!
//! Each rank runs on its own named OS thread with its own [`Comm`]. The
//! launch closure is the rank's "main": it is invoked once per rank and may
//! freely capture shared test state by reference (threads are scoped).

use crate::comm::{Comm, Envelope, Shared, POISONED};
use crate::config::WorldConfig;
use crate::error::{Result, RumorError};
use crate::types::Rank;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// A fixed-size group of ranks, ready to run.
pub struct World {
    config: WorldConfig,
}

impl World {
    /// World with `ranks` ranks and default tuning.
    pub fn new(ranks: u32) -> Self {
        Self {
            config: WorldConfig {
                ranks,
                ..WorldConfig::default()
            },
        }
    }

    /// World with explicit tuning.
    pub fn with_config(config: WorldConfig) -> Self {
        Self { config }
    }

    /// Spawn one thread per rank and run `f(&comm)` on each.
    ///
    /// Returns once every rank's closure has returned. A panicking rank
    /// poisons the collective rendezvous so peers blocked in a barrier
    /// unwind instead of deadlocking; the first primary failure is reported
    /// as [`RumorError::RankFailed`].
    pub fn run<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&Comm) + Send + Sync,
    {
        let ranks = self.config.ranks;
        if ranks == 0 {
            return Err(RumorError::InvalidWorldSize { ranks });
        }

        let mut senders = Vec::with_capacity(ranks as usize);
        let mut mailboxes = Vec::with_capacity(ranks as usize);
        for _ in 0..ranks {
            let (tx, rx) = crossbeam_channel::unbounded::<Envelope>();
            senders.push(tx);
            mailboxes.push(rx);
        }
        let shared = Arc::new(Shared::new(senders));

        tracing::info!(ranks, "spawning world");

        let mut failures: Vec<(Rank, String)> = Vec::new();
        std::thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::with_capacity(ranks as usize);
            for (rank, mailbox) in mailboxes.into_iter().enumerate() {
                let rank = rank as Rank;
                let thread_shared = Arc::clone(&shared);
                let f = &f;
                let mut builder = std::thread::Builder::new().name(format!("rank-{rank}"));
                if let Some(bytes) = self.config.thread_stack_bytes {
                    builder = builder.stack_size(bytes);
                }
                let spawned = builder.spawn_scoped(scope, move || {
                    let comm = Comm::new(rank, ranks, thread_shared, mailbox);
                    match panic::catch_unwind(AssertUnwindSafe(|| f(&comm))) {
                        Ok(()) => Ok(()),
                        Err(payload) => {
                            comm.poison_world();
                            Err(panic_message(payload.as_ref()))
                        }
                    }
                });
                match spawned {
                    Ok(handle) => handles.push((rank, handle)),
                    Err(e) => {
                        // Already-spawned ranks would wait forever on a
                        // rendezvous that can never fill.
                        shared.rendezvous.poison();
                        return Err(e.into());
                    }
                }
            }
            for (rank, handle) in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(message)) => failures.push((rank, message)),
                    // Unreachable in practice: the rank body catches its own
                    // unwind. Kept so a future change cannot silently drop a
                    // failure.
                    Err(payload) => failures.push((rank, panic_message(payload.as_ref()))),
                }
            }
            Ok(())
        })?;

        // Prefer the rank that actually failed over peers that merely woke
        // up from the poisoned rendezvous.
        let primary = failures
            .iter()
            .find(|(_, message)| !message.contains(POISONED))
            .or_else(|| failures.first())
            .cloned();
        match primary {
            Some((rank, message)) => Err(RumorError::RankFailed { rank, message }),
            None => Ok(()),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "rank panicked with a non-string payload".to_string()
    }
}
