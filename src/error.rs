use crate::types::Rank;

pub type Result<T> = std::result::Result<T, RumorError>;

/// Errors surfaced by the world launcher.
///
/// Contract violations inside the containers (unprocessed work at queue
/// destruction, a post-balance weight mismatch, zero global weight) are not
/// represented here: they are always-on assertions that panic the offending
/// rank, and [`World::run`](crate::World::run) reports them as
/// [`RumorError::RankFailed`].
#[derive(Debug, thiserror::Error)]
pub enum RumorError {
    #[error("world must have at least one rank (got {ranks})")]
    InvalidWorldSize { ranks: u32 },

    #[error("rank {rank} failed: {message}")]
    RankFailed { rank: Rank, message: String },

    #[error("failed to spawn rank thread: {0}")]
    Spawn(#[from] std::io::Error),
}
