/// Rank of a participant in a world (0-indexed).
///
/// Ranks are fixed for the lifetime of a world; there is no dynamic
/// membership.
pub type Rank = u32;
