use thiserror::Error;

/// Internal-only signal that a write path must restart traversal from the
/// root. Never returned from a public `BwTree` method — §7 of the design
/// treats it purely as a driver-loop control-flow error.
#[derive(Debug)]
pub(crate) struct StructuralRetry;

pub(crate) type Retry<T> = Result<T, StructuralRetry>;

/// Errors surfaced by the tile-group MVCC header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TileGroupError {
    /// `ReserveSlot`/`ReserveSpecificSlot` found no free slot in the header.
    #[error("tile group header is full")]
    Full,
}
