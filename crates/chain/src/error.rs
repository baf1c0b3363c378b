//! Chain errors.

use quorumstate_mempool::MempoolError;
use quorumstate_types::ChainId;

/// Errors surfaced by chain operations called directly (not through events).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("Chain {0} is dismissed")]
    Dismissed(ChainId),

    #[error("Request rejected: {0}")]
    Request(#[from] MempoolError),

    #[error("Committee does not include this node (own index {own}, size {size})")]
    NotAMember { own: u16, size: u16 },
}
