//! Request backlog for one chain.
//!
//! Tracks every request admitted for the chain, which committee peers have
//! reported each one ready, and computes the ordered ready list consensus
//! draws batches from.

mod state;

pub use state::{
    MempoolConfig, MempoolError, MempoolState, ReadyListRecord, DEFAULT_MAX_REQUESTS,
    DEFAULT_TOMBSTONE_RETENTION,
};
