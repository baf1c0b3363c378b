//! Requests submitted to a chain.

use crate::{Hash, RequestId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single call argument.
///
/// Large payloads travel out of band: a `Blob` argument names the content
/// hash of a blob that must be present in the blob cache before the request
/// can be processed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgValue {
    Inline(Vec<u8>),
    Blob(Hash),
}

/// Tokens moved into the chain together with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transfer {
    pub amount: u64,
}

/// An atomic unit of work for a chain.
///
/// Immutable once created. Ordering inside the mempool uses `timestamp`
/// (the ledger arrival time of the carrying transaction) and then `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    /// Ledger arrival time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub target_contract: String,
    pub entry_point: String,
    pub args: BTreeMap<String, ArgValue>,
    /// Not processable before this time (milliseconds since the Unix epoch).
    pub time_lock: Option<u64>,
    pub transfer: Option<Transfer>,
}

/// Reasons a request is rejected at admission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Request {0} has no target contract")]
    EmptyTarget(RequestId),

    #[error("Request {0} has no entry point")]
    EmptyEntryPoint(RequestId),

    #[error("Request {id} has {count} arguments, limit is {limit}")]
    TooManyArgs {
        id: RequestId,
        count: usize,
        limit: usize,
    },
}

impl Request {
    /// Upper bound on the argument map size.
    pub const MAX_ARGS: usize = 256;

    /// Structural validation performed before admission.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.target_contract.is_empty() {
            return Err(RequestError::EmptyTarget(self.id));
        }
        if self.entry_point.is_empty() {
            return Err(RequestError::EmptyEntryPoint(self.id));
        }
        if self.args.len() > Self::MAX_ARGS {
            return Err(RequestError::TooManyArgs {
                id: self.id,
                count: self.args.len(),
                limit: Self::MAX_ARGS,
            });
        }
        Ok(())
    }

    /// True while the time-lock is still in the future.
    pub fn is_time_locked(&self, now_ms: u64) -> bool {
        self.time_lock.is_some_and(|lock| lock > now_ms)
    }

    /// Content hashes of every blob this request references.
    pub fn blob_refs(&self) -> impl Iterator<Item = &Hash> {
        self.args.values().filter_map(|arg| match arg {
            ArgValue::Blob(hash) => Some(hash),
            ArgValue::Inline(_) => None,
        })
    }
}

/// Where a request is in its lifecycle, derived on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestProcessingStatus {
    Unknown,
    Backlog,
    Completed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request {
            id: RequestId::new(Hash::from_bytes(b"tx"), 0),
            timestamp: 1_000,
            target_contract: "counter".into(),
            entry_point: "increment".into(),
            args: BTreeMap::new(),
            time_lock: None,
            transfer: None,
        }
    }

    #[test]
    fn test_time_lock() {
        let mut req = request();
        assert!(!req.is_time_locked(0));
        req.time_lock = Some(5_000);
        assert!(req.is_time_locked(4_999));
        assert!(!req.is_time_locked(5_000));
    }

    #[test]
    fn test_validate() {
        let mut req = request();
        assert!(req.validate().is_ok());
        req.entry_point.clear();
        assert_eq!(req.validate(), Err(RequestError::EmptyEntryPoint(req.id)));
        req.target_contract.clear();
        assert_eq!(req.validate(), Err(RequestError::EmptyTarget(req.id)));
    }

    #[test]
    fn test_blob_refs() {
        let mut req = request();
        let blob = Hash::from_bytes(b"wasm");
        req.args.insert("code".into(), ArgValue::Blob(blob));
        req.args.insert("n".into(), ArgValue::Inline(vec![1]));
        assert_eq!(req.blob_refs().collect::<Vec<_>>(), vec![&blob]);
    }
}
