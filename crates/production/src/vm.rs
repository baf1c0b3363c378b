//! Key-value VM used by the node binary.

use quorumstate_core::{BlobCache, StateView, VmError, VmProcessor};
use quorumstate_types::{ArgValue, Hash, Request, RequestId, StateDelta};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stores request arguments under `<contract>/<name>`.
///
/// Entry points:
/// - `set`: write every argument; blob arguments store the blob contents
/// - `delete`: remove the key of every argument name
/// - `append`: append each inline argument to the current value
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyValueVm;

impl KeyValueVm {
    pub fn key(contract: &str, name: &str) -> Vec<u8> {
        format!("{contract}/{name}").into_bytes()
    }

    /// A `kv.set` request writing `value` under `name`. The id is derived
    /// from `seq`, so resubmitting the same sequence number is a duplicate.
    pub fn set_request(seq: u64, timestamp: u64, name: &str, value: Vec<u8>) -> Arc<Request> {
        let id = RequestId::new(
            Hash::from_parts(&[b"KV_REQUEST".as_slice(), &seq.to_le_bytes()[..]]),
            0,
        );
        let mut args = BTreeMap::new();
        args.insert(name.to_string(), ArgValue::Inline(value));
        Arc::new(Request {
            id,
            timestamp,
            target_contract: "kv".into(),
            entry_point: "set".into(),
            args,
            time_lock: None,
            transfer: None,
        })
    }
}

impl VmProcessor for KeyValueVm {
    fn process(
        &self,
        view: &StateView<'_>,
        request: &Request,
        blobs: &dyn BlobCache,
    ) -> Result<StateDelta, VmError> {
        let mut delta = StateDelta::new();
        for (name, arg) in &request.args {
            let key = Self::key(&request.target_contract, name);
            match (request.entry_point.as_str(), arg) {
                ("set", ArgValue::Inline(value)) => delta.set(key, value.clone()),
                ("set", ArgValue::Blob(hash)) => {
                    let blob = blobs.get_blob(hash).ok_or(VmError::MissingBlob(*hash))?;
                    delta.set(key, blob.to_vec());
                }
                ("delete", _) => delta.delete(key),
                ("append", ArgValue::Inline(value)) => {
                    let mut current = view.get(&key).map(<[u8]>::to_vec).unwrap_or_default();
                    current.extend_from_slice(value);
                    delta.set(key, current);
                }
                (entry, _) => {
                    return Err(VmError::Execution(format!(
                        "unsupported entry point {entry} for argument {name}"
                    )))
                }
            }
        }
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumstate_core::MemoryBlobCache;
    use quorumstate_test_helpers::fixtures;
    use quorumstate_types::{ChainId, VirtualState};

    fn with_entry(mut request: Request, entry: &str) -> Request {
        request.target_contract = "kv".into();
        request.entry_point = entry.into();
        request
    }

    #[test]
    fn test_set_append_delete() {
        let state = VirtualState::origin(ChainId::from_address(&Hash::from_bytes(b"kv")));
        let blobs = MemoryBlobCache::new();
        let mut view = StateView::new(&state);

        let set = with_entry(
            (*fixtures::make_set_request(1, 1, &[("a", &b"x"[..]), ("b", &b"y"[..])])).clone(),
            "set",
        );
        let delta = KeyValueVm.process(&view, &set, &blobs).unwrap();
        view.absorb(&delta.writes);
        assert_eq!(view.get(&KeyValueVm::key("kv", "a")), Some(&b"x"[..]));

        let append = with_entry(
            (*fixtures::make_set_request(2, 2, &[("a", &b"z"[..])])).clone(),
            "append",
        );
        let delta = KeyValueVm.process(&view, &append, &blobs).unwrap();
        view.absorb(&delta.writes);
        assert_eq!(view.get(&KeyValueVm::key("kv", "a")), Some(&b"xz"[..]));

        let delete = with_entry(
            (*fixtures::make_set_request(3, 3, &[("b", &b""[..])])).clone(),
            "delete",
        );
        let delta = KeyValueVm.process(&view, &delete, &blobs).unwrap();
        view.absorb(&delta.writes);
        assert_eq!(view.get(&KeyValueVm::key("kv", "b")), None);
    }

    #[test]
    fn test_blob_argument_and_missing_blob() {
        let state = VirtualState::origin(ChainId::from_address(&Hash::from_bytes(b"kv")));
        let blobs = MemoryBlobCache::new();
        let hash = blobs.put_blob(b"payload".to_vec());
        let view = StateView::new(&state);

        let mut request = with_entry((*fixtures::make_request(4, 4)).clone(), "set");
        request.args.insert("doc".into(), ArgValue::Blob(hash));
        let delta = KeyValueVm.process(&view, &request, &blobs).unwrap();
        assert_eq!(
            delta.writes.get(&KeyValueVm::key("kv", "doc")),
            Some(&Some(b"payload".to_vec()))
        );

        let empty = Arc::new(MemoryBlobCache::new());
        assert_ne!(
            KeyValueVm::set_request(1, 0, "a", vec![1]).id,
            KeyValueVm::set_request(2, 0, "a", vec![1]).id
        );
        assert_eq!(
            KeyValueVm.process(&view, &request, empty.as_ref()),
            Err(VmError::MissingBlob(hash))
        );
    }
}
