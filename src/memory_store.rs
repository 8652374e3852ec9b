// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! `inmemory://` backend (spec §4.4, §6): a process-local `ObjectStore`
//! backed by a `HashMap`, used by tests and by the `S1-S6` scenarios that
//! don't need a real transport.

use std::collections::HashMap;
use std::sync::Mutex;

use vds_core::{ByteRange, GetResult, ObjectHeaders, ObjectStore};
use vds_utils::{VdsError, VdsResult};

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, (Vec<u8>, ObjectHeaders)>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            objects: Mutex::new(HashMap::new()),
        }
    }
}

impl ObjectStore for MemoryStore {
    fn get(&self, key: &str, range: Option<ByteRange>) -> VdsResult<GetResult> {
        let objects = self.objects.lock().unwrap();
        let (data, headers) = objects
            .get(key)
            .ok_or_else(|| VdsError::ObjectStoreTransport(format!("no such object '{key}'")))?;
        let sliced = match range {
            Some(r) => {
                let begin = (r.begin as usize).min(data.len());
                let end = (r.end as usize).min(data.len());
                data[begin..end.max(begin)].to_vec()
            }
            None => data.clone(),
        };
        Ok(GetResult {
            data: sliced,
            headers: headers.clone(),
        })
    }

    fn put(&self, key: &str, data: &[u8], headers: ObjectHeaders) -> VdsResult<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (data.to_vec(), headers));
        Ok(())
    }

    fn exists(&self, key: &str) -> VdsResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let store = MemoryStore::new();
        store.put("foo", b"hello", vec![("x".into(), "y".into())]).unwrap();
        let result = store.get("foo", None).unwrap();
        assert_eq!(result.data, b"hello");
        assert_eq!(result.headers, vec![("x".to_string(), "y".to_string())]);
    }

    #[test]
    fn ranged_get_slices_the_object() {
        let store = MemoryStore::new();
        store.put("foo", b"0123456789", Vec::new()).unwrap();
        let result = store.get("foo", Some(ByteRange { begin: 2, end: 5 })).unwrap();
        assert_eq!(result.data, b"234");
    }

    #[test]
    fn missing_key_is_transport_error() {
        let store = MemoryStore::new();
        let err = store.get("missing", None).unwrap_err();
        assert_eq!(err.kind(), "ObjectStoreTransport");
    }
}
