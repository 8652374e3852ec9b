// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! `file://` backend (spec §4.4, §6): objects are plain files under a root
//! directory; headers (the `vdschunkmetadata` blob header, mainly) live in a
//! `.headers.json` sidecar next to each object since a bare file has no
//! place to carry them.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use vds_core::{ByteRange, GetResult, ObjectHeaders, ObjectStore};
use vds_utils::{VdsError, VdsResult};

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> VdsResult<FileStore> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FileStore { root })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn headers_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.headers.json"))
    }

    fn read_headers(&self, key: &str) -> VdsResult<ObjectHeaders> {
        let path = self.headers_path(key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| VdsError::invalid_argument(format!("malformed header sidecar for '{key}': {e}")))
    }
}

impl ObjectStore for FileStore {
    fn get(&self, key: &str, range: Option<ByteRange>) -> VdsResult<GetResult> {
        let path = self.object_path(key);
        let mut file = fs::File::open(&path)
            .map_err(|_| VdsError::ObjectStoreTransport(format!("no such object '{key}'")))?;
        let data = match range {
            None => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf)?;
                buf
            }
            Some(r) => {
                file.seek(SeekFrom::Start(r.begin))?;
                let mut buf = vec![0u8; r.len() as usize];
                let read = file.read(&mut buf)?;
                buf.truncate(read);
                buf
            }
        };
        Ok(GetResult {
            data,
            headers: self.read_headers(key)?,
        })
    }

    fn put(&self, key: &str, data: &[u8], headers: ObjectHeaders) -> VdsResult<()> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        if !headers.is_empty() {
            let encoded = serde_json::to_vec(&headers)
                .map_err(|e| VdsError::invalid_argument(format!("cannot serialize headers: {e}")))?;
            fs::write(self.headers_path(key), encoded)?;
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> VdsResult<bool> {
        Ok(Path::new(&self.object_path(key)).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir();
        let store = FileStore::new(&dir).unwrap();
        store
            .put("Dimensions_012LOD0/0", b"abc", vec![("vdschunkmetadata".into(), "xyz".into())])
            .unwrap();
        let result = store.get("Dimensions_012LOD0/0", None).unwrap();
        assert_eq!(result.data, b"abc");
        assert_eq!(result.headers, vec![("vdschunkmetadata".to_string(), "xyz".to_string())]);
    }

    #[test]
    fn missing_object_is_transport_error() {
        let dir = tempdir();
        let store = FileStore::new(&dir).unwrap();
        let err = store.get("nope", None).unwrap_err();
        assert_eq!(err.kind(), "ObjectStoreTransport");
    }

    fn tempdir() -> PathBuf {
        use rand::Rng;
        let suffix: u64 = rand::thread_rng().gen();
        let mut path = std::env::temp_dir();
        path.push(format!("openvds-filestore-test-{}-{suffix}", std::process::id()));
        path
    }
}
