// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! C5: `MetadataManager` — per-layer paged metadata cache. See spec §4.5.
//!
//! The source models the clean/dirty lists as intrusive linked lists to
//! avoid per-node allocation on the hot path (spec §9 design note). A `Vec`
//! acting as an MRU-ordered index (front = most recently used) gets the same
//! eviction behavior with a simpler implementation; the per-page state itself
//! still lives in one place (`pages`) so no entry is ever copied on touch.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use vds_utils::{VdsError, VdsResult};

use crate::object_store::ObjectStore;

/// Per-page state (spec §4.5 "State per page").
struct Page {
    data: Vec<u8>,
    valid: bool,
    dirty: bool,
    lock_count: u32,
    transfer_error: Option<VdsError>,
}

impl Page {
    fn zeroed(byte_len: usize) -> Page {
        Page {
            data: vec![0u8; byte_len],
            valid: false,
            dirty: false,
            lock_count: 0,
            transfer_error: None,
        }
    }
}

struct Inner {
    pages: HashMap<u32, Page>,
    /// MRU order, front = most recently used. Mirrors the clean LRU list;
    /// dirty pages are tracked separately below.
    clean_mru: Vec<u32>,
    dirty: Vec<u32>,
    page_limit: usize,
}

/// Per-layer paged metadata cache (spec §4.5).
///
/// `P` is entries per page, `E` is bytes per entry (8 for non-adaptive
/// layers, 28 for wavelet-adaptive ones — spec §6).
pub struct MetadataManager {
    layer_key: String,
    entries_per_page: u32,
    entry_size: u32,
    inner: Mutex<Inner>,
    transfer_completed: Condvar,
}

impl MetadataManager {
    pub fn new(layer_key: String, entries_per_page: u32, entry_size: u32) -> MetadataManager {
        MetadataManager {
            layer_key,
            entries_per_page,
            entry_size,
            inner: Mutex::new(Inner {
                pages: HashMap::new(),
                clean_mru: Vec::new(),
                dirty: Vec::new(),
                page_limit: 64,
            }),
            transfer_completed: Condvar::new(),
        }
    }

    pub fn layer_key(&self) -> &str {
        &self.layer_key
    }

    pub fn entries_per_page(&self) -> u32 {
        self.entries_per_page
    }

    pub fn entry_size(&self) -> u32 {
        self.entry_size
    }

    fn page_byte_len(&self) -> usize {
        self.entries_per_page as usize * self.entry_size as usize
    }

    /// `(pageIndex, entryIndex)` split of a chunk's linear metadata-entry
    /// offset.
    pub fn entry_location(&self, linear_entry_index: u64) -> (u32, u32) {
        let per_page = self.entries_per_page as u64;
        ((linear_entry_index / per_page) as u32, (linear_entry_index % per_page) as u32)
    }

    fn object_name(&self, page_index: u32) -> String {
        format!("{}/ChunkMetadata/{}", self.layer_key, page_index)
    }

    /// spec §4.5 `lockPage`: returns whether the caller must call
    /// [`Self::initiate_transfer`] (`true` only for a freshly created page).
    pub fn lock_page(&self, page_index: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let byte_len = self.page_byte_len();
        let needs_transfer = if let Some(page) = inner.pages.get_mut(&page_index) {
            page.lock_count += 1;
            if !page.dirty {
                touch_mru(&mut inner.clean_mru, page_index);
            }
            false
        } else {
            inner.pages.insert(page_index, {
                let mut p = Page::zeroed(byte_len);
                p.lock_count = 1;
                p
            });
            inner.clean_mru.insert(0, page_index);
            true
        };
        self.evict_locked(&mut inner);
        needs_transfer
    }

    /// spec §4.5 `initiateTransfer`: fetches the page object and stores the
    /// result, then wakes every thread parked on [`Self::wait_for_valid`].
    pub fn initiate_transfer(&self, page_index: u32, store: &dyn ObjectStore) {
        let object_name = self.object_name(page_index);
        let result = store.get(&object_name, None);
        let mut inner = self.inner.lock().unwrap();
        if let Some(page) = inner.pages.get_mut(&page_index) {
            match result {
                Ok(fetched) => {
                    let want_len = self.page_byte_len();
                    if fetched.data.len() == want_len {
                        page.data = fetched.data;
                        page.valid = true;
                    } else if fetched.data.is_empty() {
                        page.transfer_error = Some(VdsError::MetadataPageFetch {
                            layer: self.layer_key.clone(),
                            page_index,
                            message: "empty metadata page".to_string(),
                        });
                    } else {
                        page.transfer_error = Some(VdsError::MetadataPageFetch {
                            layer: self.layer_key.clone(),
                            page_index,
                            message: format!(
                                "unexpected page size {} (want {want_len})",
                                fetched.data.len()
                            ),
                        });
                    }
                }
                Err(err) => {
                    page.transfer_error = Some(VdsError::MetadataPageFetch {
                        layer: self.layer_key.clone(),
                        page_index,
                        message: err.to_string(),
                    });
                }
            }
        }
        self.transfer_completed.notify_all();
    }

    /// spec §4.5 `initPage`: a zero-filled valid page for newly created
    /// layers, bypassing any object fetch.
    pub fn init_page(&self, page_index: u32) {
        let mut inner = self.inner.lock().unwrap();
        let byte_len = self.page_byte_len();
        let page = inner
            .pages
            .entry(page_index)
            .or_insert_with(|| Page::zeroed(byte_len));
        page.valid = true;
        if !inner.clean_mru.contains(&page_index) && !inner.dirty.contains(&page_index) {
            inner.clean_mru.insert(0, page_index);
        }
        drop(inner);
        self.transfer_completed.notify_all();
    }

    /// Blocks until `page_index` is `valid` or carries a transfer error.
    pub fn wait_for_valid(&self, page_index: u32) -> VdsResult<()> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.pages.get(&page_index) {
                Some(page) if page.valid => return Ok(()),
                Some(page) if page.transfer_error.is_some() => {
                    return Err(page.transfer_error.clone().unwrap());
                }
                Some(_) => {
                    inner = self.transfer_completed.wait(inner).unwrap();
                }
                None => return Err(VdsError::invalid_argument("page was unlocked before becoming valid")),
            }
        }
    }

    /// spec §4.5 `getEntry`.
    pub fn get_entry(&self, page_index: u32, entry_index: u32) -> VdsResult<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let page = inner
            .pages
            .get(&page_index)
            .ok_or_else(|| VdsError::invalid_argument("page not locked"))?;
        if !page.valid {
            return Err(VdsError::invalid_argument("page is not valid"));
        }
        let e = self.entry_size as usize;
        let start = entry_index as usize * e;
        Ok(page.data[start..start + e].to_vec())
    }

    /// spec §4.5 `setEntry`, returns the previous entry bytes.
    pub fn set_entry(&self, page_index: u32, entry_index: u32, new_entry: &[u8]) -> VdsResult<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let e = self.entry_size as usize;
        let page = inner
            .pages
            .get_mut(&page_index)
            .ok_or_else(|| VdsError::invalid_argument("page not locked"))?;
        let start = entry_index as usize * e;
        let old = page.data[start..start + e].to_vec();
        page.data[start..start + e].copy_from_slice(new_entry);
        let was_dirty = page.dirty;
        page.dirty = true;
        if !was_dirty {
            inner.clean_mru.retain(|&p| p != page_index);
            inner.dirty.push(page_index);
        }
        Ok(old)
    }

    /// spec §4.5 `uploadDirtyPages`.
    pub fn upload_dirty_pages(&self, store: &dyn ObjectStore) -> VdsResult<()> {
        let dirty_indexes: Vec<u32> = {
            let inner = self.inner.lock().unwrap();
            inner.dirty.clone()
        };
        for page_index in dirty_indexes {
            let data = {
                let inner = self.inner.lock().unwrap();
                inner.pages.get(&page_index).map(|p| p.data.clone())
            };
            let Some(data) = data else { continue };
            store.put(&self.object_name(page_index), &data, Vec::new())?;
            let mut inner = self.inner.lock().unwrap();
            if let Some(page) = inner.pages.get_mut(&page_index) {
                page.dirty = false;
            }
            inner.dirty.retain(|&p| p != page_index);
            inner.clean_mru.insert(0, page_index);
        }
        Ok(())
    }

    /// spec §4.5 `unlockPage`.
    pub fn unlock_page(&self, page_index: u32) {
        let mut inner = self.inner.lock().unwrap();
        let should_drop = if let Some(page) = inner.pages.get_mut(&page_index) {
            page.lock_count = page.lock_count.saturating_sub(1);
            page.lock_count == 0 && !page.valid
        } else {
            false
        };
        if should_drop {
            inner.pages.remove(&page_index);
            inner.clean_mru.retain(|&p| p != page_index);
            inner.dirty.retain(|&p| p != page_index);
        }
        self.evict_locked(&mut inner);
    }

    fn evict_locked(&self, inner: &mut Inner) {
        while inner.clean_mru.len() + inner.dirty.len() > inner.page_limit {
            let evict_at = inner
                .clean_mru
                .iter()
                .rposition(|&p| inner.pages.get(&p).map(|pg| pg.lock_count == 0).unwrap_or(false));
            let Some(pos) = evict_at else { break };
            let page_index = inner.clean_mru.remove(pos);
            inner.pages.remove(&page_index);
        }
    }

    pub fn set_page_limit(&self, limit: usize) {
        self.inner.lock().unwrap().page_limit = limit;
    }
}

fn touch_mru(mru: &mut Vec<u32>, page_index: u32) {
    if let Some(pos) = mru.iter().position(|&p| p == page_index) {
        mru.remove(pos);
    }
    mru.insert(0, page_index);
}

/// Size accounting for adaptive-level decisions (spec §4.5
/// `updateMetadataStatus`). Commutative/associative by construction: each
/// field is a plain running sum.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetadataStatus {
    pub uncompressed_size: i64,
    pub serialized_size: i64,
    pub adaptive_level_sizes: [i64; crate::layout::WAVELET_ADAPTIVE_LEVELS],
}

impl MetadataStatus {
    pub fn accumulate(
        &mut self,
        uncompressed_delta: i64,
        serialized_delta: i64,
        subtract: bool,
        adaptive_levels: &[u8; crate::layout::WAVELET_ADAPTIVE_LEVELS],
    ) {
        let sign = if subtract { -1 } else { 1 };
        self.uncompressed_size += sign * uncompressed_delta;
        self.serialized_size += sign * serialized_delta;
        for (acc, &level) in self.adaptive_level_sizes.iter_mut().zip(adaptive_levels.iter()) {
            *acc += sign * level as i64;
        }
    }
}

pub type SharedMetadataManager = Arc<MetadataManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{ByteRange, GetResult, ObjectHeaders};
    use std::sync::Mutex as StdMutex;

    struct FakeStore {
        pages: StdMutex<HashMap<String, Vec<u8>>>,
    }

    impl ObjectStore for FakeStore {
        fn get(&self, key: &str, _range: Option<ByteRange>) -> VdsResult<GetResult> {
            let pages = self.pages.lock().unwrap();
            match pages.get(key) {
                Some(data) => Ok(GetResult {
                    data: data.clone(),
                    headers: Vec::new(),
                }),
                None => Err(VdsError::ObjectStoreTransport("not found".into())),
            }
        }
        fn put(&self, key: &str, data: &[u8], _headers: ObjectHeaders) -> VdsResult<()> {
            self.pages.lock().unwrap().insert(key.to_string(), data.to_vec());
            Ok(())
        }
        fn exists(&self, key: &str) -> VdsResult<bool> {
            Ok(self.pages.lock().unwrap().contains_key(key))
        }
    }

    #[test]
    fn lock_then_init_then_get_entry() {
        let manager = MetadataManager::new("Dimensions_012LOD0".into(), 4, 8);
        let needs_transfer = manager.lock_page(0);
        assert!(needs_transfer);
        manager.init_page(0);
        let entry = manager.get_entry(0, 2).unwrap();
        assert_eq!(entry, vec![0u8; 8]);
    }

    #[test]
    fn set_entry_moves_page_to_dirty_and_uploads() {
        let manager = MetadataManager::new("Dimensions_012LOD0".into(), 4, 8);
        manager.lock_page(0);
        manager.init_page(0);
        let old = manager.set_entry(0, 1, &42u64.to_le_bytes()).unwrap();
        assert_eq!(old, vec![0u8; 8]);

        let store = FakeStore {
            pages: StdMutex::new(HashMap::new()),
        };
        manager.upload_dirty_pages(&store).unwrap();
        let uploaded = store.get("Dimensions_012LOD0/ChunkMetadata/0", None).unwrap();
        assert_eq!(&uploaded.data[8..16], &42u64.to_le_bytes());
    }

    #[test]
    fn transfer_error_is_sticky_until_unlock() {
        let manager = MetadataManager::new("Dimensions_012LOD0".into(), 4, 8);
        manager.lock_page(0);
        let store = FakeStore {
            pages: StdMutex::new(HashMap::new()),
        };
        manager.initiate_transfer(0, &store);
        let err = manager.wait_for_valid(0).unwrap_err();
        assert_eq!(err.kind(), "MetadataPageFetch");
        manager.unlock_page(0);
        assert!(manager.get_entry(0, 0).is_err());
    }
}
