// Copyright 2021 Satchel contributors

// SPDX-License-Identifier: Apache-2.0

//! Raw data storages and the de-duplicating storage table.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

/// An opaque blob of typed elements living on some device. Storages are
/// shared by handle; two `Arc`s to the same allocation are the same
/// storage for de-duplication purposes.
#[derive(Debug)]
pub struct Storage {
    type_tag: String,
    device: String,
    element_size: usize,
    data: Vec<u8>,
}

impl Storage {
    pub fn new(type_tag: &str, device: &str, element_size: usize, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            type_tag: type_tag.to_string(),
            device: device.to_string(),
            element_size,
            data,
        })
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// Location tag, e.g. `cpu` or `cuda:0`.
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn numel(&self) -> usize {
        if self.element_size == 0 {
            0
        } else {
            self.data.len() / self.element_size
        }
    }

    fn is_local(&self) -> bool {
        self.device == "cpu"
    }

    /// Bytes of the storage on the local device. Non-local storages are
    /// copied over before their bytes can be read.
    pub fn local_data(&self) -> Cow<'_, [u8]> {
        if self.is_local() {
            Cow::Borrowed(&self.data)
        } else {
            debug!("moving storage from `{}` to the local device", self.device);
            Cow::Owned(self.data.clone())
        }
    }
}

/// Map from storage identity to the minted key it will be emitted under.
/// Insertion-ordered; emission iterates over sorted keys.
#[derive(Debug, Default)]
pub struct StorageTable {
    entries: HashMap<String, Arc<Storage>>,
    identities: HashMap<usize, String>,
    order: Vec<String>,
}

impl StorageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `storage`, minting a fresh key on first sight and returning
    /// the existing key on every later one.
    pub fn register<F: FnOnce() -> String>(&mut self, storage: &Arc<Storage>, mint: F) -> String {
        let identity = Arc::as_ptr(storage) as usize;
        if let Some(key) = self.identities.get(&identity) {
            return key.clone();
        }
        let key = mint();
        self.identities.insert(identity, key.clone());
        self.entries.insert(key.clone(), Arc::clone(storage));
        self.order.push(key.clone());
        key
    }

    pub fn get(&self, key: &str) -> Option<&Arc<Storage>> {
        self.entries.get(key)
    }

    /// Keys in sorted order, as emitted.
    pub fn sorted_keys(&self) -> Vec<String> {
        let mut keys = self.order.clone();
        keys.sort();
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
