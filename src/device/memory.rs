//! Buffer registration bookkeeping
//!
//! The table maps buffer identity to the driver-issued mapping id. It never
//! talks to the driver itself; [`DeviceSession`](super::DeviceSession) does
//! the mapping and records the result here.

use std::collections::HashMap;

use crate::tensor::{Buffer, BufferId};

use super::request::RequestId;

/// Driver mapping ids are never zero
pub const FORBIDDEN_MEMORY_ID: u64 = 0;

/// One registered buffer
#[derive(Debug, Clone)]
pub struct MappingEntry {
    pub id: u64,
    pub size: usize,
    /// Keeps the storage alive while the device may touch it
    pub buffer: Buffer,
    /// Last request that used the mapping
    pub ticket: Option<RequestId>,
}

#[derive(Debug, Default)]
pub struct MemoryMapTable {
    entries: HashMap<BufferId, MappingEntry>,
    by_id: HashMap<u64, BufferId>,
}

impl MemoryMapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, buffer: BufferId) -> Option<&MappingEntry> {
        self.entries.get(&buffer)
    }

    pub fn contains_id(&self, id: u64) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn insert(&mut self, buffer: &Buffer, id: u64) -> &MappingEntry {
        let key = buffer.id();
        if let Some(old) = self.entries.remove(&key) {
            self.by_id.remove(&old.id);
        }
        self.by_id.insert(id, key);
        self.entries.entry(key).or_insert(MappingEntry {
            id,
            size: buffer.len(),
            buffer: buffer.clone(),
            ticket: None,
        })
    }

    /// Record `request` as the latest user of `buffer`
    pub fn stamp(&mut self, buffer: BufferId, request: RequestId) {
        if let Some(entry) = self.entries.get_mut(&buffer) {
            entry.ticket = Some(request);
        }
    }

    pub fn remove(&mut self, buffer: BufferId) -> Option<MappingEntry> {
        let entry = self.entries.remove(&buffer)?;
        self.by_id.remove(&entry.id);
        Some(entry)
    }

    pub fn remove_id(&mut self, id: u64) -> Option<MappingEntry> {
        let buffer = self.by_id.remove(&id)?;
        self.entries.remove(&buffer)
    }

    /// Mapping ids, ascending
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
