//! # Summary
//!
//! This module defines the contract the pipeline requires from the key-value
//! store, and a thread-safe in-memory implementation. Each machine owns one
//! store holding the keys of its partition; the worker applies writes, and
//! tests preload fixtures through the same interface.
//!
//! Mastership defaults are computed by a `MetadataInitializer`: every
//! machine derives the same metadata for a key it has never seen, so the
//! forwarder can classify transactions without a metadata exchange.

use parking_lot::RwLock;
use std::collections::HashMap as Map;

use crate::transaction::{Key, Metadata};

pub trait Storage: Send + Sync {
    fn read(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn write(&self, key: &[u8], value: Vec<u8>);
    fn delete(&self, key: &[u8]) -> bool;
}

#[derive(Default)]
pub struct MemStorage {
    data: RwLock<Map<Key, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        MemStorage::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Storage for MemStorage {
    fn read(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.read().get(key).cloned()
    }

    fn write(&self, key: &[u8], value: Vec<u8>) {
        self.data.write().insert(key.to_vec(), value);
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.data.write().remove(key).is_some()
    }
}

/// Computes the default mastership of a key that has never been remastered.
/// Must be deterministic across machines. The forwarder runs without one in
/// the generic deployments, where an unknown key is homed at the local
/// region instead.
pub trait MetadataInitializer: Send + Sync {
    fn compute(&self, key: &[u8]) -> Metadata;
}

/// MovR keys embed a 16-bit city index in the top bits of their leading
/// 8-byte id; cities are striped over partitions, then regions.
pub struct MovrInitializer {
    num_regions: u32,
    num_partitions: u32,
}

impl MovrInitializer {
    pub fn new(num_regions: u32, num_partitions: u32) -> Self {
        MovrInitializer { num_regions, num_partitions }
    }
}

impl MetadataInitializer for MovrInitializer {
    fn compute(&self, key: &[u8]) -> Metadata {
        if key.len() < 8 {
            warn!("MovR key shorter than 8 bytes; defaulting to region 0");
            return Metadata { master: 0, counter: 0 };
        }
        let global_id = u64::from_le_bytes([
            key[0], key[1], key[2], key[3], key[4], key[5], key[6], key[7],
        ]);
        let city_index = (global_id >> 48) as u32;
        Metadata {
            master: (city_index / self.num_partitions) % self.num_regions,
            counter: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_storage_round_trip() {
        let storage = MemStorage::new();
        assert_eq!(storage.read(b"k"), None);
        storage.write(b"k", b"v".to_vec());
        assert_eq!(storage.read(b"k"), Some(b"v".to_vec()));
        assert!(storage.delete(b"k"));
        assert!(!storage.delete(b"k"));
    }

    #[test]
    fn movr_initializer_uses_city_index() {
        let init = MovrInitializer::new(2, 4);
        // City index 5 lives in the top 16 bits of the little-endian id.
        let global_id: u64 = 5 << 48;
        let key = global_id.to_le_bytes().to_vec();
        assert_eq!(init.compute(&key).master, (5 / 4) % 2);
    }
}
