//! Merge-on-insert byte range store.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::HostResult;

/// Size of the 32-bit virtual address space.
const ADDRESS_SPACE: u64 = 1 << 32;

/// One stored run of patched bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchRegion<'a> {
    pub address: u32,
    pub bytes: &'a [u8],
}

/// Sorted set of patched byte ranges.
///
/// Invariant: no two stored regions overlap or touch. Every insert
/// overwrites the bytes it covers and coalesces with its neighbours, so the
/// set is always the minimal list of maximal runs.
///
/// On disk a pool is a JSON map of `address -> [bytes]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PatchPool {
    regions: BTreeMap<u32, Vec<u8>>,
}

impl PatchPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `bytes` at `address`, overwriting any stored bytes they cover.
    ///
    /// Bytes that would run past the end of the 32-bit address space are
    /// dropped. Inserting an empty slice is a no-op.
    pub fn insert(&mut self, address: u32, bytes: &[u8]) {
        let room = usize::try_from(ADDRESS_SPACE - u64::from(address)).unwrap_or(usize::MAX);
        let bytes = &bytes[..bytes.len().min(room)];
        if bytes.is_empty() {
            return;
        }
        let start = u64::from(address);
        let end = start + bytes.len() as u64;

        // Every region that overlaps or touches [start, end]. Only the
        // nearest region below `address` can reach it, since stored regions
        // never touch each other.
        let mut absorbed: Vec<(u32, u64)> = Vec::new();
        if let Some((&key, data)) = self.regions.range(..address).next_back() {
            let key_end = u64::from(key) + data.len() as u64;
            if key_end >= start {
                absorbed.push((key, key_end));
            }
        }
        let upper = u32::try_from(end).unwrap_or(u32::MAX);
        absorbed.extend(
            self.regions
                .range(address..=upper)
                .map(|(&key, data)| (key, u64::from(key) + data.len() as u64)),
        );

        let merged_start = absorbed
            .first()
            .map_or(start, |&(key, _)| start.min(u64::from(key)));
        let merged_end = absorbed
            .iter()
            .fold(end, |acc, &(_, key_end)| acc.max(key_end));

        let mut merged = vec![0u8; (merged_end - merged_start) as usize];
        for (key, _) in absorbed {
            if let Some(data) = self.regions.remove(&key) {
                let at = (u64::from(key) - merged_start) as usize;
                merged[at..at + data.len()].copy_from_slice(&data);
            }
        }
        let at = (start - merged_start) as usize;
        merged[at..at + bytes.len()].copy_from_slice(bytes);

        // merged_start <= address, so it fits.
        self.regions.insert(merged_start as u32, merged);
    }

    /// Regions in ascending address order.
    pub fn regions(&self) -> impl Iterator<Item = PatchRegion<'_>> {
        self.regions.iter().map(|(&address, bytes)| PatchRegion {
            address,
            bytes: bytes.as_slice(),
        })
    }

    /// Number of stored regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Load a pool from its JSON file. A missing file yields an empty pool.
    pub fn load(path: &Path) -> HostResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the pool to its JSON file.
    pub fn save(&self, path: &Path) -> HostResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

impl<'de> Deserialize<'de> for PatchPool {
    /// Entries are re-inserted so a hand-edited file cannot break the
    /// no-overlap invariant.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<u32, Vec<u8>>::deserialize(deserializer)?;
        let mut pool = Self::new();
        for (address, bytes) in raw {
            pool.insert(address, &bytes);
        }
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pool: &PatchPool) -> Vec<(u32, Vec<u8>)> {
        pool.regions().map(|r| (r.address, r.bytes.to_vec())).collect()
    }

    #[test]
    fn test_insert_into_empty_pool() {
        let mut pool = PatchPool::new();
        pool.insert(0x10, &[1, 2]);
        assert_eq!(snapshot(&pool), vec![(0x10, vec![1, 2])]);
    }

    #[test]
    fn test_overlapping_tail_overwrites_and_coalesces() {
        let mut pool = PatchPool::new();
        pool.insert(100, &[1, 2, 3, 4]);
        pool.insert(102, &[9, 9]);
        assert_eq!(snapshot(&pool), vec![(100, vec![1, 2, 9, 9])]);
    }

    #[test]
    fn test_adjacent_regions_coalesce() {
        let mut pool = PatchPool::new();
        pool.insert(10, &[1, 2]);
        pool.insert(14, &[5]);
        pool.insert(12, &[3, 4]);
        assert_eq!(snapshot(&pool), vec![(10, vec![1, 2, 3, 4, 5])]);
    }

    #[test]
    fn test_insert_spanning_several_regions() {
        let mut pool = PatchPool::new();
        pool.insert(2, &[1, 1]);
        pool.insert(6, &[2, 2]);
        pool.insert(12, &[3]);
        pool.insert(0, &[7, 7, 7, 7, 7, 7, 7]);
        assert_eq!(
            snapshot(&pool),
            vec![(0, vec![7, 7, 7, 7, 7, 7, 7, 2]), (12, vec![3])]
        );
    }

    #[test]
    fn test_insert_inside_existing_region() {
        let mut pool = PatchPool::new();
        pool.insert(0, &[0; 8]);
        pool.insert(3, &[1, 2]);
        assert_eq!(snapshot(&pool), vec![(0, vec![0, 0, 0, 1, 2, 0, 0, 0])]);
    }

    #[test]
    fn test_insert_before_region_extends_start() {
        let mut pool = PatchPool::new();
        pool.insert(4, &[4, 5, 6]);
        pool.insert(2, &[2, 3, 9]);
        assert_eq!(snapshot(&pool), vec![(2, vec![2, 3, 9, 5, 6])]);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut once = PatchPool::new();
        once.insert(5, &[1, 2, 3]);
        let mut twice = once.clone();
        twice.insert(5, &[1, 2, 3]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_insert_is_noop() {
        let mut pool = PatchPool::new();
        pool.insert(5, &[]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_top_of_address_space_is_truncated() {
        let mut pool = PatchPool::new();
        pool.insert(u32::MAX - 1, &[1, 2, 3, 4]);
        assert_eq!(snapshot(&pool), vec![(u32::MAX - 1, vec![1, 2])]);
        pool.insert(u32::MAX - 3, &[8, 8]);
        assert_eq!(snapshot(&pool), vec![(u32::MAX - 3, vec![8, 8, 1, 2])]);
    }

    #[test]
    fn test_json_round_trip() {
        let mut pool = PatchPool::new();
        pool.insert(0x8785, &[0xC9]);
        pool.insert(0x872C, &[0xCA, 0x87]);
        let json = serde_json::to_string(&pool).unwrap();
        assert_eq!(json, r#"{"34604":[202,135],"34693":[201]}"#);

        let restored: PatchPool = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot(&restored), snapshot(&pool));
    }

    #[test]
    fn test_deserialize_normalizes_overlaps() {
        let restored: PatchPool = serde_json::from_str(r#"{"0":[1,2,3],"2":[9,9]}"#).unwrap();
        assert_eq!(snapshot(&restored), vec![(0, vec![1, 2, 9, 9])]);
    }
}
