//! Patch pool merge properties.

use proptest::prelude::*;
use retrohost_core::PatchPool;

const SPACE: usize = 1024;

fn snapshot(pool: &PatchPool) -> Vec<(u32, Vec<u8>)> {
    pool.regions().map(|r| (r.address, r.bytes.to_vec())).collect()
}

/// Maximal runs of written bytes in a last-writer-wins byte array.
fn runs(model: &[Option<u8>]) -> Vec<(u32, Vec<u8>)> {
    let mut out: Vec<(u32, Vec<u8>)> = Vec::new();
    let mut current: Option<(u32, Vec<u8>)> = None;
    for (at, byte) in model.iter().enumerate() {
        let Some(b) = byte else {
            out.extend(current.take());
            continue;
        };
        if let Some((_, bytes)) = current.as_mut() {
            bytes.push(*b);
            continue;
        }
        current = Some((at as u32, vec![*b]));
    }
    out.extend(current);
    out
}

fn region() -> impl Strategy<Value = (u32, Vec<u8>)> {
    (0u32..900, prop::collection::vec(any::<u8>(), 0..64))
}

/// Bytes that depend only on their address, so overlapping inserts agree.
fn address_derived(address: u32, length: usize) -> Vec<u8> {
    (0..length)
        .map(|i| ((address as usize + i) * 7 + 3) as u8)
        .collect()
}

proptest! {
    #[test]
    fn property_pool_matches_last_writer_model(inserts in prop::collection::vec(region(), 0..12)) {
        let mut pool = PatchPool::new();
        let mut model = vec![None; SPACE];
        for (address, bytes) in &inserts {
            pool.insert(*address, bytes);
            for (i, &b) in bytes.iter().enumerate() {
                model[*address as usize + i] = Some(b);
            }
        }
        prop_assert_eq!(snapshot(&pool), runs(&model));
    }

    #[test]
    fn property_insert_is_idempotent(
        seed in prop::collection::vec(region(), 0..6),
        (address, bytes) in region(),
    ) {
        let mut once = PatchPool::new();
        for (a, b) in &seed {
            once.insert(*a, b);
        }
        once.insert(address, &bytes);
        let mut twice = once.clone();
        twice.insert(address, &bytes);
        prop_assert_eq!(snapshot(&once), snapshot(&twice));
    }

    #[test]
    fn property_merge_is_order_independent(
        spans in prop::collection::vec((0u32..200, 1usize..48), 3),
    ) {
        let regions: Vec<(u32, Vec<u8>)> = spans
            .iter()
            .map(|&(address, length)| (address, address_derived(address, length)))
            .collect();
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        let build = |order: &[usize; 3]| {
            let mut pool = PatchPool::new();
            for &i in order {
                pool.insert(regions[i].0, &regions[i].1);
            }
            snapshot(&pool)
        };
        let reference = build(&orders[0]);
        for order in &orders[1..] {
            prop_assert_eq!(build(order), reference.clone());
        }
    }

    #[test]
    fn property_json_round_trip(inserts in prop::collection::vec(region(), 0..8)) {
        let mut pool = PatchPool::new();
        for (address, bytes) in &inserts {
            pool.insert(*address, bytes);
        }
        let json = serde_json::to_string(&pool).unwrap();
        let restored: PatchPool = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(snapshot(&restored), snapshot(&pool));
    }
}

#[test]
fn test_overwrite_then_coalesce_scenario() {
    let mut pool = PatchPool::new();
    pool.insert(100, &[1, 2, 3, 4]);
    pool.insert(102, &[9, 9]);
    assert_eq!(snapshot(&pool), vec![(100, vec![1, 2, 9, 9])]);
}
