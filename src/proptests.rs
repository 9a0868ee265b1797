use super::*;

use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::collections::HashMap;

/// Operations both map variants support, so one model drives either.
trait ModelMap {
    type L: KeyLayout;

    fn build(page_size: u32, free_indices_limit: u32) -> Self;
    fn try_add(&mut self, value: u32) -> Result<SlotKey<Self::L>, Rejected<u32>>;
    fn try_get(&self, key: SlotKey<Self::L>) -> Result<&u32, SlotError>;
    fn try_replace(&mut self, key: SlotKey<Self::L>, value: u32) -> Result<SlotKey<Self::L>, Rejected<u32>>;
    fn try_remove(&mut self, key: SlotKey<Self::L>) -> Result<u32, SlotError>;
    fn clear(&mut self);
    fn len(&self) -> usize;
    fn tombstone_count(&self) -> usize;
    fn entries(&self) -> Vec<(SlotKey<Self::L>, u32)>;
    fn validate(&self);
}

macro_rules! model_map {
    ($map:ident) => {
        impl<L: KeyLayout> ModelMap for $map<u32, L> {
            type L = L;

            fn build(page_size: u32, free_indices_limit: u32) -> Self {
                $map::with_page_size(page_size, free_indices_limit)
            }
            fn try_add(&mut self, value: u32) -> Result<SlotKey<L>, Rejected<u32>> {
                $map::try_add(self, value)
            }
            fn try_get(&self, key: SlotKey<L>) -> Result<&u32, SlotError> {
                $map::try_get(self, key)
            }
            fn try_replace(&mut self, key: SlotKey<L>, value: u32) -> Result<SlotKey<L>, Rejected<u32>> {
                $map::try_replace(self, key, value)
            }
            fn try_remove(&mut self, key: SlotKey<L>) -> Result<u32, SlotError> {
                $map::try_remove(self, key)
            }
            fn clear(&mut self) {
                $map::clear(self)
            }
            fn len(&self) -> usize {
                $map::len(self)
            }
            fn tombstone_count(&self) -> usize {
                $map::tombstone_count(self)
            }
            fn entries(&self) -> Vec<(SlotKey<L>, u32)> {
                self.iter().map(|(key, value)| (key, *value)).collect()
            }
            fn validate(&self) {
                self.assert_invariants();
            }
        }
    };
}

model_map!(PagedSlotMap);
model_map!(SparseSlotMap);

#[derive(Clone, Debug, Arbitrary)]
enum Op {
    #[proptest(weight = 4)]
    Add(u32),
    #[proptest(weight = 3)]
    Remove(#[proptest(strategy = "0usize..64")] usize),
    #[proptest(weight = 2)]
    Replace(#[proptest(strategy = "0usize..64")] usize, u32),
    #[proptest(weight = 3)]
    Get(#[proptest(strategy = "0usize..64")] usize),
    #[proptest(skip)]
    Clear,
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        99 => any::<Op>(),
        1 => Just(Op::Clear),
    ];
    prop::collection::vec(op, 0..=600)
}

/// Record of every key a map has issued, for version monotonicity checks.
#[derive(Default)]
struct Issued<L: KeyLayout> {
    keys: Vec<SlotKey<L>>,
    newest: HashMap<u32, u32>,
}

impl<L: KeyLayout> Issued<L> {
    fn record(&mut self, key: SlotKey<L>) -> Result<(), TestCaseError> {
        let version = key.version().get();
        if let Some(&prev) = self.newest.get(&key.index()) {
            prop_assert!(
                version > prev,
                "index {} reissued at {} after {}",
                key.index(),
                version,
                prev
            );
        }
        self.newest.insert(key.index(), version);
        self.keys.push(key);
        Ok(())
    }

    fn pick(&self, at: usize) -> SlotKey<L> {
        if self.keys.is_empty() {
            SlotKey::INVALID
        } else {
            self.keys[at % self.keys.len()]
        }
    }
}

fn run_model<M: ModelMap>(
    page_size: u32,
    free_indices_limit: u32,
    ops: Vec<Op>,
) -> Result<M, TestCaseError> {
    let mut map = M::build(page_size, free_indices_limit);
    let mut live: HashMap<SlotKey<M::L>, u32> = HashMap::new();
    let mut issued: Issued<M::L> = Issued::default();

    for op in ops {
        match op {
            Op::Add(value) => {
                let key = map.try_add(value).map_err(|r| TestCaseError::fail(r.to_string()))?;
                prop_assert!(live.keys().all(|k| k.index() != key.index()));
                issued.record(key)?;
                live.insert(key, value);
            }
            Op::Remove(at) => {
                let key = issued.pick(at);
                prop_assert_eq!(map.try_remove(key).ok(), live.remove(&key));
                prop_assert!(map.try_get(key).is_err());
            }
            Op::Replace(at, value) => {
                let key = issued.pick(at);
                match map.try_replace(key, value) {
                    Ok(next) => {
                        prop_assert!(live.remove(&key).is_some(), "replaced a dead key {:?}", key);
                        prop_assert_ne!(next, key);
                        issued.record(next)?;
                        live.insert(next, value);
                        prop_assert!(map.try_get(key).is_err());
                    }
                    Err(rejected) => {
                        prop_assert!(!live.contains_key(&key));
                        prop_assert_eq!(rejected.value, value);
                    }
                }
            }
            Op::Get(at) => {
                let key = issued.pick(at);
                prop_assert_eq!(map.try_get(key).ok().copied(), live.get(&key).copied());
            }
            Op::Clear => {
                map.clear();
                live.clear();
            }
        }

        prop_assert_eq!(map.len(), live.len());
        map.validate();
    }

    let entries = map.entries();
    prop_assert_eq!(entries.len(), live.len());
    for (key, value) in &entries {
        prop_assert_eq!(live.get(key), Some(value));
    }
    Ok(map)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        max_shrink_iters: 20_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_paged_matches_model(ops in ops_strategy(), limit in 0u32..6) {
        let map: PagedSlotMap<u32> = run_model(4, limit, ops)?;
        let indices: Vec<u32> = map.keys().map(SlotKey::index).collect();
        prop_assert!(indices.windows(2).all(|w| w[0] < w[1]), "paged order must follow index");
    }

    #[test]
    fn prop_sparse_matches_model(ops in ops_strategy(), limit in 0u32..6) {
        let map: SparseSlotMap<u32> = run_model(4, limit, ops)?;
        prop_assert_eq!(map.values().count(), map.len());
    }

    #[test]
    fn prop_small_versions_exhaust_cleanly(ops in ops_strategy()) {
        let paged: PagedSlotMap<u32, Version8> = run_model(2, 0, ops.clone())?;
        let sparse: SparseSlotMap<u32, Version8> = run_model(2, 0, ops)?;
        prop_assert_eq!(paged.len(), sparse.len());
        prop_assert_eq!(paged.tombstone_count(), sparse.tombstone_count());
    }

    #[test]
    fn prop_key_raw_roundtrip(index in any::<u32>(), version in 1u32..=u16::MAX as u32, tag in any::<u16>()) {
        let key: SlotKey<Tagged16> = SlotKey::new(index, SlotVersion::new(version)).with_tag(tag);
        let back = SlotKey::<Tagged16>::from_raw(key.to_raw());
        prop_assert_eq!(back, key);
        prop_assert_eq!(back.index(), index);
        prop_assert_eq!(back.version().get(), version);
        prop_assert_eq!(back.tag(), tag);
    }
}

fn churn<M: ModelMap>(seed: u64, steps: usize) -> M {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(seed);
    let mut map = M::build(4, 0);
    let mut live: Vec<(SlotKey<M::L>, u32)> = Vec::new();

    for step in 0..steps {
        let value = step as u32;
        match rng.gen_range(0..10) {
            0..=3 if live.len() < 8 => {
                let key = map.try_add(value).expect("unbounded map accepts adds");
                live.push((key, value));
            }
            4..=5 if !live.is_empty() => {
                let at = rng.gen_range(0..live.len());
                let (key, _) = live[at];
                let next = map.try_replace(key, value).expect("live key replaces");
                live[at] = (next, value);
                assert!(map.try_get(key).is_err());
            }
            _ if !live.is_empty() => {
                let (key, expected) = live.swap_remove(rng.gen_range(0..live.len()));
                assert_eq!(map.try_remove(key), Ok(expected));
                assert!(map.try_remove(key).is_err());
            }
            _ => {}
        }
        assert_eq!(map.len(), live.len());
    }

    map.validate();
    for &(key, value) in &live {
        assert_eq!(map.try_get(key), Ok(&value));
    }
    map
}

#[test]
fn churn_small_versions_tombstones_slots() {
    let paged: PagedSlotMap<u32, Version8> = churn(7, 20_000);
    let sparse: SparseSlotMap<u32, Version8> = churn(7, 20_000);
    assert!(paged.tombstone_count() > 0);
    assert_eq!(paged.tombstone_count(), sparse.tombstone_count());
}

#[test]
fn churn_default_versions_never_tombstone() {
    let paged: PagedSlotMap<u32> = churn(11, 20_000);
    let sparse: SparseSlotMap<u32> = churn(11, 20_000);
    assert_eq!(paged.tombstone_count(), 0);
    assert_eq!(sparse.tombstone_count(), 0);
    assert_eq!(paged.len(), sparse.len());
}

/// `get` panics exactly where `try_get` errors; `remove` reports the same
/// failures as `None`.
#[test]
fn panicking_forms_match_fallible_forms() {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    let mut map: SparseSlotMap<u32, Version8> = SparseSlotMap::with_page_size(2, 0);
    let live = map.add(1);
    let dead = map.add(2);
    map.remove(dead);

    for key in [live, dead, SlotKey::INVALID, SlotKey::from_raw(u32::MAX as u64 | 1 << 32)] {
        let soft = map.try_get(key).is_ok();
        let hard = catch_unwind(AssertUnwindSafe(|| *map.get(key))).is_ok();
        assert_eq!(soft, hard, "get disagrees for {key:?}");

        let mut fallible = map.clone();
        let soft = fallible.try_remove(key).is_ok();
        let mut plain = map.clone();
        let removed = plain.remove(key).is_some();
        assert_eq!(soft, removed, "remove disagrees for {key:?}");
        assert_eq!(plain.len(), fallible.len());
        assert_eq!(plain.free_key_count(), fallible.free_key_count());
    }
}
