//! Coverage records and their merge algebra.
//!
//! A worker hands the session an [`ExecutionDataStore`]: one probe bit
//! vector per executed class, keyed by class id. Merging is a union that
//! ORs probe bits, so it is commutative, associative and idempotent;
//! delivering the same record twice never double counts.

mod bundle;
mod report;

pub use bundle::{
    ClassAnalysis, ClassCoverage, CoverageBundle, Counter, LineCoverage, ProbeInfo,
    build_bundle, load_class_analyses, percentage, PROBES_FILE_SUFFIX,
};
pub use report::{LCOV_FILE, REPORT_FILE, dump_report};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

/// Errors raised while resolving or writing coverage.
#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid class analysis {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize coverage report: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Probe hits of a single class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionData {
    pub id: u64,
    pub name: String,
    pub probes: Vec<bool>,
}

impl ExecutionData {
    pub fn new(id: u64, name: impl Into<String>, probes: Vec<bool>) -> Self {
        Self {
            id,
            name: name.into(),
            probes,
        }
    }

    fn is_compatible(&self, other: &ExecutionData) -> bool {
        self.name == other.name && self.probes.len() == other.probes.len()
    }

    pub fn has_hits(&self) -> bool {
        self.probes.iter().any(|hit| *hit)
    }
}

/// Per-class probe hits, keyed by class id.
///
/// Serialized as a list of [`ExecutionData`] so it can travel inside
/// internally tagged signals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<ExecutionData>", into = "Vec<ExecutionData>")]
pub struct ExecutionDataStore {
    classes: BTreeMap<u64, ExecutionData>,
}

impl From<Vec<ExecutionData>> for ExecutionDataStore {
    fn from(entries: Vec<ExecutionData>) -> Self {
        let mut store = ExecutionDataStore::new();
        for entry in entries {
            store.put(entry);
        }
        store
    }
}

impl From<ExecutionDataStore> for Vec<ExecutionData> {
    fn from(store: ExecutionDataStore) -> Self {
        store.classes.into_values().collect()
    }
}

impl ExecutionDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn get(&self, id: u64) -> Option<&ExecutionData> {
        self.classes.get(&id)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ExecutionData> {
        self.classes.values()
    }

    /// Record hits for a class, OR-ing into any existing entry.
    ///
    /// Returns `false` (and leaves the store untouched) when the entry
    /// disagrees with the stored class on name or probe count.
    pub fn put(&mut self, data: ExecutionData) -> bool {
        match self.classes.get_mut(&data.id) {
            Some(existing) => {
                if !existing.is_compatible(&data) {
                    return false;
                }
                for (hit, incoming) in existing.probes.iter_mut().zip(&data.probes) {
                    *hit |= *incoming;
                }
                true
            }
            None => {
                self.classes.insert(data.id, data);
                true
            }
        }
    }

    /// Union `other` into this store.
    ///
    /// Incompatible classes are skipped and logged; the count of skipped
    /// classes is returned.
    pub fn merge(&mut self, other: &ExecutionDataStore) -> usize {
        let mut incompatible = 0;
        for data in other.classes.values() {
            if !self.put(data.clone()) {
                incompatible += 1;
                warn!(
                    class_id = data.id,
                    class = %data.name,
                    "Skipping incompatible execution data"
                );
            }
        }
        incompatible
    }

    /// Number of probes hit across all classes.
    pub fn hit_probes(&self) -> usize {
        self.classes
            .values()
            .map(|c| c.probes.iter().filter(|hit| **hit).count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store(entries: &[(u64, &str, &[bool])]) -> ExecutionDataStore {
        entries
            .iter()
            .map(|(id, name, probes)| ExecutionData::new(*id, *name, probes.to_vec()))
            .collect::<Vec<_>>()
            .into()
    }

    #[test]
    fn merge_ors_probe_bits() {
        let mut a = store(&[(1, "Foo", &[true, false, false])]);
        let b = store(&[(1, "Foo", &[false, false, true]), (2, "Bar", &[true])]);
        assert_eq!(a.merge(&b), 0);
        assert_eq!(a.get(1).unwrap().probes, vec![true, false, true]);
        assert_eq!(a.len(), 2);
        assert_eq!(a.hit_probes(), 3);
    }

    #[test]
    fn duplicate_delivery_does_not_double_count() {
        let record = store(&[(1, "Foo", &[true, true, false])]);
        let mut acc = ExecutionDataStore::new();
        acc.merge(&record);
        acc.merge(&record);
        assert_eq!(acc, record);
        assert_eq!(acc.hit_probes(), 2);
    }

    #[test]
    fn incompatible_class_is_skipped_others_merge() {
        let mut acc = store(&[(1, "Foo", &[true, false])]);
        let other = store(&[(1, "Foo", &[true, true, true]), (2, "Bar", &[true])]);
        assert_eq!(acc.merge(&other), 1);
        assert_eq!(acc.get(1).unwrap().probes, vec![true, false]);
        assert!(acc.get(2).is_some());
    }

    #[test]
    fn renamed_class_with_same_id_is_incompatible() {
        let mut acc = store(&[(7, "Foo", &[false])]);
        assert!(!acc.put(ExecutionData::new(7, "Baz", vec![true])));
        assert!(!acc.get(7).unwrap().has_hits());
    }

    #[test]
    fn serializes_as_list() {
        let record = store(&[(2, "Bar", &[true]), (1, "Foo", &[false])]);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.is_array());
        assert_eq!(json[0]["id"], 1);
        let back: ExecutionDataStore = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    fn arb_store() -> impl Strategy<Value = ExecutionDataStore> {
        // Class ids 0..6 each have a fixed name and probe count so records stay compatible.
        prop::collection::vec((0u64..6, prop::collection::vec(any::<bool>(), 4)), 0..8).prop_map(
            |entries| {
                let mut store = ExecutionDataStore::new();
                for (id, probes) in entries {
                    store.put(ExecutionData::new(id, format!("C{id}"), probes));
                }
                store
            },
        )
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in arb_store(), b in arb_store()) {
            let mut ab = a.clone();
            ab.merge(&b);
            let mut ba = b.clone();
            ba.merge(&a);
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn merge_is_associative(a in arb_store(), b in arb_store(), c in arb_store()) {
            let mut left = a.clone();
            left.merge(&b);
            left.merge(&c);

            let mut bc = b.clone();
            bc.merge(&c);
            let mut right = a.clone();
            right.merge(&bc);

            prop_assert_eq!(left, right);
        }

        #[test]
        fn merge_is_idempotent(a in arb_store()) {
            let mut twice = a.clone();
            twice.merge(&a);
            prop_assert_eq!(twice, a);
        }
    }
}
