//! Folds every module result into session-wide state.
//!
//! Flags are OR-ed, skipped-test counts summed, coverage merged under one
//! coarse lock. Module bookkeeping is delegated to the [`ModuleRegistry`],
//! whose answer becomes the response to the worker.

use crate::registry::ModuleRegistry;
use civis_common::coverage::ExecutionDataStore;
use civis_common::domain::{StatusCounts, TestStatus};
use civis_common::protocol::{ModuleExecutionResult, SignalResponse};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct CoverageState {
    store: ExecutionDataStore,
    output_dirs: BTreeSet<PathBuf>,
}

/// Point-in-time view of the folded flags and counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateSnapshot {
    pub coverage_enabled: bool,
    pub skip_enabled: bool,
    pub early_flake_enabled: bool,
    pub early_flake_faulty: bool,
    pub tests_skipped: u64,
    pub modules: StatusCounts,
    pub results_received: u64,
}

#[derive(Debug)]
pub struct ResultAggregator {
    registry: Arc<ModuleRegistry>,
    coverage_enabled: AtomicBool,
    skip_enabled: AtomicBool,
    early_flake_enabled: AtomicBool,
    early_flake_faulty: AtomicBool,
    tests_skipped: AtomicU64,
    results_received: AtomicU64,
    modules: Mutex<StatusCounts>,
    coverage: Mutex<CoverageState>,
    sealed: AtomicBool,
}

impl ResultAggregator {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self {
            registry,
            coverage_enabled: AtomicBool::new(false),
            skip_enabled: AtomicBool::new(false),
            early_flake_enabled: AtomicBool::new(false),
            early_flake_faulty: AtomicBool::new(false),
            tests_skipped: AtomicU64::new(0),
            results_received: AtomicU64::new(0),
            modules: Mutex::new(StatusCounts::default()),
            coverage: Mutex::new(CoverageState::default()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Remember where a module's compiled classes live, for coverage resolution.
    pub fn add_output_dirs<'a, I>(&self, dirs: I)
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        let mut coverage = self.coverage.lock().unwrap();
        coverage.output_dirs.extend(dirs.into_iter().cloned());
    }

    pub fn on_module_execution_result(&self, result: &ModuleExecutionResult) -> SignalResponse {
        if self.sealed.load(Ordering::SeqCst) {
            debug!(module = %result.module_name, "Ignoring module result after session end");
            return SignalResponse::ModuleAck {
                module_removed: false,
            };
        }

        if result.coverage_enabled {
            self.coverage_enabled.store(true, Ordering::SeqCst);
        }
        if result.skip_enabled {
            self.skip_enabled.store(true, Ordering::SeqCst);
        }
        if result.early_flake_enabled {
            self.early_flake_enabled.store(true, Ordering::SeqCst);
        }
        if result.early_flake_faulty {
            self.early_flake_faulty.store(true, Ordering::SeqCst);
        }
        self.tests_skipped
            .fetch_add(result.tests_skipped_total, Ordering::SeqCst);
        self.results_received.fetch_add(1, Ordering::SeqCst);

        match result.status.as_deref().map(TestStatus::parse) {
            Some(Some(status)) => self.modules.lock().unwrap().record(status),
            Some(None) => warn!(
                module = %result.module_name,
                status = ?result.status,
                "Unrecognised module status"
            ),
            None => {}
        }

        if let Some(record) = &result.coverage {
            let mut coverage = self.coverage.lock().unwrap();
            let incompatible = coverage.store.merge(record);
            debug!(
                module = %result.module_name,
                classes = record.len(),
                incompatible,
                "Merged module coverage"
            );
        }

        self.registry.on_module_execution_result(result)
    }

    /// Stop accepting results. Returns `false` if already sealed.
    pub fn seal(&self) -> bool {
        !self.sealed.swap(true, Ordering::SeqCst)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        AggregateSnapshot {
            coverage_enabled: self.coverage_enabled.load(Ordering::SeqCst),
            skip_enabled: self.skip_enabled.load(Ordering::SeqCst),
            early_flake_enabled: self.early_flake_enabled.load(Ordering::SeqCst),
            early_flake_faulty: self.early_flake_faulty.load(Ordering::SeqCst),
            tests_skipped: self.tests_skipped.load(Ordering::SeqCst),
            modules: *self.modules.lock().unwrap(),
            results_received: self.results_received.load(Ordering::SeqCst),
        }
    }

    /// Merged coverage and the output directories it resolves against.
    pub fn coverage(&self) -> (ExecutionDataStore, Vec<PathBuf>) {
        let coverage = self.coverage.lock().unwrap();
        (
            coverage.store.clone(),
            coverage.output_dirs.iter().cloned().collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civis_common::coverage::ExecutionData;
    use civis_common::domain::{Module, ModuleDescriptor, ModuleParent};
    use proptest::prelude::*;

    struct NoopParent;

    impl ModuleParent for NoopParent {
        fn on_module_end(&self, _result: ModuleExecutionResult) {}
    }

    fn register(registry: &ModuleRegistry, id: u64, name: &str) -> Arc<Module> {
        let module = Module::new(
            ModuleDescriptor {
                session_id: "s".to_string(),
                id,
                name: name.to_string(),
                output_dirs: Vec::new(),
                signal_address: None,
            },
            Default::default(),
            Arc::new(NoopParent),
        );
        registry.add(Arc::clone(&module)).unwrap();
        module
    }

    fn result(id: u64, name: &str) -> ModuleExecutionResult {
        ModuleExecutionResult {
            session_id: "s".to_string(),
            module_id: id,
            module_name: name.to_string(),
            ..Default::default()
        }
    }

    fn coverage(classes: &[(u64, &[bool])]) -> ExecutionDataStore {
        ExecutionDataStore::from(
            classes
                .iter()
                .map(|(id, probes)| ExecutionData::new(*id, format!("C{id}"), probes.to_vec()))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_flags_are_or_folded_and_skips_summed() {
        let registry = Arc::new(ModuleRegistry::new());
        register(&registry, 1, "core");
        register(&registry, 2, "api");
        let aggregator = ResultAggregator::new(Arc::clone(&registry));

        let response = aggregator.on_module_execution_result(&ModuleExecutionResult {
            coverage_enabled: true,
            tests_skipped_total: 3,
            status: Some("pass".to_string()),
            ..result(1, "core")
        });
        assert_eq!(response, SignalResponse::ModuleAck { module_removed: true });
        aggregator.on_module_execution_result(&ModuleExecutionResult {
            skip_enabled: true,
            early_flake_enabled: true,
            tests_skipped_total: 4,
            status: Some("fail".to_string()),
            ..result(2, "api")
        });

        let snapshot = aggregator.snapshot();
        assert!(snapshot.coverage_enabled && snapshot.skip_enabled);
        assert!(snapshot.early_flake_enabled && !snapshot.early_flake_faulty);
        assert_eq!(snapshot.tests_skipped, 7);
        assert_eq!(snapshot.modules.status(), TestStatus::Fail);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_module_is_folded_without_error() {
        let registry = Arc::new(ModuleRegistry::new());
        let core = register(&registry, 1, "core");
        let aggregator = ResultAggregator::new(Arc::clone(&registry));

        let response = aggregator.on_module_execution_result(&ModuleExecutionResult {
            tests_skipped_total: 2,
            ..result(99, "ghost")
        });
        assert_eq!(response, SignalResponse::ModuleAck { module_removed: false });
        assert_eq!(aggregator.snapshot().tests_skipped, 2);
        assert!(!core.is_ended());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_coverage_delivery_is_idempotent() {
        let aggregator = ResultAggregator::new(Arc::new(ModuleRegistry::new()));
        let record = ModuleExecutionResult {
            coverage: Some(coverage(&[(1, &[true, false, true])])),
            ..result(1, "core")
        };
        aggregator.on_module_execution_result(&record);
        aggregator.on_module_execution_result(&record);
        let (store, _) = aggregator.coverage();
        assert_eq!(store.hit_probes(), 2);
    }

    #[test]
    fn test_sealed_aggregator_ignores_results() {
        let registry = Arc::new(ModuleRegistry::new());
        let core = register(&registry, 1, "core");
        let aggregator = ResultAggregator::new(Arc::clone(&registry));
        assert!(aggregator.seal());
        assert!(!aggregator.seal());

        let response = aggregator.on_module_execution_result(&ModuleExecutionResult {
            coverage_enabled: true,
            ..result(1, "core")
        });
        assert_eq!(response, SignalResponse::ModuleAck { module_removed: false });
        assert!(!aggregator.snapshot().coverage_enabled);
        assert!(!core.is_ended());
    }

    #[test]
    fn test_output_dirs_are_deduplicated() {
        let aggregator = ResultAggregator::new(Arc::new(ModuleRegistry::new()));
        let dirs = vec![PathBuf::from("/b"), PathBuf::from("/a")];
        aggregator.add_output_dirs(&dirs);
        aggregator.add_output_dirs(&dirs[..1]);
        let (_, output_dirs) = aggregator.coverage();
        assert_eq!(output_dirs, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    fn probes() -> impl Strategy<Value = Vec<(u64, Vec<bool>)>> {
        prop::collection::vec((0u64..6, prop::collection::vec(any::<bool>(), 4)), 0..6)
    }

    proptest! {
        #[test]
        fn test_delivery_order_does_not_change_merged_hits(a in probes(), b in probes()) {
            let to_result = |classes: &[(u64, Vec<bool>)], id: u64| ModuleExecutionResult {
                coverage: Some(ExecutionDataStore::from(
                    classes
                        .iter()
                        .map(|(class, bits)| ExecutionData::new(*class, format!("C{class}"), bits.clone()))
                        .collect::<Vec<_>>(),
                )),
                ..result(id, "m")
            };
            let forward = ResultAggregator::new(Arc::new(ModuleRegistry::new()));
            forward.on_module_execution_result(&to_result(&a, 1));
            forward.on_module_execution_result(&to_result(&b, 2));
            let backward = ResultAggregator::new(Arc::new(ModuleRegistry::new()));
            backward.on_module_execution_result(&to_result(&b, 2));
            backward.on_module_execution_result(&to_result(&a, 1));
            prop_assert_eq!(forward.coverage().0, backward.coverage().0);
        }
    }
}
