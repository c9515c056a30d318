mod common;

use civis_common::domain::ModuleParent;
use civis_common::types::EarlyFlakeDetectionSettings;
use civis_common::{ModuleDescriptor, ModuleExecutionResult, ModuleExecutionSettings, TestIdentifier};
use civis_wkr::{TestEventsHandler, WorkerEvent};
use common::init_test_logging;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingParent {
    results: Mutex<Vec<ModuleExecutionResult>>,
}

impl ModuleParent for RecordingParent {
    fn on_module_end(&self, result: ModuleExecutionResult) {
        self.results.lock().unwrap().push(result);
    }
}

fn descriptor() -> ModuleDescriptor {
    ModuleDescriptor {
        session_id: "replay".to_string(),
        id: 1,
        name: "core".to_string(),
        output_dirs: Vec::new(),
        signal_address: None,
    }
}

fn efd_settings(known: Option<Vec<TestIdentifier>>) -> ModuleExecutionSettings {
    ModuleExecutionSettings {
        early_flake_detection: EarlyFlakeDetectionSettings {
            enabled: true,
            execution_thresholds: Vec::new(),
            faulty_session_threshold: 50,
        },
        known_tests: known.map(|tests| BTreeMap::from([("core".to_string(), tests)])),
        ..Default::default()
    }
}

const SCRIPT: &str = r#"{"event":"suite_start","suite":"CartTest","code_unit":"Cart"}
{"event":"suite_start","suite":"CartTest","code_unit":"Cart","parallelized":true}
{"event":"test_start","suite":"CartTest","code_unit":"Cart","name":"adds"}
{"event":"test_finish","suite":"CartTest","code_unit":"Cart","name":"adds"}
{"event":"test_start","suite":"CartTest","code_unit":"Cart","name":"removes"}
{"event":"test_failure","suite":"CartTest","code_unit":"Cart","name":"removes","error":{"kind":"AssertionError","message":"expected 0"}}
{"event":"test_finish","suite":"CartTest","code_unit":"Cart","name":"removes"}
{"event":"test_start","suite":"CartTest","code_unit":"Cart","name":"totals"}
{"event":"test_finish","suite":"CartTest","code_unit":"Cart","name":"totals"}
{"event":"suite_finish","suite":"CartTest","code_unit":"Cart"}
{"event":"suite_finish","suite":"CartTest","code_unit":"Cart"}
"#;

fn replay(settings: ModuleExecutionSettings) -> ModuleExecutionResult {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(SCRIPT.as_bytes()).unwrap();
    let script = std::fs::read_to_string(file.path()).unwrap();

    let parent = Arc::new(RecordingParent::default());
    let handler = TestEventsHandler::new(descriptor(), settings, parent.clone());
    for line in script.lines() {
        let event: WorkerEvent = serde_json::from_str(line).unwrap();
        handler.apply(event);
    }
    assert!(handler.finish_module());
    let results = parent.results.lock().unwrap();
    assert_eq!(results.len(), 1);
    results[0].clone()
}

#[test]
fn replayed_failure_fails_the_module() {
    init_test_logging();
    let result = replay(ModuleExecutionSettings::default());
    assert_eq!(result.status.as_deref(), Some("fail"));
    assert!(!result.early_flake_enabled);
}

#[test]
fn early_flake_detection_needs_known_tests() {
    init_test_logging();
    let result = replay(efd_settings(None));
    assert!(!result.early_flake_enabled);
    assert!(!result.early_flake_faulty);
}

#[test]
fn mostly_new_tests_mark_the_module_faulty() {
    init_test_logging();
    // One of three tests is known: 66% new exceeds the 50% threshold.
    let result = replay(efd_settings(Some(vec![TestIdentifier::new("CartTest", "adds")])));
    assert!(result.early_flake_enabled);
    assert!(result.early_flake_faulty);

    let result = replay(efd_settings(Some(vec![
        TestIdentifier::new("CartTest", "adds"),
        TestIdentifier::new("CartTest", "removes"),
    ])));
    assert!(result.early_flake_enabled);
    assert!(!result.early_flake_faulty);
}
