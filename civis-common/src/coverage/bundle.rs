//! Resolution of merged probe hits into a named coverage bundle.
//!
//! Output directories carry one `<Class>.probes.json` file per compiled
//! class describing its probes (source line and instruction count). Every
//! analysed class counts towards the total; probes hit in the execution
//! data count as covered.

use super::{CoverageError, ExecutionDataStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Suffix of class analysis files inside output directories.
pub const PROBES_FILE_SUFFIX: &str = ".probes.json";

/// Static description of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeInfo {
    pub line: u32,
    pub instructions: u32,
}

/// Static analysis of a compiled class, read from an output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassAnalysis {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub source_file: Option<String>,
    pub probes: Vec<ProbeInfo>,
}

/// Covered/total pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub covered: u64,
    pub total: u64,
}

impl Counter {
    fn add(&mut self, other: Counter) {
        self.covered += other.covered;
        self.total += other.total;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCoverage {
    pub instructions: Counter,
}

impl LineCoverage {
    pub fn is_covered(&self) -> bool {
        self.instructions.covered > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCoverage {
    pub name: String,
    pub source_file: Option<String>,
    pub instructions: Counter,
    pub lines: BTreeMap<u32, LineCoverage>,
}

impl ClassCoverage {
    fn from_analysis(analysis: &ClassAnalysis, hits: Option<&[bool]>) -> Self {
        let mut lines: BTreeMap<u32, LineCoverage> = BTreeMap::new();
        let mut instructions = Counter::default();

        for (idx, probe) in analysis.probes.iter().enumerate() {
            let hit = hits.and_then(|h| h.get(idx)).copied().unwrap_or(false);
            let count = Counter {
                covered: if hit { u64::from(probe.instructions) } else { 0 },
                total: u64::from(probe.instructions),
            };
            instructions.add(count);
            lines.entry(probe.line).or_default().instructions.add(count);
        }

        Self {
            name: analysis.name.clone(),
            source_file: analysis.source_file.clone(),
            instructions,
            lines,
        }
    }

    pub fn line_counter(&self) -> Counter {
        Counter {
            covered: self.lines.values().filter(|l| l.is_covered()).count() as u64,
            total: self.lines.len() as u64,
        }
    }
}

/// Merged coverage resolved against class metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageBundle {
    pub name: String,
    pub classes: Vec<ClassCoverage>,
    pub instructions: Counter,
    pub lines: Counter,
}

impl CoverageBundle {
    fn from_classes(name: impl Into<String>, classes: Vec<ClassCoverage>) -> Self {
        let mut instructions = Counter::default();
        let mut lines = Counter::default();
        for class in &classes {
            instructions.add(class.instructions);
            lines.add(class.line_counter());
        }
        Self {
            name: name.into(),
            classes,
            instructions,
            lines,
        }
    }
}

/// Instruction coverage percentage, rounded half up.
///
/// Returns `None` when the bundle has no instructions at all.
pub fn percentage(bundle: &CoverageBundle) -> Option<u64> {
    let Counter { covered, total } = bundle.instructions;
    if total == 0 {
        return None;
    }
    Some((100.0 * covered as f64 / total as f64).round() as u64)
}

/// Read every class analysis file below `dirs`, deduplicated by class id.
pub fn load_class_analyses<'a, I>(dirs: I) -> Result<Vec<ClassAnalysis>, CoverageError>
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    let mut files = Vec::new();
    for dir in dirs {
        if !dir.is_dir() {
            debug!("Skipping missing output directory {:?}", dir);
            continue;
        }
        collect_probe_files(dir, &mut files)?;
    }
    files.sort();

    let mut seen = BTreeSet::new();
    let mut analyses = Vec::new();
    for path in files {
        let raw = fs::read(&path).map_err(|source| CoverageError::Io {
            path: path.clone(),
            source,
        })?;
        let analysis: ClassAnalysis = serde_json::from_slice(&raw)
            .map_err(|source| CoverageError::Metadata { path, source })?;
        if seen.insert(analysis.id) {
            analyses.push(analysis);
        }
    }
    Ok(analyses)
}

fn collect_probe_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), CoverageError> {
    let entries = fs::read_dir(dir).map_err(|source| CoverageError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| CoverageError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_probe_files(&path, out)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(PROBES_FILE_SUFFIX))
        {
            out.push(path);
        }
    }
    Ok(())
}

/// Resolve merged execution data against the classes found in `output_dirs`.
///
/// Returns `Ok(None)` when there is nothing to report: no output
/// directories are known or no class was executed.
pub fn build_bundle<'a, I>(
    store: &ExecutionDataStore,
    output_dirs: I,
) -> Result<Option<CoverageBundle>, CoverageError>
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    let dirs: Vec<&PathBuf> = output_dirs.into_iter().collect();
    if dirs.is_empty() || store.is_empty() {
        return Ok(None);
    }

    let analyses = load_class_analyses(dirs)?;
    let classes = analyses
        .iter()
        .map(|analysis| {
            let hits = store
                .get(analysis.id)
                .filter(|data| data.probes.len() == analysis.probes.len())
                .map(|data| data.probes.as_slice());
            ClassCoverage::from_analysis(analysis, hits)
        })
        .collect();

    Ok(Some(CoverageBundle::from_classes("aggregated", classes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::ExecutionData;

    fn write_analysis(dir: &Path, analysis: &ClassAnalysis) {
        let rel = analysis.name.replace('.', "/");
        let path = dir.join(format!("{rel}{PROBES_FILE_SUFFIX}"));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, serde_json::to_vec(analysis).unwrap()).unwrap();
    }

    fn analysis(id: u64, name: &str, probes: &[(u32, u32)]) -> ClassAnalysis {
        ClassAnalysis {
            id,
            name: name.to_string(),
            source_file: Some(format!("{}.java", name.rsplit('.').next().unwrap())),
            probes: probes
                .iter()
                .map(|(line, instructions)| ProbeInfo {
                    line: *line,
                    instructions: *instructions,
                })
                .collect(),
        }
    }

    fn bundle_with(covered: u64, total: u64) -> CoverageBundle {
        CoverageBundle {
            name: "b".to_string(),
            classes: Vec::new(),
            instructions: Counter { covered, total },
            lines: Counter::default(),
        }
    }

    #[test]
    fn percentage_rounds() {
        assert_eq!(percentage(&bundle_with(50, 200)), Some(25));
        assert_eq!(percentage(&bundle_with(1, 3)), Some(33));
        assert_eq!(percentage(&bundle_with(2, 3)), Some(67));
        assert_eq!(percentage(&bundle_with(7, 7)), Some(100));
    }

    #[test]
    fn percentage_of_empty_bundle_is_not_applicable() {
        assert_eq!(percentage(&bundle_with(0, 0)), None);
    }

    #[test]
    fn build_bundle_without_dirs_or_data_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = vec![dir.path().to_path_buf()];
        let empty = ExecutionDataStore::new();
        assert!(build_bundle(&empty, &dirs).unwrap().is_none());

        let mut store = ExecutionDataStore::new();
        store.put(ExecutionData::new(1, "a.Foo", vec![true]));
        let no_dirs: Vec<PathBuf> = Vec::new();
        assert!(build_bundle(&store, &no_dirs).unwrap().is_none());
    }

    #[test]
    fn build_bundle_counts_instructions_and_lines() {
        let dir = tempfile::tempdir().unwrap();
        write_analysis(dir.path(), &analysis(1, "com.acme.Foo", &[(10, 4), (11, 6), (11, 2)]));
        write_analysis(dir.path(), &analysis(2, "com.acme.Bar", &[(5, 8)]));

        let mut store = ExecutionDataStore::new();
        store.put(ExecutionData::new(1, "com.acme.Foo", vec![true, false, true]));

        let dirs = vec![dir.path().to_path_buf()];
        let bundle = build_bundle(&store, &dirs).unwrap().unwrap();
        assert_eq!(bundle.classes.len(), 2);
        assert_eq!(bundle.instructions, Counter { covered: 6, total: 20 });
        // Lines: Foo:10 covered, Foo:11 partially covered, Bar:5 missed.
        assert_eq!(bundle.lines, Counter { covered: 2, total: 3 });
        assert_eq!(percentage(&bundle), Some(30));
    }

    #[test]
    fn mismatched_probe_count_counts_as_missed() {
        let dir = tempfile::tempdir().unwrap();
        write_analysis(dir.path(), &analysis(1, "Foo", &[(1, 5), (2, 5)]));
        let mut store = ExecutionDataStore::new();
        store.put(ExecutionData::new(1, "Foo", vec![true]));

        let dirs = vec![dir.path().to_path_buf()];
        let bundle = build_bundle(&store, &dirs).unwrap().unwrap();
        assert_eq!(bundle.instructions, Counter { covered: 0, total: 10 });
    }

    #[test]
    fn invalid_metadata_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(format!("Broken{PROBES_FILE_SUFFIX}")), b"{").unwrap();
        let mut store = ExecutionDataStore::new();
        store.put(ExecutionData::new(1, "Foo", vec![true]));

        let dirs = vec![dir.path().to_path_buf()];
        let err = build_bundle(&store, &dirs).unwrap_err();
        assert!(matches!(err, CoverageError::Metadata { .. }));
    }

    #[test]
    fn same_class_in_two_dirs_is_counted_once() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_analysis(a.path(), &analysis(1, "Foo", &[(1, 3)]));
        write_analysis(b.path(), &analysis(1, "Foo", &[(1, 3)]));

        let dirs = vec![a.path().to_path_buf(), b.path().to_path_buf()];
        let analyses = load_class_analyses(&dirs).unwrap();
        assert_eq!(analyses.len(), 1);
    }
}
