//! Coverage report output.

use super::{CoverageBundle, CoverageError, Counter, percentage};
use crate::types::RepoIndex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// JSON summary written into the report folder.
pub const REPORT_FILE: &str = "report.json";
/// LCOV tracefile written into the report folder.
pub const LCOV_FILE: &str = "lcov.info";

#[derive(Serialize)]
struct ReportClass<'a> {
    name: &'a str,
    source_path: Option<String>,
    instructions: Counter,
    lines: Counter,
}

#[derive(Serialize)]
struct ReportDocument<'a> {
    name: &'a str,
    instructions: Counter,
    lines: Counter,
    percentage: Option<u64>,
    classes: Vec<ReportClass<'a>>,
}

fn resolve_source(
    class_name: &str,
    source_file: Option<&str>,
    index: Option<&RepoIndex>,
) -> Option<String> {
    index
        .and_then(|idx| idx.source_path(class_name))
        .map(str::to_string)
        .or_else(|| source_file.map(str::to_string))
}

fn render_lcov(
    bundle: &CoverageBundle,
    index: Option<&RepoIndex>,
    repo_root: &Path,
) -> String {
    // Classes compiled from one source file (nested classes) share a record.
    let mut by_source: BTreeMap<String, BTreeMap<u32, u64>> = BTreeMap::new();
    for class in &bundle.classes {
        let Some(source) = resolve_source(&class.name, class.source_file.as_deref(), index) else {
            continue;
        };
        let lines = by_source.entry(source).or_default();
        for (line, coverage) in &class.lines {
            let hits = lines.entry(*line).or_default();
            *hits = (*hits).max(coverage.instructions.covered);
        }
    }

    let mut out = String::new();
    for (source, lines) in by_source {
        let _ = writeln!(out, "SF:{}", repo_root.join(&source).display());
        for (line, hits) in &lines {
            let _ = writeln!(out, "DA:{line},{hits}");
        }
        let hit = lines.values().filter(|h| **h > 0).count();
        let _ = writeln!(out, "LH:{hit}");
        let _ = writeln!(out, "LF:{}", lines.len());
        out.push_str("end_of_record\n");
    }
    out
}

/// Write `report.json` and `lcov.info` for `bundle` into `folder`.
///
/// Callers treat failures as non-fatal; the error is returned so they can log it.
pub fn dump_report(
    bundle: &CoverageBundle,
    index: Option<&RepoIndex>,
    repo_root: &Path,
    folder: &Path,
) -> Result<PathBuf, CoverageError> {
    fs::create_dir_all(folder).map_err(|source| CoverageError::Io {
        path: folder.to_path_buf(),
        source,
    })?;

    let document = ReportDocument {
        name: &bundle.name,
        instructions: bundle.instructions,
        lines: bundle.lines,
        percentage: percentage(bundle),
        classes: bundle
            .classes
            .iter()
            .map(|class| ReportClass {
                name: &class.name,
                source_path: resolve_source(&class.name, class.source_file.as_deref(), index),
                instructions: class.instructions,
                lines: class.line_counter(),
            })
            .collect(),
    };
    let json = serde_json::to_vec_pretty(&document).map_err(CoverageError::Serialize)?;
    let report_path = folder.join(REPORT_FILE);
    fs::write(&report_path, json).map_err(|source| CoverageError::Io {
        path: report_path.clone(),
        source,
    })?;

    let lcov_path = folder.join(LCOV_FILE);
    fs::write(&lcov_path, render_lcov(bundle, index, repo_root)).map_err(|source| {
        CoverageError::Io {
            path: lcov_path.clone(),
            source,
        }
    })?;

    Ok(folder.to_path_buf())
}
