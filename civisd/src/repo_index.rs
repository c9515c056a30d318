//! Repository source index, built once per session on first request.

use anyhow::Context;
use civis_common::types::RepoIndex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// File extensions treated as source files.
pub const SOURCE_EXTENSIONS: &[&str] = &["java", "kt", "scala", "groovy"];

const SKIPPED_DIRS: &[&str] = &["target", "build", "out", "node_modules"];

/// Read only the head of each file when looking for its package declaration.
const PACKAGE_SCAN_BYTES: usize = 8 * 1024;

pub trait RepoIndexProvider: Send + Sync {
    fn index(&self) -> anyhow::Result<Arc<RepoIndex>>;
}

/// Walks the repository on first use and caches the result.
#[derive(Debug)]
pub struct FsRepoIndexProvider {
    repo_root: PathBuf,
    cached: Mutex<Option<Arc<RepoIndex>>>,
}

impl FsRepoIndexProvider {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}

impl RepoIndexProvider for FsRepoIndexProvider {
    fn index(&self) -> anyhow::Result<Arc<RepoIndex>> {
        let mut cached = self.cached.lock().unwrap();
        if let Some(index) = cached.as_ref() {
            return Ok(Arc::clone(index));
        }
        let index = Arc::new(build_index(&self.repo_root)?);
        info!(
            root = ?self.repo_root,
            sources = index.sources.len(),
            roots = index.source_roots.len(),
            "Built repo index"
        );
        *cached = Some(Arc::clone(&index));
        Ok(index)
    }
}

/// Index every source file below `repo_root`.
///
/// Each file is keyed by its declared package plus its stem. The source root
/// of a file is its directory minus that package path; files without a
/// matching declaration use their own directory. When two files share a
/// qualified key the lexicographically first path wins.
pub fn build_index(repo_root: &Path) -> anyhow::Result<RepoIndex> {
    let mut files = Vec::new();
    collect_sources(repo_root, &mut files)
        .with_context(|| format!("walking {}", repo_root.display()))?;
    files.sort();

    let mut index = RepoIndex::default();
    let mut roots = BTreeSet::new();
    for file in files {
        let Ok(relative) = file.strip_prefix(repo_root) else {
            continue;
        };
        let Some(stem) = relative.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let package = read_package(&file).unwrap_or_default();
        if let Some(root) = source_root(relative, &package) {
            roots.insert(root);
        }
        let key = if package.is_empty() {
            stem.to_string()
        } else {
            format!("{}/{}", package.replace('.', "/"), stem)
        };
        index.sources.entry(key).or_insert_with(|| to_slash(relative));
    }
    index.source_roots = roots.into_iter().collect();
    Ok(index)
}

fn collect_sources(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref()) {
                debug!("Skipping {:?}", path);
                continue;
            }
            collect_sources(&path, out)?;
        } else if file_type.is_file()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
        {
            out.push(path);
        }
    }
    Ok(())
}

fn source_root(relative: &Path, package: &str) -> Option<String> {
    let parent = relative.parent()?;
    let package_path: PathBuf = package.split('.').filter(|s| !s.is_empty()).collect();
    let root = if !package.is_empty() && parent.ends_with(&package_path) {
        let depth = package_path.components().count();
        let mut root = parent.to_path_buf();
        for _ in 0..depth {
            root.pop();
        }
        root
    } else {
        parent.to_path_buf()
    };
    Some(to_slash(&root))
}

fn read_package(file: &Path) -> Option<String> {
    let raw = fs::read(file).ok()?;
    let head = &raw[..raw.len().min(PACKAGE_SCAN_BYTES)];
    let text = String::from_utf8_lossy(head);
    text.lines().map(str::trim).find_map(|line| {
        let rest = line.strip_prefix("package ")?;
        Some(rest.trim_end_matches(';').trim().to_string())
    })
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_index_maps_classes_to_sources() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "core/src/main/java/com/acme/Parser.java",
            "// header\npackage com.acme;\n\nclass Parser {}\n",
        );
        write(
            dir.path(),
            "api/src/main/kotlin/com/acme/api/Handler.kt",
            "package com.acme.api\n",
        );
        write(dir.path(), "scripts/Tool.groovy", "println 'hi'\n");
        write(dir.path(), "core/target/generated/Gen.java", "package gen;\n");
        write(dir.path(), ".git/objects/Hidden.java", "");
        write(dir.path(), "README.md", "# readme");

        let index = build_index(dir.path()).unwrap();
        assert_eq!(
            index.source_path("com.acme.Parser$Inner"),
            Some("core/src/main/java/com/acme/Parser.java")
        );
        assert_eq!(
            index.source_path("Handler"),
            Some("api/src/main/kotlin/com/acme/api/Handler.kt")
        );
        assert!(index.source_path("Gen").is_none());
        assert!(index.source_path("Hidden").is_none());
        assert_eq!(
            index.source_roots,
            vec![
                "api/src/main/kotlin".to_string(),
                "core/src/main/java".to_string(),
                "scripts".to_string(),
            ]
        );
    }

    #[test]
    fn test_same_simple_name_in_two_packages() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/com/a/Util.java", "package com.a;\n");
        write(dir.path(), "src/com/b/Util.java", "package com.b;\n");

        let index = build_index(dir.path()).unwrap();
        assert_eq!(index.source_path("com.a.Util"), Some("src/com/a/Util.java"));
        assert_eq!(index.source_path("com.b.Util"), Some("src/com/b/Util.java"));
        assert_eq!(index.source_path("com/b/Util$Inner"), Some("src/com/b/Util.java"));
        assert_eq!(index.source_path("Util"), None);
        assert_eq!(index.source_roots, vec!["src".to_string()]);
    }

    #[test]
    fn test_provider_builds_once() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/A.java", "package a;\n");
        let provider = FsRepoIndexProvider::new(dir.path());
        let first = provider.index().unwrap();
        write(dir.path(), "src/B.java", "");
        let second = provider.index().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.source_path("B").is_none());
    }

    #[test]
    fn test_missing_root_is_error_and_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("later");
        let provider = FsRepoIndexProvider::new(&root);
        let err = provider.index().unwrap_err();
        assert!(format!("{err:#}").contains("walking"));

        write(&root, "X.java", "");
        assert!(provider.index().unwrap().source_path("X").is_some());
    }
}
