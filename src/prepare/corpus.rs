//! Data-pool layout and raw-corpus staging

use crate::core::error::RunnerError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Subdirectories every experiment data pool carries.
const DATAPOOL_DIRS: [&str; 8] = [
    "data/raw",
    "data/processed",
    "data/tokenized",
    "model/base",
    "model/cpt_checkpoints",
    "model/sft_checkpoints",
    "model/hf",
    "reports",
];

/// Idempotent creation of the data-pool directory skeleton.
pub fn ensure_datapool_structure(datapool_root: &Path) -> Result<(), RunnerError> {
    for dir in DATAPOOL_DIRS {
        fs::create_dir_all(datapool_root.join(dir))?;
    }
    Ok(())
}

/// Hard link when possible, copy across filesystems.
pub fn copy_or_link(src: &Path, dst: &Path) -> Result<(), RunnerError> {
    if fs::hard_link(src, dst).is_err() {
        fs::copy(src, dst)?;
    }
    Ok(())
}

/// Recursive link-fallback copy of a directory tree. Refuses to clobber an
/// existing destination; staging is strictly additive.
pub fn copytree_link_fallback(src: &Path, dst: &Path) -> Result<(), RunnerError> {
    if dst.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("destination already exists: {}", dst.display()),
        )
        .into());
    }
    copytree_inner(src, dst)
}

fn copytree_inner(src: &Path, dst: &Path) -> Result<(), RunnerError> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copytree_inner(&entry.path(), &target)?;
        } else {
            copy_or_link(&entry.path(), &target)?;
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct FlatCopyReport {
    pub copied: usize,
    /// Destinations that already existed and were left untouched.
    pub clashes: Vec<PathBuf>,
}

fn collect_jsonl_recursive(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RunnerError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_jsonl_recursive(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            out.push(path);
        }
    }
    Ok(())
}

/// Copy every `.jsonl` under `src_dir` into `dst_dir`, flattening the tree
/// by joining relative path segments with `__`. Existing destinations are
/// recorded as clashes and never overwritten.
pub fn copy_tree_flat(src_dir: &Path, dst_dir: &Path) -> Result<FlatCopyReport, RunnerError> {
    fs::create_dir_all(dst_dir)?;
    let mut files = Vec::new();
    collect_jsonl_recursive(src_dir, &mut files)?;
    files.sort();

    let mut report = FlatCopyReport::default();
    for file in files {
        let rel = file.strip_prefix(src_dir).unwrap_or(&file);
        let flat_name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("__");
        let out = dst_dir.join(flat_name);
        if out.exists() {
            report.clashes.push(out);
            continue;
        }
        copy_or_link(&file, &out)?;
        report.copied += 1;
    }
    debug!(
        "flat copy {} -> {}: copied={} clashes={}",
        src_dir.display(),
        dst_dir.display(),
        report.copied,
        report.clashes.len()
    );
    Ok(report)
}

impl FlatCopyReport {
    /// First 20 clashes as warnings, then an overflow count.
    pub fn log_clashes(&self) {
        for clash in self.clashes.iter().take(20) {
            warn!("skip (exists): {}", clash.display());
        }
        if self.clashes.len() > 20 {
            warn!("... and {} more", self.clashes.len() - 20);
        }
    }
}

/// Reject paths escaping the data pool unless the operator opted out.
pub fn ensure_within_datapool(
    label: &str,
    path: &Path,
    datapool_root: &Path,
    allow_external: bool,
) -> Result<(), RunnerError> {
    if allow_external || path.starts_with(datapool_root) {
        return Ok(());
    }
    Err(RunnerError::PathOutsideDataPool {
        label: label.to_string(),
        datapool: datapool_root.to_path_buf(),
        path: path.to_path_buf(),
    })
}
