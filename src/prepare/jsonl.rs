//! JSONL corpus merging and input expansion
//!
//! Tokenizer frontends want exactly one uniform `.jsonl` file. `expand_input`
//! turns whatever the operator configured (a directory of shards, a single
//! file) into that file, merging and filtering when needed.

use crate::cli::output::create_progress_bar;
use crate::core::error::RunnerError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Conventional name for the merged tokenizer input. Lives next to the raw
/// shards, not under the tokenized output, so output clearing never eats it.
pub const MERGED_INPUT_FILE: &str = "merged_input.jsonl";

pub const DEFAULT_SHUFFLE_BUFFER: usize = 10_000;

#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// When false and no filtering is needed, multiple files pass through
    /// unmerged (first file wins).
    pub merge: bool,
    /// Keys every record must carry; records missing one are dropped.
    pub required_keys: Vec<String>,
    pub shuffle: bool,
    pub seed: Option<u64>,
    /// Bounded shuffle window: lines are buffered up to this count, shuffled,
    /// and flushed. An approximate shuffle, not a full-corpus permutation.
    pub buffer_size: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            merge: true,
            required_keys: Vec::new(),
            shuffle: false,
            seed: None,
            buffer_size: DEFAULT_SHUFFLE_BUFFER,
        }
    }
}

/// Merge JSONL files into `output`, returning the number of lines written.
///
/// Input files are processed in sorted order, or in a seeded random order
/// when shuffling. Empty lines are skipped. With `required_keys`, each line
/// must parse as a JSON object carrying every key or it is dropped with a
/// warning. Zero surviving lines is fatal.
pub fn merge_and_shuffle(
    files: &[PathBuf],
    output: &Path,
    opts: &MergeOptions,
) -> Result<usize, RunnerError> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut ordered: Vec<PathBuf> = files.to_vec();
    ordered.sort();

    let mut rng = StdRng::seed_from_u64(opts.seed.unwrap_or(0));
    if opts.shuffle {
        ordered.shuffle(&mut rng);
    }

    let bar = (ordered.len() > 1).then(|| create_progress_bar(ordered.len()));

    let mut writer = BufWriter::new(File::create(output)?);
    let mut buffer: Vec<String> = Vec::new();
    let mut total: usize = 0;
    let mut skipped: usize = 0;

    for file in &ordered {
        if !file.exists() {
            return Err(RunnerError::MissingSource {
                label: "merge input".to_string(),
                path: file.clone(),
                hint: String::new(),
            });
        }
        let reader = BufReader::new(File::open(file)?);
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if !opts.required_keys.is_empty() {
                match serde_json::from_str::<serde_json::Value>(line) {
                    Ok(serde_json::Value::Object(obj)) => {
                        let missing: Vec<&str> = opts
                            .required_keys
                            .iter()
                            .filter(|k| !obj.contains_key(k.as_str()))
                            .map(String::as_str)
                            .collect();
                        if !missing.is_empty() {
                            warn!(
                                "skipping {}:{} (missing keys: {})",
                                file.display(),
                                line_num + 1,
                                missing.join(", ")
                            );
                            skipped += 1;
                            continue;
                        }
                    }
                    Ok(_) => {
                        warn!("skipping non-object JSON at {}:{}", file.display(), line_num + 1);
                        skipped += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!("invalid JSON at {}:{}: {}", file.display(), line_num + 1, e);
                        skipped += 1;
                        continue;
                    }
                }
            }

            if opts.shuffle {
                buffer.push(line.to_string());
                if buffer.len() >= opts.buffer_size {
                    flush_shuffled(&mut writer, &mut buffer, &mut rng)?;
                }
            } else {
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
            }
            total += 1;
        }
        if let Some(bar) = &bar {
            bar.inc(1);
        }
    }

    if opts.shuffle && !buffer.is_empty() {
        flush_shuffled(&mut writer, &mut buffer, &mut rng)?;
    }
    writer.flush()?;
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    if skipped > 0 {
        warn!("merged {} lines, skipped {} invalid/mismatched lines", total, skipped);
    }
    if total == 0 {
        return Err(RunnerError::EmptyMergeResult {
            file_count: files.len(),
            output: output.to_path_buf(),
            hint: if opts.required_keys.is_empty() {
                String::new()
            } else {
                format!(" (required keys: {})", opts.required_keys.join(", "))
            },
        });
    }
    debug!("merged {} lines into {}", total, output.display());
    Ok(total)
}

fn flush_shuffled(
    writer: &mut BufWriter<File>,
    buffer: &mut Vec<String>,
    rng: &mut StdRng,
) -> Result<(), RunnerError> {
    buffer.shuffle(rng);
    for line in buffer.iter() {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    buffer.clear();
    Ok(())
}

/// A partition file is a tokenizer-produced shard like `train_3.jsonl`.
/// Flattened corpus names join path segments with `__`, so a second
/// underscore before the digits marks a legitimate corpus file.
fn is_partition_file(name: &str) -> bool {
    // regex crate has no lookbehind; (^|[^_]) stands in for (?<!_)
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(^|[^_])_\d+\.jsonl$").expect("valid pattern"))
        .is_match(name)
}

/// Expand an operator-supplied input path into the single `.jsonl` file a
/// tokenizer will read, merging when necessary.
///
/// `path` must already be absolute. Globs are rejected. A directory expands
/// to its non-partition `.jsonl` files; multiple files or any required-keys
/// constraint force a merge into `merge_output` (default: `merged_input.jsonl`
/// beside the inputs).
pub fn expand_input(
    path: &Path,
    merge_output: Option<&Path>,
    opts: &MergeOptions,
    missing_hint: &str,
) -> Result<PathBuf, RunnerError> {
    let raw = path.to_string_lossy();
    if raw.contains(['*', '?', '[']) {
        return Err(RunnerError::GlobNotSupported(raw.into_owned()));
    }
    if !path.exists() {
        return Err(RunnerError::MissingSource {
            label: "input path".to_string(),
            path: path.to_path_buf(),
            hint: missing_hint.to_string(),
        });
    }

    let files: Vec<PathBuf> = if path.is_dir() {
        let mut found: Vec<PathBuf> = fs::read_dir(path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension().and_then(|e| e.to_str()) == Some("jsonl")
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| !is_partition_file(n))
                        .unwrap_or(false)
            })
            .collect();
        found.sort();
        if found.is_empty() {
            return Err(RunnerError::MissingSource {
                label: "input directory (no non-partition .jsonl files)".to_string(),
                path: path.to_path_buf(),
                hint: missing_hint.to_string(),
            });
        }
        found
    } else {
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            return Err(RunnerError::MissingSource {
                label: "input file (must be .jsonl)".to_string(),
                path: path.to_path_buf(),
                hint: String::new(),
            });
        }
        vec![path.to_path_buf()]
    };

    // A single clean file passes through untouched; anything needing
    // filtering or concatenation goes through a merge.
    let needs_filter = !opts.required_keys.is_empty() || opts.shuffle;
    if (files.len() == 1 || !opts.merge) && !needs_filter {
        return Ok(files.into_iter().next().unwrap_or_else(|| path.to_path_buf()));
    }

    let output = match merge_output {
        Some(out) => out.to_path_buf(),
        None => {
            let merge_dir = if path.is_dir() {
                path.to_path_buf()
            } else {
                path.parent().map(Path::to_path_buf).unwrap_or_default()
            };
            merge_dir.join(MERGED_INPUT_FILE)
        }
    };
    // Never feed an earlier merge result back into itself
    let inputs: Vec<PathBuf> = files
        .into_iter()
        .filter(|f| {
            f != &output && f.file_name().and_then(|n| n.to_str()) != Some(MERGED_INPUT_FILE)
        })
        .collect();
    merge_and_shuffle(&inputs, &output, opts)?;
    Ok(output)
}
