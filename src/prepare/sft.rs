//! SFT record normalization
//!
//! Raw supervised-fine-tuning corpora arrive in several shapes. Trainers
//! expect one: `{input, label, text}` where `text == input + label`.

use crate::core::error::RunnerError;
use serde_json::{json, Map, Value};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, warn};

/// Prompt formatting applied to instruction-shaped records.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    /// Must contain `{instruction}`.
    pub prompt: String,
    /// Must contain `{input}`.
    pub input: String,
    pub response_prefix: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            prompt: "### Instruction:\n{instruction}\n".to_string(),
            input: "### Input:\n{input}\n".to_string(),
            response_prefix: "### Response:\n".to_string(),
        }
    }
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// Classify one raw record into `(input, label)`, or None when the shape is
/// not recognized.
fn classify(obj: &Map<String, Value>, templates: &PromptTemplates) -> Option<(String, String)> {
    // Already paired
    if let (Some(input), Some(label)) = (str_field(obj, "input"), str_field(obj, "label")) {
        return Some((input.to_string(), label.to_string()));
    }

    // Alpaca shape: instruction + optional input + output
    if let (Some(instruction), Some(output)) = (str_field(obj, "instruction"), str_field(obj, "output")) {
        let mut prompt = templates.prompt.replace("{instruction}", instruction);
        if let Some(extra) = str_field(obj, "input").filter(|s| !s.trim().is_empty()) {
            prompt.push_str(&templates.input.replace("{input}", extra));
        }
        prompt.push_str(&templates.response_prefix);
        return Some((prompt, output.to_string()));
    }

    // Prompt/completion shape
    if let Some(prompt) = str_field(obj, "prompt") {
        if let Some(response) = str_field(obj, "response").or_else(|| str_field(obj, "completion")) {
            return Some((prompt.to_string(), response.to_string()));
        }
    }

    // Bare pretraining-style text: everything is label, no prompt
    if let Some(text) = str_field(obj, "text") {
        return Some((String::new(), text.to_string()));
    }

    None
}

/// Rewrite a heterogeneous SFT corpus into canonical `{input, label, text}`
/// records. Unclassifiable records and records whose label trims to empty
/// are dropped with a logged count; writing zero records is fatal.
pub fn rewrite_instruction_to_input_label(
    input_file: &Path,
    output_file: &Path,
    templates: &PromptTemplates,
) -> Result<usize, RunnerError> {
    if let Some(parent) = output_file.parent() {
        fs::create_dir_all(parent)?;
    }

    let reader = BufReader::new(File::open(input_file)?);
    let mut writer = BufWriter::new(File::create(output_file)?);
    let mut written: usize = 0;
    let mut dropped: usize = 0;

    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let obj = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(obj)) => obj,
            _ => {
                warn!("dropping unparseable record at {}:{}", input_file.display(), line_num + 1);
                dropped += 1;
                continue;
            }
        };
        let Some((input, label)) = classify(&obj, templates) else {
            warn!("dropping unclassifiable record at {}:{}", input_file.display(), line_num + 1);
            dropped += 1;
            continue;
        };
        if label.trim().is_empty() {
            dropped += 1;
            continue;
        }
        let text = format!("{}{}", input, label);
        let record = json!({ "input": input, "label": label, "text": text });
        serde_json::to_writer(&mut writer, &record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writer.write_all(b"\n")?;
        written += 1;
    }
    writer.flush()?;

    if dropped > 0 {
        warn!(
            "sft rewrite: wrote {} records, dropped {} ({})",
            written,
            dropped,
            input_file.display()
        );
    }
    if written == 0 {
        return Err(RunnerError::EmptyMergeResult {
            file_count: 1,
            output: output_file.to_path_buf(),
            hint: " (no classifiable SFT records)".to_string(),
        });
    }
    debug!("sft rewrite: {} records -> {}", written, output_file.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rewrite(lines: &[&str]) -> Result<Vec<Value>, RunnerError> {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("raw.jsonl");
        let output = tmp.path().join("sft_input_label.jsonl");
        fs::write(&input, lines.join("\n") + "\n").unwrap();
        rewrite_instruction_to_input_label(&input, &output, &PromptTemplates::default())?;
        Ok(fs::read_to_string(&output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect())
    }

    #[test]
    fn test_instruction_output_round_trip() {
        let records = rewrite(&[r#"{"instruction":"Do X","output":"Y"}"#]).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(
            r["input"].as_str().unwrap(),
            "### Instruction:\nDo X\n### Response:\n"
        );
        assert_eq!(r["label"].as_str().unwrap(), "Y");
        let text = format!("{}{}", r["input"].as_str().unwrap(), r["label"].as_str().unwrap());
        assert_eq!(r["text"].as_str().unwrap(), text);
    }

    #[test]
    fn test_instruction_with_input_uses_input_template() {
        let records =
            rewrite(&[r#"{"instruction":"Sum","input":"1 2","output":"3"}"#]).unwrap();
        let input = records[0]["input"].as_str().unwrap();
        assert_eq!(
            input,
            "### Instruction:\nSum\n### Input:\n1 2\n### Response:\n"
        );
    }

    #[test]
    fn test_paired_records_pass_through() {
        let records = rewrite(&[r#"{"input":"Q: x\n","label":"A: y"}"#]).unwrap();
        assert_eq!(records[0]["input"].as_str().unwrap(), "Q: x\n");
        assert_eq!(records[0]["label"].as_str().unwrap(), "A: y");
        assert_eq!(records[0]["text"].as_str().unwrap(), "Q: x\nA: y");
    }

    #[test]
    fn test_prompt_response_and_completion_shapes() {
        let records = rewrite(&[
            r#"{"prompt":"p1","response":"r1"}"#,
            r#"{"prompt":"p2","completion":"r2"}"#,
        ])
        .unwrap();
        assert_eq!(records[0]["label"].as_str().unwrap(), "r1");
        assert_eq!(records[1]["label"].as_str().unwrap(), "r2");
    }

    #[test]
    fn test_bare_text_becomes_label_only() {
        let records = rewrite(&[r#"{"text":"just text"}"#]).unwrap();
        assert_eq!(records[0]["input"].as_str().unwrap(), "");
        assert_eq!(records[0]["label"].as_str().unwrap(), "just text");
        assert_eq!(records[0]["text"].as_str().unwrap(), "just text");
    }

    #[test]
    fn test_empty_labels_and_unknown_shapes_dropped() {
        let records = rewrite(&[
            r#"{"instruction":"Do X","output":"  "}"#,
            r#"{"question":"?"}"#,
            r#"{"prompt":"p","response":"ok"}"#,
        ])
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["label"].as_str().unwrap(), "ok");
    }

    #[test]
    fn test_zero_written_is_fatal() {
        let err = rewrite(&[r#"{"question":"?"}"#]).unwrap_err();
        assert!(matches!(err, RunnerError::EmptyMergeResult { .. }));
    }
}
