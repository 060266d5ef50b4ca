//! Append-only accounting of billable calls.
//!
//! Records live in memory for the process lifetime and are mirrored line by
//! line to a JSONL log file when one is configured. The fast path only ever
//! appends; merging with on-disk history happens explicitly, on
//! [`CallLedger::set_log_path`] and [`CallLedger::save`].

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Designated extension for ledger log files.
pub const LEDGER_EXTENSION: &str = "jsonl";

/// One billable call. Never mutated after creation, only appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Globally unique, stable id; the merge key across processes.
    pub id: String,
    /// Operation that produced the charge (e.g. `chat_completion`).
    pub method: String,
    /// Endpoint identity the call was billed against.
    pub model: String,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl CallRecord {
    pub fn new(
        method: impl Into<String>,
        model: impl Into<String>,
        cost: f64,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method: method.into(),
            model: model.into(),
            cost,
            input_tokens,
            output_tokens,
            timestamp: Utc::now(),
        }
    }
}

/// In-memory ledger with an optional durable JSONL mirror.
///
/// Not internally synchronized; the owning context serializes access
/// (append-only under a single writer per process).
pub struct CallLedger {
    records: Vec<CallRecord>,
    log_path: Option<PathBuf>,
}

impl CallLedger {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            log_path: None,
        }
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Configure the durable log. Performs a merge-then-reload: the
    /// in-memory ledger is merged into any existing file at `path` (union by
    /// id, in-memory records win on collision), then the in-memory state is
    /// reloaded strictly from that file so the two are consistent.
    pub fn set_log_path(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        if path.extension().map_or(true, |e| e != LEDGER_EXTENSION) {
            return Err(Error::InvalidLogPath(path));
        }
        self.save(&path, true)?;
        self.records = Self::load_file(&path)?;
        tracing::info!(path = %path.display(), records = self.records.len(), "call log path configured");
        self.log_path = Some(path);
        Ok(())
    }

    /// Append one record: in-memory push plus one line on the log file when
    /// a path is configured. Prior lines are never rewritten here.
    pub fn append(&mut self, record: CallRecord) -> Result<()> {
        if let Some(path) = &self.log_path {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{}", serde_json::to_string(&record)?)?;
            file.flush()?;
        }
        self.records.push(record);
        Ok(())
    }

    /// Records, optionally filtered to one endpoint identity.
    pub fn records(&self, model: Option<&str>) -> Vec<&CallRecord> {
        self.records
            .iter()
            .filter(|r| model.map_or(true, |m| r.model == m))
            .collect()
    }

    pub fn total_cost(&self, model: Option<&str>) -> f64 {
        self.records(model).iter().map(|r| r.cost).sum()
    }

    pub fn total_input_tokens(&self, model: Option<&str>) -> u64 {
        self.records(model)
            .iter()
            .filter_map(|r| r.input_tokens)
            .sum()
    }

    pub fn total_output_tokens(&self, model: Option<&str>) -> u64 {
        self.records(model)
            .iter()
            .filter_map(|r| r.output_tokens)
            .sum()
    }

    pub fn total_tokens(&self, model: Option<&str>) -> u64 {
        self.total_input_tokens(model) + self.total_output_tokens(model)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Full merge-and-rewrite snapshot of the ledger at `path` (distinct
    /// from the append-only fast path). With `combine_with_existing`,
    /// on-disk-only records are preserved after the in-memory ones.
    pub fn save(&self, path: &Path, combine_with_existing: bool) -> Result<()> {
        let mut to_save = self.records.clone();
        if combine_with_existing && path.exists() {
            let in_memory: HashSet<&str> = self.records.iter().map(|r| r.id.as_str()).collect();
            for record in Self::load_file(path)? {
                if !in_memory.contains(record.id.as_str()) {
                    to_save.push(record);
                }
            }
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = File::create(path)?;
        for record in &to_save {
            writeln!(file, "{}", serde_json::to_string(record)?)?;
        }
        file.flush()?;
        Ok(())
    }

    /// Parse every record line of a ledger file, skipping blank lines.
    pub fn load_file(path: &Path) -> Result<Vec<CallRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl Default for CallLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(method: &str, model: &str, cost: f64) -> CallRecord {
        CallRecord::new(method, model, cost, Some(100), Some(50))
    }

    #[test]
    fn log_path_requires_jsonl_extension() {
        let dir = TempDir::new().unwrap();
        let mut ledger = CallLedger::new();
        let err = ledger
            .set_log_path(dir.path().join("calls.log"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidLogPath(_)));
    }

    #[test]
    fn append_mirrors_one_line_per_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("calls.jsonl");
        let mut ledger = CallLedger::new();
        ledger.set_log_path(&path).unwrap();

        ledger.append(record("chat_completion", "gpt-4o", 0.01)).unwrap();
        ledger.append(record("embedding", "small", 0.002)).unwrap();

        let lines = std::fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 2);
        assert_eq!(CallLedger::load_file(&path).unwrap().len(), 2);
    }

    #[test]
    fn merge_unions_by_id_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("calls.jsonl");

        // First process writes A and B.
        let mut first = CallLedger::new();
        first.set_log_path(&path).unwrap();
        let a = record("chat_completion", "gpt-4o", 0.01);
        let b = record("chat_completion", "gpt-4o", 0.02);
        first.append(a.clone()).unwrap();
        first.append(b.clone()).unwrap();

        // A fresh process sets the same log path and appends C.
        let mut second = CallLedger::new();
        second.set_log_path(&path).unwrap();
        assert_eq!(second.len(), 2);
        let c = record("embedding", "small", 0.003);
        second.append(c.clone()).unwrap();

        let ids: HashSet<String> = CallLedger::load_file(&path)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(
            ids,
            HashSet::from([a.id.clone(), b.id.clone(), c.id.clone()])
        );
    }

    #[test]
    fn merge_prefers_in_memory_on_id_collision() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("calls.jsonl");

        let mut stale = record("chat_completion", "gpt-4o", 0.01);
        let mut on_disk = CallLedger::new();
        on_disk.append(stale.clone()).unwrap();
        on_disk.save(&path, false).unwrap();

        stale.cost = 0.05;
        let mut current = CallLedger::new();
        current.append(stale.clone()).unwrap();
        current.save(&path, true).unwrap();

        let reloaded = CallLedger::load_file(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].cost, 0.05);
    }

    #[test]
    fn totals_respect_model_filter() {
        let mut ledger = CallLedger::new();
        ledger.append(record("chat_completion", "gpt-4o", 0.01)).unwrap();
        ledger.append(record("chat_completion", "gpt-4o", 0.04)).unwrap();
        ledger.append(record("embedding", "small", 0.002)).unwrap();

        assert!((ledger.total_cost(None) - 0.052).abs() < 1e-9);
        assert!((ledger.total_cost(Some("gpt-4o")) - 0.05).abs() < 1e-9);
        assert_eq!(ledger.total_input_tokens(Some("gpt-4o")), 200);
        assert_eq!(ledger.total_output_tokens(None), 150);
        assert_eq!(ledger.total_tokens(Some("small")), 150);
        assert_eq!(ledger.records(Some("small")).len(), 1);
    }

    #[test]
    fn records_without_token_counts_are_skipped_in_totals() {
        let mut ledger = CallLedger::new();
        ledger
            .append(CallRecord::new("http_get", "api", 0.0, None, None))
            .unwrap();
        assert_eq!(ledger.total_tokens(None), 0);
        assert_eq!(ledger.len(), 1);
    }
}
