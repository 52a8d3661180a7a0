//! Run results

use chrono::{DateTime, Utc};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::{Deserialize, Serialize};
use sightline_common::{Outcome, Result};
use std::path::{Path, PathBuf};

/// Result of one executed test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRecord {
    pub name: String,
    pub outcome: Outcome,
    pub message: String,
    pub duration_ms: u64,
    pub log_file: Option<PathBuf>,
}

/// Results of a whole run, bucketed by outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub passed: Vec<TestRecord>,
    pub failed: Vec<TestRecord>,
    pub errored: Vec<TestRecord>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Set when a signal ended the run early
    pub interrupted: bool,
    /// Infrastructure error that aborted the run
    pub fatal: Option<String>,
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            passed: Vec::new(),
            failed: Vec::new(),
            errored: Vec::new(),
            started_at: Utc::now(),
            duration_ms: 0,
            interrupted: false,
            fatal: None,
        }
    }

    pub fn push(&mut self, record: TestRecord) {
        match record.outcome {
            Outcome::Passed => self.passed.push(record),
            Outcome::Failed => self.failed.push(record),
            Outcome::Errored => self.errored.push(record),
        }
    }

    pub fn total(&self) -> usize {
        self.passed.len() + self.failed.len() + self.errored.len()
    }

    /// True when every executed test passed and nothing aborted the run
    pub fn all_passed(&self) -> bool {
        self.failed.is_empty() && self.errored.is_empty() && self.fatal.is_none() && !self.interrupted
    }

    /// Record the wall-clock duration since the run started
    pub fn finish(&mut self) {
        let elapsed = Utc::now() - self.started_at;
        self.duration_ms = elapsed.num_milliseconds().max(0) as u64;
    }

    /// Counts, then failed tests with their message, then errored tests
    pub fn render_summary(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!(
            "{} passed, {} failed, {} errored ({} total, {:.1}s)\n",
            self.passed.len().to_string().green(),
            self.failed.len().to_string().red(),
            self.errored.len().to_string().yellow(),
            self.total(),
            self.duration_ms as f64 / 1000.0
        ));

        if !self.failed.is_empty() || !self.errored.is_empty() {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["Test", "Result", "Message"]);
            for record in &self.failed {
                table.add_row(vec![record.name.clone(), "FAIL".to_string(), record.message.clone()]);
            }
            for record in &self.errored {
                table.add_row(vec![record.name.clone(), "ERROR".to_string(), record.message.clone()]);
            }
            out.push_str(&format!("{table}\n"));
        }

        if let Some(fatal) = &self.fatal {
            out.push_str(&format!("{} {}\n", "Run aborted:".red().bold(), fatal));
        }
        if self.interrupted {
            out.push_str(&format!("{}\n", "Run interrupted".yellow().bold()));
        }
        out
    }

    pub fn print_summary(&self) {
        print!("{}", self.render_summary());
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
