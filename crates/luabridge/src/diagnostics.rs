use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::rc::Rc;

use anyhow::Context;
use luabridge_contracts::LUABRIDGE_REPORT_SCHEMA_VERSION;
use serde::Serialize;
use serde_json::Value;

pub const LB_PULL_UNSUPPORTED: &str = "LB_PULL_UNSUPPORTED";
pub const LB_PULL_FOREIGN_FUNCTION: &str = "LB_PULL_FOREIGN_FUNCTION";
pub const LB_PULL_KEY_UNSUPPORTED: &str = "LB_PULL_KEY_UNSUPPORTED";
pub const LB_PULL_TOO_DEEP: &str = "LB_PULL_TOO_DEEP";
pub const LB_PULL_UNREADABLE_STRING: &str = "LB_PULL_UNREADABLE_STRING";
pub const LB_CODE_UNDELIVERED: &str = "LB_CODE_UNDELIVERED";
pub const LB_CODE_NOTHING_LOADED: &str = "LB_CODE_NOTHING_LOADED";
pub const LB_CALLBACK_STALE: &str = "LB_CALLBACK_STALE";
pub const LB_CALLBACK_PANIC: &str = "LB_CALLBACK_PANIC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, Value>,
}

impl Diagnostic {
    fn new(code: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity,
            message: message.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Warning, message)
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Error, message)
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub schema_version: String,
    pub ok: bool,
    pub diagnostics: Vec<Diagnostic>,
    /// Records the sink discarded because it was full.
    #[serde(skip_serializing_if = "is_zero")]
    pub dropped: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl Report {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            schema_version: LUABRIDGE_REPORT_SCHEMA_VERSION.to_string(),
            ok: diagnostics.iter().all(|d| d.severity != Severity::Error),
            diagnostics,
            dropped: 0,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let mut bytes = serde_json::to_vec_pretty(self).context("serialize report")?;
        bytes.push(b'\n');
        std::fs::write(path, bytes).with_context(|| format!("write: {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Sink {
    records: VecDeque<Diagnostic>,
    dropped: u64,
}

/// Per-bridge sink shared with the trampolines the bridge hands out.
///
/// Holds at most `cap` records; once full, the oldest record is dropped and
/// counted. Callers that keep a bridge alive are expected to drain it with
/// `take_diagnostics`.
#[derive(Debug, Clone)]
pub(crate) struct Diagnostics {
    sink: Rc<RefCell<Sink>>,
    cap: usize,
    echo: bool,
}

impl Diagnostics {
    pub(crate) fn new(echo: bool, cap: u32) -> Self {
        Self {
            sink: Rc::new(RefCell::new(Sink::default())),
            cap: usize::try_from(cap).unwrap_or(usize::MAX).max(1),
            echo,
        }
    }

    pub(crate) fn record(&self, diag: Diagnostic) {
        if self.echo {
            eprintln!("{}: {}", diag.code, diag.message);
        }
        let mut sink = self.sink.borrow_mut();
        if sink.records.len() >= self.cap {
            sink.records.pop_front();
            sink.dropped += 1;
        }
        sink.records.push_back(diag);
    }

    pub(crate) fn snapshot(&self) -> Vec<Diagnostic> {
        self.sink.borrow().records.iter().cloned().collect()
    }

    /// Drains the records and resets the dropped count.
    pub(crate) fn take(&self) -> Vec<Diagnostic> {
        let mut sink = self.sink.borrow_mut();
        sink.dropped = 0;
        sink.records.drain(..).collect()
    }

    pub(crate) fn report(&self) -> Report {
        let mut report = Report::new(self.snapshot());
        report.dropped = self.sink.borrow().dropped;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_serializes_with_schema_version() {
        let diag = Diagnostic::warning(LB_PULL_UNSUPPORTED, "userdata has no host value")
            .with_data("type", "userdata");
        let report = Report::new(vec![diag]);
        assert!(report.ok);
        let v = report.to_json();
        assert_eq!(v["schema_version"], LUABRIDGE_REPORT_SCHEMA_VERSION);
        assert_eq!(v["diagnostics"][0]["severity"], "warning");
        assert_eq!(v["diagnostics"][0]["data"]["type"], "userdata");
    }

    #[test]
    fn take_drains_the_sink() {
        let sink = Diagnostics::new(false, 8);
        sink.record(Diagnostic::warning(LB_CODE_NOTHING_LOADED, "nothing loaded"));
        assert_eq!(sink.snapshot().len(), 1);
        assert_eq!(sink.take().len(), 1);
        assert!(sink.snapshot().is_empty());
    }

    #[test]
    fn full_sink_drops_the_oldest_records() {
        let sink = Diagnostics::new(false, 3);
        for i in 0..5 {
            sink.record(Diagnostic::warning(LB_PULL_UNSUPPORTED, format!("warning {i}")));
        }
        let report = sink.report();
        let kept: Vec<&str> = report.diagnostics.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(kept, vec!["warning 2", "warning 3", "warning 4"]);
        assert_eq!(report.dropped, 2);
        assert_eq!(report.to_json()["dropped"], 2);

        sink.take();
        let report = sink.report();
        assert_eq!(report.dropped, 0);
        assert!(report.to_json().get("dropped").is_none());
    }

    #[test]
    fn errors_make_the_report_fail() {
        let report = Report::new(vec![
            Diagnostic::warning(LB_PULL_UNSUPPORTED, "substituted nil"),
            Diagnostic::error(LB_CALLBACK_PANIC, "host callback panicked"),
        ]);
        assert!(!report.ok);
        assert_eq!(report.to_json()["diagnostics"][1]["severity"], "error");
    }

    #[test]
    fn write_json_reports_the_path_on_failure() {
        let report = Report::new(Vec::new());
        let err = report
            .write_json(Path::new("/nonexistent-luabridge-dir/report.json"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent-luabridge-dir/report.json"));
    }
}
