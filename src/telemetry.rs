use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::config::RuntimeConfig;
use crate::events::{AGENT_FAILED, AGENT_SUCCEEDED, ENQUEUE_REJECTED, Event, PIPELINE_TERMINATED};

pub fn unix_ms_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Observability collaborator handed to the scheduler. Every event the
/// scheduler appends to the state is also offered here.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &Event);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: &Event) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &Event) {
        let agent = event
            .meta
            .get("agent")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let meta = Value::Object(event.meta.clone());
        if event.kind == AGENT_FAILED {
            tracing::warn!(event = %event.kind, agent, meta = %meta, "pipeline event");
        } else {
            tracing::info!(event = %event.kind, agent, meta = %meta, "pipeline event");
        }
    }
}

/// Forwards each event to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn record(&self, event: &Event) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Appends one JSON line per event. Write failures are logged and dropped.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    pub enabled: bool,
    pub path: PathBuf,
    pub run_id: String,
    pub project: String,
    pub file_lock: Arc<Mutex<()>>,
}

impl TelemetrySink {
    pub fn new(cfg: &RuntimeConfig, project: &str) -> Self {
        let run_id = format!("run-{}-{}", unix_ms_now(), std::process::id());
        Self {
            enabled: cfg.telemetry_enabled,
            path: PathBuf::from(&cfg.telemetry_path),
            run_id,
            project: project.to_string(),
            file_lock: Arc::new(Mutex::new(())),
        }
    }

    fn append_event_line(&self, value: &Value) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create telemetry directory '{}'",
                    parent.display()
                )
            })?;
        }

        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open telemetry path '{}'", self.path.display()))?;

        serde_json::to_writer(&mut file, value)
            .with_context(|| format!("failed to serialize telemetry event for run '{}'", self.run_id))?;
        writeln!(file).context("failed to write telemetry newline")
    }
}

impl EventSink for TelemetrySink {
    fn record(&self, event: &Event) {
        if !self.enabled {
            return;
        }

        let record = json!({
            "ts_unix_ms": unix_ms_now() as u64,
            "run_id": self.run_id,
            "project": self.project,
            "event": event.kind,
            "meta": Value::Object(event.meta.clone()),
        });

        if let Err(err) = self.append_event_line(&record) {
            tracing::warn!(
                event = %event.kind,
                path = %self.path.display(),
                error = %err,
                "telemetry write failed"
            );
        }
    }
}

#[derive(Debug, Default)]
pub struct TelemetrySummary {
    pub total_lines: usize,
    pub parsed_events: usize,
    pub parse_errors: usize,
    pub unique_runs: BTreeSet<String>,
    pub agent_succeeded: BTreeMap<String, usize>,
    pub agent_failed: BTreeMap<String, usize>,
    pub enqueue_rejected: usize,
    pub terminations: BTreeMap<String, usize>,
    pub last_event_ts_unix_ms: Option<u128>,
}

pub fn summarize_telemetry_lines(lines: Vec<String>, limit: usize) -> TelemetrySummary {
    let mut summary = TelemetrySummary::default();
    let max_events = limit.max(1);
    summary.total_lines = lines.len();

    for line in lines.into_iter().rev().take(max_events) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parsed = match serde_json::from_str::<Value>(line) {
            Ok(value) => value,
            Err(_) => {
                summary.parse_errors += 1;
                continue;
            }
        };

        summary.parsed_events += 1;

        if let Some(run_id) = parsed.get("run_id").and_then(Value::as_str)
            && !run_id.is_empty()
        {
            summary.unique_runs.insert(run_id.to_string());
        }

        if let Some(ts) = parsed.get("ts_unix_ms").and_then(Value::as_u64) {
            let ts_u128 = ts as u128;
            summary.last_event_ts_unix_ms = Some(
                summary
                    .last_event_ts_unix_ms
                    .map(|existing| existing.max(ts_u128))
                    .unwrap_or(ts_u128),
            );
        }

        let meta_str = |key: &str| {
            parsed
                .get("meta")
                .and_then(|meta| meta.get(key))
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string()
        };

        match parsed
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
        {
            AGENT_SUCCEEDED => *summary.agent_succeeded.entry(meta_str("agent")).or_insert(0) += 1,
            AGENT_FAILED => *summary.agent_failed.entry(meta_str("agent")).or_insert(0) += 1,
            ENQUEUE_REJECTED => summary.enqueue_rejected += 1,
            PIPELINE_TERMINATED => *summary.terminations.entry(meta_str("reason")).or_insert(0) += 1,
            _ => {}
        }
    }

    summary
}

pub fn run_telemetry_report(
    cfg: &RuntimeConfig,
    path_override: Option<String>,
    limit: usize,
) -> Result<()> {
    let path = PathBuf::from(path_override.unwrap_or_else(|| cfg.telemetry_path.clone()));
    if !path.exists() {
        println!("No telemetry file found at '{}'.", path.display());
        return Ok(());
    }

    let file = std::fs::File::open(&path)
        .with_context(|| format!("failed to open telemetry file '{}'", path.display()))?;
    let reader = io::BufReader::new(file);
    let lines = reader
        .lines()
        .collect::<std::result::Result<Vec<String>, std::io::Error>>()
        .with_context(|| format!("failed to read telemetry file '{}'", path.display()))?;

    let summary = summarize_telemetry_lines(lines, limit);

    println!("Telemetry report");
    println!("Path: {}", path.display());
    println!("Lines in file: {}", summary.total_lines);
    println!(
        "Events analyzed: {} (parse_errors={})",
        summary.parsed_events, summary.parse_errors
    );
    println!("Unique runs: {}", summary.unique_runs.len());
    println!("Rejected enqueues: {}", summary.enqueue_rejected);

    let agents = summary
        .agent_succeeded
        .keys()
        .chain(summary.agent_failed.keys())
        .collect::<BTreeSet<_>>();
    if !agents.is_empty() {
        println!("Agent outcomes:");
        for agent in agents {
            println!(
                "- {}: succeeded={} failed={}",
                agent,
                summary.agent_succeeded.get(agent).copied().unwrap_or(0),
                summary.agent_failed.get(agent).copied().unwrap_or(0)
            );
        }
    }

    if !summary.terminations.is_empty() {
        println!("Terminations:");
        for (reason, count) in &summary.terminations {
            println!("- {reason}: {count}");
        }
    }

    if let Some(last_ts) = summary.last_event_ts_unix_ms {
        println!("Last event ts_unix_ms: {last_ts}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn summary_counts_outcomes_and_skips_bad_lines() {
        let lines = vec![
            r#"{"ts_unix_ms":10,"run_id":"r1","event":"agent_succeeded","meta":{"agent":"contract"}}"#.to_string(),
            r#"{"ts_unix_ms":11,"run_id":"r1","event":"agent_failed","meta":{"agent":"database"}}"#.to_string(),
            "not json".to_string(),
            String::new(),
            r#"{"ts_unix_ms":12,"run_id":"r2","event":"enqueue_rejected","meta":{"agent":"ghost"}}"#.to_string(),
            r#"{"ts_unix_ms":13,"run_id":"r2","event":"pipeline_terminated","meta":{"reason":"goal_met"}}"#.to_string(),
        ];
        let summary = summarize_telemetry_lines(lines, 100);
        assert_eq!(summary.total_lines, 6);
        assert_eq!(summary.parsed_events, 4);
        assert_eq!(summary.parse_errors, 1);
        assert_eq!(summary.unique_runs.len(), 2);
        assert_eq!(summary.agent_succeeded.get("contract"), Some(&1));
        assert_eq!(summary.agent_failed.get("database"), Some(&1));
        assert_eq!(summary.enqueue_rejected, 1);
        assert_eq!(summary.terminations.get("goal_met"), Some(&1));
        assert_eq!(summary.last_event_ts_unix_ms, Some(13));
    }

    #[test]
    fn limit_keeps_most_recent_lines() {
        let lines = (0..5)
            .map(|i| format!(r#"{{"ts_unix_ms":{i},"run_id":"r{i}","event":"x"}}"#))
            .collect::<Vec<_>>();
        let summary = summarize_telemetry_lines(lines, 2);
        assert_eq!(summary.parsed_events, 2);
        assert!(summary.unique_runs.contains("r4"));
        assert!(!summary.unique_runs.contains("r0"));
    }

    #[test]
    fn sink_appends_jsonl_records_when_enabled() {
        let dir = tempdir().unwrap();
        let cfg = RuntimeConfig {
            telemetry_enabled: true,
            telemetry_path: dir
                .path()
                .join("nested/telemetry.jsonl")
                .to_string_lossy()
                .to_string(),
            ..RuntimeConfig::default()
        };
        let sink = TelemetrySink::new(&cfg, "blog");
        sink.record(&Event::with_meta(AGENT_SUCCEEDED, json!({"agent": "memory"})));
        sink.record(&Event::tag("custom"));

        let content = std::fs::read_to_string(&sink.path).unwrap();
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["project"], json!("blog"));
        assert_eq!(first["event"], json!(AGENT_SUCCEEDED));
        assert_eq!(first["meta"]["agent"], json!("memory"));
        assert_eq!(first["run_id"], json!(sink.run_id));
    }

    #[test]
    fn disabled_sink_writes_nothing() {
        let dir = tempdir().unwrap();
        let cfg = RuntimeConfig {
            telemetry_enabled: false,
            telemetry_path: dir.path().join("t.jsonl").to_string_lossy().to_string(),
            ..RuntimeConfig::default()
        };
        let sink = TelemetrySink::new(&cfg, "p");
        sink.record(&Event::tag("x"));
        assert!(!sink.path.exists());
    }

    #[test]
    fn fanout_forwards_through_tracing_to_file() {
        let dir = tempdir().unwrap();
        let cfg = RuntimeConfig {
            telemetry_enabled: true,
            telemetry_path: dir.path().join("t.jsonl").to_string_lossy().to_string(),
            ..RuntimeConfig::default()
        };
        let file = Arc::new(TelemetrySink::new(&cfg, "p"));
        let fanout = FanoutSink::new().with(Arc::new(TracingSink)).with(file.clone());

        fanout.record(&Event::with_meta(AGENT_FAILED, json!({"agent": "review", "reason": "503"})));
        fanout.record(&Event::with_meta(AGENT_SUCCEEDED, json!({"agent": "memory"})));

        let content = std::fs::read_to_string(&file.path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.lines().next().unwrap().contains("\"reason\":\"503\""));
    }
}
