use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Serialize;
use toolkt_core::{TelemetryEvent, TelemetrySink};

pub const SINK_VAR: &str = "TOOLKT_TELEMETRY_SINK";
pub const FILE_VAR: &str = "TOOLKT_TELEMETRY_FILE";
pub const ENDPOINT_VAR: &str = "TOOLKT_TELEMETRY_ENDPOINT";

pub fn sink_from_env() -> Option<Box<dyn TelemetrySink>> {
    sink_from_vars(|name| std::env::var(name).ok())
}

/// Same selection as [`sink_from_env`], reading variables through `lookup`.
pub fn sink_from_vars(lookup: impl Fn(&str) -> Option<String>) -> Option<Box<dyn TelemetrySink>> {
    let mode = lookup(SINK_VAR)?;
    match mode.trim().to_ascii_lowercase().as_str() {
        // stdout carries the CLI result document, so console telemetry goes to stderr.
        "stderr" | "stdout" | "console" => Some(Box::new(ConsoleSink)),
        "file" => {
            let path = lookup(FILE_VAR).filter(|v| !v.trim().is_empty())?;
            Some(Box::new(FileSink::new(PathBuf::from(path))))
        }
        "http" => {
            let endpoint = lookup(ENDPOINT_VAR).filter(|v| !v.trim().is_empty())?;
            Some(Box::new(HttpSink::new(endpoint)))
        }
        _ => None,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryEnvelope {
    event_type: String,
    mode: Option<&'static str>,
    factor: Option<u32>,
    duration_ms: Option<u64>,
    detail: Option<String>,
}

impl From<&TelemetryEvent> for TelemetryEnvelope {
    fn from(event: &TelemetryEvent) -> Self {
        Self {
            event_type: format!("{:?}", event.event_type),
            mode: event.mode.map(|mode| mode.label()),
            factor: event.factor,
            duration_ms: event.duration_ms,
            detail: event.detail.clone(),
        }
    }
}

impl TelemetryEnvelope {
    fn to_line(&self) -> Result<String> {
        serde_json::to_string(self).context("encoding telemetry event")
    }
}

/// JSON lines on stderr.
pub struct ConsoleSink;

impl ConsoleSink {
    fn write_event(&self, out: &mut impl Write, event: &TelemetryEvent) -> Result<()> {
        let line = TelemetryEnvelope::from(event).to_line()?;
        writeln!(out, "{}", line).context("writing telemetry line")?;
        Ok(())
    }
}

impl TelemetrySink for ConsoleSink {
    fn emit(&self, event: TelemetryEvent) {
        let _ = self.write_event(&mut std::io::stderr().lock(), &event);
    }
}

pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("creating telemetry log parent directory")?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("opening telemetry file")?;
        writeln!(file, "{}", line).context("writing telemetry line")?;
        Ok(())
    }
}

impl TelemetrySink for FileSink {
    fn emit(&self, event: TelemetryEvent) {
        let written = TelemetryEnvelope::from(&event)
            .to_line()
            .and_then(|line| self.write_line(&line));
        if let Err(err) = written {
            eprintln!("telemetry: dropped {:?} event for {}: {:#}", event.event_type, self.path.display(), err);
        }
    }
}

pub struct HttpSink {
    endpoint: String,
    client: Client,
}

impl HttpSink {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: Client::new(),
        }
    }
}

impl TelemetrySink for HttpSink {
    fn emit(&self, event: TelemetryEvent) {
        let sent = self
            .client
            .post(&self.endpoint)
            .json(&TelemetryEnvelope::from(&event))
            .send()
            .and_then(|response| response.error_for_status());
        if let Err(err) = sent {
            eprintln!("telemetry: post to {} failed: {}", self.endpoint, err);
        }
    }
}
