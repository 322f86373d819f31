use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::error::OutputError;
use super::frd::RawFileWriter;
use super::source::RawEvent;

/// What an output saw over a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SinkSummary {
    pub name: String,
    pub events: u64,
    pub bytes: u64,
    pub per_path: BTreeMap<String, u64>,
    pub file: Option<PathBuf>,
}

impl SinkSummary {
    fn record(&mut self, event: &RawEvent, paths: &[&str]) {
        self.events += 1;
        self.bytes += event.payload().len() as u64;
        for path in paths {
            *self.per_path.entry(path.to_string()).or_default() += 1;
        }
    }
}

/// A named consumer of admitted events.
///
/// Each event arrives once, tagged with every subscribed path that admitted it.
/// Sinks are shared by all streams.
pub trait OutputSink: Send + Sync {
    fn name(&self) -> &str;
    fn write_event(&self, event: &RawEvent, paths: &[&str]) -> Result<(), OutputError>;
    fn close(&self) -> Result<SinkSummary, OutputError>;
}

/// Writes admitted events to `run{NNNNNN}_stream{Name}.dat` in the raw format, with a
/// YAML summary alongside on close.
#[derive(Debug)]
pub struct StreamFileWriter {
    name: String,
    summary_path: PathBuf,
    writer: Mutex<Option<RawFileWriter>>,
    summary: Mutex<SinkSummary>,
}

impl StreamFileWriter {
    pub fn new(name: &str, run_dir: &Path, run_number: u32) -> Result<Self, OutputError> {
        let stem = format!("run{run_number:06}_stream{name}");
        let data_path = run_dir.join(format!("{stem}.dat"));
        let writer = RawFileWriter::create(&data_path, run_number, 0)?;
        log::info!("Output {name} writing to {}", data_path.display());
        Ok(Self {
            name: name.to_string(),
            summary_path: run_dir.join(format!("{stem}.yml")),
            writer: Mutex::new(Some(writer)),
            summary: Mutex::new(SinkSummary {
                name: name.to_string(),
                file: Some(data_path),
                ..Default::default()
            }),
        })
    }
}

impl OutputSink for StreamFileWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_event(&self, event: &RawEvent, paths: &[&str]) -> Result<(), OutputError> {
        let mut writer = self.writer.lock();
        let writer = writer
            .as_mut()
            .ok_or_else(|| OutputError::Closed(self.name.clone()))?;
        writer.write_raw(&event.header, event.payload())?;
        self.summary.lock().record(event, paths);
        Ok(())
    }

    fn close(&self) -> Result<SinkSummary, OutputError> {
        let summary = self.summary.lock().clone();
        if let Some(writer) = self.writer.lock().take() {
            let (events, bytes) = writer.finish()?;
            log::info!(
                "Output {} closed with {events} events ({})",
                self.name,
                human_bytes::human_bytes(bytes as f64)
            );
            std::fs::write(&self.summary_path, serde_yaml::to_string(&summary)?)?;
        }
        Ok(summary)
    }
}

/// Keeps counts only. Stands in for a shared-memory consumer.
#[derive(Debug)]
pub struct MemorySink {
    name: String,
    summary: Mutex<SinkSummary>,
}

impl MemorySink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            summary: Mutex::new(SinkSummary {
                name: name.to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn events(&self) -> u64 {
        self.summary.lock().events
    }
}

impl OutputSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_event(&self, event: &RawEvent, paths: &[&str]) -> Result<(), OutputError> {
        self.summary.lock().record(event, paths);
        Ok(())
    }

    fn close(&self) -> Result<SinkSummary, OutputError> {
        Ok(self.summary.lock().clone())
    }
}
