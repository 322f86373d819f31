use std::path::PathBuf;
use thiserror::Error;

use super::constants::*;
use super::worker_status::WorkerStatus;

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("Handoff failed due to IO error on {path:?}: {source}")]
    IOError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Handoff gave up on {path:?} after {attempts} attempts: {source}")]
    RetriesExhausted {
        path: PathBuf,
        attempts: u32,
        source: std::io::Error,
    },
    #[error("Handoff could not write a ready marker: {0}")]
    MarkerError(#[from] serde_yaml::Error),
    #[error("Handoff failed due to raw file error: {0}")]
    FrdError(#[from] FrdError),
}

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("Raw file {0:?} was already claimed by another consumer")]
    AlreadyClaimed(PathBuf),
    #[error("Claim failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum FrdError {
    #[error("Raw file failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Incorrect magic {0:?} found in raw file header; expected {exp:?}", exp=FILE_MAGIC)]
    BadMagic([u8; 8]),
    #[error("Unsupported raw file version {0}; expected {exp}", exp=FILE_VERSION)]
    BadFileVersion(u16),
    #[error("Unsupported event header version {0}; expected {exp}", exp=EVENT_VERSION)]
    BadEventVersion(u16),
    #[error("Event payload of {0} bytes does not fit the 32-bit size field")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Adler32,
    Crc32,
}

impl std::fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adler32 => write!(f, "adler32"),
            Self::Crc32 => write!(f, "crc32"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("EventSource was given an invalid configuration: {0}")]
    Config(String),
    #[error("Event {event_id} failed {kind} verification -- stored: {stored:#010x} computed: {computed:#010x}")]
    Checksum {
        event_id: u64,
        kind: ChecksumKind,
        stored: u32,
        computed: u32,
    },
    #[error("Event of {0} bytes does not fit in a chunk of {1} bytes")]
    EventTooLarge(usize, usize),
    #[error("Raw file {0:?} ended in the middle of an event")]
    Truncated(PathBuf),
    #[error("No raw file became ready after {0} polls")]
    NoData(u32),
    #[error("EventSource failed due to raw file error: {0}")]
    FrdError(#[from] FrdError),
    #[error("EventSource failed due to handoff error: {0}")]
    HandoffError(#[from] HandoffError),
    #[error("EventSource failed due to claim error: {0}")]
    ClaimError(#[from] ClaimError),
    #[error("EventSource failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PrescaleConfigError {
    #[error("Prescale factor 0 given for path {path} (label {label:?}); factors must be at least 1")]
    ZeroFactor { path: String, label: Option<String> },
    #[error("Path {0} appears more than once in the prescale table")]
    DuplicatePath(String),
    #[error("Prescale override refers to unknown path {0}")]
    UnknownPath(String),
    #[error("Prescale override refers to unknown L1 label {0}")]
    UnknownLabel(String),
    #[error("Path {path} has {given} prescales but {expected} L1 labels are configured")]
    LabelCountMismatch {
        path: String,
        given: usize,
        expected: usize,
    },
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Path {path} failed on event {event_id}: {message}")]
    StepFailed {
        path: String,
        event_id: u64,
        message: String,
    },
    #[error("Output {0} selects unknown path {1}")]
    UnknownSelection(String, String),
    #[error("Schedule failed due to output error: {0}")]
    OutputError(#[from] OutputError),
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Output failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Output failed due to raw file error: {0}")]
    FrdError(#[from] FrdError),
    #[error("Output failed to write yaml summary: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Output {0} was written to after it was closed")]
    Closed(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config is invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to handoff error: {0}")]
    HandoffError(#[from] HandoffError),
    #[error("Processor failed due to EventSource error: {0}")]
    SourceError(#[from] SourceError),
    #[error("Processor failed due to prescale configuration error: {0}")]
    PrescaleError(#[from] PrescaleConfigError),
    #[error("Processor failed due to Schedule error: {0}")]
    ScheduleError(#[from] ScheduleError),
    #[error("Processor failed due to output error: {0}")]
    OutputError(#[from] OutputError),
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
    #[error("Processor failed to write the run summary: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Processor failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Stream {0} panicked")]
    StreamPanicked(usize),
}
