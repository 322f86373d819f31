use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::constants::*;

/// The identity encoded in a raw file name: `run000100_ls0001_index000000.raw`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawFileName {
    pub run: u32,
    pub lumisection: u32,
    pub index: u32,
}

impl RawFileName {
    pub fn new(run: u32, lumisection: u32, index: u32) -> Self {
        Self {
            run,
            lumisection,
            index,
        }
    }

    pub fn stem(&self) -> String {
        format!(
            "run{:06}_ls{:04}_index{:06}",
            self.run, self.lumisection, self.index
        )
    }

    pub fn data_name(&self) -> String {
        format!("{}.{RAW_EXTENSION}", self.stem())
    }

    pub fn ready_name(&self) -> String {
        format!("{}.{READY_EXTENSION}", self.stem())
    }

    pub fn claimed_name(&self) -> String {
        format!("{}.{CLAIMED_EXTENSION}", self.stem())
    }

    /// Parse any of the data, ready or claimed names. Returns None for anything else.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, _ext) = file_name.rsplit_once('.')?;
        let mut parts = stem.split('_');
        let run = parts.next()?.strip_prefix("run")?.parse().ok()?;
        let lumisection = parts.next()?.strip_prefix("ls")?.parse().ok()?;
        let index = parts.next()?.strip_prefix("index")?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(run, lumisection, index))
    }
}

/// Run directory name, e.g. `run000100`
pub fn run_dir_name(run_number: u32) -> String {
    format!("run{run_number:06}")
}

/// End-of-run marker name, e.g. `run000100_EoR.marker`
pub fn eor_marker_name(run_number: u32) -> String {
    format!("run{run_number:06}_EoR.marker")
}

/// Contents of a ready marker. Written by the producer once the data file is complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMarker {
    pub events: u32,
    pub bytes: u64,
}

/// A completed raw file announced by the producer and not yet claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFile {
    pub name: RawFileName,
    pub data_path: PathBuf,
    pub marker_path: PathBuf,
    pub size_bytes: u64,
    pub events: u32,
    pub complete: bool,
}

impl RawFile {
    pub fn in_directory(run_dir: &Path, name: RawFileName, marker: &FileMarker) -> Self {
        Self {
            name,
            data_path: run_dir.join(name.data_name()),
            marker_path: run_dir.join(name.ready_name()),
            size_bytes: marker.bytes,
            events: marker.events,
            complete: true,
        }
    }

    pub fn run(&self) -> u32 {
        self.name.run
    }

    pub fn lumisection(&self) -> u32 {
        self.name.lumisection
    }
}

/// A raw file this consumer owns. Only one consumer can ever hold a ClaimedFile for a
/// given RawFile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedFile {
    pub file: RawFile,
    pub claim_path: PathBuf,
}
