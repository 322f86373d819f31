use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::backoff::{Backoff, RetryPolicy, Sleeper};
use super::config::{BuilderConfig, Config};
use super::constants::*;
use super::error::{ClaimError, HandoffError, SourceError};
use super::frd::RawFileWriter;
use super::handoff::{
    claim_file, discover_next_file, ensure_directory, ensure_run_directory_with, is_run_ended,
    RunContext,
};
use super::raw_file::{FileMarker, RawFile, RawFileName};
use super::run_control::StopSignal;
use super::source::{FileProvider, Provided};

/// Deterministic synthetic events: L1 ids count up from 1 across the whole run and each
/// payload is a byte pattern derived from its id.
#[derive(Debug, Clone)]
pub struct SyntheticGenerator {
    pub lumisections: u32,
    pub files_per_lumisection: u32,
    pub events_per_file: u32,
    pub payload_bytes: u32,
}

impl From<&BuilderConfig> for SyntheticGenerator {
    fn from(config: &BuilderConfig) -> Self {
        Self {
            lumisections: config.lumisections,
            files_per_lumisection: config.files_per_lumisection,
            events_per_file: config.events_per_file,
            payload_bytes: config.payload_bytes,
        }
    }
}

impl SyntheticGenerator {
    pub fn total_events(&self) -> u64 {
        self.lumisections as u64 * self.files_per_lumisection as u64 * self.events_per_file as u64
    }

    pub fn payload(&self, l1_event_id: u32) -> Vec<u8> {
        let seed = l1_event_id.to_le_bytes();
        (0..self.payload_bytes as usize)
            .map(|i| seed[i % 4].wrapping_add(i as u8))
            .collect()
    }
}

/// The producer role. Owns the BU run directory and publishes complete raw files.
#[derive(Debug)]
pub struct BuilderUnit {
    ctx: RunContext,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    next_index: BTreeMap<u32, u32>,
    files_written: u64,
}

impl BuilderUnit {
    pub fn new(ctx: RunContext, retry: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            ctx,
            retry,
            sleeper,
            next_index: BTreeMap::new(),
            files_written: 0,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    fn open_dir(&self) -> PathBuf {
        self.ctx.bu_run_dir.join(OPEN_SUBDIR)
    }

    /// Create the run directory and its `open/` staging area
    pub fn start_run(&mut self) -> Result<(), HandoffError> {
        let base = self.ctx.bu_run_dir.parent().unwrap_or(Path::new("."));
        ensure_run_directory_with(base, self.ctx.run_number, &self.retry, self.sleeper.as_ref())?;
        ensure_directory(&self.open_dir(), &self.retry, self.sleeper.as_ref())?;
        log::info!(
            "Builder unit started run {} in {}",
            self.ctx.run_number,
            self.ctx.bu_run_dir.display()
        );
        Ok(())
    }

    /// Write one raw file for a lumisection and publish it.
    ///
    /// The data is written under `open/` and renamed into the run directory, then the
    /// ready marker follows the same route. A consumer can only see the marker after
    /// the data file is complete.
    pub fn write_file<'a>(
        &mut self,
        lumisection: u32,
        events: impl IntoIterator<Item = (u32, &'a [u8])>,
    ) -> Result<RawFile, HandoffError> {
        let index = self.next_index.entry(lumisection).or_insert(0);
        let name = RawFileName::new(self.ctx.run_number, lumisection, *index);
        *index += 1;

        let open_data = self.open_dir().join(name.data_name());
        let mut writer = RawFileWriter::create(&open_data, self.ctx.run_number, lumisection)?;
        for (l1_event_id, payload) in events {
            writer.write_event(lumisection, l1_event_id, payload)?;
        }
        let (events, bytes) = writer.finish()?;

        let data_path = self.ctx.bu_run_dir.join(name.data_name());
        rename(&open_data, &data_path)?;

        let marker = FileMarker { events, bytes };
        let open_marker = self.open_dir().join(name.ready_name());
        std::fs::write(&open_marker, serde_yaml::to_string(&marker)?).map_err(|source| {
            HandoffError::IOError {
                path: open_marker.clone(),
                source,
            }
        })?;
        let file = RawFile::in_directory(&self.ctx.bu_run_dir, name, &marker);
        rename(&open_marker, &file.marker_path)?;

        self.files_written += 1;
        log::debug!(
            "Published {} with {events} events ({})",
            file.data_path.display(),
            human_bytes::human_bytes(bytes as f64)
        );
        Ok(file)
    }

    /// Announce that no more files will be published for this run
    pub fn end_run(&mut self) -> Result<(), HandoffError> {
        let marker = self.ctx.eor_marker();
        std::fs::write(&marker, b"").map_err(|source| HandoffError::IOError {
            path: marker.clone(),
            source,
        })?;
        log::info!(
            "Builder unit ended run {} after {} files",
            self.ctx.run_number,
            self.files_written
        );
        Ok(())
    }

    /// Produce a whole synthetic run, end-of-run marker included
    pub fn produce_run(
        &mut self,
        generator: &SyntheticGenerator,
        stop: &StopSignal,
    ) -> Result<u64, HandoffError> {
        self.start_run()?;
        let mut l1_event_id: u32 = 1;
        let mut produced: u64 = 0;
        'run: for lumisection in 1..=generator.lumisections {
            for _ in 0..generator.files_per_lumisection {
                if stop.is_stopped() {
                    log::warn!("Builder unit stopped before the end of the run");
                    break 'run;
                }
                let first = l1_event_id;
                let payloads: Vec<(u32, Vec<u8>)> = (first..first + generator.events_per_file)
                    .map(|id| (id, generator.payload(id)))
                    .collect();
                self.write_file(
                    lumisection,
                    payloads.iter().map(|(id, payload)| (*id, payload.as_slice())),
                )?;
                l1_event_id += generator.events_per_file;
                produced += generator.events_per_file as u64;
            }
        }
        self.end_run()?;
        Ok(produced)
    }

    pub fn files_written(&self) -> u64 {
        self.files_written
    }
}

fn rename(from: &Path, to: &Path) -> Result<(), HandoffError> {
    std::fs::rename(from, to).map_err(|source| HandoffError::IOError {
        path: from.to_path_buf(),
        source,
    })
}

/// The consumer role. Discovers and claims the producer's files for the event source.
#[derive(Debug)]
pub struct FilterUnit {
    ctx: RunContext,
    backoff: Backoff,
    max_idle_polls: Option<u32>,
    idle_polls: u32,
    sleeper: Arc<dyn Sleeper>,
    lost_claims: u64,
    claimed: u64,
}

impl FilterUnit {
    /// Make sure the FU run directory exists and build the consumer
    pub fn new(
        ctx: RunContext,
        backoff: Backoff,
        max_idle_polls: Option<u32>,
        retry: &RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, HandoffError> {
        let base = ctx.fu_run_dir.parent().unwrap_or(Path::new("."));
        ensure_run_directory_with(base, ctx.run_number, retry, sleeper.as_ref())?;
        Ok(Self {
            ctx,
            backoff,
            max_idle_polls,
            idle_polls: 0,
            sleeper,
            lost_claims: 0,
            claimed: 0,
        })
    }

    /// Consume a run this FU produces itself. A private BuilderUnit writes the run
    /// under `{fu_base}/testmode` and the FU then reads it through the normal
    /// discover and claim path.
    pub fn new_test_mode(
        ctx: RunContext,
        generator: &SyntheticGenerator,
        backoff: Backoff,
        retry: &RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
        stop: &StopSignal,
    ) -> Result<Self, HandoffError> {
        let fu_base = ctx.fu_run_dir.parent().unwrap_or(Path::new("."));
        let test_ctx = RunContext::new(ctx.run_number, &fu_base.join(TEST_MODE_SUBDIR), fu_base);
        log::info!(
            "Test mode: generating {} synthetic events in {}",
            generator.total_events(),
            test_ctx.bu_run_dir.display()
        );
        let mut builder = BuilderUnit::new(test_ctx.clone(), *retry, Arc::clone(&sleeper));
        builder.produce_run(generator, stop)?;
        Self::new(test_ctx, backoff, None, retry, sleeper)
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Number of claims lost to another consumer
    pub fn lost_claims(&self) -> u64 {
        self.lost_claims
    }

    pub fn claimed(&self) -> u64 {
        self.claimed
    }
}

impl FileProvider for FilterUnit {
    fn next_file(&mut self, stop: &StopSignal) -> Result<Provided, SourceError> {
        loop {
            if stop.is_stopped() {
                return Ok(Provided::Stopped);
            }
            // Check for the end marker before listing: everything published before the
            // marker is then guaranteed to show up in the listing.
            let ended = is_run_ended(&self.ctx);
            match discover_next_file(&self.ctx.bu_run_dir)? {
                Some(file) => match claim_file(&file) {
                    Ok(claimed) => {
                        self.backoff.reset();
                        self.idle_polls = 0;
                        self.claimed += 1;
                        return Ok(Provided::File(claimed));
                    }
                    Err(ClaimError::AlreadyClaimed(path)) => {
                        log::debug!("Lost claim on {}, looking again", path.display());
                        self.lost_claims += 1;
                    }
                    Err(e) => return Err(e.into()),
                },
                None if ended => return Ok(Provided::EndOfRun),
                None => {
                    self.idle_polls += 1;
                    if let Some(max) = self.max_idle_polls {
                        if self.idle_polls > max {
                            return Err(SourceError::NoData(max));
                        }
                    }
                    self.sleeper.sleep(self.backoff.next_delay());
                }
            }
        }
    }
}

/// The role this process plays, decided once from the configuration
#[derive(Debug)]
pub enum Director {
    Builder(BuilderUnit),
    Filter(FilterUnit),
}

impl Director {
    pub fn from_config(
        config: &Config,
        sleeper: Arc<dyn Sleeper>,
        stop: &StopSignal,
    ) -> Result<Self, HandoffError> {
        let ctx = config.run_context();
        let retry = config.polling.retry_policy();
        if config.director.director_is_bu {
            Ok(Self::Builder(BuilderUnit::new(ctx, retry, sleeper)))
        } else if config.director.test_mode_no_builder_unit {
            Ok(Self::Filter(FilterUnit::new_test_mode(
                ctx,
                &SyntheticGenerator::from(&config.builder),
                config.polling.backoff(),
                &retry,
                sleeper,
                stop,
            )?))
        } else {
            Ok(Self::Filter(FilterUnit::new(
                ctx,
                config.polling.backoff(),
                config.polling.max_idle_polls,
                &retry,
                sleeper,
            )?))
        }
    }
}
