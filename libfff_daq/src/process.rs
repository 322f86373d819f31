use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use super::backoff::{Sleeper, ThreadSleeper};
use super::config::{Config, OutputKind};
use super::director::{Director, FilterUnit, SyntheticGenerator};
use super::error::{OutputError, ProcessorError};
use super::output::{MemorySink, OutputSink, SinkSummary, StreamFileWriter};
use super::prescaler::Prescaler;
use super::run_control::{RunControl, RunState, StopSignal, TransitionRecord};
use super::schedule::{ProcessingPath, Schedule, Subscription};
use super::source::{ChunkParams, EventSource, SourceStats};
use super::worker_status::{Microstate, WorkerStatus};

/// How many events a stream processes between status reports
const STATUS_INTERVAL: u64 = 100;

/// Everything worth knowing about a finished run. Written next to the outputs as
/// `run{NNNNNN}_summary.yml`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_number: u32,
    pub role: String,
    pub state: RunState,
    pub events: u64,
    pub per_stream: Vec<u64>,
    pub accepted: BTreeMap<String, u64>,
    pub source: SourceStats,
    pub outputs: Vec<SinkSummary>,
    pub transitions: Vec<TransitionRecord>,
}

impl RunSummary {
    fn new(run_number: u32, role: &str) -> Self {
        Self {
            run_number,
            role: role.to_string(),
            state: RunState::Ready,
            events: 0,
            per_stream: Vec::new(),
            accepted: BTreeMap::new(),
            source: SourceStats::default(),
            outputs: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn write(&self, run_dir: &Path) -> Result<(), ProcessorError> {
        let path = run_dir.join(format!("run{:06}_summary.yml", self.run_number));
        std::fs::write(&path, serde_yaml::to_string(self)?)?;
        log::info!("Run summary written to {}", path.display());
        Ok(())
    }
}

/// Pull events until the source runs dry, pushing each through the schedule.
fn run_stream(
    stream_id: usize,
    run_number: u32,
    source: &EventSource,
    schedule: &Schedule,
    tx: &Sender<WorkerStatus>,
) -> Result<u64, ProcessorError> {
    let mut events: u64 = 0;
    tx.send(WorkerStatus::new(
        stream_id,
        run_number,
        events,
        Microstate::Processing,
    ))?;
    while let Some(event) = source.next_event()? {
        schedule.process(&event)?;
        events += 1;
        if events % STATUS_INTERVAL == 0 {
            tx.send(WorkerStatus::new(
                stream_id,
                run_number,
                events,
                Microstate::Processing,
            ))?;
        }
    }
    tx.send(WorkerStatus::new(
        stream_id,
        run_number,
        events,
        Microstate::Finished,
    ))?;
    log::info!("Stream {stream_id} finished after {events} events");
    Ok(events)
}

fn build_sinks(config: &Config, run_dir: &Path) -> Result<Vec<Subscription>, ProcessorError> {
    let mut subscriptions = Vec::with_capacity(config.outputs.len());
    for output in &config.outputs {
        let sink: Arc<dyn OutputSink> = match output.kind {
            OutputKind::File => Arc::new(StreamFileWriter::new(
                &output.name,
                run_dir,
                config.run_number,
            )?),
            OutputKind::Memory => Arc::new(MemorySink::new(&output.name)),
        };
        subscriptions.push(Subscription {
            sink,
            select_events: output.select_events.clone(),
        });
    }
    Ok(subscriptions)
}

/// Close every sink, even after one fails. Returns the first close error.
fn close_sinks<'a>(
    sinks: impl Iterator<Item = &'a Arc<dyn OutputSink>>,
    outputs: &mut Vec<SinkSummary>,
) -> Option<OutputError> {
    let mut first_error = None;
    for sink in sinks {
        match sink.close() {
            Ok(summary) => outputs.push(summary),
            Err(e) => {
                log::error!("Output {} failed to close: {e}", sink.name());
                first_error.get_or_insert(e);
            }
        }
    }
    first_error
}

/// Consume a run as an FU: `n_streams` workers share one source and one schedule.
fn consume_run(
    config: &Config,
    filter: FilterUnit,
    tx: &Sender<WorkerStatus>,
    stop: &StopSignal,
    sleeper: Arc<dyn Sleeper>,
    control: &mut RunControl,
) -> Result<RunSummary, ProcessorError> {
    let run_dir = filter.context().fu_run_dir.clone();
    let mut summary = RunSummary::new(config.run_number, "FU");

    let prescaler = Arc::new(Prescaler::from_config(
        &config.prescale,
        &config.path_names(),
    )?);
    let paths: Vec<ProcessingPath> = config.paths.iter().map(ProcessingPath::from).collect();
    let schedule = Schedule::new(
        paths,
        prescaler,
        build_sinks(config, &run_dir)?,
        &config.prescale.lvl1_default_label,
        sleeper,
    )?;
    let source = EventSource::new(
        filter,
        ChunkParams::from_config(&config.source),
        stop.clone(),
    )?;

    let n_streams = config.effective_streams();
    log::info!(
        "Running {n_streams} streams over {} buffers of {}",
        config.source.num_buffers,
        human_bytes::human_bytes(source.pool().chunk_capacity() as f64)
    );
    control.start();

    let results: Vec<Result<u64, ProcessorError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..n_streams)
            .map(|stream_id| {
                let tx = tx.clone();
                let source = &source;
                let schedule = &schedule;
                scope.spawn(move || {
                    let result = run_stream(stream_id, config.run_number, source, schedule, &tx);
                    if let Err(e) = &result {
                        log::error!("Stream {stream_id} failed: {e}");
                        source.stop();
                        // The monitor may already be gone; the error is what matters here
                        let _ = tx.send(WorkerStatus::new(
                            stream_id,
                            config.run_number,
                            0,
                            Microstate::Failed,
                        ));
                    }
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(stream_id, handle)| {
                handle.join().unwrap_or_else(|_| {
                    source.stop();
                    Err(ProcessorError::StreamPanicked(stream_id))
                })
            })
            .collect()
    });

    let mut first_error = None;
    for result in results {
        match result {
            Ok(events) => summary.per_stream.push(events),
            Err(e) => {
                summary.per_stream.push(0);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    // Close the outputs even on failure so whatever was written stays readable
    let close_error = close_sinks(schedule.sinks(), &mut summary.outputs);
    summary.events = summary.per_stream.iter().sum();
    summary.accepted = schedule.accepted_counts().into_iter().collect();
    summary.source = source.stats();

    // A stream failure is the root cause; close errors only matter without one
    if let Some(e) = first_error {
        control.fail();
        return Err(e);
    }
    if let Some(e) = close_error {
        control.fail();
        return Err(e.into());
    }
    if stop.is_stopped() {
        log::warn!("Run {} was stopped before its end", config.run_number);
    }
    control.begin_stop();
    control.finish_stop();

    for (path, count) in &summary.accepted {
        log::info!("Path {path} accepted {count} events");
    }
    summary.state = control.state();
    summary.transitions = control.history().to_vec();
    summary.write(&run_dir)?;
    Ok(summary)
}

/// The main loop of fff_daq.
///
/// Plays the role the config asks for. A BU produces the synthetic run; an FU consumes
/// it through the handoff directories and runs the schedule over every event.
pub fn process_run(
    config: &Config,
    tx: &Sender<WorkerStatus>,
    stop: &StopSignal,
) -> Result<RunSummary, ProcessorError> {
    process_run_with(config, tx, stop, Arc::new(ThreadSleeper))
}

/// As [process_run], with the sleeper used by delay steps and polling supplied by the
/// caller.
pub fn process_run_with(
    config: &Config,
    tx: &Sender<WorkerStatus>,
    stop: &StopSignal,
    sleeper: Arc<dyn Sleeper>,
) -> Result<RunSummary, ProcessorError> {
    config.validate()?;
    let mut control = RunControl::new();
    let director = match Director::from_config(config, sleeper.clone(), stop) {
        Ok(d) => d,
        Err(e) => {
            control.fail();
            return Err(e.into());
        }
    };

    match director {
        Director::Builder(mut builder) => {
            let mut summary = RunSummary::new(config.run_number, "BU");
            control.start();
            tx.send(WorkerStatus::new(
                0,
                config.run_number,
                0,
                Microstate::Processing,
            ))?;
            let produced =
                match builder.produce_run(&SyntheticGenerator::from(&config.builder), stop) {
                    Ok(n) => n,
                    Err(e) => {
                        control.fail();
                        return Err(e.into());
                    }
                };
            tx.send(WorkerStatus::new(
                0,
                config.run_number,
                produced,
                Microstate::Finished,
            ))?;
            control.begin_stop();
            control.finish_stop();
            summary.events = produced;
            summary.per_stream.push(produced);
            summary.state = control.state();
            summary.transitions = control.history().to_vec();
            summary.write(&builder.context().bu_run_dir)?;
            Ok(summary)
        }
        Director::Filter(filter) => {
            consume_run(config, filter, tx, stop, sleeper, &mut control)
        }
    }
}
