use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::backoff::Sleeper;
use super::config::{PathConfig, StepConfig};
use super::error::ScheduleError;
use super::output::OutputSink;
use super::prescaler::Prescaler;
use super::source::RawEvent;

/// One step of a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Hold the event, simulating processing time
    Delay(Duration),
    /// Fail the event
    Fail(String),
    /// Drop the event unless the path's prescaler admits it
    Prescale,
}

impl From<&StepConfig> for Step {
    fn from(config: &StepConfig) -> Self {
        match config {
            StepConfig::Delay { millis } => Self::Delay(Duration::from_millis(*millis)),
            StepConfig::Fail { message } => Self::Fail(message.clone()),
            StepConfig::Prescale => Self::Prescale,
        }
    }
}

/// A named linear sequence of steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingPath {
    pub name: String,
    pub steps: Vec<Step>,
}

impl From<&PathConfig> for ProcessingPath {
    fn from(config: &PathConfig) -> Self {
        Self {
            name: config.name.clone(),
            steps: config.steps.iter().map(Step::from).collect(),
        }
    }
}

/// An output and the paths it listens to
pub struct Subscription {
    pub sink: Arc<dyn OutputSink>,
    pub select_events: Vec<String>,
}

/// Runs every event through every path, then hands it to the outputs that selected
/// one of the paths that accepted it.
pub struct Schedule {
    paths: Vec<ProcessingPath>,
    accepted: Vec<AtomicU64>,
    prescaler: Arc<Prescaler>,
    subscriptions: Vec<Subscription>,
    label: RwLock<String>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schedule")
            .field("paths", &self.paths)
            .field("prescaler", &self.prescaler)
            .field("label", &*self.label.read())
            .finish()
    }
}

impl Schedule {
    pub fn new(
        paths: Vec<ProcessingPath>,
        prescaler: Arc<Prescaler>,
        subscriptions: Vec<Subscription>,
        label: &str,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, ScheduleError> {
        for sub in &subscriptions {
            for selected in &sub.select_events {
                if !paths.iter().any(|p| p.name == *selected) {
                    return Err(ScheduleError::UnknownSelection(
                        sub.sink.name().to_string(),
                        selected.clone(),
                    ));
                }
            }
        }
        if !prescaler.is_known_label(label) {
            log::warn!("L1 label {label} is not configured; base prescales will apply");
        }
        let accepted = paths.iter().map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            paths,
            accepted,
            prescaler,
            subscriptions,
            label: RwLock::new(label.to_string()),
            sleeper,
        })
    }

    /// Switch the L1 label. Prescale counters carry on from where they were.
    pub fn select_label(&self, label: &str) {
        if !self.prescaler.is_known_label(label) {
            log::warn!("L1 label {label} is not configured; base prescales will apply");
        }
        *self.label.write() = label.to_string();
    }

    pub fn label(&self) -> String {
        self.label.read().clone()
    }

    /// Process one event. Returns the names of the paths that accepted it.
    pub fn process(&self, event: &RawEvent) -> Result<Vec<&str>, ScheduleError> {
        let label = self.label.read().clone();
        let mut accepted: Vec<&str> = Vec::with_capacity(self.paths.len());
        for (path, count) in self.paths.iter().zip(&self.accepted) {
            if self.run_path(path, event, &label)? {
                count.fetch_add(1, Ordering::Relaxed);
                accepted.push(&path.name);
            }
        }

        for sub in &self.subscriptions {
            let selected: Vec<&str> = accepted
                .iter()
                .copied()
                .filter(|name| sub.select_events.iter().any(|s| s == name))
                .collect();
            if !selected.is_empty() {
                sub.sink.write_event(event, &selected)?;
            }
        }
        Ok(accepted)
    }

    fn run_path(
        &self,
        path: &ProcessingPath,
        event: &RawEvent,
        label: &str,
    ) -> Result<bool, ScheduleError> {
        for step in &path.steps {
            match step {
                Step::Delay(duration) => {
                    if !duration.is_zero() {
                        self.sleeper.sleep(*duration)
                    }
                }
                Step::Fail(message) => {
                    return Err(ScheduleError::StepFailed {
                        path: path.name.clone(),
                        event_id: event.id,
                        message: message.clone(),
                    })
                }
                Step::Prescale => {
                    if !self.prescaler.admit(&path.name, label) {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Accepted event count per path, in path order
    pub fn accepted_counts(&self) -> Vec<(String, u64)> {
        self.paths
            .iter()
            .zip(&self.accepted)
            .map(|(p, c)| (p.name.clone(), c.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn prescaler(&self) -> &Prescaler {
        &self.prescaler
    }

    pub fn sinks(&self) -> impl Iterator<Item = &Arc<dyn OutputSink>> {
        self.subscriptions.iter().map(|s| &s.sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::testing::RecordingSleeper;
    use crate::frd::RawFileWriter;
    use crate::output::MemorySink;
    use crate::prescaler::{LabelOverride, PathPrescale};
    use crate::raw_file::{ClaimedFile, FileMarker, RawFile, RawFileName};
    use crate::source::{ChunkParams, EventSource};
    use std::path::Path;

    fn source(dir: &Path, n: u32) -> EventSource {
        let name = RawFileName::new(100, 1, 0);
        let path = dir.join(name.data_name());
        let mut writer = RawFileWriter::create(&path, 100, 1).unwrap();
        for id in 1..=n {
            writer.write_event(1, id, &id.to_le_bytes()).unwrap();
        }
        let (events, bytes) = writer.finish().unwrap();
        let file = RawFile::in_directory(dir, name, &FileMarker { events, bytes });
        let claimed = ClaimedFile {
            claim_path: dir.join(name.claimed_name()),
            file,
        };
        EventSource::open(claimed, ChunkParams::new(1024, 2, 256)).unwrap()
    }

    fn prescaler(p1: u32, p2: u32) -> Arc<Prescaler> {
        Arc::new(
            Prescaler::configure(
                &[
                    PathPrescale {
                        name: String::from("p1"),
                        base_factor: p1,
                    },
                    PathPrescale {
                        name: String::from("p2"),
                        base_factor: p2,
                    },
                ],
                &[String::from("Default"), String::from("Cosmics")],
                &[LabelOverride {
                    label: String::from("Cosmics"),
                    factors: vec![(String::from("p1"), 1)],
                }],
                false,
            )
            .unwrap(),
        )
    }

    fn path(name: &str, steps: Vec<Step>) -> ProcessingPath {
        ProcessingPath {
            name: String::from(name),
            steps,
        }
    }

    #[test]
    fn test_fan_in_and_tagging() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path(), 20);
        let both = Arc::new(MemorySink::new("both"));
        let only_p2 = Arc::new(MemorySink::new("only_p2"));
        let sleeper = Arc::new(RecordingSleeper::default());
        let schedule = Schedule::new(
            vec![
                path("p1", vec![Step::Delay(Duration::from_millis(58)), Step::Prescale]),
                path("p2", vec![Step::Prescale]),
            ],
            prescaler(2, 5),
            vec![
                Subscription {
                    sink: both.clone(),
                    select_events: vec![String::from("p1"), String::from("p2")],
                },
                Subscription {
                    sink: only_p2.clone(),
                    select_events: vec![String::from("p2")],
                },
            ],
            "Default",
            sleeper.clone(),
        )
        .unwrap();

        while let Some(event) = source.next_event().unwrap() {
            schedule.process(&event).unwrap();
        }
        // p1 passes the even events, p2 passes 5, 10, 15, 20
        assert_eq!(
            schedule.accepted_counts(),
            vec![(String::from("p1"), 10), (String::from("p2"), 4)]
        );
        let summary = both.close().unwrap();
        // Events 10 and 20 pass both paths but reach the sink once
        assert_eq!(summary.events, 12);
        assert_eq!(summary.per_path.get("p1"), Some(&10));
        assert_eq!(summary.per_path.get("p2"), Some(&4));
        assert_eq!(only_p2.events(), 4);
        assert_eq!(sleeper.sleeps.lock().len(), 20);
    }

    #[test]
    fn test_label_switch() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path(), 10);
        let schedule = Schedule::new(
            vec![path("p1", vec![Step::Prescale])],
            prescaler(5, 1),
            vec![],
            "Default",
            Arc::new(RecordingSleeper::default()),
        )
        .unwrap();
        for _ in 0..3 {
            let event = source.next_event().unwrap().unwrap();
            assert!(schedule.process(&event).unwrap().is_empty());
        }
        schedule.select_label("Cosmics");
        assert_eq!(schedule.label(), "Cosmics");
        let event = source.next_event().unwrap().unwrap();
        assert_eq!(schedule.process(&event).unwrap(), vec!["p1"]);
        assert_eq!(schedule.prescaler().counter("p1"), Some(4));
    }

    #[test]
    fn test_fail_step() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path(), 1);
        let schedule = Schedule::new(
            vec![path("p1", vec![Step::Fail(String::from("boom"))])],
            prescaler(1, 1),
            vec![],
            "Default",
            Arc::new(RecordingSleeper::default()),
        )
        .unwrap();
        let event = source.next_event().unwrap().unwrap();
        match schedule.process(&event) {
            Err(ScheduleError::StepFailed { path, event_id, .. }) => {
                assert_eq!(path, "p1");
                assert_eq!(event_id, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_selection() {
        let result = Schedule::new(
            vec![path("p1", vec![])],
            prescaler(1, 1),
            vec![Subscription {
                sink: Arc::new(MemorySink::new("x")),
                select_events: vec![String::from("p9")],
            }],
            "Default",
            Arc::new(RecordingSleeper::default()),
        );
        assert!(matches!(result, Err(ScheduleError::UnknownSelection(_, _))));
    }
}
