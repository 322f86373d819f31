use std::path::Path;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

use libfff_daq::backoff::Sleeper;
use libfff_daq::config::{BuilderConfig, Config, PathConfig, StepConfig};
use libfff_daq::error::{ProcessorError, ScheduleError};
use libfff_daq::frd::FileHeader;
use libfff_daq::process::process_run_with;
use libfff_daq::run_control::{RunState, StopSignal};
use libfff_daq::worker_status::{Microstate, WorkerStatus};

struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration) {}
}

fn base_config(base: &Path) -> Config {
    let mut config = Config {
        fff_base_dir: base.to_path_buf(),
        builder: BuilderConfig {
            lumisections: 2,
            files_per_lumisection: 5,
            events_per_file: 100,
            payload_bytes: 1024,
        },
        ..Default::default()
    };
    config.source.event_chunk_size = 1;
    config.source.event_chunk_block = 1;
    for path in config.paths.iter_mut() {
        path.steps = vec![StepConfig::Delay { millis: 0 }, StepConfig::Prescale];
    }
    config
}

fn statuses(rx: &std::sync::mpsc::Receiver<WorkerStatus>) -> Vec<WorkerStatus> {
    rx.try_iter().collect()
}

#[test]
fn test_bu_then_fu() {
    let base = tempfile::tempdir().unwrap();
    let stop = StopSignal::new();

    let mut bu_config = base_config(base.path());
    bu_config.director.director_is_bu = true;
    let (tx, rx) = channel();
    let bu = process_run_with(&bu_config, &tx, &stop, Arc::new(NoSleep)).unwrap();
    assert_eq!(bu.role, "BU");
    assert_eq!(bu.events, 1000);
    let bu_run = base.path().join("ramdisk").join("run000100");
    assert!(bu_run.join("run000100_EoR.marker").exists());
    assert!(bu_run.join("run000100_ls0001_index000000.ready").exists());
    assert!(bu_run.join("run000100_ls0002_index000004.raw").exists());
    assert!(statuses(&rx)
        .iter()
        .any(|s| s.microstate == Microstate::Finished && s.events == 1000));

    let fu_config = base_config(base.path());
    let fu = process_run_with(&fu_config, &tx, &stop, Arc::new(NoSleep)).unwrap();
    assert_eq!(fu.role, "FU");
    assert_eq!(fu.state, RunState::Ready);
    assert_eq!(fu.events, 1000);
    assert_eq!(fu.per_stream.len(), 2);
    assert_eq!(fu.per_stream.iter().sum::<u64>(), 1000);
    assert_eq!(fu.accepted.get("p1"), Some(&100));
    assert_eq!(fu.accepted.get("p2"), Some(&10));
    assert_eq!(fu.source.files, 10);
    assert_eq!(fu.source.corrupted, 0);
    assert!(fu.source.max_pinned <= 2);

    let counts: Vec<(&str, u64)> = fu
        .outputs
        .iter()
        .map(|o| (o.name.as_str(), o.events))
        .collect();
    assert_eq!(counts, vec![("streamA", 100), ("streamB", 10), ("streamC", 10)]);

    let fu_run = base.path().join("data").join("run000100");
    assert!(fu_run.join("run000100_summary.yml").exists());
    let header = FileHeader::read(
        &mut std::fs::File::open(fu_run.join("run000100_streamA.dat")).unwrap(),
    )
    .unwrap();
    assert_eq!(header.event_count, 100);
    assert_eq!(header.run, 100);

    // Every ready marker was claimed
    let unclaimed = std::fs::read_dir(&bu_run)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .path()
                .extension()
                .is_some_and(|ext| ext == "ready")
        })
        .count();
    assert_eq!(unclaimed, 0);

    let finished = statuses(&rx)
        .into_iter()
        .filter(|s| s.microstate == Microstate::Finished)
        .count();
    assert_eq!(finished, 2);
}

#[test]
fn test_fu_test_mode() {
    let base = tempfile::tempdir().unwrap();
    let mut config = base_config(base.path());
    config.director.test_mode_no_builder_unit = true;
    config.builder = BuilderConfig {
        lumisections: 1,
        files_per_lumisection: 2,
        events_per_file: 50,
        payload_bytes: 64,
    };
    let (tx, _rx) = channel();
    let summary =
        process_run_with(&config, &tx, &StopSignal::new(), Arc::new(NoSleep)).unwrap();
    assert_eq!(summary.events, 100);
    assert_eq!(summary.accepted.get("p1"), Some(&10));
    assert_eq!(summary.accepted.get("p2"), Some(&1));
    assert!(base
        .path()
        .join("data")
        .join("testmode")
        .join("run000100")
        .join("run000100_EoR.marker")
        .exists());
    assert!(!base.path().join("ramdisk").exists());
}

#[test]
fn test_failing_path_fails_the_run() {
    let base = tempfile::tempdir().unwrap();
    let mut config = base_config(base.path());
    config.director.test_mode_no_builder_unit = true;
    config.paths.push(PathConfig {
        name: String::from("broken"),
        steps: vec![StepConfig::Fail {
            message: String::from("bad event"),
        }],
    });
    // streamA cannot write its summary, so closing it fails as well
    let fu_run = base.path().join("data").join("run000100");
    std::fs::create_dir_all(fu_run.join("run000100_streamA.yml")).unwrap();

    let (tx, _rx) = channel();
    let stop = StopSignal::new();
    match process_run_with(&config, &tx, &stop, Arc::new(NoSleep)) {
        Err(ProcessorError::ScheduleError(ScheduleError::StepFailed { path, .. })) => {
            assert_eq!(path, "broken")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(stop.is_stopped());
    // The outputs after the broken one were still closed
    assert!(fu_run.join("run000100_streamB.yml").is_file());
    assert!(!fu_run.join("run000100_summary.yml").exists());
}

#[test]
fn test_stopped_before_start() {
    let base = tempfile::tempdir().unwrap();
    let mut config = base_config(base.path());
    config.director.test_mode_no_builder_unit = true;
    let stop = StopSignal::new();
    stop.stop();
    let (tx, _rx) = channel();
    let summary = process_run_with(&config, &tx, &stop, Arc::new(NoSleep)).unwrap();
    assert_eq!(summary.events, 0);
    assert_eq!(summary.accepted.get("p1"), Some(&0));
}
