use clap::{Arg, ArgAction, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;

use libfff_daq::config::Config;
use libfff_daq::process::process_run;
use libfff_daq::run_control::StopSignal;
use libfff_daq::worker_status::{Microstate, WorkerStatus};

fn make_template_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config)?;
    let mut file = File::create(path)?;
    file.write_all(yaml_str.as_bytes())?;
    Ok(())
}

fn main() {
    // Create a cli
    let matches = Command::new("fff_daq_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .global(true)
                .help("Path to the configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Log at debug level"),
        )
        .get_matches();

    let level = if matches.get_flag("verbose") {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");
    log::set_max_level(level);

    // Parse the cli
    let Some(config_path) = matches.get_one::<String>("path").map(PathBuf::from) else {
        log::error!("A configuration path is required (-p/--path)");
        return;
    };

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        match make_template_config(&config_path) {
            Ok(()) => log::info!("Done."),
            Err(e) => log::error!("Could not write template config: {e}"),
        }
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Config successfully loaded.");
    log::info!("Run Number: {}", config.run_number);
    log::info!("BU Path: {}", config.bu_root().to_string_lossy());
    log::info!("FU Path: {}", config.fu_root().to_string_lossy());
    log::info!(
        "Role: {}",
        if config.director.director_is_bu {
            "BU"
        } else if config.director.test_mode_no_builder_unit {
            "FU (test mode)"
        } else {
            "FU"
        }
    );
    log::info!(
        "Threads: {} Streams: {}",
        config.n_threads,
        config.n_streams
    );

    // Setup a spinner per stream; the total event count is not known up front
    let style = ProgressStyle::with_template("{spinner} stream {prefix}: {pos} events {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    let bars: Vec<ProgressBar> = (0..config.effective_streams())
        .map(|idx| {
            let pb = pb_manager.add(ProgressBar::new_spinner());
            pb.set_style(style.clone());
            pb.set_prefix(idx.to_string());
            pb
        })
        .collect();

    let (tx, rx) = channel::<WorkerStatus>();
    // Spawn the task!
    let handle = std::thread::spawn(move || process_run(&config, &tx, &StopSignal::new()));

    loop {
        // Drain the status queue, waiting at most a tick for something new
        if let Ok(status) = rx.recv_timeout(std::time::Duration::from_millis(100)) {
            update_bar(&bars, &status);
            while let Ok(status) = rx.try_recv() {
                update_bar(&bars, &status);
            }
        }
        for pb in &bars {
            pb.tick();
        }

        if handle.is_finished() {
            match handle.join() {
                Ok(result) => match result {
                    Ok(summary) => {
                        log::info!(
                            "Run {} finished as {} with {} events",
                            summary.run_number,
                            summary.role,
                            summary.events
                        );
                        for (path, count) in &summary.accepted {
                            log::info!("Path {path}: {count} accepted");
                        }
                        for output in &summary.outputs {
                            log::info!("Output {}: {} events", output.name, output.events);
                        }
                    }
                    Err(e) => log::error!("Run failed with error: {e}"),
                },
                Err(_) => log::error!("Failed to join the run task!"),
            }
            break;
        }
    }

    for pb in &bars {
        pb.finish();
    }

    log::info!("Done.");
}

fn update_bar(bars: &[ProgressBar], status: &WorkerStatus) {
    let Some(pb) = bars.get(status.stream_id) else {
        return;
    };
    pb.set_position(status.events);
    match status.microstate {
        Microstate::Finished | Microstate::Failed => pb.set_message(status.microstate.to_string()),
        _ => (),
    }
}
