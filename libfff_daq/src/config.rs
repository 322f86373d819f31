use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::backoff::{Backoff, RetryPolicy};
use super::error::ConfigError;
use super::handoff::RunContext;

/// Which side of the handoff this process plays
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectorConfig {
    pub director_is_bu: bool,
    pub test_mode_no_builder_unit: bool,
}

/// What to do with an event whose checksum does not match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumPolicy {
    #[default]
    Abort,
    Skip,
}

/// Raw event source settings. Sizes are in MB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub get_ls_from_filename: bool,
    pub verify_adler32: bool,
    pub verify_checksum: bool,
    pub use_l1_event_id: bool,
    pub event_chunk_size: u32,
    pub num_buffers: u32,
    pub event_chunk_block: u32,
    pub checksum_policy: ChecksumPolicy,
    pub delete_consumed_files: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            get_ls_from_filename: true,
            verify_adler32: true,
            verify_checksum: true,
            use_l1_event_id: true,
            event_chunk_size: 16,
            num_buffers: 2,
            event_chunk_block: 1,
            checksum_policy: ChecksumPolicy::Abort,
            delete_consumed_files: false,
        }
    }
}

/// One row of the prescale table. `prescales[i]` applies under `lvl1_labels[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrescaleRow {
    pub path_name: String,
    pub prescales: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrescaleConfig {
    pub force_default: bool,
    pub prescale_table: Vec<PrescaleRow>,
    pub lvl1_default_label: String,
    pub lvl1_labels: Vec<String>,
}

impl Default for PrescaleConfig {
    fn default() -> Self {
        Self {
            force_default: false,
            prescale_table: vec![
                PrescaleRow {
                    path_name: String::from("p1"),
                    prescales: vec![10],
                },
                PrescaleRow {
                    path_name: String::from("p2"),
                    prescales: vec![100],
                },
            ],
            lvl1_default_label: String::from("Default"),
            lvl1_labels: vec![String::from("Default")],
        }
    }
}

/// A processing step in a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepConfig {
    /// Hold each event for the given time
    Delay { millis: u64 },
    /// Fail every event with the given message
    Fail { message: String },
    /// Apply the path's prescale
    Prescale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConfig {
    pub name: String,
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Raw event file in the FU run directory
    File,
    /// Counted in memory only
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    pub kind: OutputKind,
    pub select_events: Vec<String>,
}

/// Synthetic data shape, used by the BU role and by the FU test mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub lumisections: u32,
    pub files_per_lumisection: u32,
    pub events_per_file: u32,
    pub payload_bytes: u32,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            lumisections: 2,
            files_per_lumisection: 5,
            events_per_file: 100,
            payload_bytes: 1024,
        }
    }
}

/// Polling and retry timing, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_idle_polls: Option<u32>,
    pub fs_retries: u32,
    pub fs_retry_delay_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 10,
            max_backoff_ms: 1000,
            max_idle_polls: None,
            fs_retries: 3,
            fs_retry_delay_ms: 100,
        }
    }
}

impl PollingConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fs_retries,
            delay: Duration::from_millis(self.fs_retry_delay_ms),
        }
    }
}

/// Structure representing the application configuration. Contains pathing, run, source,
/// prescale and output information.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub run_number: u32,
    pub fff_base_dir: PathBuf,
    pub bu_base_dir: PathBuf,
    pub fu_base_dir: PathBuf,
    pub n_threads: u32,
    pub n_streams: u32,
    pub director: DirectorConfig,
    pub source: SourceConfig,
    pub prescale: PrescaleConfig,
    pub paths: Vec<PathConfig>,
    pub outputs: Vec<OutputConfig>,
    pub builder: BuilderConfig,
    pub polling: PollingConfig,
}

impl Default for Config {
    /// The standard two-path FU test setup
    fn default() -> Self {
        Self {
            run_number: 100,
            fff_base_dir: PathBuf::from("."),
            bu_base_dir: PathBuf::from("ramdisk"),
            fu_base_dir: PathBuf::from("data"),
            n_threads: 2,
            n_streams: 2,
            director: DirectorConfig::default(),
            source: SourceConfig::default(),
            prescale: PrescaleConfig::default(),
            paths: vec![
                PathConfig {
                    name: String::from("p1"),
                    steps: vec![StepConfig::Delay { millis: 58 }, StepConfig::Prescale],
                },
                PathConfig {
                    name: String::from("p2"),
                    steps: vec![StepConfig::Delay { millis: 5 }, StepConfig::Prescale],
                },
            ],
            outputs: vec![
                OutputConfig {
                    name: String::from("streamA"),
                    kind: OutputKind::File,
                    select_events: vec![String::from("p1")],
                },
                OutputConfig {
                    name: String::from("streamB"),
                    kind: OutputKind::File,
                    select_events: vec![String::from("p2")],
                },
                OutputConfig {
                    name: String::from("streamC"),
                    kind: OutputKind::Memory,
                    select_events: vec![String::from("p2")],
                },
            ],
            builder: BuilderConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Producer root, `{fff_base_dir}/{bu_base_dir}`
    pub fn bu_root(&self) -> PathBuf {
        self.fff_base_dir.join(&self.bu_base_dir)
    }

    /// Consumer root, `{fff_base_dir}/{fu_base_dir}`
    pub fn fu_root(&self) -> PathBuf {
        self.fff_base_dir.join(&self.fu_base_dir)
    }

    pub fn run_context(&self) -> RunContext {
        RunContext::new(self.run_number, &self.bu_root(), &self.fu_root())
    }

    pub fn path_names(&self) -> Vec<String> {
        self.paths.iter().map(|p| p.name.clone()).collect()
    }

    /// Check the things that can be checked without touching the filesystem
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_streams < 1 {
            return Err(ConfigError::Invalid(String::from(
                "n_streams must be at least 1",
            )));
        }
        if self.n_threads < 1 {
            return Err(ConfigError::Invalid(String::from(
                "n_threads must be at least 1",
            )));
        }
        for (idx, path) in self.paths.iter().enumerate() {
            if self.paths[..idx].iter().any(|p| p.name == path.name) {
                return Err(ConfigError::Invalid(format!(
                    "path {} is defined more than once",
                    path.name
                )));
            }
        }
        Ok(())
    }

    /// Worker streams actually run. Streams beyond the thread count would only queue.
    pub fn effective_streams(&self) -> usize {
        self.n_streams.min(self.n_threads).max(1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_round_trip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("kind: prescale"));
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.run_number, 100);
        assert_eq!(back.paths, config.paths);
        assert_eq!(back.outputs, config.outputs);
    }

    #[test]
    fn test_paths() {
        let config = Config::default();
        assert_eq!(config.bu_root(), PathBuf::from("./ramdisk"));
        assert_eq!(config.fu_root(), PathBuf::from("./data"));
        assert_eq!(
            config.run_context().fu_run_dir,
            PathBuf::from("./data/run000100")
        );
    }

    #[test]
    fn test_missing_file() {
        match Config::read_config_file(Path::new("/does/not/exist.yml")) {
            Err(ConfigError::BadFilePath(_)) => (),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        config.paths.push(config.paths[0].clone());
        assert!(config.validate().is_err());
        let mut config = Config::default();
        config.n_streams = 0;
        assert!(config.validate().is_err());
    }
}
