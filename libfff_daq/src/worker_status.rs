use serde::Serialize;

/// What a stream is doing right now
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum Microstate {
    #[default]
    Idle,
    Processing,
    Finished,
    Failed,
}

impl std::fmt::Display for Microstate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Processing => write!(f, "processing"),
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Progress report sent by each stream to whoever is monitoring the run
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub stream_id: usize,
    pub run_number: u32,
    pub events: u64,
    pub microstate: Microstate,
}

impl WorkerStatus {
    pub fn new(stream_id: usize, run_number: u32, events: u64, microstate: Microstate) -> Self {
        Self {
            stream_id,
            run_number,
            events,
            microstate,
        }
    }
}
