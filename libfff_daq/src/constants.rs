// Raw file format
pub const FILE_MAGIC: [u8; 8] = *b"FFFRAW01";
pub const FILE_VERSION: u16 = 1;
pub const FILE_HEADER_SIZE: usize = 24;

pub const EVENT_VERSION: u16 = 6;
pub const EVENT_HEADER_SIZE: usize = 28;

// Handoff naming
pub const RAW_EXTENSION: &str = "raw";
pub const READY_EXTENSION: &str = "ready";
pub const CLAIMED_EXTENSION: &str = "claimed";
pub const OPEN_SUBDIR: &str = "open";
pub const TEST_MODE_SUBDIR: &str = "testmode";

/// Source sizes are given in MB
pub const SIZE_UNIT: usize = 1024 * 1024;
