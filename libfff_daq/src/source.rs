use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::sync::Arc;

use super::chunk_pool::{Chunk, ChunkPool};
use super::config::{ChecksumPolicy, SourceConfig};
use super::constants::*;
use super::error::{ChecksumKind, SourceError};
use super::frd::{EventHeader, FileHeader};
use super::handoff::retire_file;
use super::raw_file::ClaimedFile;
use super::run_control::StopSignal;

/// Sizing and behavior of an EventSource. Sizes are in bytes.
#[derive(Debug, Clone)]
pub struct ChunkParams {
    pub chunk_bytes: usize,
    pub num_buffers: usize,
    pub read_block_bytes: usize,
    pub verify_adler32: bool,
    pub verify_crc32: bool,
    pub ls_from_filename: bool,
    pub use_l1_event_id: bool,
    pub checksum_policy: ChecksumPolicy,
    pub delete_consumed_files: bool,
}

impl ChunkParams {
    /// Checksums on, ids and lumisections from the event headers
    pub fn new(chunk_bytes: usize, num_buffers: usize, read_block_bytes: usize) -> Self {
        Self {
            chunk_bytes,
            num_buffers,
            read_block_bytes,
            verify_adler32: true,
            verify_crc32: true,
            ls_from_filename: false,
            use_l1_event_id: true,
            checksum_policy: ChecksumPolicy::Abort,
            delete_consumed_files: false,
        }
    }

    /// Convert the MB based source configuration
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            chunk_bytes: config.event_chunk_size as usize * SIZE_UNIT,
            num_buffers: config.num_buffers as usize,
            read_block_bytes: config.event_chunk_block as usize * SIZE_UNIT,
            verify_adler32: config.verify_adler32,
            verify_crc32: config.verify_checksum,
            ls_from_filename: config.get_ls_from_filename,
            use_l1_event_id: config.use_l1_event_id,
            checksum_policy: config.checksum_policy,
            delete_consumed_files: config.delete_consumed_files,
        }
    }

    pub fn validate(&self) -> Result<(), SourceError> {
        if self.num_buffers < 1 {
            return Err(SourceError::Config(String::from(
                "at least one buffer is required",
            )));
        }
        if self.chunk_bytes < EVENT_HEADER_SIZE {
            return Err(SourceError::Config(format!(
                "chunk of {} bytes cannot hold a {EVENT_HEADER_SIZE} byte event header",
                self.chunk_bytes
            )));
        }
        if self.read_block_bytes == 0 || self.read_block_bytes > self.chunk_bytes {
            return Err(SourceError::Config(format!(
                "read block of {} bytes must be non-zero and no larger than the {} byte chunk",
                self.read_block_bytes, self.chunk_bytes
            )));
        }
        Ok(())
    }
}

/// What a FileProvider hands the source next
#[derive(Debug)]
pub enum Provided {
    File(ClaimedFile),
    EndOfRun,
    Stopped,
}

/// Supplies claimed raw files to an EventSource, in order.
///
/// May wait for the producer, but must give up promptly once `stop` is set.
pub trait FileProvider: Send {
    fn next_file(&mut self, stop: &StopSignal) -> Result<Provided, SourceError>;
}

/// A provider for exactly one already-claimed file
#[derive(Debug)]
pub struct SingleFile {
    file: Option<ClaimedFile>,
}

impl SingleFile {
    pub fn new(file: ClaimedFile) -> Self {
        Self { file: Some(file) }
    }
}

impl FileProvider for SingleFile {
    fn next_file(&mut self, _stop: &StopSignal) -> Result<Provided, SourceError> {
        Ok(match self.file.take() {
            Some(file) => Provided::File(file),
            None => Provided::EndOfRun,
        })
    }
}

/// An event carved out of a chunk. Holding a RawEvent keeps its chunk pinned.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub id: u64,
    pub run: u32,
    pub lumisection: u32,
    pub header: EventHeader,
    chunk: Arc<Chunk>,
    range: Range<usize>,
}

impl RawEvent {
    pub fn payload(&self) -> &[u8] {
        &self.chunk.bytes()[self.range.clone()]
    }

    /// The pool slot this event lives in
    pub fn chunk_slot(&self) -> usize {
        self.chunk.slot()
    }
}

/// Result of asking the source for an event
#[derive(Debug)]
pub enum Fetched {
    Event(RawEvent),
    EndOfRun,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub events: u64,
    pub corrupted: u64,
    pub files: u64,
    pub bytes: u64,
    pub max_pinned: usize,
}

#[derive(Debug)]
struct OpenFile {
    claimed: ClaimedFile,
    reader: File,
    remaining: u64,
}

struct SourceState {
    provider: Box<dyn FileProvider>,
    file: Option<OpenFile>,
    chunk: Option<Arc<Chunk>>,
    cursor: usize,
    carry: Vec<u8>,
    next_sequence: u64,
    finished: bool,
    stats: SourceStats,
}

/// Streams raw events out of claimed files through a fixed pool of chunk buffers.
///
/// Shared between streams behind an Arc. All cursor and chunk bookkeeping happens
/// under one lock, so two streams never get the same bytes. An event never straddles
/// two chunks: a partial event at the end of a chunk is carried to the front of the
/// next one.
///
/// A stream must drop the event it holds before asking for the next one, otherwise a
/// single-buffer pool can never be refilled.
pub struct EventSource {
    params: ChunkParams,
    pool: ChunkPool,
    stop: StopSignal,
    state: Mutex<SourceState>,
}

impl std::fmt::Debug for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSource")
            .field("params", &self.params)
            .field("pool", &self.pool)
            .finish()
    }
}

impl EventSource {
    /// Create a source fed by a provider
    pub fn new<P: FileProvider + 'static>(
        provider: P,
        params: ChunkParams,
        stop: StopSignal,
    ) -> Result<Self, SourceError> {
        params.validate()?;
        let pool = ChunkPool::new(params.num_buffers, params.chunk_bytes);
        Ok(Self {
            params,
            pool,
            stop,
            state: Mutex::new(SourceState {
                provider: Box::new(provider),
                file: None,
                chunk: None,
                cursor: 0,
                carry: Vec::new(),
                next_sequence: 0,
                finished: false,
                stats: SourceStats::default(),
            }),
        })
    }

    /// Create a source over a single claimed file; the run ends with the file
    pub fn open(file: ClaimedFile, params: ChunkParams) -> Result<Self, SourceError> {
        Self::new(SingleFile::new(file), params, StopSignal::new())
    }

    /// The next event, or None once the run has ended or the source was stopped
    pub fn next_event(&self) -> Result<Option<RawEvent>, SourceError> {
        match self.fetch()? {
            Fetched::Event(event) => Ok(Some(event)),
            Fetched::EndOfRun | Fetched::Stopped => Ok(None),
        }
    }

    /// The next event, distinguishing end of run from a stop request
    pub fn fetch(&self) -> Result<Fetched, SourceError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        loop {
            if self.stop.is_stopped() {
                state.chunk = None;
                return Ok(Fetched::Stopped);
            }
            if state.finished {
                return Ok(Fetched::EndOfRun);
            }

            if let Some((header, chunk)) = Self::peek_event(state.chunk.as_ref(), state.cursor)? {
                let start = state.cursor + EVENT_HEADER_SIZE;
                let range = start..state.cursor + header.total_size();
                state.cursor += header.total_size();
                match self.build_event(state, header, chunk, range)? {
                    Some(event) => return Ok(Fetched::Event(event)),
                    None => continue,
                }
            }

            let file_has_bytes = state.file.as_ref().is_some_and(|f| f.remaining > 0);
            if file_has_bytes {
                if !self.refill(state)? {
                    return Ok(Fetched::Stopped);
                }
                continue;
            }

            // Current file is exhausted
            let leftover = state
                .chunk
                .as_ref()
                .map_or(0, |c| c.len() - state.cursor);
            if let Some(file) = state.file.take() {
                if leftover > 0 {
                    return Err(SourceError::Truncated(file.claimed.file.data_path));
                }
                self.close_file(file)?;
            }
            state.chunk = None;
            state.cursor = 0;

            match state.provider.next_file(&self.stop)? {
                Provided::File(claimed) => {
                    state.file = Some(self.open_file(claimed, &mut state.stats)?);
                }
                Provided::EndOfRun => {
                    log::info!(
                        "End of run reached after {} events from {} files",
                        state.stats.events,
                        state.stats.files
                    );
                    state.finished = true;
                }
                Provided::Stopped => return Ok(Fetched::Stopped),
            }
        }
    }

    /// Ask every current and future caller to stop, and drop the source's own pin.
    pub fn stop(&self) {
        self.stop.stop();
        self.pool.stop();
        if let Some(mut state) = self.state.try_lock() {
            state.chunk = None;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    pub fn stats(&self) -> SourceStats {
        let mut stats = self.state.lock().stats.clone();
        stats.max_pinned = self.pool.high_water();
        stats
    }

    pub fn pool(&self) -> &ChunkPool {
        &self.pool
    }

    /// The header of the next event if all of it is in the chunk past `cursor`
    fn peek_event(
        chunk: Option<&Arc<Chunk>>,
        cursor: usize,
    ) -> Result<Option<(EventHeader, Arc<Chunk>)>, SourceError> {
        let Some(chunk) = chunk else {
            return Ok(None);
        };
        let available = &chunk.bytes()[cursor..];
        if available.len() < EVENT_HEADER_SIZE {
            return Ok(None);
        }
        let header = EventHeader::parse(available)?;
        let total = header.total_size();
        if total > chunk.capacity() {
            return Err(SourceError::EventTooLarge(total, chunk.capacity()));
        }
        if available.len() < total {
            return Ok(None);
        }
        Ok(Some((header, Arc::clone(chunk))))
    }

    /// Replace the current chunk with a fresh one holding the unread tail of the old
    /// chunk followed by as much of the file as fits. Returns false if stopped while
    /// waiting for a buffer.
    fn refill(&self, state: &mut SourceState) -> Result<bool, SourceError> {
        state.carry.clear();
        if let Some(old) = state.chunk.take() {
            state.carry.extend_from_slice(&old.bytes()[state.cursor..]);
        }
        state.cursor = 0;

        let Some(mut chunk) = self.pool.acquire() else {
            return Ok(false);
        };
        let carried = state.carry.len();
        // A full chunk of leftovers would be carried again forever
        if carried >= chunk.capacity() {
            return Err(SourceError::EventTooLarge(carried, chunk.capacity()));
        }
        chunk.spare_mut()[..carried].copy_from_slice(&state.carry);
        chunk.advance(carried);

        if let Some(file) = state.file.as_mut() {
            while chunk.len() < chunk.capacity() && file.remaining > 0 {
                let want = self
                    .params
                    .read_block_bytes
                    .min(chunk.capacity() - chunk.len())
                    .min(file.remaining as usize);
                let n = file.reader.read(&mut chunk.spare_mut()[..want])?;
                if n == 0 {
                    return Err(SourceError::Truncated(file.claimed.file.data_path.clone()));
                }
                chunk.advance(n);
                file.remaining -= n as u64;
                state.stats.bytes += n as u64;
            }
        }
        state.chunk = Some(Arc::new(chunk));
        Ok(true)
    }

    fn build_event(
        &self,
        state: &mut SourceState,
        header: EventHeader,
        chunk: Arc<Chunk>,
        range: Range<usize>,
    ) -> Result<Option<RawEvent>, SourceError> {
        let id = if self.params.use_l1_event_id {
            header.l1_event_id as u64
        } else {
            state.next_sequence += 1;
            state.next_sequence
        };
        let lumisection = match (&state.file, self.params.ls_from_filename) {
            (Some(file), true) => file.claimed.file.lumisection(),
            _ => header.lumisection,
        };

        if let Err(e) = self.verify(id, &header, &chunk.bytes()[range.clone()]) {
            match self.params.checksum_policy {
                ChecksumPolicy::Abort => return Err(e),
                ChecksumPolicy::Skip => {
                    log::warn!("Skipping corrupt event: {e}");
                    state.stats.corrupted += 1;
                    return Ok(None);
                }
            }
        }

        state.stats.events += 1;
        Ok(Some(RawEvent {
            id,
            run: header.run,
            lumisection,
            header,
            chunk,
            range,
        }))
    }

    fn verify(&self, event_id: u64, header: &EventHeader, payload: &[u8]) -> Result<(), SourceError> {
        if self.params.verify_adler32 {
            let computed = adler2::adler32_slice(payload);
            if computed != header.adler32 {
                return Err(SourceError::Checksum {
                    event_id,
                    kind: ChecksumKind::Adler32,
                    stored: header.adler32,
                    computed,
                });
            }
        }
        if self.params.verify_crc32 {
            let computed = crc32fast::hash(payload);
            if computed != header.crc32 {
                return Err(SourceError::Checksum {
                    event_id,
                    kind: ChecksumKind::Crc32,
                    stored: header.crc32,
                    computed,
                });
            }
        }
        Ok(())
    }

    fn open_file(&self, claimed: ClaimedFile, stats: &mut SourceStats) -> Result<OpenFile, SourceError> {
        let mut reader = File::open(&claimed.file.data_path)?;
        let size = reader.metadata()?.len();
        let header = FileHeader::read(&mut reader)?;
        if header.run != claimed.file.run() {
            log::warn!(
                "File {} claims run {} but is named for run {}",
                claimed.file.data_path.display(),
                header.run,
                claimed.file.run()
            );
        }
        log::info!(
            "Opened {} with {} events ({})",
            claimed.file.data_path.display(),
            header.event_count,
            human_bytes::human_bytes(size as f64)
        );
        stats.files += 1;
        Ok(OpenFile {
            claimed,
            reader,
            remaining: size.saturating_sub(FILE_HEADER_SIZE as u64),
        })
    }

    fn close_file(&self, file: OpenFile) -> Result<(), SourceError> {
        log::debug!("Finished {}", file.claimed.file.data_path.display());
        if self.params.delete_consumed_files {
            retire_file(&file.claimed)?;
        }
        Ok(())
    }
}
