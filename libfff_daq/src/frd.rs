//! The raw event file format shared by producer, consumer and output streams.
//!
//! ```text
//! file header (24 bytes)
//! |---- magic "FFFRAW01", version(u16), reserved(u16), run(u32), lumisection(u32), event_count(u32)
//! event (repeated event_count times)
//! |---- header (28 bytes): version(u16), flags(u16), run(u32), lumisection(u32),
//! |     l1_event_id(u32), payload_size(u32), adler32(u32), crc32(u32)
//! |---- payload (payload_size bytes)
//! ```
//!
//! Everything is little endian. Both checksums cover the payload only.
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::constants::*;
use super::error::FrdError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub run: u32,
    pub lumisection: u32,
    pub event_count: u32,
}

impl FileHeader {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, FrdError> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != FILE_MAGIC {
            return Err(FrdError::BadMagic(magic));
        }
        let version = reader.read_u16::<LittleEndian>()?;
        if version != FILE_VERSION {
            return Err(FrdError::BadFileVersion(version));
        }
        let _reserved = reader.read_u16::<LittleEndian>()?;
        Ok(Self {
            run: reader.read_u32::<LittleEndian>()?,
            lumisection: reader.read_u32::<LittleEndian>()?,
            event_count: reader.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<(), FrdError> {
        writer.write_all(&FILE_MAGIC)?;
        writer.write_u16::<LittleEndian>(FILE_VERSION)?;
        writer.write_u16::<LittleEndian>(0)?;
        writer.write_u32::<LittleEndian>(self.run)?;
        writer.write_u32::<LittleEndian>(self.lumisection)?;
        writer.write_u32::<LittleEndian>(self.event_count)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub flags: u16,
    pub run: u32,
    pub lumisection: u32,
    pub l1_event_id: u32,
    pub payload_size: u32,
    pub adler32: u32,
    pub crc32: u32,
}

impl EventHeader {
    /// Build the header for a payload, computing both checksums
    pub fn for_payload(
        run: u32,
        lumisection: u32,
        l1_event_id: u32,
        payload: &[u8],
    ) -> Result<Self, FrdError> {
        let payload_size =
            u32::try_from(payload.len()).map_err(|_| FrdError::PayloadTooLarge(payload.len()))?;
        Ok(Self {
            flags: 0,
            run,
            lumisection,
            l1_event_id,
            payload_size,
            adler32: adler2::adler32_slice(payload),
            crc32: crc32fast::hash(payload),
        })
    }

    /// Parse a header from the front of a buffer. The buffer must hold at least
    /// EVENT_HEADER_SIZE bytes.
    pub fn parse(mut bytes: &[u8]) -> Result<Self, FrdError> {
        let version = bytes.read_u16::<LittleEndian>()?;
        if version != EVENT_VERSION {
            return Err(FrdError::BadEventVersion(version));
        }
        Ok(Self {
            flags: bytes.read_u16::<LittleEndian>()?,
            run: bytes.read_u32::<LittleEndian>()?,
            lumisection: bytes.read_u32::<LittleEndian>()?,
            l1_event_id: bytes.read_u32::<LittleEndian>()?,
            payload_size: bytes.read_u32::<LittleEndian>()?,
            adler32: bytes.read_u32::<LittleEndian>()?,
            crc32: bytes.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<(), FrdError> {
        writer.write_u16::<LittleEndian>(EVENT_VERSION)?;
        writer.write_u16::<LittleEndian>(self.flags)?;
        writer.write_u32::<LittleEndian>(self.run)?;
        writer.write_u32::<LittleEndian>(self.lumisection)?;
        writer.write_u32::<LittleEndian>(self.l1_event_id)?;
        writer.write_u32::<LittleEndian>(self.payload_size)?;
        writer.write_u32::<LittleEndian>(self.adler32)?;
        writer.write_u32::<LittleEndian>(self.crc32)?;
        Ok(())
    }

    /// Header plus payload
    pub fn total_size(&self) -> usize {
        EVENT_HEADER_SIZE + self.payload_size as usize
    }
}

/// Writes a raw file event by event.
///
/// The file header is written with an event count of zero and patched by `finish`.
#[derive(Debug)]
pub struct RawFileWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    header: FileHeader,
    bytes_written: u64,
}

impl RawFileWriter {
    pub fn create(path: &Path, run: u32, lumisection: u32) -> Result<Self, FrdError> {
        let mut writer = BufWriter::new(File::create(path)?);
        let header = FileHeader {
            run,
            lumisection,
            event_count: 0,
        };
        header.write(&mut writer)?;
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            header,
            bytes_written: FILE_HEADER_SIZE as u64,
        })
    }

    /// Append an event with freshly computed checksums
    pub fn write_event(
        &mut self,
        lumisection: u32,
        l1_event_id: u32,
        payload: &[u8],
    ) -> Result<(), FrdError> {
        let header = EventHeader::for_payload(self.header.run, lumisection, l1_event_id, payload)?;
        self.write_raw(&header, payload)
    }

    /// Append an event whose header was already built (i.e. forwarding a received event)
    pub fn write_raw(&mut self, header: &EventHeader, payload: &[u8]) -> Result<(), FrdError> {
        header.write(&mut self.writer)?;
        self.writer.write_all(payload)?;
        self.header.event_count += 1;
        self.bytes_written += header.total_size() as u64;
        Ok(())
    }

    pub fn event_count(&self) -> u32 {
        self.header.event_count
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Patch the event count into the file header and flush everything to disk
    pub fn finish(mut self) -> Result<(u32, u64), FrdError> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(0))?;
        self.header.write(file)?;
        file.sync_all()?;
        Ok((self.header.event_count, self.bytes_written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = EventHeader::for_payload(100, 3, 42, b"payload").unwrap();
        let mut bytes = Vec::new();
        header.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), EVENT_HEADER_SIZE);
        assert_eq!(header.total_size(), EVENT_HEADER_SIZE + 7);
        let parsed = EventHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.crc32, crc32fast::hash(b"payload"));
    }

    #[test]
    fn test_bad_event_version() {
        let mut bytes = vec![0u8; EVENT_HEADER_SIZE];
        bytes[0] = 5;
        match EventHeader::parse(&bytes) {
            Err(FrdError::BadEventVersion(5)) => (),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_writer_patches_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.raw");
        let mut writer = RawFileWriter::create(&path, 100, 1).unwrap();
        writer.write_event(1, 1, &[1, 2, 3]).unwrap();
        writer.write_event(1, 2, &[4, 5]).unwrap();
        let (count, bytes) = writer.finish().unwrap();
        assert_eq!(count, 2);
        assert_eq!(bytes, (FILE_HEADER_SIZE + 2 * EVENT_HEADER_SIZE + 5) as u64);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), bytes);

        let mut file = File::open(&path).unwrap();
        let header = FileHeader::read(&mut file).unwrap();
        assert_eq!(
            header,
            FileHeader {
                run: 100,
                lumisection: 1,
                event_count: 2
            }
        );
    }

    #[test]
    fn test_bad_magic() {
        let bytes = [0u8; FILE_HEADER_SIZE];
        match FileHeader::read(&mut &bytes[..]) {
            Err(FrdError::BadMagic(_)) => (),
            other => panic!("unexpected {other:?}"),
        }
    }
}
