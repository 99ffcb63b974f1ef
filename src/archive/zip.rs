//!
//! # ZIP 写入
//! Streaming store-mode (uncompressed) ZIP writer.
//!
//! Every entry is laid out as
//! `local header (30 + name) | data | data descriptor (16)` and indexed by a
//! central directory header (46 + name), followed by a 22-byte end of central
//! directory record. No extra fields, no comments, no ZIP64, so the final
//! length is known before the first byte is written (see [`archive_len`]).
//!

use std::io;

use chrono::{Datelike, NaiveDateTime, Timelike};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::archive::target::ArchiveObject;

const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;

pub const LOCAL_HEADER_LEN: u64 = 30;
pub const DATA_DESCRIPTOR_LEN: u64 = 16;
pub const CENTRAL_HEADER_LEN: u64 = 46;
pub const END_OF_CENTRAL_DIRECTORY_LEN: u64 = 22;
/// Fixed bytes one stored entry adds on top of its data and twice its name
pub const ENTRY_OVERHEAD: u64 = LOCAL_HEADER_LEN + DATA_DESCRIPTOR_LEN + CENTRAL_HEADER_LEN;

/// Largest archive the 32-bit format can address
pub const MAX_ARCHIVE_LEN: u64 = u32::MAX as u64;
pub const MAX_ENTRIES: usize = u16::MAX as usize;
pub const MAX_NAME_LEN: usize = u16::MAX as usize;

const VERSION: u16 = 20;
/// bit 3: sizes in data descriptor, bit 11: UTF-8 names
const FLAGS: u16 = 0x0008 | 0x0800;
const METHOD_STORED: u16 = 0;

/// Exact byte length of a store-mode archive holding `objects`.
pub fn archive_len(objects: &[ArchiveObject]) -> u64 {
    objects.iter().fold(END_OF_CENTRAL_DIRECTORY_LEN, |len, object| {
        len.saturating_add(entry_len(&object.name, object.size))
    })
}

/// Saturates instead of overflowing, so absurd sizes fail [`fits_store_mode`]
pub fn entry_len(name: &str, size: u64) -> u64 {
    size.saturating_add(ENTRY_OVERHEAD + 2 * name.len() as u64)
}

pub fn name_fits(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN
}

/// Whether `len` bytes and `entries` entries fit without ZIP64
pub fn fits_store_mode(len: u64, entries: usize) -> bool {
    len <= MAX_ARCHIVE_LEN && entries <= MAX_ENTRIES
}

fn dos_date_time(time: NaiveDateTime) -> (u16, u16) {
    if time.year() < 1980 {
        return (0, (1 << 5) | 1);
    }

    let dos_time = (time.hour() << 11) | (time.minute() << 5) | (time.second() / 2);
    let dos_date = (((time.year() - 1980) as u32).min(127) << 9) | (time.month() << 5) | time.day();

    (dos_time as u16, dos_date as u16)
}

fn too_large(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("{} exceeds store-mode ZIP limits", what))
}

fn to_u32(value: u64, what: &str) -> io::Result<u32> {
    u32::try_from(value).map_err(|_| too_large(what))
}

struct CentralEntry {
    name: String,
    crc: u32,
    size: u32,
    offset: u32,
}

struct OpenEntry {
    name: String,
    offset: u64,
    hasher: crc32fast::Hasher,
    size: u64,
}

pub struct ZipWriter<W> {
    sink: W,
    offset: u64,
    dos_time: u16,
    dos_date: u16,
    entries: Vec<CentralEntry>,
    current: Option<OpenEntry>,
}

impl<W: AsyncWrite + Unpin> ZipWriter<W> {
    pub fn new(sink: W) -> Self {
        Self::with_modified(sink, chrono::Local::now().naive_local())
    }

    /// All entries carry `modified` as their timestamp
    pub fn with_modified(sink: W, modified: NaiveDateTime) -> Self {
        let (dos_time, dos_date) = dos_date_time(modified);
        Self {
            sink,
            offset: 0,
            dos_time,
            dos_date,
            entries: Vec::new(),
            current: None,
        }
    }

    /// Bytes handed to the sink so far
    pub fn bytes_written(&self) -> u64 {
        self.offset
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.sink.write_all(bytes).await?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    pub async fn start_entry(&mut self, name: &str) -> io::Result<()> {
        if self.current.is_some() {
            return Err(io::Error::new(io::ErrorKind::Other, "previous entry still open"));
        }
        if self.entries.len() >= MAX_ENTRIES {
            return Err(too_large("entry count"));
        }
        let name_len = u16::try_from(name.len()).map_err(|_| too_large("entry name"))?;
        to_u32(self.offset, "archive offset")?;

        let mut header = Vec::with_capacity(LOCAL_HEADER_LEN as usize + name.len());
        header.extend_from_slice(&LOCAL_HEADER_SIGNATURE.to_le_bytes());
        header.extend_from_slice(&VERSION.to_le_bytes());
        header.extend_from_slice(&FLAGS.to_le_bytes());
        header.extend_from_slice(&METHOD_STORED.to_le_bytes());
        header.extend_from_slice(&self.dos_time.to_le_bytes());
        header.extend_from_slice(&self.dos_date.to_le_bytes());
        // crc, compressed and uncompressed size follow in the data descriptor
        header.extend_from_slice(&[0u8; 12]);
        header.extend_from_slice(&name_len.to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes());
        header.extend_from_slice(name.as_bytes());

        let offset = self.offset;
        self.write(&header).await?;
        self.current = Some(OpenEntry {
            name: name.to_string(),
            offset,
            hasher: crc32fast::Hasher::new(),
            size: 0,
        });

        Ok(())
    }

    pub async fn write_data(&mut self, data: &[u8]) -> io::Result<()> {
        let entry = self
            .current
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no open entry"))?;
        entry.hasher.update(data);
        entry.size += data.len() as u64;
        to_u32(entry.size, "entry size")?;

        self.write(data).await
    }

    /// Size of the data written into the open entry
    pub fn current_entry_size(&self) -> Option<u64> {
        self.current.as_ref().map(|entry| entry.size)
    }

    pub async fn finish_entry(&mut self) -> io::Result<()> {
        let entry = self
            .current
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no open entry"))?;
        let crc = entry.hasher.finalize();
        let size = to_u32(entry.size, "entry size")?;

        let mut descriptor = Vec::with_capacity(DATA_DESCRIPTOR_LEN as usize);
        descriptor.extend_from_slice(&DATA_DESCRIPTOR_SIGNATURE.to_le_bytes());
        descriptor.extend_from_slice(&crc.to_le_bytes());
        descriptor.extend_from_slice(&size.to_le_bytes());
        descriptor.extend_from_slice(&size.to_le_bytes());
        self.write(&descriptor).await?;

        self.entries.push(CentralEntry {
            name: entry.name,
            crc,
            size,
            offset: to_u32(entry.offset, "archive offset")?,
        });

        Ok(())
    }

    /// Drop the open entry from the index. Its bytes stay in the stream but no
    /// central directory record points at them.
    pub fn abandon_entry(&mut self) {
        self.current = None;
    }

    /// Write the central directory and end record, then shut the sink down.
    ///
    /// With `pad_to`, zero bytes are inserted before the central directory so
    /// the archive is exactly that long.
    pub async fn finish(mut self, pad_to: Option<u64>) -> io::Result<u64> {
        self.abandon_entry();

        let directory_len: u64 = self
            .entries
            .iter()
            .map(|entry| CENTRAL_HEADER_LEN + entry.name.len() as u64)
            .sum();

        if let Some(target_len) = pad_to {
            let natural_len = self.offset + directory_len + END_OF_CENTRAL_DIRECTORY_LEN;
            if natural_len > target_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("archive is {} bytes, more than the declared {}", natural_len, target_len),
                ));
            }

            let zeros = [0u8; 8192];
            let mut padding = target_len - natural_len;
            while padding > 0 {
                let n = padding.min(zeros.len() as u64) as usize;
                self.write(&zeros[..n]).await?;
                padding -= n as u64;
            }
        }

        let directory_offset = to_u32(self.offset, "central directory offset")?;
        let mut directory = Vec::with_capacity(directory_len as usize);
        for entry in &self.entries {
            directory.extend_from_slice(&CENTRAL_HEADER_SIGNATURE.to_le_bytes());
            directory.extend_from_slice(&VERSION.to_le_bytes());
            directory.extend_from_slice(&VERSION.to_le_bytes());
            directory.extend_from_slice(&FLAGS.to_le_bytes());
            directory.extend_from_slice(&METHOD_STORED.to_le_bytes());
            directory.extend_from_slice(&self.dos_time.to_le_bytes());
            directory.extend_from_slice(&self.dos_date.to_le_bytes());
            directory.extend_from_slice(&entry.crc.to_le_bytes());
            directory.extend_from_slice(&entry.size.to_le_bytes());
            directory.extend_from_slice(&entry.size.to_le_bytes());
            directory.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
            // extra, comment, disk number, internal attributes
            directory.extend_from_slice(&[0u8; 8]);
            // external attributes
            directory.extend_from_slice(&0u32.to_le_bytes());
            directory.extend_from_slice(&entry.offset.to_le_bytes());
            directory.extend_from_slice(entry.name.as_bytes());
        }

        let entry_count = self.entries.len() as u16;
        let mut end = Vec::with_capacity(END_OF_CENTRAL_DIRECTORY_LEN as usize);
        end.extend_from_slice(&END_OF_CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
        end.extend_from_slice(&0u16.to_le_bytes());
        end.extend_from_slice(&0u16.to_le_bytes());
        end.extend_from_slice(&entry_count.to_le_bytes());
        end.extend_from_slice(&entry_count.to_le_bytes());
        end.extend_from_slice(&to_u32(directory.len() as u64, "central directory")?.to_le_bytes());
        end.extend_from_slice(&directory_offset.to_le_bytes());
        end.extend_from_slice(&0u16.to_le_bytes());

        self.write(&directory).await?;
        self.write(&end).await?;
        self.sink.flush().await?;
        self.sink.shutdown().await?;

        Ok(self.offset)
    }
}


#[cfg(test)]
mod tests {
    use super::reader::read_entries;
    use super::*;
    use crate::archive::target::object;

    async fn build(objects: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut writer = ZipWriter::new(&mut out);
        for (name, data) in objects {
            writer.start_entry(name).await.unwrap();
            writer.write_data(data).await.unwrap();
            writer.finish_entry().await.unwrap();
        }
        writer.finish(None).await.unwrap();
        out
    }

    #[test]
    fn should_compute_exact_length() {
        let objects = vec![object(1, "a.jpg", 10), object(2, "ü.png", 0)];
        // "ü.png" is 6 bytes in UTF-8
        assert_eq!(archive_len(&objects), 22 + (10 + 92 + 10) + (92 + 12));
        assert_eq!(archive_len(&[]), 22);
    }

    #[tokio::test]
    async fn should_match_exact_length_of_real_archive() {
        let files: Vec<(&str, Vec<u8>)> = vec![
            ("one.jpg", vec![1u8; 1000]),
            ("two/ünïcode.jpg", (0..=255u8).collect()),
            ("empty.txt", Vec::new()),
        ];
        let objects: Vec<ArchiveObject> = files
            .iter()
            .enumerate()
            .map(|(i, (name, data))| object(i as u64, name, data.len() as u64))
            .collect();

        let archive = build(&files).await;
        assert_eq!(archive.len() as u64, archive_len(&objects));

        let entries = read_entries(&archive);
        assert_eq!(entries.len(), 3);
        for ((name, data), entry) in files.iter().zip(entries) {
            assert_eq!(&entry.name, name);
            assert_eq!(&entry.data, data);
        }
    }

    #[tokio::test]
    async fn should_write_empty_archive() {
        let archive = build(&[]).await;
        assert_eq!(archive.len(), 22);
        assert!(read_entries(&archive).is_empty());
    }

    #[tokio::test]
    async fn should_hide_abandoned_entry_and_pad() {
        let declared = 22 + entry_len("a.jpg", 4) + entry_len("b.jpg", 6);

        let mut out = Vec::new();
        let mut writer = ZipWriter::new(&mut out);
        writer.start_entry("a.jpg").await.unwrap();
        writer.write_data(b"abc").await.unwrap();
        writer.abandon_entry();
        writer.start_entry("b.jpg").await.unwrap();
        writer.write_data(b"123456").await.unwrap();
        writer.finish_entry().await.unwrap();
        writer.finish(Some(declared)).await.unwrap();

        assert_eq!(out.len() as u64, declared);
        let entries = read_entries(&out);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b.jpg");
        assert_eq!(entries[0].data, b"123456");
    }

    #[tokio::test]
    async fn should_refuse_to_shrink_below_content() {
        let mut out = Vec::new();
        let mut writer = ZipWriter::new(&mut out);
        writer.start_entry("a.jpg").await.unwrap();
        writer.write_data(&[0u8; 100]).await.unwrap();
        writer.finish_entry().await.unwrap();

        let err = writer.finish(Some(50)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn should_reject_nested_entries() {
        let mut out = Vec::new();
        let mut writer = ZipWriter::new(&mut out);
        writer.start_entry("a").await.unwrap();
        assert!(writer.start_entry("b").await.is_err());
    }

    #[test]
    fn should_encode_dos_time() {
        let time = NaiveDateTime::parse_from_str("2024-06-15 13:45:30", "%Y-%m-%d %H:%M:%S").unwrap();
        let (dos_time, dos_date) = dos_date_time(time);
        assert_eq!(dos_time, (13 << 11) | (45 << 5) | 15);
        assert_eq!(dos_date, ((2024 - 1980) << 9) | (6 << 5) | 15);
    }

    #[test]
    fn should_check_store_mode_limits() {
        assert!(fits_store_mode(MAX_ARCHIVE_LEN, MAX_ENTRIES));
        assert!(!fits_store_mode(MAX_ARCHIVE_LEN + 1, 1));
        assert!(!fits_store_mode(10, MAX_ENTRIES + 1));
    }

    #[test]
    fn should_saturate_absurd_sizes() {
        let objects = vec![object(1, "a.jpg", u64::MAX), object(2, "b.jpg", u64::MAX)];
        assert_eq!(archive_len(&objects), u64::MAX);
        assert!(!fits_store_mode(archive_len(&objects), objects.len()));
    }

    #[test]
    fn should_limit_entry_name_length() {
        assert!(name_fits(&"a".repeat(MAX_NAME_LEN)));
        assert!(!name_fits(&"a".repeat(MAX_NAME_LEN + 1)));
    }
}
