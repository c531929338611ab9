//! Single-entry zip containers
//!
//! Every file Strata writes (data files and hourly indexes) is a zip archive
//! holding exactly one deflated entry, named as the file minus `.zip`.
//!
//! Strategy:
//! 1. Data files are written incrementally, one JSON line at a time
//! 2. Entry timestamps are pinned so identical content yields identical bytes
//! 3. Readers stream the entry line by line instead of inflating it whole

use crate::model::naming::entry_name;
use crate::store::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{BufRead, BufReader, Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
}

/// Incremental writer for a single-entry zip held in memory
pub struct ZipEntryWriter {
    writer: ZipWriter<Cursor<Vec<u8>>>,
    bytes_written: u64,
}

impl ZipEntryWriter {
    /// Open a container for `file_name`; the entry is named accordingly
    pub fn create(file_name: &str) -> CodecResult<Self> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file(entry_name(file_name), entry_options())?;
        Ok(Self {
            writer,
            bytes_written: 0,
        })
    }

    /// Append one line (a trailing newline is added)
    pub fn write_line(&mut self, line: &str) -> CodecResult<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.bytes_written += line.len() as u64 + 1;
        Ok(())
    }

    /// Uncompressed bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Close the entry and return the archive bytes
    pub fn finish(self) -> CodecResult<Vec<u8>> {
        let cursor = self.writer.finish()?;
        Ok(cursor.into_inner())
    }
}

/// Compress `payload` into a single-entry container for `file_name`
pub fn compress_single_entry(file_name: &str, payload: &[u8]) -> CodecResult<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file(entry_name(file_name), entry_options())?;
    writer.write_all(payload)?;
    Ok(writer.finish()?.into_inner())
}

/// Inflate the single entry of a container
pub fn decompress_single_entry(data: &[u8]) -> CodecResult<Vec<u8>> {
    let mut archive = open_archive(data)?;
    let mut entry = archive.by_index(0)?;
    let mut payload = Vec::new();
    entry.read_to_end(&mut payload)?;
    Ok(payload)
}

/// Serialize `value` as JSON into a single-entry container
pub fn encode_json<T: Serialize>(file_name: &str, value: &T) -> CodecResult<Vec<u8>> {
    let payload = serde_json::to_vec(value)?;
    compress_single_entry(file_name, &payload)
}

/// Decode a JSON value from a single-entry container
pub fn decode_json<T: DeserializeOwned>(data: &[u8]) -> CodecResult<T> {
    let payload = decompress_single_entry(data)?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Statistics from a line scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineScanStats {
    /// Lines seen (including unreadable ones)
    pub lines: u64,
    /// Lines that were not valid UTF-8
    pub invalid_utf8: u64,
}

/// Stream the entry of a container line by line.
///
/// `on_line` receives the 0-based line number and the line without its
/// terminator. Lines that are not valid UTF-8 are skipped but still consume
/// a line number, so positions always match physical lines.
pub fn scan_lines<F>(data: &[u8], mut on_line: F) -> CodecResult<LineScanStats>
where
    F: FnMut(u64, &str),
{
    let mut archive = open_archive(data)?;
    let entry = archive.by_index(0)?;
    let mut reader = BufReader::new(entry);
    let mut buf = Vec::new();
    let mut stats = LineScanStats::default();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line_number = stats.lines;
        stats.lines += 1;

        let line = match std::str::from_utf8(&buf) {
            Ok(s) => s.trim_end_matches(&['\n', '\r'][..]),
            Err(_) => {
                stats.invalid_utf8 += 1;
                continue;
            }
        };
        on_line(line_number, line);
    }

    Ok(stats)
}

fn open_archive(data: &[u8]) -> CodecResult<ZipArchive<Cursor<&[u8]>>> {
    let archive = ZipArchive::new(Cursor::new(data))?;
    if archive.len() != 1 {
        return Err(CodecError::EntryCount(archive.len()));
    }
    Ok(archive)
}
