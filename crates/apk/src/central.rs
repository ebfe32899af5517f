//! Zip central directory reader.
//!
//! Devices report their installed APKs as raw central directory dumps rather
//! than whole archives, so the reader works on the central directory bytes
//! alone. Only the two fields needed for diffing are kept: the entry name and
//! its CRC32.

use exn::{ErrorExt, OptionExt, ResultExt};
use std::collections::HashMap;
use std::path::Path;
use tracing::instrument;

use crate::error::{ErrorKind, Result};

/// Signature at the start of every central directory file header.
pub const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0201_4b50;
/// Signature of the end of central directory record.
pub const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;

const END_OF_CENTRAL_DIRECTORY_SIZE: usize = 22;
const MAX_COMMENT_SIZE: usize = u16::MAX as usize;

/// Mapping of entry name to CRC32.
pub type CentralDirectory = HashMap<String, u32>;

/// Reads a central directory dump from disk and parses it.
pub fn read_central_directory(path: impl AsRef<Path>) -> Result<CentralDirectory> {
    let path = path.as_ref();
    let bytes = read_file(path)?;
    parse_central_directory(&bytes)
}

/// Parses the central directory records in `bytes`.
///
/// Records are read back to back until one does not start with
/// [`CENTRAL_DIRECTORY_SIGNATURE`]; anything after that point (the end of
/// central directory record, or trailing garbage) is ignored. A record that is
/// cut short is an error.
///
/// ```
/// use apkswap_apk::parse_central_directory;
///
/// assert!(parse_central_directory(&[]).unwrap().is_empty());
/// ```
pub fn parse_central_directory(bytes: &[u8]) -> Result<CentralDirectory> {
    let mut reader = Reader { bytes, offset: 0 };
    let mut entries = CentralDirectory::new();
    while reader.remaining() >= 4 && reader.peek_u32() == Some(CENTRAL_DIRECTORY_SIGNATURE) {
        let start = reader.offset;
        let record = reader
            .record()
            .ok_or_raise(|| ErrorKind::Malformed(format!("truncated record at offset {start}")))?;
        entries.insert(record.0, record.1);
    }
    tracing::trace!(entries = entries.len(), bytes = bytes.len(), "Parsed central directory");
    Ok(entries)
}

/// Returns the central directory slice of a complete zip archive.
///
/// The end of central directory record is searched for backwards from the
/// end of the archive, allowing for a trailing comment of up to 64KiB.
#[instrument(level = "trace", skip(archive), fields(archive_size = archive.len()))]
pub fn locate_central_directory(archive: &[u8]) -> Result<&[u8]> {
    if archive.len() < END_OF_CENTRAL_DIRECTORY_SIZE {
        exn::bail!(ErrorKind::Malformed("archive too small".into()));
    }
    let last = archive.len() - END_OF_CENTRAL_DIRECTORY_SIZE;
    let first = last.saturating_sub(MAX_COMMENT_SIZE);
    let eocd = (first..=last)
        .rev()
        .find(|&offset| read_u32(archive, offset) == Some(END_OF_CENTRAL_DIRECTORY_SIGNATURE))
        .ok_or_raise(|| ErrorKind::Malformed("end of central directory not found".into()))?;

    let size = read_u32(archive, eocd + 12).ok_or_raise(|| ErrorKind::Malformed("eocd".into()))?;
    let offset = read_u32(archive, eocd + 16).ok_or_raise(|| ErrorKind::Malformed("eocd".into()))?;
    if size == u32::MAX || offset == u32::MAX {
        exn::bail!(ErrorKind::Malformed("zip64 archives are not supported".into()));
    }
    let start = usize::try_from(offset).or_raise(|| ErrorKind::Malformed("offset".into()))?;
    let end = start
        .checked_add(usize::try_from(size).or_raise(|| ErrorKind::Malformed("size".into()))?)
        .filter(|&end| end <= eocd)
        .ok_or_raise(|| ErrorKind::Malformed(format!("central directory {start}+{size} overlaps eocd")))?;
    Ok(&archive[start..end])
}

pub(crate) fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            _ => ErrorKind::Io(path.to_path_buf()),
        };
        e.raise().raise(kind)
    })
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.offset)
    }

    fn peek_u32(&self) -> Option<u32> {
        read_u32(self.bytes, self.offset)
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.offset.checked_add(len)?;
        let slice = self.bytes.get(self.offset..end)?;
        self.offset = end;
        Some(slice)
    }

    fn skip(&mut self, len: usize) -> Option<()> {
        self.take(len).map(|_| ())
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// One central directory file header, positioned on its signature.
    fn record(&mut self) -> Option<(String, u32)> {
        // signature, then version made by, version needed, flags, compression, time and date
        self.skip(4)?;
        self.skip(12)?;
        let crc = self.u32()?;
        // compressed and uncompressed sizes
        self.skip(8)?;
        let name_length = usize::from(self.u16()?);
        let extra_length = usize::from(self.u16()?);
        let comment_length = usize::from(self.u16()?);
        // disk number, internal and external attributes, local header offset
        self.skip(12)?;
        let name = String::from_utf8_lossy(self.take(name_length)?).into_owned();
        self.skip(extra_length + comment_length)?;
        Some((name, crc))
    }
}
