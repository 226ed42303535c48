//! Log record types and their on-disk encoding.
//!
//! File layout (all integers big-endian):
//!
//! ```text
//! [0..8)  i64  offset of the latest CHECKPOINT record, or -1
//! then records:
//!   i32 type | i64 transaction id | payload | i64 offset where this record began
//! UPDATE payload:     before image, after image
//! CHECKPOINT payload: i32 count, then count x (i64 transaction id, i64 first record offset)
//! page image:         i32 page kind | i32 page id kind | i32 n | n x i32 | i32 len | len bytes
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, PageImage, PageKind};
use crate::transaction::TransactionId;

pub const NO_CHECKPOINT: i64 = -1;
pub const HEADER_SIZE: u64 = 8;

/// Transaction id field written into CHECKPOINT records.
const CHECKPOINT_TXN: i64 = -1;

/// Page id layouts known to the codec.
const PAGE_ID_KIND_TABLE_PAGE: i32 = 1;

/// Upper bound on a serialized page when the page size is not known.
const MAX_PAGE_BYTES: i32 = 64 * 1024 * 1024;

/// Bytes per CHECKPOINT entry: transaction id and first record offset.
const CHECKPOINT_ENTRY_SIZE: u64 = 16;
const TRAILER_SIZE: u64 = 8;

/// What a record starting inside the log may legally declare.
///
/// A length field that points past `end` can only be honest in the last
/// record of the file; everything else checked here is corruption wherever
/// it appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordBounds {
    /// Offset one past the last byte of the log.
    pub end: u64,
    /// Exact length of every page image, when the caller knows it.
    pub page_size: Option<usize>,
}

impl RecordBounds {
    pub fn new(end: u64) -> Self {
        Self {
            end,
            page_size: None,
        }
    }

    pub fn with_page_size(self, page_size: usize) -> Self {
        Self {
            page_size: Some(page_size),
            ..self
        }
    }
}

/// Log record type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Abort = 1,
    Commit = 2,
    Update = 3,
    Begin = 4,
    Checkpoint = 5,
}

impl RecordType {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Abort),
            2 => Some(Self::Commit),
            3 => Some(Self::Update),
            4 => Some(Self::Begin),
            5 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Begin {
        txn: TransactionId,
    },
    Commit {
        txn: TransactionId,
    },
    Abort {
        txn: TransactionId,
    },
    Update {
        txn: TransactionId,
        before: PageImage,
        after: PageImage,
    },
    /// Transactions active when the checkpoint was taken, with the offset of
    /// each one's first record.
    Checkpoint {
        active: Vec<(TransactionId, u64)>,
    },
}

impl LogRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            LogRecord::Begin { .. } => RecordType::Begin,
            LogRecord::Commit { .. } => RecordType::Commit,
            LogRecord::Abort { .. } => RecordType::Abort,
            LogRecord::Update { .. } => RecordType::Update,
            LogRecord::Checkpoint { .. } => RecordType::Checkpoint,
        }
    }

    pub fn txn(&self) -> Option<TransactionId> {
        match self {
            LogRecord::Begin { txn }
            | LogRecord::Commit { txn }
            | LogRecord::Abort { txn }
            | LogRecord::Update { txn, .. } => Some(*txn),
            LogRecord::Checkpoint { .. } => None,
        }
    }

    /// Serializes the record as it appears at file offset `start`.
    pub fn encode(&self, start: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writes into a Vec cannot fail.
        let _ = self.encode_into(&mut buf, start);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>, start: u64) -> io::Result<()> {
        buf.write_i32::<BigEndian>(self.record_type() as i32)?;
        let txn = self.txn().map(|t| t.value() as i64).unwrap_or(CHECKPOINT_TXN);
        buf.write_i64::<BigEndian>(txn)?;

        match self {
            LogRecord::Update { before, after, .. } => {
                write_page_image(buf, before)?;
                write_page_image(buf, after)?;
            }
            LogRecord::Checkpoint { active } => {
                buf.write_i32::<BigEndian>(active.len() as i32)?;
                for (txn, first) in active {
                    buf.write_i64::<BigEndian>(txn.value() as i64)?;
                    buf.write_i64::<BigEndian>(*first as i64)?;
                }
            }
            _ => {}
        }

        buf.write_i64::<BigEndian>(start as i64)?;
        Ok(())
    }

    /// Decodes one record expected to start at `start`.
    ///
    /// Returns `Ok(None)` at a clean end of file, [`StorageError::TornRecord`]
    /// if the file ends inside the record, and [`StorageError::CorruptLog`]
    /// for anything that is not a well-formed record, including a length
    /// field that `bounds` rules out. On success the second element is the
    /// encoded length.
    pub fn decode<R: Read>(
        reader: &mut R,
        start: u64,
        bounds: RecordBounds,
    ) -> StorageResult<Option<(LogRecord, u64)>> {
        let mut reader = CountingReader::new(reader);

        let code = match reader.read_i32::<BigEndian>() {
            Ok(code) => code,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && reader.count == 0 => {
                return Ok(None)
            }
            Err(e) => return Err(map_read_error(e, start)),
        };
        let record_type = RecordType::from_code(code)
            .ok_or_else(|| corrupt(start, format!("unknown record type {code}")))?;
        let txn = TransactionId::new(read_i64(&mut reader, start)? as u64);

        let record = match record_type {
            RecordType::Begin => LogRecord::Begin { txn },
            RecordType::Commit => LogRecord::Commit { txn },
            RecordType::Abort => LogRecord::Abort { txn },
            RecordType::Update => LogRecord::Update {
                txn,
                before: read_page_image(&mut reader, start, bounds)?,
                after: read_page_image(&mut reader, start, bounds)?,
            },
            RecordType::Checkpoint => {
                let count = read_i32(&mut reader, start)?;
                if count < 0 {
                    return Err(corrupt(start, format!("negative checkpoint count {count}")));
                }
                let remaining = bounds.end.saturating_sub(start + reader.count);
                if count as u64 * CHECKPOINT_ENTRY_SIZE + TRAILER_SIZE > remaining {
                    return Err(corrupt(
                        start,
                        format!("checkpoint count {count} overruns the log ({remaining} byte(s) left)"),
                    ));
                }
                let mut active = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let txn = read_i64(&mut reader, start)?;
                    let first = read_i64(&mut reader, start)?;
                    active.push((TransactionId::new(txn as u64), first as u64));
                }
                LogRecord::Checkpoint { active }
            }
        };

        let trailer = read_i64(&mut reader, start)?;
        if trailer != start as i64 {
            return Err(corrupt(
                start,
                format!("trailer offset {trailer} does not match record start"),
            ));
        }

        Ok(Some((record, reader.count)))
    }
}

fn write_page_image(buf: &mut Vec<u8>, image: &PageImage) -> io::Result<()> {
    buf.write_i32::<BigEndian>(image.kind.tag())?;
    buf.write_i32::<BigEndian>(PAGE_ID_KIND_TABLE_PAGE)?;
    buf.write_i32::<BigEndian>(2)?;
    buf.write_i32::<BigEndian>(image.id.table_id as i32)?;
    buf.write_i32::<BigEndian>(image.id.page_number as i32)?;
    buf.write_i32::<BigEndian>(image.data.len() as i32)?;
    buf.extend_from_slice(&image.data);
    Ok(())
}

fn read_page_image<R: Read>(
    reader: &mut R,
    start: u64,
    bounds: RecordBounds,
) -> StorageResult<PageImage> {
    let kind_tag = read_i32(reader, start)?;
    let kind = PageKind::from_tag(kind_tag)
        .ok_or_else(|| corrupt(start, format!("unknown page kind {kind_tag}")))?;
    let id_kind = read_i32(reader, start)?;
    if id_kind != PAGE_ID_KIND_TABLE_PAGE {
        return Err(corrupt(start, format!("unknown page id kind {id_kind}")));
    }
    let components = read_i32(reader, start)?;
    if components != 2 {
        return Err(corrupt(
            start,
            format!("page id has {components} components, expected 2"),
        ));
    }
    let table_id = read_i32(reader, start)? as u32;
    let page_number = read_i32(reader, start)? as u32;

    let len = read_i32(reader, start)?;
    match bounds.page_size {
        Some(size) if len as i64 != size as i64 => {
            return Err(corrupt(
                start,
                format!("page image of {len} byte(s), pages are {size}"),
            ));
        }
        _ if !(0..=MAX_PAGE_BYTES).contains(&len) => {
            return Err(corrupt(start, format!("implausible page length {len}")));
        }
        _ => {}
    }
    let mut data = vec![0u8; len as usize];
    reader
        .read_exact(&mut data)
        .map_err(|e| map_read_error(e, start))?;

    Ok(PageImage {
        id: PageId::new(table_id, page_number),
        kind,
        data,
    })
}

fn read_i32<R: Read>(reader: &mut R, start: u64) -> StorageResult<i32> {
    reader
        .read_i32::<BigEndian>()
        .map_err(|e| map_read_error(e, start))
}

fn read_i64<R: Read>(reader: &mut R, start: u64) -> StorageResult<i64> {
    reader
        .read_i64::<BigEndian>()
        .map_err(|e| map_read_error(e, start))
}

fn corrupt(offset: u64, reason: String) -> StorageError {
    StorageError::CorruptLog { offset, reason }
}

fn map_read_error(e: io::Error, start: u64) -> StorageError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        StorageError::TornRecord { offset: start }
    } else {
        StorageError::Io(e)
    }
}

/// Counts bytes consumed so the caller knows where the next record starts.
struct CountingReader<'a, R> {
    inner: &'a mut R,
    count: u64,
}

impl<'a, R: Read> CountingReader<'a, R> {
    fn new(inner: &'a mut R) -> Self {
        Self { inner, count: 0 }
    }
}

impl<R: Read> Read for CountingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}
