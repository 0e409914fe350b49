/*
Binary file format for commits.idx V1

┌─────────────────────────────────────┐
 │ Header (32 bytes)                   │
 ├─────────────────────────────────────┤
 │ Record 1                            │
 │ Record 2                            │
 │ ...                                 │
 │ Record N                            │
 └─────────────────────────────────────┘

Record: [len: u32 LE][tag: u8][payload: len - 1 bytes][checksum: 8 bytes]
The checksum is the first 8 bytes of SHA-256(tag + payload).
The file is append-only: records are never rewritten in place.
*/

use crate::commit::CommitIndex;
use crate::hash::Hash;
use crate::refs::RefKind;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::str::Utf8Error;

pub const MAGIC: [u8; 4] = *b"VLOG";
pub const VERSION: u32 = 1;
pub const CHECKSUM_SIZE: usize = 8;
pub const LEN_SIZE: usize = 4;

const TAG_COMMIT: u8 = 1;
const TAG_REF: u8 = 2;

// tag + index + empty root + empty hash
const MIN_BODY_LEN: usize = 1 + 4 + 2 + 2;
// tag + index + three u16-prefixed fields + ref kind
const MAX_BODY_LEN: usize = 1 + 4 + 3 * (2 + u16::MAX as usize) + 1;

#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 4],
    pub version: u32,
    pub created_at: u64,
    pub reserved: [u8; 16],
}

impl Header {
    pub const HEADER_SIZE: usize = 32;

    pub fn new() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            magic: MAGIC,
            version: VERSION,
            created_at: now,
            reserved: [0; 16],
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::HEADER_SIZE] {
        let mut buf = [0u8; Self::HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.created_at.to_le_bytes());
        buf[16..32].copy_from_slice(&self.reserved);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(FormatError::InvalidHeader("Too short".into()));
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if magic != MAGIC {
            return Err(FormatError::InvalidMagic(magic));
        }

        let version = read_u32(bytes, 4)?;
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let created_at = read_u64(bytes, 8)?;
        let mut reserved = [0u8; 16];
        reserved.copy_from_slice(&bytes[16..32]);

        Ok(Self {
            magic,
            version,
            created_at,
            reserved,
        })
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

/// One durable mapping entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Commit {
        index: CommitIndex,
        root: PathBuf,
        hash: Hash,
    },
    Ref {
        index: u32,
        root: PathBuf,
        hash: Hash,
        name: String,
        kind: RefKind,
    },
}

impl Record {
    /// Serialize to the framed on-disk representation
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let mut body = Vec::new();

        match self {
            Record::Commit { index, root, hash } => {
                body.push(TAG_COMMIT);
                body.extend_from_slice(&index.to_le_bytes());
                write_bytes(&mut body, root.to_string_lossy().as_bytes())?;
                write_bytes(&mut body, hash.as_bytes())?;
            }
            Record::Ref {
                index,
                root,
                hash,
                name,
                kind,
            } => {
                body.push(TAG_REF);
                body.extend_from_slice(&index.to_le_bytes());
                write_bytes(&mut body, root.to_string_lossy().as_bytes())?;
                write_bytes(&mut body, hash.as_bytes())?;
                write_bytes(&mut body, name.as_bytes())?;
                body.push(kind.as_byte());
            }
        }

        let mut framed = Vec::with_capacity(LEN_SIZE + body.len() + CHECKSUM_SIZE);
        framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
        framed.extend_from_slice(&body);
        framed.extend_from_slice(&checksum(&body));
        Ok(framed)
    }

    /// Decode one record from the start of `bytes`.
    /// Returns the record and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), FormatError> {
        if bytes.len() < LEN_SIZE {
            return Err(FormatError::Truncated);
        }
        let len = read_u32(bytes, 0)? as usize;
        if !(MIN_BODY_LEN..=MAX_BODY_LEN).contains(&len) {
            return Err(FormatError::InvalidRecord(format!("record length {len}")));
        }
        // only a record running past the end of `bytes` is truncated
        let total = LEN_SIZE + len + CHECKSUM_SIZE;
        if bytes.len() < total {
            return Err(FormatError::Truncated);
        }

        let body = &bytes[LEN_SIZE..LEN_SIZE + len];
        let stored = &bytes[LEN_SIZE + len..total];
        if stored != checksum(body) {
            return Err(FormatError::ChecksumMismatch);
        }

        let tag = body[0];
        let mut offset = 1;
        let index = read_u32(body, offset)
            .map_err(|_| FormatError::InvalidRecord("missing index".into()))?;
        offset += 4;
        let root = PathBuf::from(read_str(body, &mut offset)?);
        let hash = Hash::from_bytes(read_bytes(body, &mut offset)?);

        let record = match tag {
            TAG_COMMIT => Record::Commit { index, root, hash },
            TAG_REF => {
                let name = read_str(body, &mut offset)?.to_string();
                let kind_byte = *body
                    .get(offset)
                    .ok_or_else(|| FormatError::InvalidRecord("missing ref kind".into()))?;
                let kind = RefKind::from_byte(kind_byte)
                    .ok_or_else(|| FormatError::InvalidRecord(format!("ref kind {kind_byte}")))?;
                Record::Ref {
                    index,
                    root,
                    hash,
                    name,
                    kind,
                }
            }
            other => return Err(FormatError::InvalidRecord(format!("unknown tag {other}"))),
        };

        Ok((record, total))
    }
}

fn checksum(body: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let digest = Sha256::digest(body);
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&digest[..CHECKSUM_SIZE]);
    out
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), FormatError> {
    let len = u16::try_from(bytes.len()).map_err(|_| FormatError::FieldTooLong(bytes.len()))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_bytes<'a>(bytes: &'a [u8], offset: &mut usize) -> Result<&'a [u8], FormatError> {
    let len_bytes = bytes
        .get(*offset..*offset + 2)
        .ok_or_else(|| FormatError::InvalidRecord("missing field length".into()))?;
    let len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
    *offset += 2;

    let field = bytes
        .get(*offset..*offset + len)
        .ok_or_else(|| FormatError::InvalidRecord("field overruns record".into()))?;
    *offset += len;
    Ok(field)
}

fn read_str<'a>(bytes: &'a [u8], offset: &mut usize) -> Result<&'a str, FormatError> {
    std::str::from_utf8(read_bytes(bytes, offset)?).map_err(FormatError::InvalidEncoding)
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, FormatError> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(FormatError::Truncated)
}

fn read_u64(bytes: &[u8], offset: usize) -> Result<u64, FormatError> {
    let slice = bytes.get(offset..offset + 8).ok_or(FormatError::Truncated)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(slice);
    Ok(u64::from_le_bytes(buf))
}

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("Invalid magic bytes: {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Record truncated")]
    Truncated,

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Field too long for record: {0} bytes")]
    FieldTooLong(usize),

    #[error("Invalid UTF-8 in record: {0}")]
    InvalidEncoding(Utf8Error),

    #[error("Index {index} mapped twice to different entries")]
    ConflictingIndex { index: u32 },

    #[error("Index {index} leaves no room for further allocations")]
    IndexOverflow { index: u32 },
}
