//! GGUF header probe.
//!
//! Reads the fixed header and the scalar/string metadata of a `.gguf` file
//! without llama.cpp, so that obviously unusable files are rejected before
//! an engine spends memory on them. Array values (tokenizer vocabularies
//! and the like) are skipped, not materialised.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Oldest and newest container versions understood here. Version 1 used
/// 32-bit counts and is long obsolete.
const MIN_VERSION: u32 = 2;
const MAX_VERSION: u32 = 3;

/// Metadata beyond this offset is not inspected.
const SCAN_WINDOW: u64 = 8 * 1024 * 1024;

/// Upper bound for a single metadata string (chat templates run to tens of
/// KiB; anything near this is corrupt).
const MAX_STRING_LEN: u64 = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("not a GGUF file (magic {0:02X?})")]
    NotGguf([u8; 4]),

    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid value type {tag} for key '{key}'")]
    InvalidValueType { key: String, tag: u32 },

    #[error("file ends inside the GGUF header")]
    Truncated,

    #[error("metadata string of {len} bytes at key '{key}' is implausibly large")]
    Oversized { key: String, len: u64 },
}

/// What the probe learned about a model file.
#[derive(Debug, Clone, Serialize)]
pub struct ModelProbe {
    pub path: PathBuf,
    pub file_size: u64,
    pub version: u32,
    pub tensor_count: u64,
    pub kv_count: u64,
    /// Scalar and string metadata, values rendered as text.
    pub metadata: BTreeMap<String, String>,
}

impl ModelProbe {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn architecture(&self) -> Option<&str> {
        self.get("general.architecture")
    }

    pub fn name(&self) -> Option<&str> {
        self.get("general.name")
    }

    pub fn file_type(&self) -> Option<u32> {
        self.get("general.file_type")?.parse().ok()
    }

    pub fn context_length(&self) -> Option<u32> {
        let arch = self.architecture()?;
        self.get(&format!("{arch}.context_length"))?.parse().ok()
    }

    pub fn chat_template(&self) -> Option<&str> {
        self.get("tokenizer.chat_template")
    }
}

/// Probe `path`.
pub fn probe(path: &Path) -> Result<ModelProbe, ProbeError> {
    let file = File::open(path)?;
    let file_size = file.metadata()?.len();
    let mut r = BufReader::new(file);

    let mut magic = [0u8; 4];
    read_exact(&mut r, &mut magic)?;
    if magic != GGUF_MAGIC {
        return Err(ProbeError::NotGguf(magic));
    }

    let version = read_u32(&mut r)?;
    if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
        return Err(ProbeError::UnsupportedVersion(version));
    }
    let tensor_count = read_u64(&mut r)?;
    let kv_count = read_u64(&mut r)?;

    let mut metadata = BTreeMap::new();
    for _ in 0..kv_count {
        if r.stream_position()? >= SCAN_WINDOW.min(file_size) {
            break;
        }
        match read_entry(&mut r) {
            Ok(Some((key, value))) => {
                metadata.insert(key, value);
            }
            Ok(None) => {}
            // A file cut short after the header still tells us enough.
            Err(ProbeError::Truncated) => break,
            Err(e) => return Err(e),
        }
    }

    debug!(
        path = %path.display(),
        version,
        tensor_count,
        keys = metadata.len(),
        "GGUF probe complete"
    );

    Ok(ModelProbe {
        path: path.to_path_buf(),
        file_size,
        version,
        tensor_count,
        kv_count,
        metadata,
    })
}

//  Value types

const TYPE_STRING: u32 = 8;
const TYPE_ARRAY: u32 = 9;

/// Encoded width of the fixed-size value types, indexed by type tag.
fn fixed_width(tag: u32) -> Option<u64> {
    match tag {
        0 | 1 | 7 => Some(1),
        2 | 3 => Some(2),
        4..=6 => Some(4),
        10..=12 => Some(8),
        _ => None,
    }
}

/// Read one key/value pair. Arrays are skipped and yield `None`.
fn read_entry<R: Read + Seek>(r: &mut R) -> Result<Option<(String, String)>, ProbeError> {
    let key = read_string(r, "<key>")?;
    let tag = read_u32(r)?;
    match tag {
        TYPE_STRING => Ok(Some((key.clone(), read_string(r, &key)?))),
        TYPE_ARRAY => {
            skip_array(r, &key)?;
            Ok(None)
        }
        _ => {
            let text = read_scalar(r, tag, &key)?;
            Ok(Some((key, text)))
        }
    }
}

fn read_scalar<R: Read>(r: &mut R, tag: u32, key: &str) -> Result<String, ProbeError> {
    let width = fixed_width(tag).ok_or_else(|| ProbeError::InvalidValueType {
        key: key.to_owned(),
        tag,
    })?;
    let mut b = [0u8; 8];
    read_exact(r, &mut b[..width as usize])?;
    let text = match tag {
        0 => b[0].to_string(),
        1 => (b[0] as i8).to_string(),
        2 => u16::from_le_bytes([b[0], b[1]]).to_string(),
        3 => i16::from_le_bytes([b[0], b[1]]).to_string(),
        4 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]).to_string(),
        5 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]).to_string(),
        6 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]).to_string(),
        7 => (b[0] != 0).to_string(),
        10 => u64::from_le_bytes(b).to_string(),
        11 => i64::from_le_bytes(b).to_string(),
        _ => f64::from_le_bytes(b).to_string(),
    };
    Ok(text)
}

fn skip_array<R: Read + Seek>(r: &mut R, key: &str) -> Result<(), ProbeError> {
    let elem = read_u32(r)?;
    let count = read_u64(r)?;
    match elem {
        TYPE_STRING => {
            for _ in 0..count {
                let len = read_u64(r)?;
                skip(r, len)?;
            }
        }
        TYPE_ARRAY => {
            for _ in 0..count {
                skip_array(r, key)?;
            }
        }
        _ => {
            let width = fixed_width(elem).ok_or_else(|| ProbeError::InvalidValueType {
                key: key.to_owned(),
                tag: elem,
            })?;
            skip(r, width.saturating_mul(count))?;
        }
    }
    Ok(())
}

//  Primitives

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), ProbeError> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ProbeError::Truncated,
        _ => ProbeError::Io(e),
    })
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, ProbeError> {
    let mut b = [0u8; 4];
    read_exact(r, &mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, ProbeError> {
    let mut b = [0u8; 8];
    read_exact(r, &mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn read_string<R: Read>(r: &mut R, key: &str) -> Result<String, ProbeError> {
    let len = read_u64(r)?;
    if len > MAX_STRING_LEN {
        return Err(ProbeError::Oversized {
            key: key.to_owned(),
            len,
        });
    }
    let mut buf = vec![0u8; len as usize];
    read_exact(r, &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn skip<R: Seek>(r: &mut R, n: u64) -> Result<(), ProbeError> {
    let offset = i64::try_from(n).map_err(|_| ProbeError::Truncated)?;
    r.seek_relative(offset)?;
    Ok(())
}
