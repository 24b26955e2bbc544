//! Key-value settings blob.
//!
//! On-disk layout, little-endian:
//!   total_size: u32            (byte length of the entry region)
//!   entries:    { key_size: u32, key_bytes, type: u8,
//!                 value_size: u32, value_bytes }*

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::warn;

const TYPE_BYTES: u8 = 0;
const TYPE_BOOL: u8 = 1;
const TYPE_U64: u8 = 2;
const TYPE_STRING: u8 = 3;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("settings io: {0}")]
    Io(#[from] io::Error),
    #[error("settings blob truncated")]
    Truncated,
    #[error("settings blob size mismatch (declared {declared}, actual {actual})")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("settings value has wrong size for type {ty}")]
    BadValue { ty: u8 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Value {
    Bytes(Vec<u8>),
    Bool(bool),
    U64(u64),
    String(String),
}

impl Value {
    fn type_tag(&self) -> u8 {
        match self {
            Value::Bytes(_) => TYPE_BYTES,
            Value::Bool(_) => TYPE_BOOL,
            Value::U64(_) => TYPE_U64,
            Value::String(_) => TYPE_STRING,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Bytes(b) => b.clone(),
            Value::Bool(b) => vec![*b as u8],
            Value::U64(v) => v.to_le_bytes().to_vec(),
            Value::String(s) => s.as_bytes().to_vec(),
        }
    }

    fn from_bytes(ty: u8, bytes: &[u8]) -> Result<Self, SettingsError> {
        match ty {
            TYPE_BOOL => match bytes {
                [b] => Ok(Value::Bool(*b != 0)),
                _ => Err(SettingsError::BadValue { ty }),
            },
            TYPE_U64 => {
                let arr: [u8; 8] = bytes.try_into().map_err(|_| SettingsError::BadValue { ty })?;
                Ok(Value::U64(u64::from_le_bytes(arr)))
            }
            TYPE_STRING => String::from_utf8(bytes.to_vec())
                .map(Value::String)
                .map_err(|_| SettingsError::BadValue { ty }),
            // Unknown tags round-trip as raw bytes so newer blobs stay loadable.
            _ => Ok(Value::Bytes(bytes.to_vec())),
        }
    }
}

/// Read access used by consumers that only care about a few keys.
pub trait SettingsProvider: Send + Sync {
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn get_u64(&self, key: &str) -> Option<u64>;
    fn get_bytes(&self, key: &str) -> Option<Vec<u8>>;
}

/// File-backed settings store. A missing file yields an empty store; a
/// corrupt one is rejected.
pub struct SettingsStore {
    path: PathBuf,
    entries: BTreeMap<String, Value>,
    dirty: bool,
}

impl SettingsStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_owned();
        let entries = match std::fs::read(&path) {
            Ok(blob) => Self::parse(&blob)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries, dirty: false })
    }

    fn parse(blob: &[u8]) -> Result<BTreeMap<String, Value>, SettingsError> {
        fn take<'a>(
            region: &'a [u8],
            off: &mut usize,
            n: usize,
        ) -> Result<&'a [u8], SettingsError> {
            let end = off.checked_add(n).ok_or(SettingsError::Truncated)?;
            let s = region.get(*off..end).ok_or(SettingsError::Truncated)?;
            *off = end;
            Ok(s)
        }

        let mut entries = BTreeMap::new();
        if blob.len() < 4 {
            return Err(SettingsError::Truncated);
        }
        let declared = u32::from_le_bytes(blob[..4].try_into().unwrap()) as usize;
        let region = &blob[4..];
        if declared != region.len() {
            return Err(SettingsError::SizeMismatch { declared, actual: region.len() });
        }

        let mut off = 0usize;
        while off < region.len() {
            let key_size =
                u32::from_le_bytes(take(region, &mut off, 4)?.try_into().unwrap()) as usize;
            let key = String::from_utf8(take(region, &mut off, key_size)?.to_vec())
                .map_err(|_| SettingsError::BadValue { ty: TYPE_STRING })?;
            let ty = take(region, &mut off, 1)?[0];
            let value_size =
                u32::from_le_bytes(take(region, &mut off, 4)?.try_into().unwrap()) as usize;
            let value = Value::from_bytes(ty, take(region, &mut off, value_size)?)?;
            entries.insert(key, value);
        }
        Ok(entries)
    }

    fn serialize(&self) -> Vec<u8> {
        let mut region = Vec::new();
        for (key, value) in &self.entries {
            region.extend_from_slice(&(key.len() as u32).to_le_bytes());
            region.extend_from_slice(key.as_bytes());
            region.push(value.type_tag());
            let bytes = value.to_bytes();
            region.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            region.extend_from_slice(&bytes);
        }
        let mut blob = Vec::with_capacity(4 + region.len());
        blob.extend_from_slice(&(region.len() as u32).to_le_bytes());
        blob.extend_from_slice(&region);
        blob
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.entries.insert(key.to_owned(), Value::Bool(value));
        self.dirty = true;
    }

    pub fn set_u64(&mut self, key: &str, value: u64) {
        self.entries.insert(key.to_owned(), Value::U64(value));
        self.dirty = true;
    }

    pub fn set_bytes(&mut self, key: &str, value: &[u8]) {
        self.entries.insert(key.to_owned(), Value::Bytes(value.to_vec()));
        self.dirty = true;
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_owned(), Value::String(value.to_owned()));
        self.dirty = true;
    }

    /// Writes the blob back out if anything changed since load.
    pub fn flush(&mut self) -> Result<(), SettingsError> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, self.serialize())?;
        self.dirty = false;
        Ok(())
    }
}

impl Drop for SettingsStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("couldn't persist settings on drop: {e}");
        }
    }
}

impl SettingsProvider for SettingsStore {
    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.entries.get(key)? {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        match self.entries.get(key)? {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).map(Value::to_bytes)
    }
}
