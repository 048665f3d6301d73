use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::codec::{self, ByteReader};
use crate::error::{ModbError, Result};
use crate::index::IndexSpec;
use crate::value::{FieldKind, Record};

/// Container magic, "MODB".
pub const FILE_MAGIC: u32 = 0x4D4F_4442;
pub const FILE_VERSION: u32 = 1;
/// Per-collection payload magic, "MOCK".
pub const PAYLOAD_MAGIC: u32 = 0x4D4F_434B;
pub const PAYLOAD_VERSION: u32 = 1;

/// Fixed 64-byte container header: magic, version, collection count,
/// 52 reserved zero bytes.
pub const HEADER_LEN: usize = 64;
const PAYLOAD_HEADER_LEN: usize = 64;

pub const DEFAULT_PATH: &str = "./data/database.mdb";

/// Resolve the container path: default location when none is given, `.mdb`
/// appended when missing.
pub fn resolve_path(path: Option<&Path>) -> PathBuf {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => return PathBuf::from(DEFAULT_PATH),
    };
    if path.extension().map(|ext| ext == "mdb").unwrap_or(false) {
        path
    } else {
        PathBuf::from(format!("{}.mdb", path.display()))
    }
}

/// The persisted form of one collection: kind-only schema, index directory
/// and records, exactly what the codec frames into a payload.
#[derive(Debug)]
pub struct StoredCollection {
    pub kinds: BTreeMap<String, FieldKind>,
    pub indexes: Vec<IndexSpec>,
    pub records: Vec<Record>,
}

/// The single on-disk container holding every collection. Saving is always
/// a full rewrite: serialize into one buffer, write a temp file next to the
/// target, rename into place.
#[derive(Debug)]
pub struct Container {
    path: PathBuf,
    collections: BTreeMap<String, StoredCollection>,
}

impl Container {
    pub fn new(path: PathBuf) -> Self {
        Container {
            path,
            collections: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn names(&self) -> Vec<&str> {
        self.collections.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Option<&StoredCollection> {
        self.collections.get(name)
    }

    pub fn set_collection(&mut self, name: impl Into<String>, stored: StoredCollection) {
        self.collections.insert(name.into(), stored);
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Load the container from disk. An absent file yields an empty
    /// container; a malformed one is a `FormatError`.
    pub fn load(path: &Path) -> Result<Container> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::debug!("no database file at {}, starting empty", path.display());
                return Ok(Container::new(path.to_path_buf()));
            }
            Err(err) => return Err(err.into()),
        };
        Self::decode(path.to_path_buf(), &bytes)
    }

    fn decode(path: PathBuf, bytes: &[u8]) -> Result<Container> {
        let mut r = ByteReader::new(bytes);
        let magic = r.read_u32()?;
        if magic != FILE_MAGIC {
            return Err(ModbError::Format(format!(
                "bad container magic {magic:#010x}"
            )));
        }
        let version = r.read_u32()?;
        if version != FILE_VERSION {
            return Err(ModbError::Format(format!(
                "unsupported container format version {version}"
            )));
        }
        let count = r.read_u32()?;
        r.seek(HEADER_LEN)?;

        let mut directory = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = r.read_string()?;
            let offset = r.read_u64()? as usize;
            let length = r.read_u64()? as usize;
            directory.push((name, offset, length));
        }

        let mut last_offset = 0usize;
        let mut collections = BTreeMap::new();
        for (name, offset, length) in directory {
            if offset < last_offset {
                return Err(ModbError::Format(format!(
                    "payload offsets not monotonic at collection '{name}'"
                )));
            }
            last_offset = offset;
            let end = offset.checked_add(length).ok_or_else(|| {
                ModbError::Format(format!("payload bounds overflow for '{name}'"))
            })?;
            if end > bytes.len() {
                return Err(ModbError::Format(format!(
                    "payload for '{name}' runs past end of file"
                )));
            }
            let stored = Self::decode_payload(&bytes[offset..end])?;
            collections.insert(name, stored);
        }

        Ok(Container { path, collections })
    }

    fn decode_payload(bytes: &[u8]) -> Result<StoredCollection> {
        let mut r = ByteReader::new(bytes);
        let magic = r.read_u32()?;
        if magic != PAYLOAD_MAGIC {
            return Err(ModbError::Format(format!(
                "bad payload magic {magic:#010x}"
            )));
        }
        let version = r.read_u32()?;
        if version != PAYLOAD_VERSION {
            return Err(ModbError::Format(format!(
                "unsupported payload format version {version}"
            )));
        }
        let schema_offset = r.read_u64()? as usize;
        let index_offset = r.read_u64()? as usize;
        let data_offset = r.read_u64()? as usize;
        let record_count = r.read_u64()?;

        r.seek(schema_offset)?;
        let kinds = codec::decode_schema(&mut r)?;

        r.seek(index_offset)?;
        let indexes = codec::decode_index_directory(&mut r)?;

        r.seek(data_offset)?;
        let mut records = Vec::with_capacity(record_count as usize);
        for _ in 0..record_count {
            records.push(codec::decode_record(&mut r, &kinds)?);
        }

        Ok(StoredCollection {
            kinds,
            indexes,
            records,
        })
    }

    /// Serialize every collection and rewrite the file atomically, creating
    /// the containing directory on first write.
    pub fn save(&self) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent)?;
                parent
            }
            _ => Path::new("."),
        };

        let bytes = self.encode();
        let temp = tempfile::NamedTempFile::new_in(parent)?;
        fs::write(temp.path(), &bytes)?;
        temp.persist(&self.path).map_err(|err| {
            ModbError::Io(std::io::Error::new(
                ErrorKind::Other,
                format!("failed to persist database file: {err}"),
            ))
        })?;
        Ok(())
    }

    fn encode(&self) -> Vec<u8> {
        let payloads: Vec<(&String, Vec<u8>)> = self
            .collections
            .iter()
            .map(|(name, stored)| (name, Self::encode_payload(stored)))
            .collect();

        let directory_len: usize = payloads.iter().map(|(name, _)| 4 + name.len() + 16).sum();

        let mut out = Vec::new();
        codec::write_u32(&mut out, FILE_MAGIC);
        codec::write_u32(&mut out, FILE_VERSION);
        codec::write_u32(&mut out, payloads.len() as u32);
        out.resize(HEADER_LEN, 0);

        let mut offset = (HEADER_LEN + directory_len) as u64;
        for (name, payload) in &payloads {
            codec::write_string(&mut out, name);
            codec::write_u64(&mut out, offset);
            codec::write_u64(&mut out, payload.len() as u64);
            offset += payload.len() as u64;
        }
        for (_, payload) in payloads {
            out.extend_from_slice(&payload);
        }
        out
    }

    fn encode_payload(stored: &StoredCollection) -> Vec<u8> {
        let mut schema = Vec::new();
        codec::encode_schema(&stored.kinds, &mut schema);
        let mut index = Vec::new();
        codec::encode_index_directory(&stored.indexes, &mut index);
        let mut data = Vec::new();
        for record in &stored.records {
            codec::encode_record(record, &stored.kinds, &mut data);
        }

        let schema_offset = PAYLOAD_HEADER_LEN as u64;
        let index_offset = schema_offset + schema.len() as u64;
        let data_offset = index_offset + index.len() as u64;

        let mut out = Vec::new();
        codec::write_u32(&mut out, PAYLOAD_MAGIC);
        codec::write_u32(&mut out, PAYLOAD_VERSION);
        codec::write_u64(&mut out, schema_offset);
        codec::write_u64(&mut out, index_offset);
        codec::write_u64(&mut out, data_offset);
        codec::write_u64(&mut out, stored.records.len() as u64);
        out.resize(PAYLOAD_HEADER_LEN, 0);
        out.extend_from_slice(&schema);
        out.extend_from_slice(&index);
        out.extend_from_slice(&data);
        out
    }
}
