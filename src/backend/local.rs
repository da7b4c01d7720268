//! Directory-backed object store
//!
//! Objects live under `objects/` as a data file plus a JSON metadata
//! sidecar, both named by the SHA-256 of the key. Multipart sessions live
//! under `sessions/<id>/` with one data file and one receipt per part, until
//! they are committed or aborted. CRC-64 values are kept for every part and
//! object, so it behaves like a service that advertises checksums.

use crate::core::checksum::{crc64_combine, Crc64Reader};
use crate::error::{Result, TransferError};
use crate::protocol::{
    CompletedPart, ObjectDescriptor, ObjectMeta, ObjectService, PartPayload, NO_SUCH_KEY,
    NO_SUCH_UPLOAD,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const OBJECTS_DIR: &str = "objects";
const SESSIONS_DIR: &str = "sessions";
const SESSION_META: &str = "meta.json";

/// Metadata sidecar of a stored object
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredObject {
    key: String,
    size: u64,
    etag: String,
    last_modified: String,
    crc64: u64,
}

impl From<StoredObject> for ObjectMeta {
    fn from(stored: StoredObject) -> Self {
        ObjectMeta {
            key: stored.key,
            size: stored.size,
            etag: Some(stored.etag),
            last_modified: Some(stored.last_modified),
            crc64: Some(stored.crc64),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionMeta {
    key: String,
    created_at: String,
}

/// Receipt of a part accepted by a session
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPart {
    number: u32,
    etag: String,
    size: u64,
    crc64: u64,
}

/// [`ObjectService`] over a local directory
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(OBJECTS_DIR))?;
        fs::create_dir_all(root.join(SESSIONS_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        let dir = self.root.join(OBJECTS_DIR);
        (
            dir.join(format!("{}.data", name)),
            dir.join(format!("{}.json", name)),
        )
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        if session_id.is_empty() || !session_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(no_such_upload(session_id));
        }
        Ok(self.root.join(SESSIONS_DIR).join(session_id))
    }

    fn load_object(&self, key: &str) -> Result<StoredObject> {
        let (_, meta_path) = self.object_paths(key);
        match fs::read(&meta_path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(TransferError::service(
                404,
                NO_SUCH_KEY,
                format!("object {} does not exist", key),
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn load_session(&self, key: &str, session_id: &str) -> Result<PathBuf> {
        let dir = self.session_dir(session_id)?;
        let meta: SessionMeta = match fs::read(dir.join(SESSION_META)) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(no_such_upload(session_id)),
            Err(e) => return Err(e.into()),
        };
        if meta.key != key {
            return Err(no_such_upload(session_id));
        }
        Ok(dir)
    }

    /// Store a whole object in one call
    pub fn put_object(&self, key: &str, data: &[u8]) -> Result<ObjectMeta> {
        let stored = StoredObject {
            key: key.to_string(),
            size: data.len() as u64,
            etag: short_digest(data),
            last_modified: Utc::now().to_rfc3339(),
            crc64: crate::core::checksum::crc64(data),
        };
        let (data_path, _) = self.object_paths(key);
        write_atomic(&data_path, data)?;
        self.write_object_meta(&stored)?;
        Ok(stored.into())
    }

    /// Read a whole object
    pub fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        self.load_object(key)?;
        let (data_path, _) = self.object_paths(key);
        Ok(fs::read(data_path)?)
    }

    pub fn delete_object(&self, key: &str) -> Result<()> {
        self.load_object(key)?;
        let (data_path, meta_path) = self.object_paths(key);
        fs::remove_file(meta_path)?;
        fs::remove_file(data_path)?;
        Ok(())
    }

    /// Ids of sessions that are neither committed nor aborted
    pub fn open_sessions(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join(SESSIONS_DIR))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn write_object_meta(&self, stored: &StoredObject) -> Result<()> {
        let (_, meta_path) = self.object_paths(&stored.key);
        write_atomic(&meta_path, &serde_json::to_vec_pretty(stored)?)
    }

    fn read_parts(dir: &Path) -> Result<Vec<StoredPart>> {
        let mut parts = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_receipt = path.extension().is_some_and(|ext| ext == "json")
                && path.file_name().is_some_and(|name| name != SESSION_META);
            if is_receipt {
                parts.push(serde_json::from_slice::<StoredPart>(&fs::read(&path)?)?);
            }
        }
        parts.sort_by_key(|p| p.number);
        Ok(parts)
    }

    /// Stream `body` into the session as part `number`
    fn store_part(
        &self,
        dir: &Path,
        number: u32,
        body: &mut dyn Read,
        size: u64,
    ) -> Result<String> {
        let mut temp = NamedTempFile::new_in(dir)?;
        let mut reader = Crc64Reader::new(body.take(size));
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            temp.write_all(&buffer[..n])?;
        }
        if reader.bytes_read() != size {
            return Err(TransferError::service(
                400,
                "IncompleteBody",
                format!(
                    "part {} declared {} bytes but carried {}",
                    number,
                    size,
                    reader.bytes_read()
                ),
            ));
        }
        temp.as_file().sync_all()?;
        temp.persist(dir.join(format!("{}.part", number)))
            .map_err(|e| TransferError::Io(e.error))?;

        let etag = hex::encode(&hasher.finalize()[..16]);
        let receipt = StoredPart {
            number,
            etag: etag.clone(),
            size,
            crc64: reader.crc64(),
        };
        write_atomic(
            &dir.join(format!("{}.json", number)),
            &serde_json::to_vec(&receipt)?,
        )?;
        Ok(etag)
    }
}

fn no_such_upload(session_id: &str) -> TransferError {
    TransferError::service(
        404,
        NO_SUCH_UPLOAD,
        format!("upload {} does not exist", session_id),
    )
}

fn short_digest(data: &[u8]) -> String {
    hex::encode(&Sha256::digest(data)[..16])
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| {
            TransferError::InvalidArgument(format!("{} has no parent", path.display()))
        })?;
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.persist(path).map_err(|e| TransferError::Io(e.error))?;
    Ok(())
}

impl ObjectService for LocalObjectStore {
    fn head_object(&self, key: &str) -> Result<ObjectMeta> {
        self.load_object(key).map(Into::into)
    }

    fn get_range(&self, key: &str, offset: u64, size: u64) -> Result<Box<dyn Read + Send>> {
        let stored = self.load_object(key)?;
        let in_bounds = matches!(offset.checked_add(size), Some(end) if end <= stored.size);
        if !in_bounds {
            return Err(TransferError::service(
                416,
                "InvalidRange",
                format!("range {}+{} outside object of {} bytes", offset, size, stored.size),
            ));
        }
        if size == 0 {
            return Ok(Box::new(io::empty()));
        }
        let (data_path, _) = self.object_paths(key);
        let mut file = File::open(data_path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(BufReader::new(file).take(size)))
    }

    fn open_session(&self, key: &str) -> Result<String> {
        let session_id = format!("{:032x}", rand::random::<u128>());
        let dir = self.session_dir(&session_id)?;
        fs::create_dir_all(&dir)?;
        let meta = SessionMeta {
            key: key.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };
        write_atomic(&dir.join(SESSION_META), &serde_json::to_vec(&meta)?)?;
        debug!(key, session_id = %session_id, "Opened session");
        Ok(session_id)
    }

    fn submit_part(
        &self,
        key: &str,
        session_id: &str,
        part_number: u32,
        payload: PartPayload<'_>,
    ) -> Result<String> {
        let dir = self.load_session(key, session_id)?;
        if part_number == 0 {
            return Err(TransferError::service(400, "InvalidArgument", "part numbers start at 1"));
        }
        match payload {
            PartPayload::Data { mut body, size } => {
                self.store_part(&dir, part_number, &mut body, size)
            }
            PartPayload::CopyRange {
                source_key,
                offset,
                size,
            } => {
                let mut body = self.get_range(source_key, offset, size)?;
                self.store_part(&dir, part_number, &mut body, size)
            }
        }
    }

    fn list_session_parts(&self, key: &str, session_id: &str) -> Result<Vec<CompletedPart>> {
        let dir = self.load_session(key, session_id)?;
        Ok(Self::read_parts(&dir)?
            .into_iter()
            .map(|p| CompletedPart {
                number: p.number,
                etag: p.etag,
            })
            .collect())
    }

    fn commit_session(
        &self,
        key: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectDescriptor> {
        let dir = self.load_session(key, session_id)?;
        if parts.is_empty() {
            return Err(TransferError::service(400, "MalformedXML", "no parts to commit"));
        }
        if parts.windows(2).any(|w| w[0].number >= w[1].number) {
            return Err(TransferError::service(
                400,
                "InvalidPartOrder",
                "parts must be listed in ascending order",
            ));
        }

        let stored = Self::read_parts(&dir)?;
        let mut selected = Vec::with_capacity(parts.len());
        for part in parts {
            match stored.iter().find(|s| s.number == part.number) {
                Some(s) if s.etag == part.etag => selected.push(s),
                _ => {
                    return Err(TransferError::service(
                        400,
                        "InvalidPart",
                        format!("part {} was not uploaded with etag {}", part.number, part.etag),
                    ))
                }
            }
        }

        let (data_path, _) = self.object_paths(key);
        let mut temp = NamedTempFile::new_in(self.root.join(OBJECTS_DIR))?;
        let mut crc = 0u64;
        let mut size = 0u64;
        let mut etags = Sha256::new();
        for part in &selected {
            let mut file = File::open(dir.join(format!("{}.part", part.number)))?;
            io::copy(&mut file, &mut temp)?;
            crc = crc64_combine(crc, part.crc64, part.size);
            size += part.size;
            etags.update(part.etag.as_bytes());
        }
        temp.as_file().sync_all()?;
        temp.persist(&data_path).map_err(|e| TransferError::Io(e.error))?;

        let object = StoredObject {
            key: key.to_string(),
            size,
            etag: format!("{}-{}", hex::encode(&etags.finalize()[..16]), selected.len()),
            last_modified: Utc::now().to_rfc3339(),
            crc64: crc,
        };
        self.write_object_meta(&object)?;
        fs::remove_dir_all(&dir)?;
        debug!(key, session_id, parts = selected.len(), size, "Committed session");

        Ok(ObjectDescriptor {
            key: object.key,
            etag: Some(object.etag),
            crc64: Some(object.crc64),
        })
    }

    fn abort_session(&self, key: &str, session_id: &str) -> Result<()> {
        let dir = self.load_session(key, session_id)?;
        fs::remove_dir_all(dir)?;
        debug!(key, session_id, "Aborted session");
        Ok(())
    }
}
