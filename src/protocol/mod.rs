/*!
 * Remote object service abstraction
 *
 * The transfer engine only needs a handful of primitives from the remote
 * side: object metadata, ranged reads and the multipart session calls.
 * Signing, URL construction and metadata document formats live behind this
 * trait.
 */

pub mod http;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;

/// Metadata of a remote object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object key
    pub key: String,

    /// Object size in bytes
    pub size: u64,

    /// ETag (entity tag)
    pub etag: Option<String>,

    /// Last modified timestamp as reported by the service
    pub last_modified: Option<String>,

    /// Server-side CRC-64/ECMA of the whole object, if advertised
    pub crc64: Option<u64>,
}

/// A part that has been accepted by a multipart session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub number: u32,
    pub etag: String,
}

/// Result of committing a multipart session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub key: String,
    pub etag: Option<String>,
    pub crc64: Option<u64>,
}

/// Body of a part submission
pub enum PartPayload<'a> {
    /// Bytes streamed from the client
    Data {
        body: Box<dyn Read + Send + 'a>,
        size: u64,
    },
    /// Server-side copy of a byte range of another object
    CopyRange {
        source_key: &'a str,
        offset: u64,
        size: u64,
    },
}

impl PartPayload<'_> {
    pub fn size(&self) -> u64 {
        match self {
            PartPayload::Data { size, .. } | PartPayload::CopyRange { size, .. } => *size,
        }
    }
}

/// Remote primitives consumed by the transfer orchestrator
pub trait ObjectService: Send + Sync {
    /// Fetch object metadata
    fn head_object(&self, key: &str) -> Result<ObjectMeta>;

    /// Read `size` bytes starting at `offset`
    fn get_range(&self, key: &str, offset: u64, size: u64) -> Result<Box<dyn Read + Send>>;

    /// Open a multipart session for `key`, returning its id
    fn open_session(&self, key: &str) -> Result<String>;

    /// Submit one part, returning the part's ETag
    fn submit_part(
        &self,
        key: &str,
        session_id: &str,
        part_number: u32,
        payload: PartPayload<'_>,
    ) -> Result<String>;

    /// List parts the session has accepted; fails if the session is unknown
    fn list_session_parts(&self, key: &str, session_id: &str) -> Result<Vec<CompletedPart>>;

    /// Assemble the submitted parts (ascending order) into the final object
    fn commit_session(
        &self,
        key: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectDescriptor>;

    /// Discard a session and every part submitted to it
    fn abort_session(&self, key: &str, session_id: &str) -> Result<()>;

    /// Whether the session still exists on the remote side
    fn session_exists(&self, key: &str, session_id: &str) -> Result<bool> {
        match self.list_session_parts(key, session_id) {
            Ok(_) => Ok(true),
            Err(e) if e.service_code() == Some(NO_SUCH_UPLOAD) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Service error code for an unknown multipart session
pub const NO_SUCH_UPLOAD: &str = "NoSuchUpload";

/// Service error code for an unknown object
pub const NO_SUCH_KEY: &str = "NoSuchKey";

impl<T: ObjectService + ?Sized> ObjectService for Arc<T> {
    fn head_object(&self, key: &str) -> Result<ObjectMeta> {
        (**self).head_object(key)
    }

    fn get_range(&self, key: &str, offset: u64, size: u64) -> Result<Box<dyn Read + Send>> {
        (**self).get_range(key, offset, size)
    }

    fn open_session(&self, key: &str) -> Result<String> {
        (**self).open_session(key)
    }

    fn submit_part(
        &self,
        key: &str,
        session_id: &str,
        part_number: u32,
        payload: PartPayload<'_>,
    ) -> Result<String> {
        (**self).submit_part(key, session_id, part_number, payload)
    }

    fn list_session_parts(&self, key: &str, session_id: &str) -> Result<Vec<CompletedPart>> {
        (**self).list_session_parts(key, session_id)
    }

    fn commit_session(
        &self,
        key: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectDescriptor> {
        (**self).commit_session(key, session_id, parts)
    }

    fn abort_session(&self, key: &str, session_id: &str) -> Result<()> {
        (**self).abort_session(key, session_id)
    }

    fn session_exists(&self, key: &str, session_id: &str) -> Result<bool> {
        (**self).session_exists(key, session_id)
    }
}
