//! Object service over a raw HTTP request primitive
//!
//! Request signing, URL escaping and connection handling belong to the
//! injected [`HttpTransport`]; the XML (or JSON) documents exchanged by the
//! multipart calls are handled by the injected [`MultipartCodec`].

use super::{CompletedPart, ObjectDescriptor, ObjectMeta, ObjectService, PartPayload};
use crate::error::{Result, TransferError};
use std::collections::BTreeMap;
use std::io::{self, Read};

/// Header names, lowercase
pub mod headers {
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const ETAG: &str = "etag";
    pub const LAST_MODIFIED: &str = "last-modified";
    pub const RANGE: &str = "range";
    pub const CRC64: &str = "x-oss-hash-crc64ecma";
    pub const COPY_SOURCE: &str = "x-oss-copy-source";
    pub const COPY_SOURCE_RANGE: &str = "x-oss-copy-source-range";
    pub const REQUEST_ID: &str = "x-oss-request-id";
}

/// Largest error document read from a failed response
const MAX_ERROR_BODY: u64 = 64 * 1024;

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Put,
    Post,
    Delete,
}

/// Header map; keys are stored lowercase
pub type Headers = BTreeMap<String, String>;

/// A request handed to the transport
pub struct HttpRequest<'a> {
    pub method: Method,
    /// Path plus query string, e.g. `/bucket/key?uploads`
    pub resource: String,
    pub headers: Headers,
    pub body: Option<Box<dyn Read + Send + 'a>>,
}

impl<'a> HttpRequest<'a> {
    pub fn new(method: Method, resource: impl Into<String>) -> Self {
        Self {
            method,
            resource: resource.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn body(mut self, body: Box<dyn Read + Send + 'a>, length: u64) -> Self {
        self.body = Some(body);
        self.header(headers::CONTENT_LENGTH, length.to_string())
    }
}

/// A response returned by the transport
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The single request primitive the engine consumes.
///
/// Implementations return `Err(TransferError::Transport)` for failures that
/// never produced a response; any response, including non-2xx, is `Ok`.
pub trait HttpTransport: Send + Sync {
    fn do_request(&self, request: HttpRequest<'_>) -> Result<HttpResponse>;
}

/// Structured error extracted from a failed response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFault {
    pub code: String,
    pub message: String,
}

/// Encoding of the documents exchanged by multipart calls
pub trait MultipartCodec: Send + Sync {
    fn decode_session_id(&self, body: &[u8]) -> Result<String>;
    fn decode_part_list(&self, body: &[u8]) -> Result<Vec<CompletedPart>>;
    fn encode_commit(&self, parts: &[CompletedPart]) -> Result<Vec<u8>>;
    fn decode_fault(&self, status: u16, body: &[u8]) -> ServiceFault;
}

/// [`ObjectService`] bound to one bucket, speaking through an [`HttpTransport`]
pub struct HttpObjectService<T, C> {
    transport: T,
    codec: C,
    bucket: String,
}

impl<T: HttpTransport, C: MultipartCodec> HttpObjectService<T, C> {
    pub fn new(transport: T, codec: C, bucket: impl Into<String>) -> Self {
        Self {
            transport,
            codec,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_resource(&self, key: &str) -> String {
        format!("/{}/{}", self.bucket, key)
    }

    fn session_resource(&self, key: &str, session_id: &str) -> String {
        format!("{}?uploadId={}", self.object_resource(key), session_id)
    }

    /// Send a request, turning non-2xx responses into service errors
    fn send(&self, request: HttpRequest<'_>) -> Result<HttpResponse> {
        let response = self.transport.do_request(request)?;
        if response.is_success() {
            return Ok(response);
        }

        let status = response.status;
        let request_id = response.header(headers::REQUEST_ID).map(str::to_string);
        let mut body = Vec::new();
        // A broken error body still yields a status-only fault
        let _ = response.body.take(MAX_ERROR_BODY).read_to_end(&mut body);
        let fault = self.codec.decode_fault(status, &body);
        Err(TransferError::Service {
            status,
            code: fault.code,
            message: fault.message,
            request_id,
        })
    }

    fn read_body(response: HttpResponse) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let mut reader = response.body;
        reader
            .read_to_end(&mut body)
            .map_err(|e| TransferError::Transport(format!("failed to read response body: {}", e)))?;
        Ok(body)
    }

    fn etag_of(response: &HttpResponse) -> Result<String> {
        response
            .header(headers::ETAG)
            .map(|etag| etag.trim_matches('"').to_string())
            .ok_or_else(|| TransferError::Transport("response carried no ETag".to_string()))
    }

    fn crc64_of(response: &HttpResponse) -> Option<u64> {
        response
            .header(headers::CRC64)
            .and_then(|v| v.trim().parse::<u64>().ok())
    }
}

impl<T: HttpTransport, C: MultipartCodec> ObjectService for HttpObjectService<T, C> {
    fn head_object(&self, key: &str) -> Result<ObjectMeta> {
        let response = self.send(HttpRequest::new(Method::Head, self.object_resource(key)))?;
        let size = response
            .header(headers::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                TransferError::Transport(format!("HEAD {} returned no Content-Length", key))
            })?;

        Ok(ObjectMeta {
            key: key.to_string(),
            size,
            etag: response
                .header(headers::ETAG)
                .map(|etag| etag.trim_matches('"').to_string()),
            last_modified: response.header(headers::LAST_MODIFIED).map(str::to_string),
            crc64: Self::crc64_of(&response),
        })
    }

    fn get_range(&self, key: &str, offset: u64, size: u64) -> Result<Box<dyn Read + Send>> {
        if size == 0 {
            return Ok(Box::new(io::empty()));
        }
        let request = HttpRequest::new(Method::Get, self.object_resource(key)).header(
            headers::RANGE,
            format!("bytes={}-{}", offset, offset + size - 1),
        );
        let response = self.send(request)?;

        // A 200 means the range was ignored; only accept it if it is what we asked for
        if response.status == 200 {
            let length = response
                .header(headers::CONTENT_LENGTH)
                .and_then(|v| v.trim().parse::<u64>().ok());
            if offset != 0 || length != Some(size) {
                return Err(TransferError::Transport(format!(
                    "range {}+{} of {} was not honoured",
                    offset, size, key
                )));
            }
        }
        Ok(response.body)
    }

    fn open_session(&self, key: &str) -> Result<String> {
        let resource = format!("{}?uploads", self.object_resource(key));
        let response = self.send(HttpRequest::new(Method::Post, resource))?;
        let body = Self::read_body(response)?;
        self.codec.decode_session_id(&body)
    }

    fn submit_part(
        &self,
        key: &str,
        session_id: &str,
        part_number: u32,
        payload: PartPayload<'_>,
    ) -> Result<String> {
        let resource = format!(
            "{}?partNumber={}&uploadId={}",
            self.object_resource(key),
            part_number,
            session_id
        );
        let request = match payload {
            PartPayload::Data { body, size } => {
                HttpRequest::new(Method::Put, resource).body(body, size)
            }
            PartPayload::CopyRange {
                source_key,
                offset,
                size,
            } => {
                let mut request = HttpRequest::new(Method::Put, resource)
                    .header(headers::COPY_SOURCE, self.object_resource(source_key));
                if size > 0 {
                    request = request.header(
                        headers::COPY_SOURCE_RANGE,
                        format!("bytes={}-{}", offset, offset + size - 1),
                    );
                }
                request
            }
        };
        let response = self.send(request)?;
        Self::etag_of(&response)
    }

    fn list_session_parts(&self, key: &str, session_id: &str) -> Result<Vec<CompletedPart>> {
        let response = self.send(HttpRequest::new(
            Method::Get,
            self.session_resource(key, session_id),
        ))?;
        let body = Self::read_body(response)?;
        self.codec.decode_part_list(&body)
    }

    fn commit_session(
        &self,
        key: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectDescriptor> {
        let document = self.codec.encode_commit(parts)?;
        let length = document.len() as u64;
        let request = HttpRequest::new(Method::Post, self.session_resource(key, session_id))
            .body(Box::new(io::Cursor::new(document)), length);
        let response = self.send(request)?;
        Ok(ObjectDescriptor {
            key: key.to_string(),
            etag: response
                .header(headers::ETAG)
                .map(|etag| etag.trim_matches('"').to_string()),
            crc64: Self::crc64_of(&response),
        })
    }

    fn abort_session(&self, key: &str, session_id: &str) -> Result<()> {
        self.send(HttpRequest::new(
            Method::Delete,
            self.session_resource(key, session_id),
        ))?;
        Ok(())
    }
}
