//! IPC protocol types using rkyv for zero-copy serialization.
//!
//! Every frame on the wire is `[4-byte length (little-endian)][rkyv bytes]`.
//! A connection carries one `Request` frame; `Install`/`Upgrade`/`Push`
//! requests are followed on the same connection by a sequence of `Chunk`
//! frames, and `WatchLog` answers with a stream of `LogLine` responses
//! terminated by `StreamEnd`.

use rkyv::{Archive, Deserialize, Serialize};

use crate::service::{ResourceStat, Service, ServiceVersion};

/// IPC request from client to daemon.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub enum Request {
    // Daemon lifecycle
    /// Check if daemon is alive
    Ping,
    /// Daemon pid/version/os/arch/uptime/stat
    Info,
    /// Shutdown the daemon
    Shutdown {
        /// Wait for services to stop gracefully
        graceful: bool,
    },

    // Service lifecycle
    Create { service: Service },
    Get { name: String },
    List,
    /// Merge-patch: only non-empty fields of `patch` are applied
    Edit { patch: Service },
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Delete { name: String },

    // Versioned deployment (followed by Chunk frames where noted)
    /// Spec on the request, package bytes as Chunk frames
    Install { service: Service },
    /// Package bytes as Chunk frames
    Upgrade { name: String, version: String },
    Rollback { name: String, version: String },
    ListVersions { name: String },
    /// Prune a version's on-disk sibling and history entry
    Forget { name: String, version: String },
    /// Plain file push; bytes as Chunk frames
    Push { path: String },

    // Observability
    WatchLog {
        name: String,
        /// Tail offset in bytes from the end; 0 means from the beginning
        lines: u64,
        /// Keep streaming new lines until the client disconnects
        follow: bool,
    },
}

/// One message in a package-transfer stream.
///
/// `length` is authoritative: only the first `length` bytes of `data` carry
/// payload. `is_ok` marks the terminal message, which may still carry data
/// (or be a zero-length flush); receivers check `length`, not `is_ok`.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub struct Chunk {
    pub data: Vec<u8>,
    pub length: u32,
    pub is_ok: bool,
}

impl Chunk {
    pub fn data(data: Vec<u8>) -> Self {
        let length = data.len() as u32;
        Self {
            data,
            length,
            is_ok: false,
        }
    }

    pub fn terminal(data: Vec<u8>) -> Self {
        let length = data.len() as u32;
        Self {
            data,
            length,
            is_ok: true,
        }
    }

    pub fn payload(&self) -> &[u8] {
        let len = (self.length as usize).min(self.data.len());
        &self.data[..len]
    }
}

/// IPC response from daemon to client.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[rkyv(derive(Debug))]
pub enum Response {
    /// Response to Ping
    Pong { uptime_secs: u64, version: String },
    /// Generic success
    Ok,
    /// Structured error with a machine-readable kind
    Error { kind: String, message: String },
    /// Daemon self-description
    Info {
        pid: u32,
        version: String,
        os: String,
        arch: String,
        uptime_secs: u64,
        stat: ResourceStat,
    },
    /// Single service snapshot
    Service { service: Service },
    /// Service list plus total count
    Services { list: Vec<Service>, total: u64 },
    /// Version history
    Versions { list: Vec<ServiceVersion> },
    /// One tailed log line (for streaming)
    LogLine {
        text: String,
        timestamp: i64,
        error: Option<String>,
    },
    /// End of stream
    StreamEnd,
}

impl Response {
    pub fn error(err: &crate::error::GpmError) -> Self {
        Response::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Message frame for the wire protocol.
///
/// Format: [4-byte length (little-endian)][rkyv bytes]
pub struct MessageFrame;

impl MessageFrame {
    /// Encode a request to bytes with length prefix
    pub fn encode_request(request: &Request) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)?;
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(&bytes);
        Ok(result)
    }

    /// Encode a response to bytes with length prefix
    pub fn encode_response(response: &Response) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)?;
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(&bytes);
        Ok(result)
    }

    /// Encode a transfer chunk to bytes with length prefix
    pub fn encode_chunk(chunk: &Chunk) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(chunk)?;
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(&bytes);
        Ok(result)
    }

    /// Read length prefix from buffer
    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }
}
