use crate::protocol::Address;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GdbError {
    #[error("Not connected")]
    NotConnected,
    #[error("Malformed packet: {0}")]
    ProtocolFraming(String),
    #[error("Checksum mismatch: expected {expected:02x}, got {actual:02x}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("Error reading registers: {0}")]
    RegisterRead(String),
    #[error("Error reading memory: {0}")]
    MemoryRead(String),
    #[error("Invalid reply to '{request}': {reply}")]
    InvalidReply { request: String, reply: String },
    #[error("Connection closed by remote stub")]
    ConnectionClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum QmpError {
    #[error("Not connected")]
    NotConnected,
    #[error("Invalid QMP greeting: {0}")]
    Handshake(String),
    #[error("Failed to receive valid JSON: {0}")]
    MalformedMessage(String),
    #[error("Command '{command}' failed: {class}: {desc}")]
    CommandFailed {
        command: String,
        class: String,
        desc: String,
    },
    #[error("Unexpected reply to '{command}': {reply}")]
    UnexpectedReply { command: String, reply: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("Servers not reachable on ports {gdb_port}/{qmp_port} within {timeout:?}")]
    StartupTimeout {
        gdb_port: u16,
        qmp_port: u16,
        timeout: Duration,
    },
    #[error("Target process exited during startup ({0})")]
    ProcessExited(String),
    #[error("Failed to spawn '{executable}': {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Command '{command}' not visible on screen. Screen shows: [{line}]")]
    CommandNotEchoed { command: String, line: String },
    #[error("Target not running")]
    NotRunning,
    #[error("Instance already started")]
    AlreadyStarted,
    #[error(transparent)]
    Gdb(#[from] GdbError),
    #[error(transparent)]
    Qmp(#[from] QmpError),
}

/// Anything that can read target memory. The video helpers are written
/// against this so they work over a live stub or a captured dump.
pub trait MemoryReader {
    fn read_memory_at(&mut self, address: Address, length: usize) -> Result<Vec<u8>, GdbError>;
}
