//! Blocking client for the remote-serial debug stub.
//!
//! The stub handles one request at a time and carries no transaction ids, so
//! every I/O method takes `&mut self`: a reply is always matched to the last
//! request by arrival order. The only exception is the stop reply that
//! follows `c`, which is collected separately with [`GdbClient::wait_for_stop`].
//!
//! Bytes read past the end of a frame are kept in a per-client buffer, so a
//! stop reply that arrives together with an ack, or only partly before a
//! timeout, is still seen by the next wait.
use crate::config::GdbConfig;
use crate::interfaces::{GdbError, MemoryReader};
use crate::protocol::{Address, Register, RegisterSet, StopReply};
use crate::rsp_packet::{self, ACK, INTERRUPT};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Grace period between the interrupt byte and reading the stop reply.
const HALT_GRACE: Duration = Duration::from_millis(100);
/// How long `c` waits for the transport acknowledgment.
const CONTINUE_ACK_TIMEOUT: Duration = Duration::from_millis(500);
const REGISTER_HEX_WIDTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    AwaitingReply,
}

/// Overrides the socket read timeout for one call and puts the previous
/// value back when dropped, including on error paths.
struct ReadTimeoutGuard<'a> {
    stream: &'a TcpStream,
    previous: Option<Duration>,
}

impl<'a> ReadTimeoutGuard<'a> {
    fn set(stream: &'a TcpStream, timeout: Duration) -> io::Result<Self> {
        let previous = stream.read_timeout()?;
        // A zero duration is rejected by set_read_timeout.
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        Ok(Self { stream, previous })
    }
}

impl Drop for ReadTimeoutGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.stream.set_read_timeout(self.previous) {
            warn!(error = %e, "Failed to restore socket read timeout");
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Removes the first complete frame from `pending`. Without `require_start`
/// an unframed buffer ending in a `#xx` trailer also counts.
fn take_frame(pending: &mut Vec<u8>, require_start: bool) -> Option<Vec<u8>> {
    let len = match rsp_packet::frame_len(pending) {
        Some(len) => len,
        None if !require_start && !pending.contains(&b'$') && rsp_packet::frame_complete(pending) => {
            pending.len()
        }
        None => return None,
    };
    Some(pending.drain(..len).collect())
}

/// Reads into `pending` until it holds a complete frame. `Ok(None)` means
/// the peer closed first; anything partial stays buffered.
fn read_frame(mut stream: &TcpStream, pending: &mut Vec<u8>, require_start: bool) -> io::Result<Option<Vec<u8>>> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(frame) = take_frame(pending, require_start) {
            return Ok(Some(frame));
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        pending.extend_from_slice(&chunk[..n]);
    }
}

fn parse_register_block(reply: &str) -> Result<RegisterSet, GdbError> {
    let invalid = || GdbError::InvalidReply {
        request: "g".to_string(),
        reply: reply.to_string(),
    };
    if !reply.is_ascii() || reply.len() < Register::ALL.len() * REGISTER_HEX_WIDTH {
        return Err(invalid());
    }
    let mut values = [0u32; 16];
    for (i, value) in values.iter_mut().enumerate() {
        let field = &reply[i * REGISTER_HEX_WIDTH..(i + 1) * REGISTER_HEX_WIDTH];
        // 'x' digits mark a register the stub cannot supply.
        if field.contains('x') {
            continue;
        }
        *value = rsp_packet::hex_swap_u32(field).ok_or_else(invalid)?;
    }
    Ok(RegisterSet::from_values(values))
}

fn parse_supported(reply: &str) -> HashMap<String, String> {
    reply
        .split(';')
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => match entry.strip_suffix(['+', '-', '?']) {
                Some(name) => (name.to_string(), entry[name.len()..].to_string()),
                None => (entry.to_string(), String::new()),
            },
        })
        .collect()
}

pub struct GdbClient {
    config: GdbConfig,
    stream: Option<TcpStream>,
    state: ConnectionState,
    no_ack: bool,
    /// Received bytes not yet consumed as a frame.
    pending: Vec<u8>,
}

impl GdbClient {
    pub fn new(config: GdbConfig) -> Self {
        Self {
            config,
            stream: None,
            state: ConnectionState::Disconnected,
            no_ack: false,
            pending: Vec::new(),
        }
    }

    /// Creates a client and connects it. The connection is closed (with a
    /// detach) when the client is dropped.
    pub fn connect_to(config: GdbConfig) -> Result<Self, GdbError> {
        let mut client = Self::new(config);
        client.connect()?;
        Ok(client)
    }

    pub fn config(&self) -> &GdbConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn no_ack_mode(&self) -> bool {
        self.no_ack
    }

    pub fn connect(&mut self) -> Result<(), GdbError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = self.config.addr();
        let stream = crate::connect_tcp(&addr, self.config.timeout)?;
        stream.set_read_timeout(Some(self.config.timeout))?;
        stream.set_write_timeout(Some(self.config.timeout))?;
        stream.set_nodelay(true)?;
        info!(%addr, "Connected to GDB stub");
        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        self.no_ack = false;
        self.pending.clear();
        Ok(())
    }

    /// Sends a best-effort detach and closes the socket. Never fails.
    pub fn close(&mut self) {
        if self.stream.is_none() {
            return;
        }
        if let Err(e) = self.send_request("D") {
            debug!(error = %e, "Detach before close failed");
        }
        if self.stream.is_some() {
            self.drop_connection();
            debug!("GDB connection closed");
        }
        self.state = ConnectionState::Disconnected;
    }

    fn connected_stream(&self) -> Result<&TcpStream, GdbError> {
        self.stream.as_ref().ok_or(GdbError::NotConnected)
    }

    /// Unframed replies carry no checksum, so they are only checked by
    /// `strict_framing`.
    fn decode_reply(&self, raw: &[u8]) -> Result<String, GdbError> {
        let text = String::from_utf8_lossy(raw);
        let framed = rsp_packet::decode(&text);
        if self.config.verify_checksums && framed.is_ok() {
            rsp_packet::verify_checksum(&text)?;
        }
        let payload = match framed {
            Ok(payload) => payload,
            Err(e) if self.config.strict_framing => return Err(e),
            Err(_) => rsp_packet::decode_lenient(&text),
        };
        Ok(payload.to_string())
    }

    fn drop_connection(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.no_ack = false;
        self.pending.clear();
    }

    fn discard_pending(&mut self) {
        if !self.pending.is_empty() {
            debug!(bytes = self.pending.len(), "Discarding unsolicited bytes");
            self.pending.clear();
        }
    }

    /// Runs one blocking exchange with the state at `AwaitingReply`. A peer
    /// close drops the connection, so later calls fail with `NotConnected`.
    fn awaiting<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T, GdbError>) -> Result<T, GdbError> {
        self.connected_stream()?;
        self.state = ConnectionState::AwaitingReply;
        let result = op(self);
        if matches!(result, Err(GdbError::ConnectionClosed)) {
            warn!("GDB stub closed the connection");
            self.drop_connection();
        }
        self.state = if self.stream.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        result
    }

    /// Writes one framed packet and returns the payload of the reply.
    pub fn send_request(&mut self, payload: &str) -> Result<String, GdbError> {
        self.awaiting(|client| client.exchange(payload))
    }

    fn exchange(&mut self, payload: &str) -> Result<String, GdbError> {
        self.discard_pending();
        let mut stream = self.stream.as_ref().ok_or(GdbError::NotConnected)?;
        trace!(payload, "-> packet");
        stream.write_all(&rsp_packet::encode(payload))?;
        let raw = match read_frame(stream, &mut self.pending, false) {
            Ok(Some(frame)) => frame,
            Ok(None) if self.pending.is_empty() => return Err(GdbError::ConnectionClosed),
            Ok(None) => std::mem::take(&mut self.pending),
            // An unframed reply only ends when the socket goes quiet.
            Err(e) if is_timeout(&e) && self.pending.iter().any(|&b| b != ACK) && !self.pending.contains(&b'$') => {
                std::mem::take(&mut self.pending)
            }
            Err(e) => return Err(e.into()),
        };
        let reply = self.decode_reply(&raw)?;
        trace!(reply = %reply, "<- packet");
        Ok(reply)
    }

    /// Sends the interrupt byte and returns the stop reply, or an empty
    /// string if none arrives within the socket timeout.
    pub fn halt(&mut self) -> Result<String, GdbError> {
        let timeout = self.config.timeout;
        self.halt_with_timeout(timeout)
    }

    pub fn halt_with_timeout(&mut self, timeout: Duration) -> Result<String, GdbError> {
        self.awaiting(|client| {
            let mut stream = client.stream.as_ref().ok_or(GdbError::NotConnected)?;
            debug!("Sending interrupt");
            stream.write_all(&[INTERRUPT])?;
            thread::sleep(HALT_GRACE);
            let _guard = ReadTimeoutGuard::set(stream, timeout)?;
            match read_frame(stream, &mut client.pending, true) {
                Ok(Some(frame)) => client.decode_reply(&frame),
                Ok(None) => Err(GdbError::ConnectionClosed),
                Err(e) if is_timeout(&e) => {
                    debug!(buffered = client.pending.len(), "No stop reply after interrupt");
                    Ok(String::new())
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Resumes the target. Returns `"+"` if the stub acknowledged the packet
    /// and an empty string otherwise; the eventual stop reply must be read
    /// with [`GdbClient::wait_for_stop`]. In no-ack mode nothing is read.
    pub fn continue_execution(&mut self) -> Result<String, GdbError> {
        self.awaiting(|client| {
            client.discard_pending();
            let mut stream = client.stream.as_ref().ok_or(GdbError::NotConnected)?;
            trace!("-> packet c");
            stream.write_all(&rsp_packet::encode("c"))?;
            if client.no_ack {
                return Ok(String::new());
            }
            let _guard = ReadTimeoutGuard::set(stream, CONTINUE_ACK_TIMEOUT)?;
            let mut chunk = [0u8; 4096];
            let n = match stream.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if is_timeout(&e) => return Ok(String::new()),
                Err(e) => return Err(e.into()),
            };
            client.pending.extend_from_slice(&chunk[..n]);
            // Only the ack is consumed; an early stop reply stays buffered.
            if client.pending.first() == Some(&ACK) {
                client.pending.remove(0);
                Ok("+".to_string())
            } else {
                Ok(String::new())
            }
        })
    }

    /// Blocks for an asynchronous stop reply. Timing out is not an error:
    /// the result is an empty string and any partial frame is kept.
    pub fn wait_for_stop(&mut self, timeout: Duration) -> Result<String, GdbError> {
        self.awaiting(|client| {
            let stream = client.stream.as_ref().ok_or(GdbError::NotConnected)?;
            let _guard = ReadTimeoutGuard::set(stream, timeout)?;
            match read_frame(stream, &mut client.pending, true) {
                Ok(Some(frame)) => {
                    let reply = client.decode_reply(&frame)?;
                    debug!(reply = %reply, "Stop reply");
                    Ok(reply)
                }
                Ok(None) => Err(GdbError::ConnectionClosed),
                Err(e) if is_timeout(&e) => Ok(String::new()),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Typed variant of [`GdbClient::wait_for_stop`].
    pub fn wait_for_stop_reply(&mut self, timeout: Duration) -> Result<Option<StopReply>, GdbError> {
        let reply = self.wait_for_stop(timeout)?;
        Ok((!reply.is_empty()).then(|| StopReply::parse(&reply)))
    }

    pub fn read_all_registers(&mut self) -> Result<RegisterSet, GdbError> {
        let reply = self.send_request("g")?;
        if reply.starts_with('E') {
            return Err(GdbError::RegisterRead(reply));
        }
        parse_register_block(&reply)
    }

    /// Writes the whole register file with `G`. True iff the stub replied `OK`.
    pub fn write_all_registers(&mut self, regs: &RegisterSet) -> Result<bool, GdbError> {
        let mut payload = String::with_capacity(1 + 16 * REGISTER_HEX_WIDTH);
        payload.push('G');
        for (_, value) in regs.iter() {
            payload.push_str(&hex::encode(value.to_le_bytes()));
        }
        Ok(self.send_request(&payload)? == "OK")
    }

    pub fn read_register(&mut self, index: usize) -> Result<u32, GdbError> {
        let request = format!("p{:x}", index);
        let reply = self.send_request(&request)?;
        if reply.starts_with('E') {
            return Err(GdbError::RegisterRead(format!("register {}: {}", index, reply)));
        }
        rsp_packet::hex_swap_u32(&reply).ok_or(GdbError::InvalidReply { request, reply })
    }

    pub fn read_named_register(&mut self, reg: Register) -> Result<u32, GdbError> {
        self.read_register(reg.index())
    }

    pub fn read_memory(&mut self, addr: impl Into<Address>, length: usize) -> Result<Vec<u8>, GdbError> {
        let linear = addr.into().linear();
        let request = format!("m{:x},{:x}", linear, length);
        let reply = self.send_request(&request)?;
        if reply.starts_with('E') {
            return Err(GdbError::MemoryRead(format!("0x{:x}+{}: {}", linear, length, reply)));
        }
        hex::decode(&reply).map_err(|_| GdbError::InvalidReply { request, reply })
    }

    /// True iff the stub replied `OK`.
    pub fn write_memory(&mut self, addr: impl Into<Address>, data: &[u8]) -> Result<bool, GdbError> {
        let linear = addr.into().linear();
        let request = format!("M{:x},{:x}:{}", linear, data.len(), hex::encode(data));
        Ok(self.send_request(&request)? == "OK")
    }

    /// Software breakpoint, kind 1 (single x86 opcode byte). The stub owns
    /// the breakpoint table; nothing is tracked here.
    pub fn set_breakpoint(&mut self, addr: impl Into<Address>) -> Result<bool, GdbError> {
        let linear = addr.into().linear();
        Ok(self.send_request(&format!("Z0,{:x},1", linear))? == "OK")
    }

    pub fn remove_breakpoint(&mut self, addr: impl Into<Address>) -> Result<bool, GdbError> {
        let linear = addr.into().linear();
        Ok(self.send_request(&format!("z0,{:x},1", linear))? == "OK")
    }

    /// Single step. Unlike continue, the stop reply is read synchronously.
    pub fn step(&mut self) -> Result<String, GdbError> {
        self.send_request("s")
    }

    pub fn query_halt_reason(&mut self) -> Result<String, GdbError> {
        self.send_request("?")
    }

    pub fn query_supported(&mut self) -> Result<HashMap<String, String>, GdbError> {
        let reply = self.send_request("qSupported:swbreak+")?;
        Ok(parse_supported(&reply))
    }

    /// After `OK`, replies no longer carry a leading `+`.
    pub fn enable_no_ack_mode(&mut self) -> Result<bool, GdbError> {
        let ok = self.send_request("QStartNoAckMode")? == "OK";
        if ok {
            debug!("No-ack mode enabled");
            self.no_ack = true;
        }
        Ok(ok)
    }

    pub fn detach(&mut self) -> Result<String, GdbError> {
        self.send_request("D")
    }
}

impl MemoryReader for GdbClient {
    fn read_memory_at(&mut self, address: Address, length: usize) -> Result<Vec<u8>, GdbError> {
        self.read_memory(address, length)
    }
}

impl Drop for GdbClient {
    fn drop(&mut self) {
        self.close();
    }
}
