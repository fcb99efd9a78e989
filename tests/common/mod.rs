#![allow(dead_code)]
//! In-process stand-ins for the emulator's debug stub and monitor server.
//! Both share one `Machine` so keys typed over the monitor show up in the
//! video memory read over the debug protocol.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

pub const VIDEO_BASE: u32 = 0xB8000;
pub const PROMPT: &str = "C:\\>";
pub const PROMPT_ROW: u32 = 24;
/// Reads at or above this address fail with `E01`.
pub const UNMAPPED: u32 = 0xFFFF_0000;

pub const REGISTER_VALUES: [u32; 16] = [
    0x0000_1234, 0x0000_0011, 0x0000_0022, 0x0000_0033, 0x0000_FFFE, 0x0000_0912,
    0x0000_0080, 0x0000_0100, 0x0000_0100, 0x0000_0202, 0x0000_0C0D, 0x0000_0C0D,
    0x0000_0C0D, 0x0000_0C0D, 0x0000_0000, 0x0000_0000,
];

pub struct Machine {
    pub regs: [u32; 16],
    pub memory: HashMap<u32, u8>,
    pub breakpoints: HashSet<u32>,
    pub paused: bool,
    /// Debug packet payloads in arrival order.
    pub packets: Vec<String>,
    /// Monitor commands in arrival order.
    pub commands: Vec<Value>,
    cursor: u32,
}

impl Machine {
    pub fn new() -> Self {
        let mut machine = Self {
            regs: REGISTER_VALUES,
            memory: HashMap::new(),
            breakpoints: HashSet::new(),
            paused: false,
            packets: Vec::new(),
            commands: Vec::new(),
            cursor: 0,
        };
        machine.reset_prompt();
        machine
    }

    fn cell(col: u32) -> u32 {
        VIDEO_BASE + (PROMPT_ROW * 80 + col) * 2
    }

    fn put_char(&mut self, col: u32, c: u8) {
        self.memory.insert(Self::cell(col), c);
        self.memory.insert(Self::cell(col) + 1, 0x07);
    }

    pub fn reset_prompt(&mut self) {
        for col in 0..80 {
            self.put_char(col, b' ');
        }
        for (col, c) in PROMPT.bytes().enumerate() {
            self.put_char(col as u32, c);
        }
        self.cursor = PROMPT.len() as u32;
    }

    pub fn type_char(&mut self, c: u8) {
        if self.cursor < 80 {
            self.put_char(self.cursor, c);
            self.cursor += 1;
        }
    }

    pub fn read(&self, addr: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| self.memory.get(&(addr + i)).copied().unwrap_or(0))
            .collect()
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.memory.insert(addr + i as u32, *b);
        }
    }
}

pub type SharedMachine = Arc<Mutex<Machine>>;

pub fn machine() -> SharedMachine {
    Arc::new(Mutex::new(Machine::new()))
}

pub fn init() {
    dosbox_remote::init_tracing();
}

/// A port nothing listens on.
pub fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ---------------------------------------------------------------------------
// Debug stub
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct StubOptions {
    /// Send `S05` this long after a `c` packet. `None` never stops.
    pub stop_after_continue: Option<Duration>,
    pub fail_register_block: bool,
    /// Say nothing in response to the interrupt byte.
    pub ignore_interrupt: bool,
    /// Write reply payloads bare, without `$...#xx`.
    pub unframed_replies: bool,
    /// Send every checksum off by one.
    pub corrupt_checksums: bool,
}

enum Reply {
    Packet(String),
    NoAckOk,
    Continue,
    Detach,
}

pub fn spawn_gdb_stub(machine: SharedMachine, opts: StubOptions) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub");
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(stream) = conn else { continue };
            serve_gdb(stream, &machine, &opts);
        }
    });
    port
}

fn send_packet(stream: &mut TcpStream, payload: &str, opts: &StubOptions) {
    let frame = if opts.unframed_replies {
        payload.to_string()
    } else {
        let sum = payload.bytes().fold(0u8, |a, b| a.wrapping_add(b));
        let sum = if opts.corrupt_checksums { sum.wrapping_add(1) } else { sum };
        format!("${}#{:02x}", payload, sum)
    };
    let _ = stream.write_all(frame.as_bytes());
}

fn serve_gdb(mut stream: TcpStream, machine: &SharedMachine, opts: &StubOptions) {
    let mut no_ack = false;
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        loop {
            while matches!(buf.first(), Some(b'+') | Some(b'-')) {
                buf.remove(0);
            }
            if buf.first() == Some(&0x03) {
                buf.remove(0);
                if !opts.ignore_interrupt {
                    send_packet(&mut stream, "S05", opts);
                }
                continue;
            }
            let Some(start) = buf.iter().position(|&b| b == b'$') else {
                buf.clear();
                break;
            };
            let Some(hash) = buf[start..].iter().position(|&b| b == b'#').map(|i| i + start) else {
                break;
            };
            if buf.len() < hash + 3 {
                break;
            }
            let payload = String::from_utf8_lossy(&buf[start + 1..hash]).into_owned();
            buf.drain(..hash + 3);
            if !no_ack {
                let _ = stream.write_all(b"+");
            }
            machine.lock().unwrap().packets.push(payload.clone());
            match handle_gdb_packet(&payload, machine, opts) {
                Reply::Packet(reply) => send_packet(&mut stream, &reply, opts),
                Reply::NoAckOk => {
                    send_packet(&mut stream, "OK", opts);
                    no_ack = true;
                }
                Reply::Continue => {
                    if let Some(delay) = opts.stop_after_continue {
                        thread::sleep(delay);
                        send_packet(&mut stream, "S05", opts);
                    }
                }
                Reply::Detach => {
                    send_packet(&mut stream, "OK", opts);
                    return;
                }
            }
        }
        let n = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn parse_addr_len(args: &str) -> (u32, usize) {
    let (addr, len) = args.split_once(',').expect("addr,len");
    (
        u32::from_str_radix(addr, 16).expect("addr hex"),
        usize::from_str_radix(len, 16).expect("len hex"),
    )
}

fn handle_gdb_packet(payload: &str, machine: &SharedMachine, opts: &StubOptions) -> Reply {
    let mut m = machine.lock().unwrap();
    let reply = match payload.as_bytes().first() {
        _ if payload == "QStartNoAckMode" => return Reply::NoAckOk,
        _ if payload.starts_with("qSupported") => {
            "PacketSize=3fff;swbreak+;hwbreak+;vContSupported+;QStartNoAckMode+".to_string()
        }
        Some(b'?') | Some(b's') => "S05".to_string(),
        Some(b'c') => return Reply::Continue,
        Some(b'D') => return Reply::Detach,
        Some(b'g') if opts.fail_register_block => "E01".to_string(),
        Some(b'g') => m.regs.iter().map(|r| hex::encode(r.to_le_bytes())).collect(),
        Some(b'G') => {
            let body = &payload[1..];
            for (i, reg) in m.regs.iter_mut().enumerate() {
                let bytes = hex::decode(&body[i * 8..i * 8 + 8]).expect("register hex");
                *reg = u32::from_le_bytes(bytes.try_into().unwrap());
            }
            "OK".to_string()
        }
        Some(b'p') => match usize::from_str_radix(&payload[1..], 16) {
            Ok(i) if i < 16 => hex::encode(m.regs[i].to_le_bytes()),
            _ => "E01".to_string(),
        },
        Some(b'm') => {
            let (addr, len) = parse_addr_len(&payload[1..]);
            if addr >= UNMAPPED {
                "E01".to_string()
            } else {
                hex::encode(m.read(addr, len))
            }
        }
        Some(b'M') => {
            let (head, data) = payload[1..].split_once(':').expect("M packet");
            let (addr, _) = parse_addr_len(head);
            m.write(addr, &hex::decode(data).expect("data hex"));
            "OK".to_string()
        }
        Some(kind @ (b'Z' | b'z')) => {
            let addr = u32::from_str_radix(payload.split(',').nth(1).expect("bp addr"), 16).unwrap();
            let ok = if *kind == b'Z' {
                m.breakpoints.insert(addr);
                true
            } else {
                m.breakpoints.remove(&addr)
            };
            let reply = if ok { "OK" } else { "E01" };
            reply.to_string()
        }
        _ => String::new(),
    };
    Reply::Packet(reply)
}

// ---------------------------------------------------------------------------
// Monitor server
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct QmpOptions {
    pub greeting: Value,
    /// Emit a `STOP` event ahead of the reply to `stop`, in the same write.
    pub event_before_stop: bool,
    /// Echo `send-key` input onto the prompt row.
    pub echo_keys: bool,
}

impl Default for QmpOptions {
    fn default() -> Self {
        Self {
            greeting: json!({"QMP": {"version": {"qemu": {"micro": 0, "minor": 0, "major": 0},
                "package": "DOSBox-X"}, "capabilities": []}}),
            event_before_stop: false,
            echo_keys: true,
        }
    }
}

pub fn spawn_qmp_server(machine: SharedMachine, opts: QmpOptions) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind qmp");
    let port = listener.local_addr().unwrap().port();
    listener.set_nonblocking(true).unwrap();
    thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            loop {
                let Ok((socket, _)) = listener.accept().await else { continue };
                let machine = machine.clone();
                let opts = opts.clone();
                tokio::spawn(async move {
                    let _ = serve_qmp(socket, machine, opts).await;
                });
            }
        });
    });
    port
}

async fn serve_qmp(socket: tokio::net::TcpStream, machine: SharedMachine, opts: QmpOptions) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    write_half.write_all(format!("{}\r\n", opts.greeting).as_bytes()).await?;
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let mut out = String::new();
        let reply = match serde_json::from_str::<Value>(&line) {
            Ok(cmd) => {
                let execute = cmd["execute"].as_str().unwrap_or_default().to_string();
                if opts.event_before_stop && execute == "stop" {
                    let event = json!({"event": "STOP", "timestamp": {"seconds": 0, "microseconds": 0}});
                    out.push_str(&format!("{}\r\n", event));
                }
                handle_qmp_command(&execute, &cmd, &machine, &opts)
            }
            Err(_) => json!({"error": {"class": "GenericError", "desc": "Invalid command format"}}),
        };
        out.push_str(&format!("{}\r\n", reply));
        write_half.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

fn qcode_char(qcode: &str) -> Option<u8> {
    match qcode {
        "spc" => Some(b' '),
        "dot" => Some(b'.'),
        "slash" => Some(b'/'),
        "minus" => Some(b'-'),
        "semicolon" => Some(b';'),
        "backslash" => Some(b'\\'),
        q if q.len() == 1 => q.bytes().next(),
        _ => None,
    }
}

fn handle_qmp_command(execute: &str, cmd: &Value, machine: &SharedMachine, opts: &QmpOptions) -> Value {
    let mut m = machine.lock().unwrap();
    m.commands.push(cmd.clone());
    let args = &cmd["arguments"];
    match execute {
        "qmp_capabilities" | "input-send-event" | "debug-break-on-exec" | "system_reset" | "quit" => {
            json!({"return": {}})
        }
        "query-commands" => json!({"return": [
            {"name": "qmp_capabilities"}, {"name": "send-key"}, {"name": "input-send-event"},
            {"name": "query-commands"}, {"name": "query-status"}, {"name": "memdump"},
            {"name": "stop"}, {"name": "cont"}
        ]}),
        "query-status" => json!({"return": {
            "status": if m.paused { "paused" } else { "running" },
            "running": !m.paused,
            "emulator-paused": m.paused,
            "debug": {"active": true, "paused": false}
        }}),
        "stop" => {
            m.paused = true;
            json!({"return": {}})
        }
        "cont" => {
            m.paused = false;
            json!({"return": {}})
        }
        "send-key" => {
            let qcodes: Vec<String> = args["keys"]
                .as_array()
                .map(|keys| keys.iter().filter_map(|k| k["data"].as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            if qcodes.is_empty() {
                return json!({"error": {"class": "GenericError", "desc": "No keys specified"}});
            }
            if opts.echo_keys {
                let shifted = qcodes.iter().any(|q| q == "shift");
                for qcode in qcodes.iter().filter(|q| *q != "shift") {
                    if qcode == "ret" {
                        m.reset_prompt();
                    } else if let Some(c) = qcode_char(qcode) {
                        m.type_char(if shifted { c.to_ascii_uppercase() } else { c });
                    }
                }
            }
            json!({"return": {}})
        }
        "memdump" => {
            let address = args["address"].as_u64().unwrap_or(0) as u32;
            let size = args["size"].as_u64().unwrap_or(0) as usize;
            match args["file"].as_str() {
                Some(file) => json!({"return": {"file": file, "size": size}}),
                None => json!({"return": {"data": BASE64_STANDARD.encode(m.read(address, size)), "size": size}}),
            }
        }
        "screendump" => json!({"return": {
            "data": BASE64_STANDARD.encode(b"\x89PNG"), "size": 4, "format": "png", "file": "/tmp/capture.png"
        }}),
        "savestate" | "loadstate" => match args["file"].as_str() {
            Some(file) => json!({"return": {"file": file}}),
            None => json!({"error": {"class": "GenericError", "desc": "Missing required 'file' argument"}}),
        },
        other => json!({"error": {"class": "CommandNotFound", "desc": format!("Command not found: {}", other)}}),
    }
}
