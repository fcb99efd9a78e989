pub use serde::{Deserialize, Serialize};
pub use serde_json::Value;

pub use self::addressing::*;
pub use self::monitor_messages::*;
pub use self::registers::*;

mod registers {
    use super::*;
    use std::str::FromStr;

    /// Register names in the order the stub transmits them in a `g` reply.
    pub const REGISTER_NAMES: [&str; 16] = [
        "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "eip", "eflags", "cs", "ss", "ds",
        "es", "fs", "gs",
    ];

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Register {
        Eax,
        Ecx,
        Edx,
        Ebx,
        Esp,
        Ebp,
        Esi,
        Edi,
        Eip,
        Eflags,
        Cs,
        Ss,
        Ds,
        Es,
        Fs,
        Gs,
    }

    impl Register {
        pub const ALL: [Register; 16] = [
            Register::Eax,
            Register::Ecx,
            Register::Edx,
            Register::Ebx,
            Register::Esp,
            Register::Ebp,
            Register::Esi,
            Register::Edi,
            Register::Eip,
            Register::Eflags,
            Register::Cs,
            Register::Ss,
            Register::Ds,
            Register::Es,
            Register::Fs,
            Register::Gs,
        ];

        /// Index used by the `p<n>` packet.
        pub fn index(self) -> usize {
            self as usize
        }

        pub fn name(self) -> &'static str {
            REGISTER_NAMES[self.index()]
        }

        pub fn from_index(index: usize) -> Option<Register> {
            Self::ALL.get(index).copied()
        }
    }

    impl FromStr for Register {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let lower = s.to_ascii_lowercase();
            REGISTER_NAMES
                .iter()
                .position(|name| *name == lower)
                .and_then(Register::from_index)
                .ok_or_else(|| format!("unknown register '{}'", s))
        }
    }

    /// Snapshot of the 32-bit register file. Every read produces a new one.
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct RegisterSet {
        pub eax: u32,
        pub ecx: u32,
        pub edx: u32,
        pub ebx: u32,
        pub esp: u32,
        pub ebp: u32,
        pub esi: u32,
        pub edi: u32,
        pub eip: u32,
        pub eflags: u32,
        pub cs: u32,
        pub ss: u32,
        pub ds: u32,
        pub es: u32,
        pub fs: u32,
        pub gs: u32,
    }

    impl RegisterSet {
        pub fn from_values(v: [u32; 16]) -> Self {
            Self {
                eax: v[0],
                ecx: v[1],
                edx: v[2],
                ebx: v[3],
                esp: v[4],
                ebp: v[5],
                esi: v[6],
                edi: v[7],
                eip: v[8],
                eflags: v[9],
                cs: v[10],
                ss: v[11],
                ds: v[12],
                es: v[13],
                fs: v[14],
                gs: v[15],
            }
        }

        pub fn to_array(&self) -> [u32; 16] {
            [
                self.eax, self.ecx, self.edx, self.ebx, self.esp, self.ebp, self.esi, self.edi,
                self.eip, self.eflags, self.cs, self.ss, self.ds, self.es, self.fs, self.gs,
            ]
        }

        pub fn value(&self, reg: Register) -> u32 {
            self.to_array()[reg.index()]
        }

        pub fn by_index(&self, index: usize) -> Option<u32> {
            self.to_array().get(index).copied()
        }

        /// Case-insensitive lookup by register name.
        pub fn get(&self, name: &str) -> Option<u32> {
            name.parse::<Register>().ok().map(|reg| self.value(reg))
        }

        pub fn iter(&self) -> impl Iterator<Item = (&'static str, u32)> {
            REGISTER_NAMES.into_iter().zip(self.to_array())
        }

        /// Real-mode linear address of CS:EIP.
        pub fn code_address(&self) -> u32 {
            Address::seg_off(self.cs as u16, self.eip as u16).linear()
        }
    }
}

mod addressing {
    use super::*;
    use std::str::FromStr;

    /// A target address, either linear or a real-mode segment:offset pair.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Address {
        Linear(u32),
        SegOff { segment: u16, offset: u16 },
    }

    impl Address {
        pub fn seg_off(segment: u16, offset: u16) -> Self {
            Address::SegOff { segment, offset }
        }

        pub fn linear(self) -> u32 {
            match self {
                Address::Linear(addr) => addr,
                Address::SegOff { segment, offset } => {
                    (u32::from(segment) << 4).wrapping_add(u32::from(offset))
                }
            }
        }
    }

    impl From<u32> for Address {
        fn from(addr: u32) -> Self {
            Address::Linear(addr)
        }
    }

    impl From<(u16, u16)> for Address {
        fn from((segment, offset): (u16, u16)) -> Self {
            Address::SegOff { segment, offset }
        }
    }

    /// Accepts `b800:0000` (hex segment and offset) or a bare hex linear
    /// address with optional `0x` prefix.
    impl FromStr for Address {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let s = s.trim();
            let parse_hex = |part: &str| {
                let part = part.trim_start_matches("0x").trim_start_matches("0X");
                u32::from_str_radix(part, 16).map_err(|e| format!("invalid address '{}': {}", s, e))
            };
            match s.split_once(':') {
                Some((seg, off)) => {
                    let segment = parse_hex(seg)?;
                    let offset = parse_hex(off)?;
                    if segment > 0xFFFF || offset > 0xFFFF {
                        return Err(format!("segment:offset out of range in '{}'", s));
                    }
                    Ok(Address::seg_off(segment as u16, offset as u16))
                }
                None => parse_hex(s).map(Address::Linear),
            }
        }
    }
}

mod monitor_messages {
    use super::*;

    /// Outgoing monitor command. Serialized as one JSON line.
    #[derive(Debug, Clone, Serialize)]
    pub struct QmpCommand<'a> {
        pub execute: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub arguments: Option<Value>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct QmpErrorBody {
        pub class: String,
        #[serde(default)]
        pub desc: String,
    }

    /// Classified incoming monitor message.
    #[derive(Debug, Clone, PartialEq)]
    pub enum MonitorMessage {
        Greeting(Value),
        Return(Value),
        Error(QmpErrorBody),
        Event { event: String, data: Option<Value> },
        Unknown(Value),
    }

    impl MonitorMessage {
        pub fn classify(value: Value) -> Self {
            let mut map = match value {
                Value::Object(map) => map,
                other => return MonitorMessage::Unknown(other),
            };
            if let Some(greeting) = map.remove("QMP") {
                return MonitorMessage::Greeting(greeting);
            }
            if let Some(ret) = map.remove("return") {
                return MonitorMessage::Return(ret);
            }
            if let Some(err) = map.remove("error") {
                return match serde_json::from_value::<QmpErrorBody>(err.clone()) {
                    Ok(body) => MonitorMessage::Error(body),
                    Err(_) => MonitorMessage::Error(QmpErrorBody {
                        class: "GenericError".to_string(),
                        desc: err.to_string(),
                    }),
                };
            }
            if let Some(Value::String(event)) = map.get("event").cloned() {
                return MonitorMessage::Event {
                    event,
                    data: map.remove("data"),
                };
            }
            MonitorMessage::Unknown(Value::Object(map))
        }

        /// True for messages that complete an outstanding command.
        pub fn is_reply(&self) -> bool {
            matches!(self, MonitorMessage::Return(_) | MonitorMessage::Error(_))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub enum KeyValue {
        #[serde(rename = "qcode")]
        Qcode(String),
        #[serde(rename = "number")]
        Number(u32),
    }

    impl KeyValue {
        pub fn qcode(name: impl Into<String>) -> Self {
            KeyValue::Qcode(name.into())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum MouseButton {
        Left,
        Right,
        Middle,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Axis {
        X,
        Y,
    }

    /// One entry of an `input-send-event` batch.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data", rename_all = "lowercase")]
    pub enum InputEvent {
        Key { down: bool, key: KeyValue },
        Btn { down: bool, button: MouseButton },
        Rel { axis: Axis, value: i64 },
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DebugStatus {
        #[serde(default)]
        pub active: bool,
        #[serde(default)]
        pub paused: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub reason: Option<String>,
    }

    /// `query-status` return payload.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StatusInfo {
        pub status: String,
        pub running: bool,
        #[serde(rename = "emulator-paused", default, skip_serializing_if = "Option::is_none")]
        pub emulator_paused: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub debug: Option<DebugStatus>,
    }

    impl StatusInfo {
        pub fn is_paused(&self) -> bool {
            !self.running || self.status == "paused"
        }
    }

    /// Result of a `memdump` command.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MemDump {
        Inline(Vec<u8>),
        File { path: String, size: u64 },
    }

    /// Result of a `screendump` command.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Screenshot {
        pub format: String,
        pub file: Option<String>,
        pub size: u64,
        pub data: Option<Vec<u8>>,
    }
}

/// Asynchronous stop notification decoded from a debug packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReply {
    /// `S<sig>` or `T<sig>...`
    Signal(u8),
    /// `W<code>`
    Exited(u8),
    /// `X<sig>`
    Terminated(u8),
    /// `O<hex>` console output
    Output(String),
    Other(String),
}

impl StopReply {
    pub fn parse(payload: &str) -> StopReply {
        let code = |s: &str| s.get(1..3).and_then(|hex| u8::from_str_radix(hex, 16).ok());
        let parsed = match payload.as_bytes().first() {
            Some(b'S') | Some(b'T') => code(payload).map(StopReply::Signal),
            Some(b'W') => code(payload).map(StopReply::Exited),
            Some(b'X') => code(payload).map(StopReply::Terminated),
            Some(b'O') if payload.len() > 1 => hex::decode(&payload[1..])
                .ok()
                .map(|bytes| StopReply::Output(String::from_utf8_lossy(&bytes).into_owned())),
            _ => None,
        };
        parsed.unwrap_or_else(|| StopReply::Other(payload.to_string()))
    }

    pub fn signal(&self) -> Option<u8> {
        match self {
            StopReply::Signal(sig) | StopReply::Terminated(sig) => Some(*sig),
            _ => None,
        }
    }

    /// SIGTRAP, reported for breakpoints, single steps and halts.
    pub fn is_trap(&self) -> bool {
        self.signal() == Some(5)
    }
}
