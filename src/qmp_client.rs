//! Blocking client for the JSON monitor protocol.
//!
//! Replies carry no request id. [`QmpClient::send_command`] therefore writes
//! one command and reads exactly one reply, and all access goes through
//! `&mut self`. Callers sharing a client across threads must wrap it in a
//! lock or open a second connection.
use crate::config::QmpConfig;
use crate::framed_json_stream::JsonStream;
use crate::interfaces::QmpError;
use crate::keymap;
use crate::protocol::{
    Address, Axis, InputEvent, KeyValue, MemDump, MonitorMessage, MouseButton, QmpCommand,
    Screenshot, StatusInfo,
};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde_json::{json, Value};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Hold time used by `type_text` for each key chord.
pub const DEFAULT_HOLD_TIME_MS: u64 = 100;

pub struct QmpClient {
    config: QmpConfig,
    stream: Option<JsonStream<TcpStream>>,
    greeting: Option<Value>,
}

impl QmpClient {
    pub fn new(config: QmpConfig) -> Self {
        Self {
            config,
            stream: None,
            greeting: None,
        }
    }

    /// Creates a client and performs the handshake. The connection is
    /// closed when the client is dropped.
    pub fn connect_to(config: QmpConfig) -> Result<Self, QmpError> {
        let mut client = Self::new(config);
        client.connect()?;
        Ok(client)
    }

    pub fn config(&self) -> &QmpConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// The `QMP` object from the server greeting.
    pub fn greeting(&self) -> Option<&Value> {
        self.greeting.as_ref()
    }

    pub fn connect(&mut self) -> Result<(), QmpError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = self.config.addr();
        let socket = crate::connect_tcp(&addr, self.config.timeout)?;
        socket.set_read_timeout(Some(self.config.timeout))?;
        socket.set_write_timeout(Some(self.config.timeout))?;
        socket.set_nodelay(true)?;
        let mut stream = JsonStream::new(socket);

        let greeting = stream.read_one_object()?;
        let marker = match MonitorMessage::classify(greeting.clone()) {
            MonitorMessage::Greeting(marker) => marker,
            _ => return Err(QmpError::Handshake(greeting.to_string())),
        };
        self.stream = Some(stream);
        self.greeting = Some(marker);

        if let Err(e) = self.send_command("qmp_capabilities", None) {
            self.close();
            return Err(e);
        }
        info!(%addr, "Connected to QMP server");
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.get_ref().shutdown(Shutdown::Both);
            debug!("QMP connection closed");
        }
        self.greeting = None;
    }

    /// Sends one command and returns the raw reply object, `return` or
    /// `error` alike. Asynchronous events read in between are skipped.
    pub fn send_command(&mut self, name: &str, arguments: Option<Value>) -> Result<Value, QmpError> {
        let stream = self.stream.as_mut().ok_or(QmpError::NotConnected)?;
        let command = QmpCommand {
            execute: name,
            arguments,
        };
        stream.send(&command)?;
        loop {
            let reply = stream.read_one_object()?;
            match MonitorMessage::classify(reply.clone()) {
                MonitorMessage::Event { event, .. } => {
                    debug!(event, command = name, "Skipping QMP event while awaiting reply");
                }
                MonitorMessage::Greeting(_) => {
                    warn!(command = name, "Unexpected second QMP greeting");
                }
                _ => {
                    trace!(command = name, reply = %reply, "QMP reply");
                    return Ok(reply);
                }
            }
        }
    }

    /// Like [`QmpClient::send_command`], but returns the `return` payload and
    /// turns an `error` reply into [`QmpError::CommandFailed`].
    pub fn execute(&mut self, name: &str, arguments: Option<Value>) -> Result<Value, QmpError> {
        let reply = self.send_command(name, arguments)?;
        match MonitorMessage::classify(reply) {
            MonitorMessage::Return(value) => Ok(value),
            MonitorMessage::Error(body) => Err(QmpError::CommandFailed {
                command: name.to_string(),
                class: body.class,
                desc: body.desc,
            }),
            other => Err(QmpError::UnexpectedReply {
                command: name.to_string(),
                reply: format!("{:?}", other),
            }),
        }
    }

    pub fn send_key<K: AsRef<str>>(&mut self, qcodes: &[K], hold_time_ms: u64) -> Result<Value, QmpError> {
        let keys: Vec<KeyValue> = qcodes.iter().map(|k| KeyValue::qcode(k.as_ref())).collect();
        self.send_command(
            "send-key",
            Some(json!({ "keys": keys, "hold-time": hold_time_ms })),
        )
    }

    pub fn input_send_event(&mut self, events: &[InputEvent]) -> Result<Value, QmpError> {
        self.send_command("input-send-event", Some(json!({ "events": events })))
    }

    pub fn key_down(&mut self, qcode: &str) -> Result<Value, QmpError> {
        self.input_send_event(&[InputEvent::Key {
            down: true,
            key: KeyValue::qcode(qcode),
        }])
    }

    pub fn key_up(&mut self, qcode: &str) -> Result<Value, QmpError> {
        self.input_send_event(&[InputEvent::Key {
            down: false,
            key: KeyValue::qcode(qcode),
        }])
    }

    pub fn key_press(&mut self, qcode: &str, hold: Duration) -> Result<Value, QmpError> {
        self.key_down(qcode)?;
        thread::sleep(hold);
        self.key_up(qcode)
    }

    pub fn mouse_move(&mut self, dx: i64, dy: i64) -> Result<Value, QmpError> {
        self.input_send_event(&[
            InputEvent::Rel { axis: Axis::X, value: dx },
            InputEvent::Rel { axis: Axis::Y, value: dy },
        ])
    }

    pub fn mouse_button(&mut self, button: MouseButton, down: bool) -> Result<Value, QmpError> {
        self.input_send_event(&[InputEvent::Btn { down, button }])
    }

    /// Types `text` one character per `send-key`, sleeping `delay` after
    /// each. Characters with no key mapping are skipped.
    pub fn type_text(&mut self, text: &str, delay: Duration) -> Result<(), QmpError> {
        for c in text.chars() {
            let Some(keys) = keymap::keys_for_char(c) else {
                trace!(?c, "No key mapping, skipping");
                continue;
            };
            self.send_key(&keys, DEFAULT_HOLD_TIME_MS)?;
            thread::sleep(delay);
        }
        Ok(())
    }

    pub fn query_commands(&mut self) -> Result<Vec<String>, QmpError> {
        let reply = self.send_command("query-commands", None)?;
        let names = reply
            .get("return")
            .and_then(Value::as_array)
            .map(|cmds| {
                cmds.iter()
                    .filter_map(|c| c.get("name").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    pub fn query_status(&mut self) -> Result<Value, QmpError> {
        self.send_command("query-status", None)
    }

    pub fn query_status_info(&mut self) -> Result<StatusInfo, QmpError> {
        let value = self.execute("query-status", None)?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn stop(&mut self) -> Result<Value, QmpError> {
        self.send_command("stop", None)
    }

    pub fn cont(&mut self) -> Result<Value, QmpError> {
        self.send_command("cont", None)
    }

    pub fn debug_break_on_exec(&mut self, enabled: bool) -> Result<Value, QmpError> {
        self.send_command("debug-break-on-exec", Some(json!({ "enabled": enabled })))
    }

    /// Dumps guest memory. Without `file` the bytes come back inline.
    pub fn memdump(&mut self, address: impl Into<Address>, size: usize, file: Option<&str>) -> Result<MemDump, QmpError> {
        let mut args = json!({ "address": address.into().linear(), "size": size });
        if let Some(file) = file {
            args["file"] = json!(file);
        }
        let ret = self.execute("memdump", Some(args))?;
        if let Some(data) = ret.get("data").and_then(Value::as_str) {
            let bytes = BASE64_STANDARD.decode(data).map_err(|e| QmpError::UnexpectedReply {
                command: "memdump".to_string(),
                reply: format!("bad base64 payload: {}", e),
            })?;
            return Ok(MemDump::Inline(bytes));
        }
        match ret.get("file").and_then(Value::as_str) {
            Some(path) => Ok(MemDump::File {
                path: path.to_string(),
                size: ret.get("size").and_then(Value::as_u64).unwrap_or(size as u64),
            }),
            None => Err(QmpError::UnexpectedReply {
                command: "memdump".to_string(),
                reply: ret.to_string(),
            }),
        }
    }

    pub fn screendump(&mut self, file: Option<&str>) -> Result<Screenshot, QmpError> {
        let args = file.map(|f| json!({ "file": f }));
        let ret = self.execute("screendump", args)?;
        let data = match ret.get("data").and_then(Value::as_str) {
            Some(data) => Some(BASE64_STANDARD.decode(data).map_err(|e| QmpError::UnexpectedReply {
                command: "screendump".to_string(),
                reply: format!("bad base64 payload: {}", e),
            })?),
            None => None,
        };
        Ok(Screenshot {
            format: ret.get("format").and_then(Value::as_str).unwrap_or("png").to_string(),
            file: ret.get("file").and_then(Value::as_str).map(str::to_string),
            size: ret.get("size").and_then(Value::as_u64).unwrap_or_default(),
            data,
        })
    }

    pub fn savestate(&mut self, file: &str) -> Result<(), QmpError> {
        self.execute("savestate", Some(json!({ "file": file }))).map(drop)
    }

    pub fn loadstate(&mut self, file: &str) -> Result<(), QmpError> {
        self.execute("loadstate", Some(json!({ "file": file }))).map(drop)
    }

    /// `dos_only` restarts the DOS shell without a full machine reset.
    pub fn system_reset(&mut self, dos_only: bool) -> Result<(), QmpError> {
        self.execute("system_reset", Some(json!({ "dos_only": dos_only }))).map(drop)
    }

    pub fn quit(&mut self) -> Result<Value, QmpError> {
        self.send_command("quit", None)
    }
}

impl Drop for QmpClient {
    fn drop(&mut self) {
        self.close();
    }
}
