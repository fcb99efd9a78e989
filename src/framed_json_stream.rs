//! JSON message stream without a length prefix.
//!
//! Outgoing messages are written as one line each. Incoming messages are
//! found by parsing the accumulated buffer after every chunk until it holds
//! one complete JSON value. Whatever follows that value, such as a reply
//! sent in the same segment as an event, is kept for the next read.
use crate::interfaces::QmpError;
use serde::{de::DeserializeOwned, Serialize};
use std::io::{ErrorKind, Read, Write};
use tracing::{debug, trace};

pub struct JsonStream<S> {
    stream: S,
    read_buffer: Vec<u8>,
}

impl<S: Read + Write> JsonStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buffer: Vec::with_capacity(4096),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<(), QmpError> {
        let mut data = serde_json::to_vec(message)?;
        data.push(b'\n');
        self.stream.write_all(&data)?;
        self.stream.flush()?;
        trace!(bytes = data.len(), "Sent message: {}", std::any::type_name::<T>());
        Ok(())
    }

    /// Reads until the buffer holds one complete JSON value.
    pub fn read_one_object(&mut self) -> Result<serde_json::Value, QmpError> {
        self.receive()
    }

    /// Returns the next value, reading more bytes only when the buffer does
    /// not already hold one. Bytes after the value stay buffered for the
    /// next call.
    pub fn receive<T: DeserializeOwned>(&mut self) -> Result<T, QmpError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(message) = self.take_buffered()? {
                return Ok(message);
            }
            let n = match self.stream.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                break;
            }
            self.read_buffer.extend_from_slice(&chunk[..n]);
        }
        Err(QmpError::MalformedMessage(
            String::from_utf8_lossy(&self.read_buffer).into_owned(),
        ))
    }

    fn take_buffered<T: DeserializeOwned>(&mut self) -> Result<Option<T>, QmpError> {
        let (next, consumed) = {
            let mut values = serde_json::Deserializer::from_slice(&self.read_buffer).into_iter::<T>();
            let next = values.next();
            (next, values.byte_offset())
        };
        match next {
            Some(Ok(message)) => {
                self.read_buffer.drain(..consumed);
                debug!(bytes = consumed, buffered = self.read_buffer.len(), "Received message: {}", std::any::type_name::<T>());
                Ok(Some(message))
            }
            // Only whitespace so far.
            None => {
                self.read_buffer.clear();
                Ok(None)
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => {
                self.read_buffer.clear();
                Err(e.into())
            }
        }
    }
}
