// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Sensor controller wire format
//!
//! Controllers emit newline-delimited JSON. Transports hand over arbitrary
//! byte chunks, so [`LineFramer`] buffers partial lines across reads. A line
//! may also carry several objects written back to back without a separator.
//!
//! Accepted record shapes:
//!
//! ```text
//! {"event_type":"sensor_triggered","chip_index":1,"pin_index":3,"edge":"vacant"}
//! {"device_id":"esp32_gym","message_type":"event","event_type":"sensor_triggered",
//!  "data":{"chip_idx":0,"addr":"0x20","pin":5,"state":"LOW","active":true}}
//! ```

use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::types::{RawSensorReading, SensorEdge};

pub const SENSOR_EVENT_TYPE: &str = "sensor_triggered";

/// Output of the framer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    /// A line longer than the limit; its bytes were dropped up to the next newline
    Oversized,
}

/// Splits an arbitrary byte stream into lines
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_line_bytes: usize,
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_line_bytes.min(4096)),
            max_line_bytes,
            discarding: false,
        }
    }

    /// Feed a chunk; returns every line completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();

        for &byte in chunk {
            if byte == b'\n' {
                if self.discarding {
                    self.discarding = false;
                    frames.push(Frame::Oversized);
                } else if let Some(line) = self.take_line() {
                    frames.push(Frame::Line(line));
                }
                continue;
            }

            if self.discarding {
                continue;
            }

            if self.buf.len() >= self.max_line_bytes {
                self.buf.clear();
                self.discarding = true;
                continue;
            }

            self.buf.push(byte);
        }

        frames
    }

    /// Flush the trailing partial line at end of stream
    pub fn finish(&mut self) -> Option<Frame> {
        if self.discarding {
            self.discarding = false;
            self.buf.clear();
            return Some(Frame::Oversized);
        }
        self.take_line().map(Frame::Line)
    }

    /// Bytes currently held for an incomplete line
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn take_line(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&raw);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// A classified wire record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedRecord {
    Sensor(RawSensorReading),
    /// Well-formed record of another type (barcode, heartbeat, motor, response)
    Ignored { event_type: String },
}

/// Decode every record on one line
///
/// Decoding stops at the first JSON syntax error; records before it are kept.
pub fn decode_line(line: &str) -> Vec<Result<DecodedRecord, DecodeError>> {
    let mut out = Vec::new();
    let stream = serde_json::Deserializer::from_str(line).into_iter::<Value>();

    for value in stream {
        match value {
            Ok(value) => out.push(decode_value(&value)),
            Err(e) => {
                out.push(Err(DecodeError::Json(e.to_string())));
                break;
            }
        }
    }

    out
}

fn decode_value(value: &Value) -> Result<DecodedRecord, DecodeError> {
    let record = value.as_object().ok_or(DecodeError::NotAnObject)?;

    let event_type = record
        .get("event_type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField("event_type"))?;

    if event_type != SENSOR_EVENT_TYPE {
        return Ok(DecodedRecord::Ignored {
            event_type: event_type.to_string(),
        });
    }

    let payload = match record.get("data") {
        Some(Value::Object(data)) => data,
        _ => record,
    };

    let chip_index = read_index(payload, &["chip_index", "chip_idx"])
        .ok_or(DecodeError::MissingField("chip_index"))?;
    let pin_index = read_index(payload, &["pin_index", "pin"])
        .ok_or(DecodeError::MissingField("pin_index"))?;
    let edge = read_edge(payload)?;

    Ok(DecodedRecord::Sensor(RawSensorReading {
        chip_index,
        pin_index,
        edge,
    }))
}

fn read_index(payload: &Map<String, Value>, keys: &[&str]) -> Option<u32> {
    keys.iter().find_map(|key| match payload.get(*key)? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    })
}

fn read_edge(payload: &Map<String, Value>) -> Result<SensorEdge, DecodeError> {
    for key in ["edge", "state"] {
        if let Some(value) = payload.get(key) {
            let text = value.as_str().ok_or(DecodeError::MissingField("edge"))?;
            return SensorEdge::from_wire(text).ok_or_else(|| DecodeError::InvalidEdge(text.to_string()));
        }
    }

    // Controllers set `active` when the key has been pulled
    match payload.get("active").and_then(Value::as_bool) {
        Some(true) => Ok(SensorEdge::Vacant),
        Some(false) => Ok(SensorEdge::Engaged),
        None => Err(DecodeError::MissingField("edge")),
    }
}
