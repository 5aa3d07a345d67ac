// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Hardware Event Ingestor
//!
//! Frames, decodes, resolves, and debounces controller output, then hands
//! each surviving [`SensorEvent`] to the sink. Bad input is counted, logged,
//! and dropped; it never ends the stream.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace, warn};

use crate::codec::{decode_line, DecodedRecord, Frame, LineFramer};
use crate::debounce::Debouncer;
use crate::error::ResolveError;
use crate::hal::{Clock, SensorEventSink};
use crate::resolver::SensorAddressResolver;
use crate::types::{RawSensorReading, SensorEdge, SensorEvent};

const READ_CHUNK: usize = 512;

#[derive(Debug, Default)]
struct Counters {
    lines: AtomicU64,
    dispatched: AtomicU64,
    debounced: AtomicU64,
    malformed: AtomicU64,
    unmapped: AtomicU64,
    ignored: AtomicU64,
    oversized: AtomicU64,
}

/// Point-in-time ingest counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub lines: u64,
    pub dispatched: u64,
    pub debounced: u64,
    pub malformed: u64,
    pub unmapped: u64,
    pub ignored: u64,
    pub oversized: u64,
}

pub struct HardwareEventIngestor {
    resolver: Arc<SensorAddressResolver>,
    sink: Arc<dyn SensorEventSink>,
    clock: Arc<dyn Clock>,
    debouncer: Mutex<Debouncer>,
    max_line_bytes: usize,
    counters: Counters,
}

impl HardwareEventIngestor {
    pub fn new(
        resolver: Arc<SensorAddressResolver>,
        sink: Arc<dyn SensorEventSink>,
        clock: Arc<dyn Clock>,
        debounce_window_ms: u64,
        max_line_bytes: usize,
    ) -> Self {
        Self {
            resolver,
            sink,
            clock,
            debouncer: Mutex::new(Debouncer::from_millis(debounce_window_ms)),
            max_line_bytes,
            counters: Counters::default(),
        }
    }

    pub fn resolver(&self) -> &SensorAddressResolver {
        &self.resolver
    }

    /// Fresh framer sized for this ingestor, one per connection
    pub fn framer(&self) -> LineFramer {
        LineFramer::new(self.max_line_bytes)
    }

    /// Process one complete line; returns how many events were dispatched
    pub fn ingest_line(&self, source: &str, line: &str) -> usize {
        self.counters.lines.fetch_add(1, Ordering::Relaxed);
        let mut dispatched = 0;

        for record in decode_line(line) {
            match record {
                Ok(DecodedRecord::Sensor(reading)) => {
                    if self.ingest_reading(source, reading) {
                        dispatched += 1;
                    }
                }
                Ok(DecodedRecord::Ignored { event_type }) => {
                    self.counters.ignored.fetch_add(1, Ordering::Relaxed);
                    trace!(target: "lockerkey-hal", source, event_type = %event_type, "Ignoring non-sensor record");
                }
                Err(e) => {
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(target: "lockerkey-hal", source, error = %e, "Discarding malformed sensor record");
                }
            }
        }

        dispatched
    }

    /// Resolve and dispatch a decoded reading; unmapped sensors are dropped
    pub fn ingest_reading(&self, source: &str, reading: RawSensorReading) -> bool {
        let locker_number = match self.resolver.resolve(reading.chip_index, reading.pin_index) {
            Ok(locker) => locker.to_string(),
            Err(e) => {
                self.counters.unmapped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "lockerkey-hal",
                    source,
                    chip_index = reading.chip_index,
                    pin_index = reading.pin_index,
                    error = %e,
                    "Dropping event from unmapped sensor"
                );
                return false;
            }
        };

        self.dispatch_normalized(locker_number, reading.edge)
    }

    /// Test/bench entry point: inject a transition by sensor number
    pub fn simulate_sensor(&self, sensor_number: u32, edge: SensorEdge) -> Result<bool, ResolveError> {
        let locker_number = self
            .resolver
            .locker_for_sensor(sensor_number)
            .ok_or(ResolveError::NotMapped { sensor_number })?
            .to_string();
        debug!(target: "lockerkey-hal", sensor_number, locker = %locker_number, %edge, "Simulated sensor transition");
        Ok(self.dispatch_normalized(locker_number, edge))
    }

    fn dispatch_normalized(&self, locker_number: String, edge: SensorEdge) -> bool {
        let observed_at = self.clock.now();

        if !self.debouncer.lock().admit(&locker_number, edge, observed_at) {
            self.counters.debounced.fetch_add(1, Ordering::Relaxed);
            trace!(target: "lockerkey-hal", locker = %locker_number, %edge, "Debounced duplicate transition");
            return false;
        }

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(target: "lockerkey-hal", locker = %locker_number, %edge, "Sensor event");
        self.sink.dispatch(SensorEvent {
            locker_number,
            edge,
            observed_at,
        });
        true
    }

    /// Feed one raw chunk through a connection's framer
    pub fn ingest_chunk(&self, source: &str, framer: &mut LineFramer, chunk: &[u8]) -> usize {
        framer
            .push(chunk)
            .into_iter()
            .map(|frame| self.ingest_frame(source, frame))
            .sum()
    }

    fn ingest_frame(&self, source: &str, frame: Frame) -> usize {
        match frame {
            Frame::Line(line) => self.ingest_line(source, &line),
            Frame::Oversized => {
                self.counters.oversized.fetch_add(1, Ordering::Relaxed);
                warn!(target: "lockerkey-hal", source, limit = self.max_line_bytes, "Discarding oversized line");
                0
            }
        }
    }

    /// Consume a byte stream until EOF
    ///
    /// Reads stay on the async task; framing and dispatch run on the blocking
    /// pool because the sink may commit to storage before it returns.
    pub async fn run_reader<R>(self: Arc<Self>, source: &str, mut reader: R) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let source: Arc<str> = Arc::from(source);
        let mut framer = self.framer();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            framer = self.ingest_blocking(&source, framer, chunk[..n].to_vec(), false).await?;
        }

        self.ingest_blocking(&source, framer, Vec::new(), true).await?;
        Ok(())
    }

    async fn ingest_blocking(
        self: &Arc<Self>,
        source: &Arc<str>,
        mut framer: LineFramer,
        bytes: Vec<u8>,
        eof: bool,
    ) -> io::Result<LineFramer> {
        let ingestor = Arc::clone(self);
        let source = Arc::clone(source);
        tokio::task::spawn_blocking(move || {
            ingestor.ingest_chunk(&source, &mut framer, &bytes);
            if eof {
                if let Some(frame) = framer.finish() {
                    ingestor.ingest_frame(&source, frame);
                }
            }
            framer
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    pub fn stats(&self) -> IngestStats {
        let c = &self.counters;
        IngestStats {
            lines: c.lines.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            debounced: c.debounced.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            unmapped: c.unmapped.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            oversized: c.oversized.load(Ordering::Relaxed),
        }
    }
}
