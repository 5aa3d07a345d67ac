// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Sensor controller connections
//!
//! Each configured source gets its own task; all of them feed the same
//! ingestor, so several controllers form one merged event stream.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use lockerkey_config::{SensorSourceConfig, SourceKind};
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::ingestor::HardwareEventIngestor;

pub type SourceReader = Pin<Box<dyn AsyncRead + Send>>;

/// Open the byte stream for one controller
///
/// Serial devices are opened as character files; line settings are expected
/// to be applied by the host (udev rule or `stty`).
pub async fn open_source(source: &SensorSourceConfig) -> io::Result<SourceReader> {
    match source.source_kind() {
        Some(SourceKind::Serial) => {
            let file = tokio::fs::File::open(&source.address).await?;
            Ok(Box::pin(file))
        }
        Some(SourceKind::Tcp) => {
            let stream = tokio::net::TcpStream::connect(&source.address).await?;
            stream.set_nodelay(true)?;
            Ok(Box::pin(stream))
        }
        None => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unknown sensor source kind '{}'", source.kind),
        )),
    }
}

/// Keep one controller connected until shutdown
///
/// Disconnects and open failures are logged and retried after
/// `reconnect_delay`.
pub async fn run_source(
    ingestor: Arc<HardwareEventIngestor>,
    source: SensorSourceConfig,
    reconnect_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match open_source(&source).await {
            Ok(reader) => {
                info!(target: "lockerkey-hal", source = %source.name, address = %source.address, "Sensor source connected");
                tokio::select! {
                    result = Arc::clone(&ingestor).run_reader(&source.name, reader) => match result {
                        Ok(()) => warn!(target: "lockerkey-hal", source = %source.name, "Sensor source closed the stream"),
                        Err(e) => error!(target: "lockerkey-hal", source = %source.name, error = %e, "Sensor source read failed"),
                    },
                    _ = shutdown.changed() => break,
                }
            }
            Err(e) => {
                warn!(target: "lockerkey-hal", source = %source.name, address = %source.address, error = %e, "Sensor source unavailable");
                if source.source_kind().is_none() {
                    break;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    info!(target: "lockerkey-hal", source = %source.name, "Sensor source stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{SensorEventSink, SystemClock};
    use crate::resolver::SensorAddressResolver;
    use crate::types::SensorEvent;
    use lockerkey_config::LockerkeyConfig;
    use parking_lot::Mutex;
    use tokio::io::AsyncWriteExt;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SensorEvent>>);

    impl SensorEventSink for Recorder {
        fn dispatch(&self, event: SensorEvent) {
            self.0.lock().push(event);
        }
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let source = SensorSourceConfig {
            name: "x".to_string(),
            kind: "usb".to_string(),
            address: "whatever".to_string(),
        };
        let err = open_source(&source).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_tcp_source_feeds_ingestor() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let resolver = SensorAddressResolver::from_config(&LockerkeyConfig::default()).unwrap();
        let sink = Arc::new(Recorder::default());
        let ingestor = Arc::new(HardwareEventIngestor::new(
            Arc::new(resolver),
            sink.clone(),
            Arc::new(SystemClock),
            300,
            4096,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_source(
            ingestor.clone(),
            SensorSourceConfig {
                name: "board-0".to_string(),
                kind: "tcp".to_string(),
                address,
            },
            Duration::from_millis(50),
            shutdown_rx,
        ));

        let (mut socket, _) = listener.accept().await.unwrap();
        socket
            .write_all(b"{\"event_type\":\"sensor_triggered\",\"data\":{\"chip_idx\":0,\"pin\":4,\"state\":\"LOW\"}}\n")
            .await
            .unwrap();

        for _ in 0..100 {
            if ingestor.stats().dispatched == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let events = sink.0.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].locker_number, "M05");
    }
}
