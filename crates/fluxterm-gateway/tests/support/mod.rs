//! In-memory serial and shell backends shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use fluxterm_common::models::{PortInfo, RemoteConfig, SerialConfig};
use fluxterm_gateway::config::{GatewayConfig, TransportSettings};
use fluxterm_gateway::origin::OriginPolicy;
use fluxterm_gateway::state::AppState;
use fluxterm_gateway::transport::{
    LineControl, RemoteShell, SerialBackend, SerialStreams, ShellCommand, ShellConnector,
    TransportError,
};
use tokio::io::{duplex, DuplexStream};

/// Serial devices backed by `tokio::io::duplex`. The far end of each opened
/// device is parked until a test claims it with [`MemorySerial::device`].
#[derive(Default)]
pub struct MemorySerial {
    devices: Mutex<HashMap<String, DuplexStream>>,
    pub lines: Arc<Mutex<Vec<(String, &'static str, bool)>>>,
}

impl MemorySerial {
    /// Take the device end of the most recent open of `port`.
    pub async fn device(&self, port: &str) -> DuplexStream {
        for _ in 0..200 {
            if let Some(d) = self.devices.lock().unwrap().remove(port) {
                return d;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("{port} was never opened");
    }
}

struct RecordingLines {
    port: String,
    log: Arc<Mutex<Vec<(String, &'static str, bool)>>>,
}

impl LineControl for RecordingLines {
    fn set_dtr(&mut self, level: bool) -> std::io::Result<()> {
        self.log.lock().unwrap().push((self.port.clone(), "dtr", level));
        Ok(())
    }
    fn set_rts(&mut self, level: bool) -> std::io::Result<()> {
        self.log.lock().unwrap().push((self.port.clone(), "rts", level));
        Ok(())
    }
}

#[async_trait]
impl SerialBackend for MemorySerial {
    fn list(&self) -> Result<Vec<PortInfo>, TransportError> {
        Ok(vec![
            PortInfo {
                name: "/dev/ttyMOCK0".into(),
                description: "Mock UART".into(),
                is_usb: true,
                vid: Some("2341".into()),
                pid: Some("0043".into()),
                serial_number: Some("A1".into()),
            },
            PortInfo {
                name: "/dev/ttyS0".into(),
                description: "Serial Port".into(),
                is_usb: false,
                vid: None,
                pid: None,
                serial_number: None,
            },
        ])
    }

    async fn open(&self, config: &SerialConfig) -> Result<SerialStreams, TransportError> {
        if config.port.contains("missing") {
            return Err(TransportError::Open {
                key: config.port.clone(),
                reason: "No such file or directory".into(),
            });
        }
        let (ours, theirs) = duplex(64 * 1024);
        self.devices
            .lock()
            .unwrap()
            .insert(config.port.clone(), theirs);
        let (reader, writer) = tokio::io::split(ours);
        Ok(SerialStreams {
            reader: Box::new(reader),
            writer: Box::new(writer),
            lines: Box::new(RecordingLines {
                port: config.port.clone(),
                log: self.lines.clone(),
            }),
        })
    }
}

/// A shell that greets, echoes input back prefixed with `echo:`, and
/// records window changes.
#[derive(Default)]
pub struct EchoShell {
    pub resizes: Arc<Mutex<Vec<(u32, u32)>>>,
}

#[async_trait]
impl ShellConnector for EchoShell {
    async fn connect(
        &self,
        key: &str,
        config: &RemoteConfig,
        settings: &TransportSettings,
    ) -> Result<RemoteShell, TransportError> {
        if config.host == "unreachable.invalid" {
            return Err(TransportError::Shell("connection refused".into()));
        }
        let (shell, mut io) = RemoteShell::new(key, settings);
        let resizes = self.resizes.clone();
        let greeting = format!("welcome {}\r\n", config.username);
        tokio::spawn(async move {
            let _ = io.output.push(Bytes::from(greeting)).await;
            loop {
                tokio::select! {
                    _ = io.shutdown.changed() => break,
                    cmd = io.commands.recv() => match cmd {
                        None => break,
                        Some(ShellCommand::Data(data, reply)) => {
                            let _ = reply.send(Ok(()));
                            let mut out = b"echo:".to_vec();
                            out.extend_from_slice(&data);
                            let _ = io.output.push(Bytes::from(out)).await;
                        }
                        Some(ShellCommand::Resize { cols, rows, reply }) => {
                            resizes.lock().unwrap().push((cols, rows));
                            let _ = reply.send(Ok(()));
                        }
                    },
                }
            }
        });
        Ok(shell)
    }
}

pub struct Harness {
    pub state: AppState,
    pub serial: Arc<MemorySerial>,
    pub shell: Arc<EchoShell>,
}

pub fn harness(origin: OriginPolicy) -> Harness {
    harness_with(GatewayConfig::default(), origin)
}

pub fn harness_with(config: GatewayConfig, origin: OriginPolicy) -> Harness {
    let serial = Arc::new(MemorySerial::default());
    let shell = Arc::new(EchoShell::default());
    let state = AppState::new(config, origin, serial.clone(), shell.clone());
    Harness {
        state,
        serial,
        shell,
    }
}
