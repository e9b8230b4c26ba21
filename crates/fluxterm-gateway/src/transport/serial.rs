//! Serial device transport and the device catalog backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fluxterm_common::models::{FlowControl, Parity, PortInfo, SerialConfig, StopBits};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio_serial::{SerialPortBuilderExt, SerialPortType};

use super::{Transport, TransportError, TransportKind};

/// How long `close` waits for in-flight I/O to let go of the streams.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Out-of-band modem control lines.
pub trait LineControl: Send {
    fn set_dtr(&mut self, level: bool) -> std::io::Result<()>;
    fn set_rts(&mut self, level: bool) -> std::io::Result<()>;
}

/// An opened device, split so reads and writes do not contend.
pub struct SerialStreams {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub lines: Box<dyn LineControl>,
}

/// Enumerates and opens serial devices.
#[async_trait]
pub trait SerialBackend: Send + Sync + 'static {
    /// Blocking; call from `spawn_blocking` on the async side.
    fn list(&self) -> Result<Vec<PortInfo>, TransportError>;
    async fn open(&self, config: &SerialConfig) -> Result<SerialStreams, TransportError>;
}

// ── System backend ──────────────────────────────────────────────────

/// Real devices through `tokio-serial`.
pub struct SystemSerial;

impl LineControl for Box<dyn tokio_serial::SerialPort> {
    fn set_dtr(&mut self, level: bool) -> std::io::Result<()> {
        Ok(self.write_data_terminal_ready(level)?)
    }

    fn set_rts(&mut self, level: bool) -> std::io::Result<()> {
        Ok(self.write_request_to_send(level)?)
    }
}

#[async_trait]
impl SerialBackend for SystemSerial {
    fn list(&self) -> Result<Vec<PortInfo>, TransportError> {
        let ports = tokio_serial::available_ports().map_err(|e| TransportError::Io(e.into()))?;
        Ok(ports
            .into_iter()
            .map(|p| match p.port_type {
                SerialPortType::UsbPort(usb) => PortInfo {
                    description: usb.product.clone().unwrap_or_else(|| {
                        format!("USB Serial - VID:{:04x} PID:{:04x}", usb.vid, usb.pid)
                    }),
                    name: p.port_name,
                    is_usb: true,
                    vid: Some(format!("{:04x}", usb.vid)),
                    pid: Some(format!("{:04x}", usb.pid)),
                    serial_number: usb.serial_number,
                },
                _ => PortInfo {
                    name: p.port_name,
                    description: "Serial Port".into(),
                    is_usb: false,
                    vid: None,
                    pid: None,
                    serial_number: None,
                },
            })
            .collect())
    }

    async fn open(&self, config: &SerialConfig) -> Result<SerialStreams, TransportError> {
        let open_err = |reason: String| TransportError::Open {
            key: config.port.clone(),
            reason,
        };
        let data_bits = match config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match config.stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        };
        let parity = match config.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        let flow_control = match config.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Rtscts => tokio_serial::FlowControl::Hardware,
            FlowControl::Xonxoff => tokio_serial::FlowControl::Software,
        };

        let stream = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .open_native_async()
            .map_err(|e| open_err(e.to_string()))?;
        let lines = tokio_serial::SerialPort::try_clone(&stream)
            .map_err(|e| open_err(format!("control handle: {e}")))?;
        let (reader, writer) = tokio::io::split(stream);

        Ok(SerialStreams {
            reader: Box::new(reader),
            writer: Box::new(writer),
            lines: Box::new(lines),
        })
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// An open serial device, keyed by its path.
///
/// `close` never waits on a stalled device: it fires the shutdown signal
/// first, and every read or write in flight resolves to `Closed`.
pub struct SerialPort {
    config: SerialConfig,
    read_timeout: Duration,
    reader: Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    writer: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    lines: std::sync::Mutex<Option<Box<dyn LineControl>>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl SerialPort {
    pub async fn open(
        backend: &dyn SerialBackend,
        config: SerialConfig,
    ) -> Result<Self, TransportError> {
        let streams = backend.open(&config).await?;
        Ok(Self::from_streams(config, streams))
    }

    pub fn from_streams(config: SerialConfig, streams: SerialStreams) -> Self {
        Self {
            read_timeout: Duration::from_millis(config.read_timeout_ms.max(1)),
            config,
            reader: Mutex::new(Some(streams.reader)),
            writer: Mutex::new(Some(streams.writer)),
            lines: std::sync::Mutex::new(Some(streams.lines)),
            closed: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
        }
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    pub fn set_dtr(&self, level: bool) -> Result<(), TransportError> {
        self.with_lines(|l| l.set_dtr(level))
    }

    pub fn set_rts(&self, level: bool) -> Result<(), TransportError> {
        self.with_lines(|l| l.set_rts(level))
    }

    fn with_lines(
        &self,
        f: impl FnOnce(&mut dyn LineControl) -> std::io::Result<()>,
    ) -> Result<(), TransportError> {
        let mut guard = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        let lines = guard.as_mut().ok_or(TransportError::Closed)?;
        Ok(f(lines.as_mut())?)
    }

    /// Resolves once `close` has been called.
    async fn closing(&self) {
        let mut rx = self.shutdown.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for SerialPort {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn key(&self) -> &str {
        &self.config.port
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let read = async {
            let mut guard = self.reader.lock().await;
            let reader = guard.as_mut().ok_or(TransportError::Closed)?;
            match tokio::time::timeout(self.read_timeout, reader.read(buf)).await {
                Err(_) => Ok(0),
                Ok(Ok(0)) if !buf.is_empty() => Err(TransportError::Closed),
                Ok(Ok(n)) => Ok(n),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
                Ok(Err(e)) => Err(e.into()),
            }
        };
        tokio::select! {
            r = read => r,
            _ = self.closing() => Err(TransportError::Closed),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let write = async {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(TransportError::Closed)?;
            writer.write_all(data).await?;
            writer.flush().await?;
            Ok(data.len())
        };
        // A device that stops draining (CTS low, stalled peer) must not
        // pin the writer lock past close.
        tokio::select! {
            r = write => r,
            _ = self.closing() => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.send_replace(true);
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).take();
        let release = async {
            let writer = self.writer.lock().await.take();
            if let Some(mut w) = writer {
                let _ = w.shutdown().await;
            }
            self.reader.lock().await.take();
        };
        if tokio::time::timeout(CLOSE_GRACE, release).await.is_err() {
            tracing::warn!(port = %self.config.port, "serial streams still busy after close");
        }
        tracing::debug!(port = %self.config.port, "serial port closed");
        Ok(())
    }
}
