//! Concrete transports: USB serial to the real board, TCP to the simulator.

use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::info;

use crate::link::{Connector, Transport};

/// Poll granularity for blocking reads; the deadline is enforced on top.
const READ_SLICE: Duration = Duration::from_millis(50);

/// The RP2040 resets when the port opens and needs a moment to boot.
const SERIAL_SETTLE: Duration = Duration::from_secs(2);

/// Unterminated input beyond this is noise; drop it.
const MAX_PENDING: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// First USB serial port matching vendor/product id.
    Discover { vendor_id: u16, product_id: u16 },
    Serial(String),
    Tcp(String),
}

impl Endpoint {
    /// `"auto"`, `"tcp://host:port"`, or a serial device path.
    pub fn parse(port: &str, vendor_id: u16, product_id: u16) -> Self {
        let port = port.trim();
        if port.eq_ignore_ascii_case("auto") {
            Endpoint::Discover {
                vendor_id,
                product_id,
            }
        } else if let Some(addr) = port.strip_prefix("tcp://") {
            Endpoint::Tcp(addr.to_string())
        } else {
            Endpoint::Serial(port.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Line buffering shared by both transports
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn take_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw);
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn read_line<R: Read>(&mut self, reader: &mut R, deadline: Instant) -> io::Result<Option<String>> {
        let mut chunk = [0u8; 256];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            match reader.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "device closed the connection",
                    ))
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    if self.pending.len() > MAX_PENDING && !self.pending.contains(&b'\n') {
                        self.pending.clear();
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Serial
// ---------------------------------------------------------------------------

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    buf: LineBuffer,
}

impl Transport for SerialTransport {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()
    }

    fn read_line(&mut self, deadline: Instant) -> io::Result<Option<String>> {
        self.buf.read_line(&mut self.port, deadline)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.buf.pending.clear();
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Locate the board by USB vendor/product id.
pub fn discover_port(vendor_id: u16, product_id: u16) -> io::Result<String> {
    let ports = serialport::available_ports().map_err(io::Error::from)?;
    ports
        .into_iter()
        .find(|p| {
            matches!(
                &p.port_type,
                SerialPortType::UsbPort(usb) if usb.vid == vendor_id && usb.pid == product_id
            )
        })
        .map(|p| p.port_name)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no USB serial device {vendor_id:04x}:{product_id:04x} found"),
            )
        })
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

pub struct TcpTransport {
    stream: TcpStream,
    buf: LineBuffer,
}

impl Transport for TcpTransport {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line.as_bytes());
        framed.push(b'\n');
        self.stream.write_all(&framed)?;
        self.stream.flush()
    }

    fn read_line(&mut self, deadline: Instant) -> io::Result<Option<String>> {
        self.buf.read_line(&mut self.stream, deadline)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.buf.pending.clear();
        self.stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 256];
        let result = loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => {
                    break Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "device closed the connection",
                    ))
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.stream.set_nonblocking(false)?;
        result
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

pub enum PortTransport {
    Serial(SerialTransport),
    Tcp(TcpTransport),
}

impl Transport for PortTransport {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        match self {
            PortTransport::Serial(t) => t.write_line(line),
            PortTransport::Tcp(t) => t.write_line(line),
        }
    }

    fn read_line(&mut self, deadline: Instant) -> io::Result<Option<String>> {
        match self {
            PortTransport::Serial(t) => t.read_line(deadline),
            PortTransport::Tcp(t) => t.read_line(deadline),
        }
    }

    fn discard_input(&mut self) -> io::Result<()> {
        match self {
            PortTransport::Serial(t) => t.discard_input(),
            PortTransport::Tcp(t) => t.discard_input(),
        }
    }
}

pub struct PortConnector {
    endpoint: Endpoint,
    baud_rate: u32,
    connect_timeout: Duration,
}

impl PortConnector {
    pub fn new(endpoint: Endpoint, baud_rate: u32, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            baud_rate,
            connect_timeout,
        }
    }

    fn open_serial(&self, path: &str) -> io::Result<PortTransport> {
        let port = serialport::new(path, self.baud_rate)
            .timeout(READ_SLICE)
            .open()
            .map_err(io::Error::from)?;
        info!(port = %path, baud = self.baud_rate, "serial port opened");
        std::thread::sleep(SERIAL_SETTLE);
        let mut transport = SerialTransport {
            port,
            buf: LineBuffer::default(),
        };
        transport.discard_input()?;
        Ok(PortTransport::Serial(transport))
    }

    fn open_tcp(&self, addr: &str) -> io::Result<PortTransport> {
        let target = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {addr}"))
        })?;
        let stream = TcpStream::connect_timeout(&target, self.connect_timeout)?;
        stream.set_read_timeout(Some(READ_SLICE))?;
        stream.set_nodelay(true)?;
        info!(%addr, "tcp link opened");
        Ok(PortTransport::Tcp(TcpTransport {
            stream,
            buf: LineBuffer::default(),
        }))
    }
}

impl Connector for PortConnector {
    type Transport = PortTransport;

    fn connect(&mut self) -> io::Result<PortTransport> {
        match &self.endpoint {
            Endpoint::Discover {
                vendor_id,
                product_id,
            } => {
                let path = discover_port(*vendor_id, *product_id)?;
                self.open_serial(&path)
            }
            Endpoint::Serial(path) => self.open_serial(path),
            Endpoint::Tcp(addr) => self.open_tcp(addr),
        }
    }

    fn describe(&self) -> String {
        match &self.endpoint {
            Endpoint::Discover {
                vendor_id,
                product_id,
            } => format!("usb {vendor_id:04x}:{product_id:04x}"),
            Endpoint::Serial(path) => path.clone(),
            Endpoint::Tcp(addr) => format!("tcp://{addr}"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
