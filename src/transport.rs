//! Byte transport under an iSCSI connection
//!
//! A connection reads from one handle and writes through a second handle to
//! the same stream, so the reader thread never contends with writers.

use crate::digest::DigestType;
use crate::error::ScsiResult;
use crate::pdu::{self, ProtocolDataUnit};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

/// Blocking, cloneable byte stream
pub trait Transport: Read + Write + Send {
    /// A second handle to the same stream
    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>>;

    /// Close both directions; blocked readers return
    fn close(&self) -> io::Result<()>;

    /// Remote end, for logs
    fn peer(&self) -> String;
}

/// TCP transport
pub type TcpTransport = TcpStream;

impl Transport for TcpStream {
    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn close(&self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn peer(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    }
}

/// Open a TCP transport with the socket options iSCSI wants
pub fn connect(addr: SocketAddr, timeout: Option<Duration>) -> ScsiResult<TcpTransport> {
    let stream = match timeout {
        Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
        None => TcpStream::connect(addr)?,
    };
    stream.set_nodelay(true)?;
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;
    Ok(stream)
}

/// Read one PDU from a boxed transport
pub fn receive(transport: &mut dyn Transport, header_digest: DigestType, data_digest: DigestType) -> ScsiResult<ProtocolDataUnit> {
    let frame = pdu::read_frame(transport, header_digest, data_digest)?;
    ProtocolDataUnit::deserialize(&frame, header_digest, data_digest)
}

/// Write one PDU to a boxed transport
pub fn send(transport: &mut dyn Transport, pdu: &ProtocolDataUnit) -> ScsiResult<()> {
    pdu.write_to(transport)
}
