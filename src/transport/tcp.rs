//! NCI over a TCP socket
//!
//! Host-side NFC controller simulators expose the NCI byte stream on a
//! plain TCP port. Frames are delimited by their own 3-byte header, so the
//! reader pulls the header first and then exactly `len` payload bytes.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use log::debug;

use super::Transport;
use crate::nci::frame::HEADER_SIZE;

/// Transport over a connected TCP stream
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connect to an NCI endpoint such as `127.0.0.1:7000`
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        debug!("Connected NCI transport to {:?}", stream.peer_addr().ok());
        Ok(Self { stream })
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, frame: &[u8]) -> io::Result<()> {
        self.stream.write_all(frame)?;
        self.stream.flush()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut header = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut header)?;
        let total = HEADER_SIZE + header[2] as usize;
        if buf.len() < total {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds receive buffer of {}", total, buf.len()),
            ));
        }
        buf[..HEADER_SIZE].copy_from_slice(&header);
        self.stream.read_exact(&mut buf[HEADER_SIZE..total])?;
        Ok(total)
    }

    fn has_data(&mut self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut peeked = [0u8; 1];
        let pending = matches!(self.stream.peek(&mut peeked), Ok(n) if n > 0);
        let _ = self.stream.set_nonblocking(false);
        pending
    }
}
