//! Byte transport and time source
//!
//! The controller never touches a bus directly. It writes whole frames,
//! reads whole frames and asks whether a frame is pending; everything below
//! that (I2C addressing, IRQ lines, sockets) lives behind [`Transport`].

use std::io;
use std::time::{Duration, Instant};

mod tcp;

#[cfg(test)]
pub mod mock;

pub use tcp::TcpTransport;

/// Frame-oriented link to an NFC controller
pub trait Transport {
    /// Write one complete frame.
    fn write(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Read one complete frame into `buf`, returning its length.
    ///
    /// Only called after [`Transport::has_data`] returned true.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Whether a frame is waiting to be read.
    fn has_data(&mut self) -> bool;
}

/// Millisecond time source used for deadlines and poll cadence
pub trait Clock {
    /// Milliseconds elapsed since an arbitrary fixed origin
    fn now_ms(&self) -> u64;

    /// Yield for roughly `ms` milliseconds
    fn sleep_ms(&self, ms: u64);
}

/// Wall clock backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, frame: &[u8]) -> io::Result<()> {
        (**self).write(frame)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn has_data(&mut self) -> bool {
        (**self).has_data()
    }
}
