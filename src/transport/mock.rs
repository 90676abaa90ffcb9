//! Scripted transport and manual clock for unit tests

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use super::{Clock, Transport};

/// In-memory transport: frames queued with [`MockTransport::push`] become
/// readable, frames written by the stack are recorded for inspection.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Rc<RefCell<MockInner>>,
}

#[derive(Default)]
struct MockInner {
    incoming: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    fail_writes: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame for the stack to read
    pub fn push(&self, frame: &[u8]) {
        self.inner.borrow_mut().incoming.push_back(frame.to_vec());
    }

    /// Every frame written so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.inner.borrow().written.clone()
    }

    pub fn last_written(&self) -> Option<Vec<u8>> {
        self.inner.borrow().written.last().cloned()
    }

    pub fn pending(&self) -> usize {
        self.inner.borrow().incoming.len()
    }

    pub fn clear_written(&self) {
        self.inner.borrow_mut().written.clear();
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.borrow_mut().fail_writes = fail;
    }
}

impl Transport for MockTransport {
    fn write(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }
        inner.written.push(frame.to_vec());
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.borrow_mut().incoming.pop_front() {
            Some(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(len)
            }
            None => Ok(0),
        }
    }

    fn has_data(&mut self) -> bool {
        !self.inner.borrow().incoming.is_empty()
    }
}

/// Clock that only moves when slept on or advanced by hand
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms.max(1));
    }
}
