//! Bounded capture of a server's stderr for postmortem diagnostics.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes of stderr retained per client.
pub const STDERR_CAPACITY: usize = 8 * 1024;

/// Fixed-capacity byte ring: writes past capacity evict the oldest bytes.
#[derive(Debug)]
pub struct StderrBuffer {
    data: Mutex<VecDeque<u8>>,
    capacity: usize,
}

impl StderrBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn write(&self, bytes: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        // Only the last `capacity` bytes of a large chunk can survive.
        let bytes = &bytes[bytes.len().saturating_sub(self.capacity)..];
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let overflow = (data.len() + bytes.len()).saturating_sub(self.capacity);
        data.drain(..overflow);
        data.extend(bytes);
    }

    /// Everything captured so far, lossily decoded.
    pub fn contents(&self) -> String {
        self.tail(self.capacity)
    }

    /// The last `max` bytes captured, lossily decoded.
    pub fn tail(&self, max: usize) -> String {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let skip = data.len().saturating_sub(max);
        let bytes: Vec<u8> = data.iter().skip(skip).copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `stream` into the buffer until EOF or a read error.
    pub async fn capture<R: AsyncRead + Unpin>(&self, mut stream: R) {
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => self.write(&chunk[..n]),
            }
        }
    }
}

impl Default for StderrBuffer {
    fn default() -> Self {
        Self::new(STDERR_CAPACITY)
    }
}
