//! Inbound Record Reassembly
//!
//! The peripheral notifies in arbitrary fragments. Records are
//! newline-terminated lines; this module glues fragments back together and
//! hands out complete, trimmed records in arrival order.

use tracing::{trace, warn};

/// Partial data kept between notifications before it is considered garbage.
pub const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Accumulates raw notification payloads into newline-delimited records.
///
/// Bytes are buffered rather than decoded per notification so a multi-byte
/// character split across two notifications still decodes correctly.
#[derive(Debug, Default)]
pub struct InboundReassembler {
    buffer: Vec<u8>,
}

impl InboundReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one notification and return every record it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut records = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..pos]);
            records.push(text.trim().to_string());
        }

        if self.buffer.len() > MAX_PENDING_BYTES {
            warn!(
                "Discarding {} bytes of unterminated inbound data",
                self.buffer.len()
            );
            self.buffer.clear();
        }

        if !self.buffer.is_empty() {
            trace!("{} bytes pending after notification", self.buffer.len());
        }
        records
    }

    /// Bytes of the current partial record.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Forget any partial record, e.g. after the link was lost.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Lets the host keep the process running while a record is processed.
///
/// Mobile hosts suspend apps shortly after a notification wakes them; the
/// returned [`BackgroundTask`] keeps the extension until it is dropped.
pub trait BackgroundExecution: Send + Sync {
    fn begin(&self, name: &str) -> BackgroundTask;
}

/// Scoped background-execution grant. Released exactly once, on drop.
pub struct BackgroundTask {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl BackgroundTask {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A grant with nothing to release.
    pub fn none() -> Self {
        Self { release: None }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Hosts that never suspend the process (desktop, CLI).
#[derive(Debug, Default, Clone, Copy)]
pub struct Unrestricted;

impl BackgroundExecution for Unrestricted {
    fn begin(&self, _name: &str) -> BackgroundTask {
        BackgroundTask::none()
    }
}
