use std::io::{Read, Seek, SeekFrom, Write};

use crate::{ConsoleError, ConsoleResult};

/// Default in-memory threshold before the capture spills to disk.
pub const DEFAULT_SPILL_THRESHOLD: usize = 8 * 1024 * 1024;

/// Byte buffer that holds console output in memory up to a threshold and
/// then spills everything to an unlinked temp file. A day of serial output
/// from a wedged kernel can be large; it must not live in RAM.
pub struct CaptureBuffer {
    threshold: usize,
    memory: Vec<u8>,
    spill: Option<std::fs::File>,
    total: u64,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_SPILL_THRESHOLD)
    }

    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            threshold,
            memory: Vec::new(),
            spill: None,
            total: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn write(&mut self, bytes: &[u8]) -> ConsoleResult<()> {
        self.total += bytes.len() as u64;

        if let Some(file) = self.spill.as_mut() {
            return file
                .write_all(bytes)
                .map_err(|err| ConsoleError::Io(err.to_string()));
        }

        if self.memory.len() + bytes.len() <= self.threshold {
            self.memory.extend_from_slice(bytes);
            return Ok(());
        }

        let mut file = tempfile::tempfile().map_err(|err| ConsoleError::Io(err.to_string()))?;
        file.write_all(&self.memory)
            .map_err(|err| ConsoleError::Io(err.to_string()))?;
        file.write_all(bytes)
            .map_err(|err| ConsoleError::Io(err.to_string()))?;
        self.memory = Vec::new();
        self.spill = Some(file);
        Ok(())
    }

    /// Drain the buffer. After this the buffer is empty again.
    pub fn take(&mut self) -> ConsoleResult<Vec<u8>> {
        self.total = 0;
        if let Some(mut file) = self.spill.take() {
            let mut contents = Vec::new();
            file.seek(SeekFrom::Start(0))
                .map_err(|err| ConsoleError::Io(err.to_string()))?;
            file.read_to_end(&mut contents)
                .map_err(|err| ConsoleError::Io(err.to_string()))?;
            return Ok(contents);
        }
        Ok(std::mem::take(&mut self.memory))
    }
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::new()
    }
}
