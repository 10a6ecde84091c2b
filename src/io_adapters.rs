use parking_lot::Mutex;
use std::io::{Result as IoResult, Write};
use std::sync::Arc;

/// Shared byte sink for prompts, default messages and handler output.
///
/// Cloning is cheap; every clone writes to the same underlying writer, one call at
/// a time.
#[derive(Clone)]
pub struct Output {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Output {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }
}

impl Write for Output {
    fn write(&mut self, data: &[u8]) -> IoResult<usize> {
        self.inner.lock().write(data)
    }

    fn write_all(&mut self, data: &[u8]) -> IoResult<()> {
        self.inner.lock().write_all(data)
    }

    fn flush(&mut self) -> IoResult<()> {
        self.inner.lock().flush()
    }
}

/// Memory-backed writer for capturing session output.
#[derive(Clone, Default)]
pub struct MemWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience: create writer and return (writer, handle to the collected bytes).
    pub fn with_handle() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let mw = MemWriter::new();
        let handle = Arc::clone(&mw.buf);
        (mw, handle)
    }

    /// Everything written so far, decoded lossily.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }
}

impl Write for MemWriter {
    fn write(&mut self, data: &[u8]) -> IoResult<usize> {
        self.buf.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_clones_share_writer() {
        let (mem, handle) = MemWriter::with_handle();
        let mut a = Output::new(mem);
        let mut b = a.clone();

        write!(a, "hello ").unwrap();
        write!(b, "world").unwrap();
        a.flush().unwrap();

        assert_eq!(&*handle.lock(), b"hello world");
    }
}
