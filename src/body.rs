use std::io::{self, Read};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::util::lock_unpoisoned;

/// A request body. Buffered bodies can be written any number of times, which
/// is what makes retries and redirects safe; a one-shot body can be consumed
/// exactly once and permanently disqualifies the request from replay.
#[derive(Clone)]
pub enum Body {
    Empty,
    Buffered(Bytes),
    OneShot(OneShotBody),
}

impl Body {
    pub fn empty() -> Self {
        Self::Empty
    }

    pub fn buffered(bytes: impl Into<Bytes>) -> Self {
        Self::Buffered(bytes.into())
    }

    /// Wraps a single-use stream. `length` of `None` means the transfer uses
    /// chunked encoding.
    pub fn one_shot(reader: impl Read + Send + 'static, length: Option<u64>) -> Self {
        Self::OneShot(OneShotBody {
            reader: Arc::new(Mutex::new(Some(Box::new(reader)))),
            length,
        })
    }

    pub fn is_replayable(&self) -> bool {
        !matches!(self, Self::OneShot(_))
    }

    /// The byte length to transfer, or `None` for chunked encoding.
    pub fn transfer_length(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Buffered(bytes) => Some(bytes.len() as u64),
            Self::OneShot(body) => body.length,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => formatter.write_str("Body::Empty"),
            Self::Buffered(bytes) => write!(formatter, "Body::Buffered({} bytes)", bytes.len()),
            Self::OneShot(body) => write!(formatter, "Body::OneShot(length={:?})", body.length),
        }
    }
}

#[derive(Clone)]
pub struct OneShotBody {
    reader: Arc<Mutex<Option<Box<dyn Read + Send>>>>,
    length: Option<u64>,
}

impl OneShotBody {
    /// Takes the underlying stream. Returns `None` on the second take.
    pub fn take_reader(&self) -> Option<Box<dyn Read + Send>> {
        lock_unpoisoned(&self.reader).take()
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// A response body stream. Dropping it closes the underlying stream and runs
/// any close hook the transfer stage attached (releasing the connection's
/// codec back to its allocation).
pub struct ResponseBody {
    reader: Box<dyn Read + Send>,
    length: Option<u64>,
    on_close: Option<CloseHook>,
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self::from_reader(io::empty(), Some(0))
    }

    pub fn buffered(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let length = bytes.len() as u64;
        Self::from_reader(io::Cursor::new(bytes), Some(length))
    }

    pub fn from_reader(reader: impl Read + Send + 'static, length: Option<u64>) -> Self {
        Self {
            reader: Box::new(reader),
            length,
            on_close: None,
        }
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub(crate) fn with_close_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        debug_assert!(self.on_close.is_none());
        self.on_close = Some(Box::new(hook));
        self
    }

    /// Reads the stream to completion.
    pub fn read_to_bytes(mut self) -> io::Result<Bytes> {
        let mut collected = match self.length {
            Some(length) => Vec::with_capacity(length.min(64 * 1024) as usize),
            None => Vec::new(),
        };
        self.reader.read_to_end(&mut collected)?;
        Ok(Bytes::from(collected))
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "ResponseBody(length={:?})", self.length)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::{Body, ResponseBody};

    #[test]
    fn buffered_body_is_replayable_with_known_length() {
        let body = Body::buffered("hello");
        assert!(body.is_replayable());
        assert_eq!(body.transfer_length(), Some(5));
    }

    #[test]
    fn one_shot_body_yields_its_reader_exactly_once() {
        let body = Body::one_shot(std::io::Cursor::new(b"stream".to_vec()), None);
        assert!(!body.is_replayable());
        assert_eq!(body.transfer_length(), None);

        let Body::OneShot(one_shot) = &body else {
            unreachable!()
        };
        let mut reader = one_shot.take_reader().expect("first take");
        let mut text = String::new();
        reader.read_to_string(&mut text).expect("read");
        assert_eq!(text, "stream");
        assert!(one_shot.take_reader().is_none());
    }

    #[test]
    fn response_body_close_hook_runs_on_drop() {
        let (sender, receiver) = std::sync::mpsc::channel();
        let body = ResponseBody::buffered("x").with_close_hook(move || {
            let _ = sender.send(());
        });
        drop(body);
        receiver.try_recv().expect("hook ran");
    }
}
