//! Turning appended bytes into length-bounded lines.

use bytes::Bytes;

/// Stateful accumulator that cuts a byte stream into lines.
///
/// A line ends at `\n`, which is not part of the emitted line. If
/// `max_line_size` bytes pile up without a newline, they are emitted as a
/// line of their own (a forced split) and accumulation carries on, so no
/// emitted line is ever longer than `max_line_size`.
#[derive(Debug)]
pub struct LineSplitter {
    max_line_size: usize,
    partial: Vec<u8>,
}

impl LineSplitter {
    /// # Panics
    ///
    /// Panics if `max_line_size` is zero.
    pub fn new(max_line_size: usize) -> Self {
        assert!(max_line_size > 0, "max_line_size must be at least 1");

        LineSplitter {
            max_line_size,
            partial: Vec::new(),
        }
    }

    /// Returns the bytes of the trailing line that has not been terminated.
    pub fn partial(&self) -> &[u8] {
        &self.partial
    }

    /// Feeds `data` to the splitter, returning a lazy iterator over the
    /// lines it completes.
    ///
    /// Bytes the iterator does not get to (because it was dropped early)
    /// are discarded, so callers should drain it.
    pub fn split<'a>(&'a mut self, data: &'a [u8]) -> SplitLines<'a> {
        SplitLines {
            splitter: self,
            rest: data,
        }
    }

    /// Takes the pending partial line, if any.
    ///
    /// Used when the file ends or is replaced, so trailing content without
    /// a newline is not lost.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.partial.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> Bytes {
        let line = std::mem::replace(&mut self.partial, Vec::with_capacity(self.max_line_size));
        Bytes::from(line)
    }
}

/// Iterator returned by [`LineSplitter::split`].
#[derive(Debug)]
pub struct SplitLines<'a> {
    splitter: &'a mut LineSplitter,
    rest: &'a [u8],
}

impl<'a> Iterator for SplitLines<'a> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        let max = self.splitter.max_line_size;

        loop {
            if self.rest.is_empty() {
                return None;
            }

            let room = max - self.splitter.partial.len();
            if room == 0 {
                // A newline right after a full line still terminates it.
                if self.rest[0] == b'\n' {
                    self.rest = &self.rest[1..];
                }
                return Some(self.splitter.take());
            }

            let window = &self.rest[..room.min(self.rest.len())];
            match memchr::memchr(b'\n', window) {
                Some(idx) => {
                    self.splitter.partial.extend_from_slice(&window[..idx]);
                    self.rest = &self.rest[idx + 1..];
                    return Some(self.splitter.take());
                }
                None => {
                    self.splitter.partial.extend_from_slice(window);
                    self.rest = &self.rest[window.len()..];
                }
            }
        }
    }
}
