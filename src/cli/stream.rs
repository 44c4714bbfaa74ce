//! Line framing for worker stdout and stderr.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of each read from the underlying pipe.
pub const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Splits a byte stream into newline-terminated lines.
///
/// Chunks may end anywhere, including inside a multi-byte character; the
/// incomplete tail is kept until its terminator arrives.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes, in order.
    ///
    /// Lines are returned without the `\n` and without a trailing `\r`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            if self.pending.last() == Some(&b'\r') {
                self.pending.pop();
            }
            lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            self.pending.clear();
            rest = &rest[pos + 1..];
        }

        self.pending.extend_from_slice(rest);
        lines
    }

    /// Bytes buffered for the current incomplete line.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// End of stream: drop the unterminated tail and return its length.
    pub fn finish(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

/// Adapt an async reader into a stream of complete lines.
///
/// The stream ends at EOF. A read error is yielded once and then the stream
/// ends. An unterminated trailing fragment is discarded.
pub fn framed_lines<R>(reader: R) -> impl futures_core::Stream<Item = std::io::Result<String>>
where
    R: AsyncRead + Unpin,
{
    struct State<R> {
        reader: R,
        framer: LineFramer,
        ready: std::collections::VecDeque<String>,
        buf: Vec<u8>,
        done: bool,
    }

    let state = State {
        reader,
        framer: LineFramer::new(),
        ready: std::collections::VecDeque::new(),
        buf: vec![0; READ_CHUNK_SIZE],
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.ready.pop_front() {
                return Some((Ok(line), state));
            }
            if state.done {
                return None;
            }
            match state.reader.read(&mut state.buf).await {
                Ok(0) => {
                    let dropped = state.framer.finish();
                    if dropped > 0 {
                        tracing::debug!(bytes = dropped, "Discarding unterminated trailing line");
                    }
                    state.done = true;
                }
                Ok(n) => {
                    let lines = state.framer.push(&state.buf[..n]);
                    state.ready.extend(lines);
                }
                Err(e) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
            }
        }
    })
}
