use std::io;
use std::os::unix::io::RawFd;
use std::time::Instant;

use tracing::debug;

use crate::http::request::HttpRequest;
use crate::http::response::find_block_end;
use crate::server::spool::BodySpool;

/// Upper bound on a header block; anything longer is treated as malformed.
const MAX_HEADER_BYTES: usize = 32 * 1024;

/// Where the streaming request parser currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    ReadingHeaders,
    /// Headers parsed, body framing known; waiting for the loop to supply
    /// the effective body-size limit via [`Connection::begin_body`].
    HeadersComplete,
    ReadingSizedBody,
    ReadingChunkSize,
    ReadingChunkData,
    RequestComplete,
}

/// Coarse session phase, orthogonal to the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ReadRequest,
    CgiPending,
    WriteResponse,
}

/// One accepted client connection. Owns the socket descriptor; the fd is
/// closed when the session is dropped, on every exit path.
pub struct Connection {
    fd: RawFd,
    pub server_idx: usize,
    pub peer_addr: String,

    pub state: ConnectionState,
    pub parse_state: ParseState,
    buffer: Vec<u8>,
    pub request: Option<HttpRequest>,
    pub spool: Option<BodySpool>,

    declared_len: u64,
    received: u64,
    chunk_remaining: u64,
    chunked: bool,
    max_body: u64,

    pub over_limit: bool,
    pub bad_request: bool,
    pub stop_reading: bool,

    pub last_activity: Instant,
    pub write_buffer: Vec<u8>,
    pub bytes_written: usize,
    pub close_after_write: bool,
}

impl Connection {
    pub fn new(fd: RawFd, server_idx: usize, peer_addr: String) -> Self {
        Self {
            fd,
            server_idx,
            peer_addr,
            state: ConnectionState::ReadRequest,
            parse_state: ParseState::ReadingHeaders,
            buffer: Vec::with_capacity(8192),
            request: None,
            spool: None,
            declared_len: 0,
            received: 0,
            chunk_remaining: 0,
            chunked: false,
            max_body: u64::MAX,
            over_limit: false,
            bad_request: false,
            stop_reading: false,
            last_activity: Instant::now(),
            write_buffer: Vec::new(),
            bytes_written: 0,
            close_after_write: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn body_received(&self) -> u64 {
        self.received
    }

    /// Appends freshly read socket bytes and advances the parser as far as
    /// the data allows.
    pub fn feed(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.buffer.extend_from_slice(bytes);
        self.advance()
    }

    /// Runs the state machine until it needs more bytes, a limit decision,
    /// or the request is complete.
    pub fn advance(&mut self) -> io::Result<()> {
        loop {
            let before_state = self.parse_state;
            let before_len = self.buffer.len();

            match self.parse_state {
                ParseState::ReadingHeaders => self.advance_headers()?,
                ParseState::HeadersComplete => break,
                ParseState::ReadingSizedBody => self.advance_sized_body()?,
                ParseState::ReadingChunkSize => self.advance_chunk_size()?,
                ParseState::ReadingChunkData => self.advance_chunk_data()?,
                ParseState::RequestComplete => break,
            }

            if self.parse_state == before_state && self.buffer.len() == before_len {
                break;
            }
        }
        Ok(())
    }

    fn advance_headers(&mut self) -> io::Result<()> {
        let (_, sep_end) = match find_block_end(&self.buffer) {
            Some(found) => found,
            None => {
                if self.buffer.len() > MAX_HEADER_BYTES {
                    self.fail_request();
                }
                return Ok(());
            }
        };

        let request = match HttpRequest::parse(&self.buffer[..sep_end]) {
            Some(request) => request,
            None => {
                self.fail_request();
                return Ok(());
            }
        };
        self.buffer.drain(..sep_end);

        debug!(method = %request.method, uri = %request.uri, "headers complete");

        if request.expects_continue() {
            // Best-effort; a failed send here is the client's problem.
            let msg = b"HTTP/1.1 100 Continue\r\n\r\n";
            unsafe {
                libc::send(self.fd, msg.as_ptr() as *const libc::c_void, msg.len(), libc::MSG_NOSIGNAL);
            }
        }

        self.chunked = request.is_chunked();
        self.declared_len = request.content_length().unwrap_or(0);

        let has_body = self.chunked || self.declared_len > 0;
        self.request = Some(request);

        if has_body {
            self.spool = Some(BodySpool::create()?);
            self.parse_state = ParseState::HeadersComplete;
        } else {
            self.parse_state = ParseState::RequestComplete;
        }
        Ok(())
    }

    /// Called by the loop once the effective body-size limit is known.
    /// A declared length already past the limit short-circuits to a 413
    /// without consuming any body bytes.
    pub fn begin_body(&mut self, max_body: u64) -> io::Result<()> {
        debug_assert_eq!(self.parse_state, ParseState::HeadersComplete);

        if self.chunked {
            self.max_body = max_body;
            self.parse_state = ParseState::ReadingChunkSize;
        } else if self.declared_len > max_body {
            self.over_limit = true;
            self.stop_reading = true;
            self.spool = None;
            self.parse_state = ParseState::RequestComplete;
        } else {
            self.max_body = max_body;
            self.parse_state = ParseState::ReadingSizedBody;
        }
        self.advance()
    }

    fn advance_sized_body(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let wanted = (self.declared_len - self.received) as usize;
        let take = wanted.min(self.buffer.len());

        if self.received + take as u64 > self.max_body {
            self.over_limit = true;
            self.stop_reading = true;
            self.spool = None;
            self.parse_state = ParseState::RequestComplete;
            return Ok(());
        }

        if let Some(spool) = self.spool.as_mut() {
            spool.write_all(&self.buffer[..take])?;
        }
        self.received += take as u64;
        self.buffer.drain(..take);

        if self.received == self.declared_len {
            if let Some(spool) = self.spool.as_mut() {
                spool.finish()?;
            }
            self.parse_state = ParseState::RequestComplete;
        }
        Ok(())
    }

    fn advance_chunk_size(&mut self) -> io::Result<()> {
        let (line_end, skip) = match find_line_end(&self.buffer) {
            Some(found) => found,
            None => {
                if self.buffer.len() > MAX_HEADER_BYTES {
                    self.fail_request();
                }
                return Ok(());
            }
        };

        let line = String::from_utf8_lossy(&self.buffer[..line_end]).trim().to_string();
        if line.is_empty() {
            self.fail_request();
            return Ok(());
        }
        let hex = match line.split_once(';') {
            Some((size, _ext)) => size.trim(),
            None => line.as_str(),
        };
        let size = match u64::from_str_radix(hex, 16) {
            Ok(size) => size,
            Err(_) => {
                self.fail_request();
                return Ok(());
            }
        };

        if size == 0 {
            // Final chunk: do not consume the size line until the
            // terminating CRLF is also in the buffer.
            let after = &self.buffer[line_end + skip..];
            let consumed = if after.starts_with(b"\r\n") {
                2
            } else if after.starts_with(b"\n") {
                1
            } else if after.is_empty() || after == b"\r" {
                return Ok(());
            } else {
                self.fail_request();
                return Ok(());
            };
            self.buffer.drain(..line_end + skip + consumed);
            if let Some(spool) = self.spool.as_mut() {
                spool.finish()?;
            }
            self.parse_state = ParseState::RequestComplete;
            return Ok(());
        }

        if self.received + size > self.max_body {
            self.over_limit = true;
            self.stop_reading = true;
            self.spool = None;
            self.parse_state = ParseState::RequestComplete;
            return Ok(());
        }

        self.buffer.drain(..line_end + skip);
        self.chunk_remaining = size;
        self.parse_state = ParseState::ReadingChunkData;
        Ok(())
    }

    fn advance_chunk_data(&mut self) -> io::Result<()> {
        if self.chunk_remaining > 0 {
            if self.buffer.is_empty() {
                return Ok(());
            }
            let take = (self.chunk_remaining as usize).min(self.buffer.len());
            if let Some(spool) = self.spool.as_mut() {
                spool.write_all(&self.buffer[..take])?;
            }
            self.received += take as u64;
            self.chunk_remaining -= take as u64;
            self.buffer.drain(..take);
            if self.chunk_remaining > 0 {
                return Ok(());
            }
        }

        // Chunk data fully spooled; eat the trailing line break.
        if self.buffer.starts_with(b"\r\n") {
            self.buffer.drain(..2);
        } else if self.buffer.starts_with(b"\n") {
            self.buffer.drain(..1);
        } else if self.buffer.is_empty() || self.buffer == b"\r" {
            return Ok(());
        } else {
            self.fail_request();
            return Ok(());
        }
        self.parse_state = ParseState::ReadingChunkSize;
        Ok(())
    }

    fn fail_request(&mut self) {
        self.bad_request = true;
        self.stop_reading = true;
        self.spool = None;
        self.parse_state = ParseState::RequestComplete;
    }

    /// Queues a serialized response; the loop flips interest to WRITE.
    pub fn queue_response(&mut self, bytes: Vec<u8>, close_after: bool) {
        self.write_buffer = bytes;
        self.bytes_written = 0;
        self.close_after_write = close_after;
        self.state = ConnectionState::WriteResponse;
        self.touch();
    }

    pub fn write_done(&self) -> bool {
        self.bytes_written >= self.write_buffer.len()
    }

    /// Resets the session for the next request on a kept-alive connection.
    /// Bytes already buffered past the previous request remain and are
    /// parsed on the next [`Connection::advance`].
    pub fn reset_for_next_request(&mut self) {
        self.state = ConnectionState::ReadRequest;
        self.parse_state = ParseState::ReadingHeaders;
        self.request = None;
        self.spool = None;
        self.declared_len = 0;
        self.received = 0;
        self.chunk_remaining = 0;
        self.chunked = false;
        self.max_body = u64::MAX;
        self.over_limit = false;
        self.bad_request = false;
        self.stop_reading = false;
        self.write_buffer = Vec::new();
        self.bytes_written = 0;
        self.close_after_write = false;
        self.touch();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// Position of the first line terminator; returns (line length, terminator
/// length). Lone CR at end of buffer means "wait for more".
fn find_line_end(buffer: &[u8]) -> Option<(usize, usize)> {
    for (i, &b) in buffer.iter().enumerate() {
        if b == b'\n' {
            if i > 0 && buffer[i - 1] == b'\r' {
                return Some((i - 1, 2));
            }
            return Some((i, 1));
        }
    }
    None
}
