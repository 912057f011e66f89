//! The response interceptor.

use http::header::HeaderValue;
use http::StatusCode;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::sync::Arc;
use tracing::{debug, warn};

use super::frame::{FrameBuffer, FrameState, HeaderBlock, MAX_HEAD_BYTES};
use super::policy::{EvalContext, HeaderPolicy};
use super::{ResponseSink, SharedConn};
use crate::errors::{ErrorKind, GatewayError, ERROR_HEADER};

/// `io::Write` adapter that turns a raw HTTP/1.x response byte stream into a
/// structured response on `S`.
///
/// The head is held back until the blank line ending the header block was
/// written, then the header policy is applied and the head committed exactly
/// once. Everything after it is forwarded as body.
pub struct ResponseInterceptor<S: ResponseSink> {
    sink: S,
    policy: Arc<HeaderPolicy>,
    eval_ctx: Option<EvalContext>,
    frame: FrameBuffer,
    state: FrameState,
    hijacked: Option<SharedConn<S::Conn>>,
    conn_closed: bool,
    /// Head exceeded `MAX_HEAD_BYTES`; later writes are discarded.
    head_overflow: bool,
    status_code: Option<StatusCode>,
    raw_bytes: usize,
    body_bytes: usize,
}

impl<S: ResponseSink> ResponseInterceptor<S> {
    pub fn new(sink: S, policy: Arc<HeaderPolicy>) -> Self {
        Self {
            sink,
            policy,
            eval_ctx: None,
            frame: FrameBuffer::new(),
            state: FrameState::AwaitingStatusLine,
            hijacked: None,
            conn_closed: false,
            head_overflow: false,
            status_code: None,
            raw_bytes: 0,
            body_bytes: 0,
        }
    }

    /// Context for `${...}` expressions in header modifiers.
    pub fn with_eval_context(mut self, ctx: EvalContext) -> Self {
        self.eval_ctx = Some(ctx);
        self
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.state, FrameState::Committed | FrameState::Streaming)
    }

    /// Status written to the client; `None` before commit.
    pub fn status_code(&self) -> Option<StatusCode> {
        self.status_code
    }

    /// Bytes forwarded as response body.
    pub fn body_bytes(&self) -> usize {
        self.body_bytes
    }

    /// All bytes written by the handler, head included.
    pub fn raw_bytes(&self) -> usize {
        self.raw_bytes
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Headers that will be committed with the head.
    pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
        self.sink.headers_mut()
    }

    /// Commit the head with an explicit status. No-op once committed.
    pub fn write_header(&mut self, status: StatusCode) -> io::Result<()> {
        self.commit(Some(status))
    }

    /// Take over the connection.
    ///
    /// Reads on the returned stream come from the raw connection; writes go
    /// through this interceptor, so a head written by the upgrade handler is
    /// still framed and gets the header policy.
    pub fn hijack(&mut self) -> Result<HijackedStream<'_, S>, GatewayError> {
        let conn = SharedConn::new(self.sink.hijack()?);
        self.hijacked = Some(conn.clone());
        debug!("Connection hijacked");

        Ok(HijackedStream {
            reader: BufReader::new(conn.clone()),
            writer: BufWriter::new(self),
            conn,
        })
    }

    /// Commit whatever head was buffered and return the sink.
    pub fn finish(mut self) -> S {
        if !self.is_committed() {
            let block = self.frame.take();
            if let Err(e) = self.commit_block(block) {
                warn!(error = %e, "Failed to commit response head");
            }
        }
        if let Err(e) = Write::flush(&mut self) {
            debug!(error = %e, "Failed to flush response");
        }
        self.sink
    }

    fn commit_block(&mut self, block: HeaderBlock) -> io::Result<()> {
        let fields = block.headers();
        let headers = self.sink.headers_mut();
        for (name, _) in &fields {
            headers.remove(name);
        }
        for (name, value) in fields {
            headers.append(name, value);
        }

        self.commit(block.status_code())?;

        if !block.body.is_empty() {
            self.forward_all(&block.body)?;
        }
        Ok(())
    }

    fn commit(&mut self, status: Option<StatusCode>) -> io::Result<()> {
        if self.is_committed() {
            return Ok(());
        }
        self.state = FrameState::Committed;

        self.policy.configure(self.sink.headers_mut());
        self.policy
            .apply_modifiers(self.sink.headers_mut(), self.eval_ctx.as_ref());

        let status = match status {
            Some(status) => status,
            None => {
                self.sink.headers_mut().insert(
                    ERROR_HEADER,
                    HeaderValue::from_static(ErrorKind::Server.code()),
                );
                ErrorKind::Server.status()
            }
        };
        self.status_code = Some(status);

        match self.hijacked.clone() {
            Some(conn) => {
                let mut head = format!(
                    "HTTP/1.1 {} {}\r\n",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("")
                )
                .into_bytes();
                for (name, value) in self.sink.headers_mut().iter() {
                    head.extend_from_slice(name.as_str().as_bytes());
                    head.extend_from_slice(b": ");
                    head.extend_from_slice(value.as_bytes());
                    head.extend_from_slice(b"\r\n");
                }
                head.extend_from_slice(b"\r\n");
                self.write_conn(&conn, &head).map(|_| ())
            }
            None => self.sink.write_head(status),
        }
    }

    fn forward(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let n = match self.hijacked.clone() {
            Some(conn) => self.write_conn(&conn, bytes)?,
            None => self.sink.write_body(bytes)?,
        };
        self.body_bytes += n;
        if n > 0 {
            self.state = FrameState::Streaming;
        }
        Ok(n)
    }

    fn forward_all(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            let n = self.forward(bytes)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "failed to write body"));
            }
            bytes = &bytes[n..];
        }
        Ok(())
    }

    /// Write onto the hijacked connection. A failure closes it for good.
    fn write_conn(&mut self, conn: &SharedConn<S::Conn>, bytes: &[u8]) -> io::Result<usize> {
        if self.conn_closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "hijacked connection closed",
            ));
        }

        let result = conn.lock().and_then(|mut c| c.write_all(bytes));
        match result {
            Ok(()) => Ok(bytes.len()),
            Err(e) => {
                warn!(error = %e, "Write to hijacked connection failed, closing");
                self.conn_closed = true;
                if let Err(close_err) = conn.close() {
                    debug!(error = %close_err, "Failed to close hijacked connection");
                }
                Err(e)
            }
        }
    }
}

impl<S: ResponseSink> Write for ResponseInterceptor<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.raw_bytes += buf.len();
        if self.head_overflow {
            return Ok(buf.len());
        }

        match self.state {
            FrameState::AwaitingStatusLine | FrameState::BufferingHeaders => {
                match self.frame.push(buf) {
                    Some(block) => self.commit_block(block)?,
                    None if self.frame.len() > MAX_HEAD_BYTES => {
                        warn!(
                            buffered = self.frame.len(),
                            limit = MAX_HEAD_BYTES,
                            "Response head too large, sending server error"
                        );
                        self.frame = FrameBuffer::new();
                        self.head_overflow = true;
                        self.commit(None)?;
                    }
                    None => self.state = self.frame.state(),
                }
                Ok(buf.len())
            }
            FrameState::Committed | FrameState::Streaming => self.forward(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.hijacked.clone() {
            Some(conn) if !self.conn_closed => conn.lock()?.flush(),
            Some(_) => Ok(()),
            None => self.sink.flush(),
        }
    }
}

/// Duplex stream over a hijacked connection.
pub struct HijackedStream<'a, S: ResponseSink> {
    reader: BufReader<SharedConn<S::Conn>>,
    writer: BufWriter<&'a mut ResponseInterceptor<S>>,
    conn: SharedConn<S::Conn>,
}

impl<S: ResponseSink> HijackedStream<'_, S> {
    /// Handle to the raw connection.
    pub fn connection(&self) -> SharedConn<S::Conn> {
        self.conn.clone()
    }
}

impl<S: ResponseSink> Read for HijackedStream<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl<S: ResponseSink> BufRead for HijackedStream<'_, S> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt)
    }
}

impl<S: ResponseSink> Write for HijackedStream<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
