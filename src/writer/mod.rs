//! Response writing.
//!
//! Handlers write complete HTTP/1.x messages as raw bytes. The
//! [`ResponseInterceptor`] recovers the header block from that stream, applies
//! the [`HeaderPolicy`] and hands a structured head to a [`ResponseSink`].

pub mod frame;
pub mod policy;
pub mod response;

pub use frame::FrameState;
pub use policy::{EvalContext, HeaderOp, HeaderPolicy, SecureCookies};
pub use response::{HijackedStream, ResponseInterceptor};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::Full;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::GatewayError;

/// A connection taken over from the HTTP server.
pub trait RawConnection: Read + Write + Send {
    fn close(&mut self) -> io::Result<()>;
}

impl RawConnection for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Structured response target behind the interceptor.
pub trait ResponseSink {
    type Conn: RawConnection;

    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Emit the head. Called at most once.
    fn write_head(&mut self, status: StatusCode) -> io::Result<()>;

    fn write_body(&mut self, bytes: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()>;

    /// Take over the underlying connection.
    fn hijack(&mut self) -> Result<Self::Conn, GatewayError>;
}

/// Connection type of sinks that cannot be hijacked.
#[derive(Debug)]
pub enum NotHijackable {}

impl Read for NotHijackable {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        match *self {}
    }
}

impl Write for NotHijackable {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        match *self {}
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {}
    }
}

impl RawConnection for NotHijackable {
    fn close(&mut self) -> io::Result<()> {
        match *self {}
    }
}

/// A raw connection shared between the hijacked reader and the interceptor.
pub struct SharedConn<C>(Arc<Mutex<C>>);

impl<C> Clone for SharedConn<C> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<C: RawConnection> SharedConn<C> {
    pub fn new(conn: C) -> Self {
        Self(Arc::new(Mutex::new(conn)))
    }

    pub fn lock(&self) -> io::Result<MutexGuard<'_, C>> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "connection lock poisoned"))
    }

    pub fn close(&self) -> io::Result<()> {
        self.lock()?.close()
    }
}

impl<C: RawConnection> Read for SharedConn<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.lock()?.read(buf)
    }
}

impl<C: RawConnection> Write for SharedConn<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

/// Sink collecting the response for the hyper server.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_response(self) -> http::Response<Full<Bytes>> {
        let mut response = http::Response::new(Full::new(Bytes::from(self.body)));
        *response.status_mut() = self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        *response.headers_mut() = self.headers;
        response
    }
}

impl ResponseSink for BufferedResponse {
    type Conn = NotHijackable;

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_head(&mut self, status: StatusCode) -> io::Result<()> {
        self.status = Some(status);
        Ok(())
    }

    fn write_body(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn hijack(&mut self) -> Result<Self::Conn, GatewayError> {
        Err(GatewayError::NotHijackable)
    }
}
