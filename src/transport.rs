//! TCP/TLS transport and HTTP/1.1 framing.
//!
//! One connection per invocation: resolve, TCP connect with keepalive,
//! large socket buffers and 300-second timeouts, an optional proxy
//! CONNECT tunnel with Basic credentials, then a TLS handshake.
//! [`Transport::exchange`] writes a full request and reads until the
//! response is completely consumed, handling both `Content-Length` and
//! chunked framing.
//!
//! # Buffer discipline
//! The response buffer grows in 1 MiB blocks and is parsed through index
//! cursors only; chunked bodies are compacted in place by sliding each
//! chunk's data over its size marker, so the assembled body is
//! contiguous when the final zero-size chunk arrives.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use base64::Engine as _;
use memchr::memmem;
use native_tls::{HandshakeError, TlsConnector, TlsStream};

use crate::config::{Config, ProxyConfig};
use crate::errors::TransportError;
use crate::progress::RateMeter;

/// Socket send/receive timeout.
const IO_TIMEOUT: Duration = Duration::from_secs(300);

/// Socket buffer size request.
const SOCKET_BUFFER: libc::c_int = 1024 * 1024;

/// Response buffer growth quantum.
const RESPONSE_BLOCK: usize = 1024 * 1024;

/// Read size per socket call.
const READ_CHUNK: usize = 4096;

/// An established TLS connection to the server (possibly tunneled).
pub struct Transport {
    stream: TlsStream<TcpStream>,
    verbosity: u8,
}

impl Transport {
    /// Resolves, connects, tunnels through the proxy when configured,
    /// and completes the TLS handshake.
    ///
    /// # Errors
    /// Resolution, connect, tunnel, or handshake failure.
    pub fn connect(config: &Config) -> Result<Self, TransportError> {
        let (dial_host, dial_port) = match &config.proxy {
            Some(proxy) => (proxy.host.as_str(), proxy.port),
            None => (config.host.as_str(), config.port),
        };

        let addrs = (dial_host, dial_port)
            .to_socket_addrs()
            .map_err(|source| TransportError::Resolve {
                host: dial_host.to_string(),
                source,
            })?;

        let mut tcp = None;
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(err) => last_error = Some(err),
            }
        }
        let mut tcp = tcp.ok_or_else(|| TransportError::Connect {
            host: dial_host.to_string(),
            source: last_error
                .unwrap_or_else(|| std::io::Error::other("no addresses resolved")),
        })?;

        configure_socket(&tcp)?;

        if let Some(proxy) = &config.proxy {
            tunnel(&mut tcp, config, proxy)?;
        }

        let connector = TlsConnector::new()?;
        let stream = connector.connect(&config.host, tcp).map_err(|err| match err {
            HandshakeError::Failure(err) => TransportError::Tls(err),
            HandshakeError::WouldBlock(_) => TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "TLS handshake stalled",
            )),
        })?;

        Ok(Self {
            stream,
            verbosity: config.verbosity,
        })
    }

    /// Writes the full request and reads the complete response body,
    /// header stripped.
    ///
    /// # Errors
    /// I/O failure, malformed chunking, or a non-2xx status.
    pub fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        if self.verbosity > 1 {
            eprintln!("{}\n", String::from_utf8_lossy(request));
        }
        self.stream.write_all(request)?;

        let mut parser = ResponseParser::new(false);
        let mut meter = RateMeter::new(self.verbosity);
        let mut chunk = [0u8; READ_CHUNK];
        while !parser.complete() {
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            parser.push(&chunk[..n])?;
            meter.tick(parser.received() as u64);
        }
        meter.finish();

        let (code, body) = parser.finish()?;
        if !(200..300).contains(&code) {
            return Err(TransportError::Http { code });
        }
        Ok(body)
    }
}

/// Applies keepalive, buffer sizes, and timeouts to the raw socket.
fn configure_socket(stream: &TcpStream) -> Result<(), TransportError> {
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    let fd = stream.as_raw_fd();
    for (option, value) in [
        (libc::SO_KEEPALIVE, 1),
        (libc::SO_SNDBUF, SOCKET_BUFFER),
        (libc::SO_RCVBUF, SOCKET_BUFFER),
    ] {
        // Buffer sizing is advisory; the kernel clamps out-of-range
        // values, and a refusal is not fatal to the transfer.
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                option,
                std::ptr::addr_of!(value).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
    Ok(())
}

/// Issues a CONNECT request and requires a 2xx answer before TLS.
fn tunnel(
    tcp: &mut TcpStream,
    config: &Config,
    proxy: &ProxyConfig,
) -> Result<(), TransportError> {
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = config.host_bracketed,
        port = config.port
    );
    if let Some(username) = &proxy.username {
        let credentials = format!("{username}:{}", proxy.password.as_deref().unwrap_or(""));
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");

    tcp.write_all(request.as_bytes())?;

    let mut parser = ResponseParser::new(true);
    let mut chunk = [0u8; READ_CHUNK];
    while !parser.complete() {
        let n = tcp.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        parser.push(&chunk[..n])?;
    }
    let (code, _) = parser.finish()?;
    if !(200..300).contains(&code) {
        return Err(TransportError::ProxyRefused { code });
    }
    Ok(())
}

/// Response framing, decided once the header is complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Framing {
    Unknown,
    /// Total buffer length at which the body is complete.
    Length { total: usize },
    Chunked,
}

/// Incremental HTTP/1.1 response parser over a growing buffer.
///
/// All positions are indices from the buffer base, so they stay valid
/// across reallocations.
#[derive(Debug)]
pub struct ResponseParser {
    buf: Vec<u8>,
    received: usize,
    head_only: bool,
    header_end: Option<usize>,
    status: u32,
    framing: Framing,
    body_start: usize,
    /// Chunked mode: index of the CRLF preceding the next size line;
    /// equally the end of compacted body data so far.
    marker: usize,
    finished: bool,
}

impl ResponseParser {
    /// `head_only` responses (CONNECT) are complete at the header.
    #[must_use]
    pub fn new(head_only: bool) -> Self {
        Self {
            buf: Vec::new(),
            received: 0,
            head_only,
            header_end: None,
            status: 0,
            framing: Framing::Unknown,
            body_start: 0,
            marker: 0,
            finished: false,
        }
    }

    /// Total bytes fed in so far.
    #[inline]
    #[must_use]
    pub fn received(&self) -> usize {
        self.received
    }

    /// True once the response is fully consumed.
    #[inline]
    #[must_use]
    pub fn complete(&self) -> bool {
        self.finished
    }

    /// Appends freshly read bytes and advances the parse.
    ///
    /// # Errors
    /// `MalformedChunking` on undecodable chunk framing.
    pub fn push(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.received += data.len();
        let needed = self.buf.len() + data.len();
        if needed > self.buf.capacity() {
            let target = needed.div_ceil(RESPONSE_BLOCK) * RESPONSE_BLOCK;
            self.buf.reserve_exact(target - self.buf.len());
        }
        self.buf.extend_from_slice(data);
        self.process()
    }

    fn process(&mut self) -> Result<(), TransportError> {
        if self.header_end.is_none() {
            // A previous chunked response may have left its final CRLF
            // in the stream.
            while self.buf.starts_with(b"\r\n") {
                self.buf.drain(..2);
            }
            let Some(at) = memmem::find(&self.buf, b"\r\n\r\n") else {
                return Ok(());
            };
            self.header_end = Some(at);
            self.status = parse_status(&self.buf);

            let header = &self.buf[..at + 4];
            if let Some(cl) = memmem::find(header, b"Content-Length: ") {
                let length = parse_decimal(&header[cl + 16..]);
                self.framing = Framing::Length { total: at + 4 + length };
                self.body_start = at + 4;
            } else {
                self.framing = Framing::Chunked;
                self.body_start = at + 2;
                self.marker = at + 2;
            }

            if self.head_only {
                self.finished = true;
                return Ok(());
            }
        }

        match self.framing {
            Framing::Unknown => Ok(()),
            Framing::Length { total } => {
                if self.buf.len() >= total {
                    self.finished = true;
                }
                Ok(())
            }
            Framing::Chunked => self.drain_chunks(),
        }
    }

    /// Splices chunk payloads over their size markers, in place.
    fn drain_chunks(&mut self) -> Result<(), TransportError> {
        while !self.finished {
            // The marker CRLF and a complete size line must be present.
            if self.marker + 2 > self.buf.len() {
                return Ok(());
            }
            if &self.buf[self.marker..self.marker + 2] != b"\r\n" {
                return Err(TransportError::MalformedChunking);
            }
            let Some(line_len) = memmem::find(&self.buf[self.marker + 2..], b"\r\n") else {
                return Ok(());
            };
            let size_line = &self.buf[self.marker + 2..self.marker + 2 + line_len];
            let chunk_size = parse_chunk_size(size_line)?;

            let data_begin = self.marker + 2 + line_len + 2;
            self.buf.copy_within(data_begin.., self.marker);
            self.buf.truncate(self.buf.len() - (data_begin - self.marker));

            if chunk_size == 0 {
                self.finished = true;
                return Ok(());
            }
            self.marker += chunk_size;
        }
        Ok(())
    }

    /// Returns the status code and the header-stripped body.
    ///
    /// # Errors
    /// Truncated responses: `MalformedChunking` for chunked bodies cut
    /// off mid-stream, an I/O error otherwise.
    pub fn finish(mut self) -> Result<(u32, Vec<u8>), TransportError> {
        let Some(_) = self.header_end else {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before response header",
            )));
        };
        if !self.finished {
            return match self.framing {
                Framing::Chunked => Err(TransportError::MalformedChunking),
                _ => Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-response",
                ))),
            };
        }

        if self.head_only {
            return Ok((self.status, Vec::new()));
        }

        match self.framing {
            Framing::Length { total } => {
                self.buf.truncate(total);
                self.buf.drain(..self.body_start);
            }
            Framing::Chunked => {
                self.buf.truncate(self.marker);
                self.buf.drain(..self.body_start);
            }
            Framing::Unknown => self.buf.clear(),
        }
        Ok((self.status, self.buf))
    }
}

/// Extracts the status code from `HTTP/1.x NNN ...`.
fn parse_status(buf: &[u8]) -> u32 {
    if !buf.starts_with(b"HTTP/1.") {
        return 0;
    }
    match memchr::memchr(b' ', buf) {
        Some(space) => parse_decimal(&buf[space + 1..]) as u32,
        None => 0,
    }
}

/// Parses a leading decimal run.
fn parse_decimal(data: &[u8]) -> usize {
    let mut value = 0usize;
    for &byte in data {
        if byte.is_ascii_digit() {
            value = value.saturating_mul(10).saturating_add((byte - b'0') as usize);
        } else {
            break;
        }
    }
    value
}

/// Parses a chunk size line: hex digits, optional `;extension`.
fn parse_chunk_size(line: &[u8]) -> Result<usize, TransportError> {
    let digits = line
        .iter()
        .take_while(|byte| byte.is_ascii_hexdigit())
        .count();
    if digits == 0 {
        return Err(TransportError::MalformedChunking);
    }
    let text = std::str::from_utf8(&line[..digits]).map_err(|_| TransportError::MalformedChunking)?;
    usize::from_str_radix(text, 16).map_err(|_| TransportError::MalformedChunking)
}
