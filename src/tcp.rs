//! TCP and TLS transport with length-prefixed framing
//!
//! Every request and response is a single frame: a 4-byte big-endian length
//! followed by that many bytes. Between exchanges a background task holds
//! the stream and watches it, so a remote close or stray bytes on an idle
//! connection are reported right away and the pool stops handing it out.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;
use tokio::time;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::transport::{ConnectOptions, ConnectionEvent, ConnectionEvents, Transport};

pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<S: AsyncRead + AsyncWrite + Unpin + Send> Stream for S {}

#[derive(Clone)]
pub struct TcpTransport {
    tls: Option<TlsConnector>,
    server_name: Option<String>,
    nodelay: bool,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            tls: None,
            server_name: None,
            nodelay: true,
        }
    }

    /// TLS settings used for endpoints with `ssl` enabled
    pub fn with_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(TlsConnector::from(config));
        self
    }

    /// Name to present and verify during the TLS handshake instead of the
    /// endpoint host
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

enum Tls {
    Off,
    /// Requested for the endpoint, but the transport has no TLS config
    Unconfigured,
    On(TlsConnector, String),
}

struct Dial {
    host: String,
    port: u16,
    keep_alive: bool,
    nodelay: bool,
    tls: Tls,
}

impl Dial {
    async fn connect(self) -> io::Result<Box<dyn Stream>> {
        let tls = match self.tls {
            Tls::Off => None,
            Tls::Unconfigured => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "tls requested but the transport has no tls config",
                ));
            }
            Tls::On(ref connector, ref name) => {
                let server_name = ServerName::try_from(name.clone())
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
                Some((connector.clone(), server_name))
            }
        };

        let stream = self.connect_tcp().await?;
        let stream: Box<dyn Stream> = match tls {
            Some((connector, server_name)) => {
                Box::new(connector.connect(server_name, stream).await?)
            }
            None => Box::new(stream),
        };
        Ok(stream)
    }

    async fn connect_tcp(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host((self.host.as_str(), self.port)).await? {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_keepalive(self.keep_alive)?;
            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(self.nodelay)?;
                    return Ok(stream);
                }
                Err(err) => {
                    debug!(%addr, %err, "connect attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        }))
    }
}

struct ConnectionInner {
    stream: Mutex<Option<Box<dyn Stream>>>,
    /// Signalled by an exchange that wants the stream back from the watcher
    wanted: Notify,
    events: ConnectionEvents,
    timeout: Option<Duration>,
}

impl ConnectionInner {
    fn new(events: ConnectionEvents, timeout: Option<Duration>) -> Self {
        Self {
            stream: Mutex::new(None),
            wanted: Notify::new(),
            events,
            timeout,
        }
    }

    /// Connect, then watch the stream while it is idle
    async fn run(self: Arc<Self>, dial: Dial) {
        if self.establish(dial).await {
            self.watch_idle().await;
        }
    }

    async fn establish(&self, dial: Dial) -> bool {
        let outcome = match self.timeout {
            Some(limit) => time::timeout(limit, dial.connect()).await.ok(),
            None => Some(dial.connect().await),
        };
        match outcome {
            Some(Ok(stream)) => {
                *self.stream.lock().await = Some(stream);
                self.events.emit(ConnectionEvent::Connect);
                true
            }
            Some(Err(err)) => {
                self.events.emit(ConnectionEvent::Error(Arc::new(err)));
                false
            }
            None => {
                self.events.emit(ConnectionEvent::Timeout);
                false
            }
        }
    }

    /// Hold the stream between exchanges. A pending read notices the peer
    /// closing; any byte arriving while no request is out is a protocol
    /// violation. The lock is handed over whenever an exchange asks for it.
    async fn watch_idle(&self) {
        let mut byte = [0u8; 1];
        loop {
            let mut stream = self.stream.lock().await;
            let Some(open) = stream.as_mut() else {
                return;
            };
            let read = tokio::select! {
                biased;
                _ = self.wanted.notified() => None,
                read = open.read(&mut byte) => Some(read),
            };
            // the tokio mutex is fair, so the exchange that asked runs before
            // this task gets the stream again
            let Some(read) = read else {
                continue;
            };

            *stream = None;
            match read {
                Ok(0) => {
                    debug!(connection = self.events.connection_id(), "closed while idle");
                    self.events.emit(ConnectionEvent::Close);
                }
                Ok(_) => {
                    let err = io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected data on idle connection",
                    );
                    self.events.emit(ConnectionEvent::Error(Arc::new(err)));
                }
                Err(err) => self.report(&err),
            }
            return;
        }
    }

    /// Translate an I/O failure into the matching lifecycle event. Only a
    /// configured timeout produces a timeout event; a timed out socket
    /// without one is an ordinary error.
    fn report(&self, err: &io::Error) {
        use io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut if self.timeout.is_some() => {
                self.events.emit(ConnectionEvent::Timeout)
            }
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionAborted => self.events.emit(ConnectionEvent::Close),
            _ => self
                .events
                .emit(ConnectionEvent::Error(Arc::new(io::Error::new(
                    err.kind(),
                    err.to_string(),
                )))),
        }
    }
}

/// Handle to one pooled TCP (or TLS) connection
pub struct TcpConnection {
    inner: Arc<ConnectionInner>,
    /// Connects, then watches the idle stream
    task: AbortHandle,
}

impl TcpConnection {
    /// Send one request frame and read one response frame. Only one exchange
    /// runs at a time; a failed exchange leaves the connection closed, as does
    /// calling this on a connection that is no longer open.
    pub async fn round_trip(&self, request: &[u8]) -> io::Result<Vec<u8>> {
        if request.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request frame too large",
            ));
        }

        self.inner.wanted.notify_one();
        let mut stream = self.inner.stream.lock().await;
        let Some(open) = stream.as_mut() else {
            self.inner.events.emit(ConnectionEvent::Close);
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is not open",
            ));
        };
        let outcome = match self.inner.timeout {
            Some(limit) => time::timeout(limit, exchange(open, request))
                .await
                .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into())),
            None => exchange(open, request).await,
        };
        if let Err(err) = &outcome {
            *stream = None;
            self.inner.report(err);
        }
        outcome
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn exchange(stream: &mut Box<dyn Stream>, request: &[u8]) -> io::Result<Vec<u8>> {
    // length fits, checked against MAX_FRAME_SIZE by the caller
    stream.write_u32(request.len() as u32).await?;
    stream.write_all(request).await?;
    stream.flush().await?;

    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("response frame of {len} bytes exceeds {MAX_FRAME_SIZE}"),
        ));
    }
    let mut response = vec![0; len];
    stream.read_exact(&mut response).await?;
    Ok(response)
}

impl Transport for TcpTransport {
    type Handle = TcpConnection;

    fn open(&self, options: ConnectOptions<'_>, events: ConnectionEvents) -> TcpConnection {
        let endpoint = options.endpoint;
        let tls = match (&self.tls, options.secure) {
            (_, false) => Tls::Off,
            (None, true) => Tls::Unconfigured,
            (Some(connector), true) => {
                let name = self
                    .server_name
                    .clone()
                    .unwrap_or_else(|| endpoint.host.clone());
                Tls::On(connector.clone(), name)
            }
        };
        let dial = Dial {
            host: endpoint.host.clone(),
            port: endpoint.port,
            keep_alive: options.keep_alive,
            nodelay: self.nodelay,
            tls,
        };

        let inner = Arc::new(ConnectionInner::new(events, options.timeout));
        let task = tokio::spawn(Arc::clone(&inner).run(dial));
        TcpConnection {
            inner,
            task: task.abort_handle(),
        }
    }

    fn end(&self, connection: &TcpConnection) {
        connection.task.abort();
        // a stream still held by the watcher closes when the handle is dropped
        if let Ok(mut stream) = connection.inner.stream.try_lock() {
            stream.take();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ConnectionError;
    use crate::lease::LeaseRecord;

    fn connection_inner(
        watch_timeouts: bool,
        timeout: Option<Duration>,
    ) -> (Arc<LeaseRecord>, ConnectionInner) {
        let record = Arc::new(LeaseRecord::new(0, watch_timeouts));
        let events = ConnectionEvents::new(Arc::clone(&record));
        (record, ConnectionInner::new(events, timeout))
    }

    #[test]
    fn socket_timeout_without_configured_timeout_is_an_error() {
        let (record, inner) = connection_inner(false, None);
        inner.report(&io::ErrorKind::TimedOut.into());
        assert!(record.is_ended());
        assert!(matches!(
            record.fault(),
            Some(ConnectionError::Transport(ref err)) if err.kind() == io::ErrorKind::TimedOut
        ));
    }

    #[test]
    fn configured_timeout_is_reported_as_timeout() {
        let (record, inner) = connection_inner(true, Some(Duration::from_secs(1)));
        inner.report(&io::ErrorKind::TimedOut.into());
        assert!(matches!(record.fault(), Some(ConnectionError::Timeout)));
    }

    #[test]
    fn reset_is_reported_as_close() {
        let (record, inner) = connection_inner(false, None);
        inner.report(&io::ErrorKind::ConnectionReset.into());
        assert!(matches!(record.fault(), Some(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn exchange_on_closed_stream_ends_the_connection() {
        let (record, inner) = connection_inner(false, None);
        let connection = TcpConnection {
            inner: Arc::new(inner),
            task: tokio::spawn(async {}).abort_handle(),
        };

        let err = connection.round_trip(b"ping").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(record.is_ended());
        assert!(matches!(record.fault(), Some(ConnectionError::Closed)));
    }
}
