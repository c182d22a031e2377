//! Builder for the connection

use std::time::Duration;

use fe2o3_amqp_types::{
    definitions::{Fields, Milliseconds},
    performatives::{ChannelMax, MaxFrameSize, Open},
    primitives::Symbol,
    sasl::SaslCode,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
};
use tracing::debug;
use url::Url;

use crate::{
    frames::sasl,
    sasl_profile::{Negotiation, SaslProfile},
    transport::Transport,
};

use super::{
    engine::ConnectionEngine, wait_for_capabilities, Connection, ConnectionEvent,
    ConnectionEventHandler, ConnectionInner, ConnectionState, Error, OpenError,
};

/// Buffer capacity of the control channel
const DEFAULT_CONTROL_CHAN_BUF: usize = 128;

/// Default buffer capacity of the outgoing frame channel
const DEFAULT_OUTGOING_BUFFER_SIZE: usize = 2048;

/// The four deadline knobs of a connection.
///
/// Sessions inherit these values and may override them per session.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Bound on the wait for the remote Open
    pub open: Duration,

    /// Bound on the wait for the remote Close; firing forcibly shuts the
    /// transport
    pub close: Duration,

    /// Bound on every request/response exchange with the engine
    pub request: Duration,

    /// Bound on a send that is blocked on link credit
    pub send: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            open: Duration::from_secs(30),
            close: Duration::from_secs(30),
            request: Duration::from_secs(30),
            send: Duration::from_secs(30),
        }
    }
}

/// Builder for a [`Connection`]
pub struct Builder {
    container_id: Option<String>,
    hostname: Option<String>,
    max_frame_size: MaxFrameSize,
    channel_max: ChannelMax,
    idle_time_out: Option<Milliseconds>,
    offered_capabilities: Option<Vec<Symbol>>,
    desired_capabilities: Option<Vec<Symbol>>,
    properties: Option<Fields>,
    sasl_profile: Option<SaslProfile>,
    alt_hosts: Vec<Url>,
    timeouts: Timeouts,
    buffer_size: usize,
    on_connected: Option<ConnectionEventHandler>,
    on_failed: Option<ConnectionEventHandler>,

    #[cfg(feature = "rustls")]
    tls_connector: Option<tokio_rustls::TlsConnector>,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("container_id", &self.container_id)
            .field("hostname", &self.hostname)
            .field("max_frame_size", &self.max_frame_size)
            .field("channel_max", &self.channel_max)
            .finish()
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Creates a new builder with the default configuration
    pub fn new() -> Self {
        Self {
            container_id: None,
            hostname: None,
            max_frame_size: MaxFrameSize(65536),
            channel_max: ChannelMax::default(),
            idle_time_out: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
            sasl_profile: None,
            alt_hosts: Vec::new(),
            timeouts: Timeouts::default(),
            buffer_size: DEFAULT_OUTGOING_BUFFER_SIZE,
            on_connected: None,
            on_failed: None,

            #[cfg(feature = "rustls")]
            tls_connector: None,
        }
    }

    /// The id of the source container
    pub fn container_id(mut self, id: impl Into<String>) -> Self {
        self.container_id = Some(id.into());
        self
    }

    /// The name of the target host sent in the Open frame
    pub fn hostname(mut self, hostname: impl Into<Option<String>>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Proposed maximum frame size
    pub fn max_frame_size(mut self, max_frame_size: impl Into<MaxFrameSize>) -> Self {
        self.max_frame_size = max_frame_size.into();
        self
    }

    /// The maximum channel number that can be used on the connection
    pub fn channel_max(mut self, channel_max: impl Into<ChannelMax>) -> Self {
        self.channel_max = channel_max.into();
        self
    }

    /// Idle time-out in milliseconds announced to the peer
    pub fn idle_time_out(mut self, millis: impl Into<Milliseconds>) -> Self {
        self.idle_time_out = Some(millis.into());
        self
    }

    /// Extension capabilities the sender supports
    pub fn offered_capabilities(mut self, capabilities: Vec<Symbol>) -> Self {
        self.offered_capabilities = Some(capabilities);
        self
    }

    /// Extension capabilities the sender can use if the receiver supports
    /// them
    pub fn desired_capabilities(mut self, capabilities: Vec<Symbol>) -> Self {
        self.desired_capabilities = Some(capabilities);
        self
    }

    /// Connection properties
    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    /// SASL profile used for authentication.
    ///
    /// PLAIN credentials found in the url take effect only when no profile
    /// is set explicitly.
    pub fn sasl_profile(mut self, profile: impl Into<SaslProfile>) -> Self {
        self.sasl_profile = Some(profile.into());
        self
    }

    /// Alternative endpoints tried in order when the primary endpoint
    /// cannot be opened
    pub fn alt_hosts(mut self, hosts: Vec<Url>) -> Self {
        self.alt_hosts = hosts;
        self
    }

    /// Bound on the wait for the remote Open
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.open = timeout;
        self
    }

    /// Bound on the wait for the remote Close
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.close = timeout;
        self
    }

    /// Bound on every request/response exchange with the engine
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request = timeout;
        self
    }

    /// Bound on a send blocked on link credit
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.send = timeout;
        self
    }

    /// Capacity of the outgoing frame channel
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Handler invoked (on a dedicated dispatch task) when the Open frames
    /// have been exchanged
    pub fn on_connected(mut self, handler: impl Fn(ConnectionEvent) + Send + 'static) -> Self {
        self.on_connected = Some(Box::new(handler));
        self
    }

    /// Handler invoked (on a dedicated dispatch task) when the connection
    /// fails
    pub fn on_failed(mut self, handler: impl Fn(ConnectionEvent) + Send + 'static) -> Self {
        self.on_failed = Some(Box::new(handler));
        self
    }

    /// TLS connector used for "amqps" addresses
    #[cfg(feature = "rustls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls")))]
    pub fn tls_connector(mut self, connector: tokio_rustls::TlsConnector) -> Self {
        self.tls_connector = Some(connector);
        self
    }

    /// Opens a connection, waiting for the remote Open bounded by the open
    /// timeout.
    ///
    /// Alternative hosts are tried in order when the primary endpoint
    /// cannot be reached.
    pub async fn open(
        self,
        url: impl TryInto<Url, Error = url::ParseError>,
    ) -> Result<Connection, OpenError> {
        self.open_inner(url, true).await
    }

    /// Opens a connection without waiting for the remote Open.
    ///
    /// The remote Open is consumed by the engine loop; it resolves the
    /// connection's [`Capabilities`](super::Capabilities) and is bounded by
    /// the open timeout.
    pub async fn open_pipelined(
        self,
        url: impl TryInto<Url, Error = url::ParseError>,
    ) -> Result<Connection, OpenError> {
        self.open_inner(url, false).await
    }

    async fn open_inner(
        mut self,
        url: impl TryInto<Url, Error = url::ParseError>,
        wait_for_open: bool,
    ) -> Result<Connection, OpenError> {
        let url: Url = url.try_into()?;

        if self.sasl_profile.is_none() {
            if let Ok(profile) = SaslProfile::try_from(&url) {
                self.sasl_profile = Some(profile);
            }
        }

        let mut candidates = Vec::with_capacity(1 + self.alt_hosts.len());
        candidates.push(url);
        candidates.append(&mut self.alt_hosts.split_off(0));

        let events = self.spawn_event_dispatch();

        let mut last_error = OpenError::InvalidDomain;
        for (index, endpoint) in candidates.into_iter().enumerate() {
            match self
                .try_endpoint(&endpoint, wait_for_open, events.clone())
                .await
            {
                Ok(connection) => return Ok(connection),
                Err(error) => {
                    debug!(endpoint = %endpoint, attempt = index, error = ?error);
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    async fn try_endpoint(
        &self,
        url: &Url,
        wait_for_open: bool,
        events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    ) -> Result<Connection, OpenError> {
        let scheme = url.scheme();
        let host = url.host_str().ok_or(OpenError::InvalidDomain)?.to_string();

        match scheme {
            "amqp" => {
                let port = url.port().unwrap_or(fe2o3_amqp_types::definitions::PORT);
                let stream = TcpStream::connect((&host[..], port)).await?;
                self.open_with_stream_inner(stream, Some(host), wait_for_open, events)
                    .await
            }
            "amqps" => {
                #[cfg(not(feature = "rustls"))]
                {
                    Err(OpenError::TlsConnectorNotFound)
                }

                #[cfg(feature = "rustls")]
                {
                    let port = url
                        .port()
                        .unwrap_or(fe2o3_amqp_types::definitions::SECURE_PORT);
                    let stream = TcpStream::connect((&host[..], port)).await?;
                    let connector = match &self.tls_connector {
                        Some(connector) => connector.clone(),
                        None => default_rustls_connector(),
                    };
                    let tls_stream =
                        Transport::connect_tls_with_rustls(stream, &host, &connector).await?;
                    self.open_with_stream_inner(tls_stream, Some(host), wait_for_open, events)
                        .await
                }
            }
            _ => Err(OpenError::InvalidScheme),
        }
    }

    /// Opens a connection over an already-established transport stream,
    /// waiting for the remote Open
    pub async fn open_with_stream<Io>(mut self, stream: Io) -> Result<Connection, OpenError>
    where
        Io: AsyncRead + AsyncWrite + std::fmt::Debug + Send + Unpin + 'static,
    {
        let hostname = self.hostname.clone();
        let events = self.spawn_event_dispatch();
        self.open_with_stream_inner(stream, hostname, true, events)
            .await
    }

    /// Opens a connection over an already-established transport stream
    /// without waiting for the remote Open
    pub async fn open_pipelined_with_stream<Io>(
        mut self,
        stream: Io,
    ) -> Result<Connection, OpenError>
    where
        Io: AsyncRead + AsyncWrite + std::fmt::Debug + Send + Unpin + 'static,
    {
        let hostname = self.hostname.clone();
        let events = self.spawn_event_dispatch();
        self.open_with_stream_inner(stream, hostname, false, events)
            .await
    }

    async fn open_with_stream_inner<Io>(
        &self,
        stream: Io,
        hostname: Option<String>,
        wait_for_open: bool,
        events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    ) -> Result<Connection, OpenError>
    where
        Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let stream = match self.sasl_profile.clone() {
            Some(profile) => {
                negotiate_sasl(stream, hostname.as_deref(), profile).await?
            }
            None => stream,
        };

        let idle_timeout = self
            .idle_time_out
            .map(|millis| Duration::from_millis(millis as u64));
        let mut local_state = ConnectionState::Start;
        let transport =
            Transport::negotiate_amqp_header(stream, &mut local_state, idle_timeout).await?;

        let container_id = self
            .container_id
            .clone()
            .unwrap_or_else(|| format!("hematite-amqp-{}", uuid::Uuid::new_v4()));
        let local_open = Open {
            container_id,
            hostname: self.hostname.clone().or(hostname),
            max_frame_size: self.max_frame_size.clone(),
            channel_max: self.channel_max.clone(),
            idle_time_out: self.idle_time_out,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: self.offered_capabilities.clone().map(Into::into),
            desired_capabilities: self.desired_capabilities.clone().map(Into::into),
            properties: self.properties.clone(),
        };

        let (control_tx, control_rx) = mpsc::channel(DEFAULT_CONTROL_CHAN_BUF);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(self.buffer_size);

        let connection = ConnectionInner::new(local_state, local_open);
        let engine = ConnectionEngine::open_pipelined(
            transport,
            connection,
            control_rx,
            outgoing_rx,
            self.timeouts.open,
            self.timeouts.close,
            events,
        )
        .await?;
        let engine_handle = engine.spawn();

        let mut connection = Connection {
            control: control_tx,
            outgoing: outgoing_tx,
            engine_handle: Some(engine_handle),
            terminal: None,
            timeouts: self.timeouts,
            session_buffer_size: self.buffer_size,
            default_session: None,
            anonymous_sender: None,
        };

        if wait_for_open {
            match wait_for_capabilities(&connection.control, self.timeouts.open).await {
                Ok(_capabilities) => {}
                Err(Error::OperationTimedOut) => {
                    let _ = connection.close().await;
                    return Err(OpenError::OperationTimedOut);
                }
                Err(_) => {
                    // The engine stopped before the remote Open arrived;
                    // surface its recorded cause
                    return Err(match connection.close().await {
                        Err(Error::RemoteClosedWithError(err)) => {
                            OpenError::RemoteClosedWithError(err)
                        }
                        Err(Error::TransportError(err)) => OpenError::TransportError(err),
                        Err(Error::OperationTimedOut) => OpenError::OperationTimedOut,
                        Ok(()) | Err(_) => OpenError::RemoteClosed,
                    });
                }
            }
        }

        Ok(connection)
    }

    /// Spawns the event-dispatch task when any lifecycle handler is
    /// configured. Handlers run there, never on the engine loop.
    fn spawn_event_dispatch(&mut self) -> Option<mpsc::UnboundedSender<ConnectionEvent>> {
        if self.on_connected.is_none() && self.on_failed.is_none() {
            return None;
        }

        let on_connected = self.on_connected.take();
        let on_failed = self.on_failed.take();

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    event @ ConnectionEvent::Connected(_) => {
                        if let Some(handler) = &on_connected {
                            handler(event)
                        }
                    }
                    event @ ConnectionEvent::Failed(_) => {
                        if let Some(handler) = &on_failed {
                            handler(event)
                        }
                    }
                }
            }
        });
        Some(tx)
    }
}

async fn negotiate_sasl<Io>(
    stream: Io,
    hostname: Option<&str>,
    mut profile: SaslProfile,
) -> Result<Io, OpenError>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut transport: Transport<Io, sasl::Frame> =
        Transport::negotiate_sasl_header(stream).await?;

    loop {
        let frame = transport.next().await.ok_or_else(|| {
            OpenError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Waiting for SASL negotiation",
            ))
        })?;
        let frame = frame?;

        match profile
            .on_frame(frame, hostname)
            .map_err(crate::transport::error::NegotiationError::from)?
        {
            Negotiation::Init(init) => transport.send(sasl::Frame::Init(init)).await?,
            Negotiation::_Response(response) => {
                transport.send(sasl::Frame::Response(response)).await?
            }
            Negotiation::Outcome(outcome) => match outcome.code {
                SaslCode::Ok => break,
                code => {
                    return Err(OpenError::SaslError {
                        code,
                        additional_data: outcome.additional_data,
                    })
                }
            },
        }
    }

    Ok(transport.into_io())
}

#[cfg(feature = "rustls")]
fn default_rustls_connector() -> tokio_rustls::TlsConnector {
    use std::sync::Arc;

    let mut root_cert_store = librustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = librustls::ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::{Builder, Timeouts};

    #[test]
    fn default_timeouts_are_thirty_seconds() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.open.as_secs(), 30);
        assert_eq!(timeouts.close.as_secs(), 30);
        assert_eq!(timeouts.request.as_secs(), 30);
        assert_eq!(timeouts.send.as_secs(), 30);
    }

    #[test]
    fn builder_overrides_timeouts() {
        let builder = Builder::new()
            .open_timeout(std::time::Duration::from_millis(5))
            .send_timeout(std::time::Duration::from_millis(1));
        assert_eq!(builder.timeouts.open.as_millis(), 5);
        assert_eq!(builder.timeouts.send.as_millis(), 1);
    }
}
