//! The process-wide container of connections

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use crate::{
    connection::{builder::Timeouts, Builder, Connection, OpenError},
    control::ConnectionControl,
    sasl_profile::SaslProfile,
};

/// A container of connections.
///
/// The client holds the container-id and the default deadlines every
/// connection it opens inherits. Closing the client closes every owned
/// connection.
///
/// ```rust,ignore
/// let client = Client::new("my-app");
/// let mut connection = client.connect("amqp://localhost:5672").await?;
/// ```
pub struct Client {
    container_id: String,
    timeouts: Timeouts,
    sasl_profile: Option<SaslProfile>,

    /// Control channels of every connection this client opened
    connections: Mutex<Vec<mpsc::Sender<ConnectionControl>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("container_id", &self.container_id)
            .finish()
    }
}

impl Client {
    /// Creates a client with the given container-id and default
    /// configuration
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            timeouts: Timeouts::default(),
            sasl_profile: None,
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Creates a builder for [`Client`]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The container-id stamped on every connection's Open frame
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// A connection builder pre-seeded with this client's container-id and
    /// defaults
    pub fn connection_builder(&self) -> Builder {
        let mut builder = Connection::builder()
            .container_id(self.container_id.clone())
            .open_timeout(self.timeouts.open)
            .close_timeout(self.timeouts.close)
            .request_timeout(self.timeouts.request)
            .send_timeout(self.timeouts.send);
        if let Some(profile) = self.sasl_profile.clone() {
            builder = builder.sasl_profile(profile);
        }
        builder
    }

    /// Opens a connection to the given url
    pub async fn connect(
        &self,
        url: impl TryInto<Url, Error = url::ParseError>,
    ) -> Result<Connection, OpenError> {
        let connection = self.connection_builder().open(url).await?;
        self.adopt(&connection);
        Ok(connection)
    }

    /// Opens a connection over an already-established stream
    pub async fn connect_with_stream<Io>(&self, stream: Io) -> Result<Connection, OpenError>
    where
        Io: tokio::io::AsyncRead + tokio::io::AsyncWrite + std::fmt::Debug + Send + Unpin + 'static,
    {
        let connection = self.connection_builder().open_with_stream(stream).await?;
        self.adopt(&connection);
        Ok(connection)
    }

    fn adopt(&self, connection: &Connection) {
        self.connections.lock().push(connection.control.clone());
    }

    /// Closes every connection this client opened.
    ///
    /// Idempotent; connections already closed are skipped. The terminal
    /// outcome of each connection is observed through its own handle.
    pub async fn close(&self) {
        let controls: Vec<_> = self.connections.lock().drain(..).collect();
        for control in controls {
            let _ = control.send(ConnectionControl::Close(None)).await;
        }
    }
}

/// Builder for a [`Client`]
#[derive(Debug, Default)]
pub struct ClientBuilder {
    container_id: Option<String>,
    timeouts: Timeouts,
    sasl_profile: Option<SaslProfile>,
}

impl ClientBuilder {
    /// Creates a new builder with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// The container-id; generated from a uuid when absent
    pub fn container_id(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    /// Default bound on the wait for remote Opens
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.open = timeout;
        self
    }

    /// Default bound on the wait for remote Closes
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.close = timeout;
        self
    }

    /// Default bound on request/response exchanges
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request = timeout;
        self
    }

    /// Default bound on sends blocked on link credit
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.send = timeout;
        self
    }

    /// SASL profile used by every connection
    pub fn sasl_profile(mut self, profile: impl Into<SaslProfile>) -> Self {
        self.sasl_profile = Some(profile.into());
        self
    }

    /// Builds the client
    pub fn build(self) -> Client {
        Client {
            container_id: self
                .container_id
                .unwrap_or_else(|| format!("hematite-amqp-{}", uuid::Uuid::new_v4())),
            timeouts: self.timeouts,
            sasl_profile: self.sasl_profile,
            connections: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Client;

    #[test]
    fn generated_container_ids_are_unique() {
        let a = Client::builder().build();
        let b = Client::builder().build();
        assert_ne!(a.container_id(), b.container_id());
    }

    #[test]
    fn explicit_container_id_is_kept() {
        let client = Client::new("my-container");
        assert_eq!(client.container_id(), "my-container");
    }
}
