//! Builder for the session

use std::sync::Arc;
use std::time::Duration;

use fe2o3_amqp_types::{
    definitions::{Fields, Handle, TransferNumber},
    primitives::Symbol,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{connection::Connection, util::Constant};

use super::{
    engine::SessionEngine, BeginError, Session, SessionInner, SessionState, DEFAULT_WINDOW,
};

/// Builder for a [`Session`]
#[derive(Debug, Clone)]
pub struct Builder {
    next_outgoing_id: TransferNumber,
    incoming_window: u32,
    outgoing_window: u32,
    handle_max: Handle,
    offered_capabilities: Option<Vec<Symbol>>,
    desired_capabilities: Option<Vec<Symbol>>,
    properties: Option<Fields>,
    buffer_size: Option<usize>,

    // Per-session overrides of the connection's deadlines
    open_timeout: Option<Duration>,
    close_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
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
            next_outgoing_id: 0,
            incoming_window: DEFAULT_WINDOW,
            outgoing_window: DEFAULT_WINDOW,
            handle_max: Handle(u32::MAX),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
            buffer_size: None,
            open_timeout: None,
            close_timeout: None,
            request_timeout: None,
            send_timeout: None,
        }
    }

    /// The transfer-id of the first transfer on the session
    pub fn next_outgoing_id(mut self, value: TransferNumber) -> Self {
        self.next_outgoing_id = value;
        self
    }

    /// The incoming window of the session
    pub fn incoming_window(mut self, value: u32) -> Self {
        self.incoming_window = value;
        self
    }

    /// The outgoing window of the session
    pub fn outgoing_window(mut self, value: u32) -> Self {
        self.outgoing_window = value;
        self
    }

    /// The maximum handle number that can be used on the session
    pub fn handle_max(mut self, value: impl Into<Handle>) -> Self {
        self.handle_max = value.into();
        self
    }

    /// Extension capabilities the session supports
    pub fn offered_capabilities(mut self, capabilities: Vec<Symbol>) -> Self {
        self.offered_capabilities = Some(capabilities);
        self
    }

    /// Extension capabilities the session may use
    pub fn desired_capabilities(mut self, capabilities: Vec<Symbol>) -> Self {
        self.desired_capabilities = Some(capabilities);
        self
    }

    /// Session properties
    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Capacity of the session's frame channels; defaults to the
    /// connection's buffer size
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Per-session override of the connection's open timeout
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = Some(timeout);
        self
    }

    /// Per-session override of the connection's close timeout
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = Some(timeout);
        self
    }

    /// Per-session override of the connection's request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Per-session override of the connection's send timeout
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Begins the session on the connection.
    ///
    /// The Begin frame is pipelined; the remote Begin is consumed by the
    /// session's event loop and errors surface on the first operation.
    pub async fn begin(self, connection: &mut Connection) -> Result<Session, BeginError> {
        let buffer_size = self.buffer_size.unwrap_or(connection.session_buffer_size);
        let (incoming_tx, incoming_rx) = mpsc::channel(buffer_size);
        let (outgoing_channel, session_id) = connection.allocate_session(incoming_tx).await?;

        let inner = SessionInner {
            outgoing_channel,
            local_state: SessionState::Unmapped,
            initial_outgoing_id: Constant::new(self.next_outgoing_id),
            next_outgoing_id: self.next_outgoing_id,
            incoming_window: self.incoming_window,
            outgoing_window: self.outgoing_window,
            handle_max: self.handle_max.clone(),
            incoming_channel: None,
            next_incoming_id: 0,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
            offered_capabilities: self.offered_capabilities.clone(),
            desired_capabilities: self.desired_capabilities.clone(),
            properties: self.properties.clone(),
            link_name_by_local_handle: Default::default(),
            relay_by_name: Default::default(),
            relay_by_remote_handle: Default::default(),
            delivery_tag_by_id: Default::default(),
        };

        let (control_tx, control_rx) = mpsc::channel(buffer_size);
        let (link_tx, link_rx) = mpsc::channel(buffer_size);

        let engine = SessionEngine::begin(
            connection.control.clone(),
            inner,
            session_id,
            control_rx,
            incoming_rx,
            connection.outgoing.clone(),
            link_rx,
        )
        .await?;
        let engine_handle = engine.spawn();

        let mut timeouts = connection.timeouts;
        if let Some(timeout) = self.open_timeout {
            timeouts.open = timeout;
        }
        if let Some(timeout) = self.close_timeout {
            timeouts.close = timeout;
        }
        if let Some(timeout) = self.request_timeout {
            timeouts.request = timeout;
        }
        if let Some(timeout) = self.send_timeout {
            timeouts.send = timeout;
        }

        Ok(Session {
            control: control_tx,
            outgoing: link_tx,
            conn_control: connection.control.clone(),
            engine_handle: Some(engine_handle),
            terminal: None,
            timeouts,
            outgoing_channel,
            link_name_counter: 0,
            current_txn: Arc::new(Mutex::new(None)),
            txn_controller: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Builder;

    #[test]
    fn default_windows() {
        let builder = Builder::new();
        assert_eq!(builder.incoming_window, super::DEFAULT_WINDOW);
        assert_eq!(builder.outgoing_window, super::DEFAULT_WINDOW);
    }
}
