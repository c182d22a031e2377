use fe2o3_amqp_types::{
    definitions::{self, Fields, Handle, SequenceNo},
    performatives::{Attach, Detach, Disposition, Flow, Transfer},
};

use crate::Payload;

/// Frames exchanged between a link handle and its session engine.
///
/// The termination variants flow only from the engine to the link; they
/// let a blocked `send`/`recv` observe which layer went away.
#[derive(Debug)]
pub(crate) enum LinkFrame {
    Attach(Attach),
    Flow(LinkFlow),
    Transfer {
        /// The handle the remote peer assigned to this link; used by the
        /// session engine for delivery-id bookkeeping of outgoing
        /// transfers
        remote_handle: u32,
        performative: Transfer,
        payload: Payload,
    },
    Detach(Detach),

    /// An outgoing disposition emitted by a receiver; kept on the same
    /// FIFO as its flow frames so the wire order is deterministic
    Disposition(Disposition),

    /// The session has ended, locally or remotely
    SessionClosed(Option<definitions::Error>),

    /// The connection has closed or failed
    ConnectionClosed,
}

/// The link-level subset of a Flow performative
#[derive(Debug, Default, Clone)]
pub(crate) struct LinkFlow {
    pub handle: Handle,
    pub delivery_count: Option<SequenceNo>,
    pub link_credit: Option<u32>,
    pub available: Option<u32>,
    pub drain: bool,
    pub echo: bool,
    pub properties: Option<Fields>,
}

impl TryFrom<Flow> for LinkFlow {
    type Error = ();

    fn try_from(value: Flow) -> Result<Self, Self::Error> {
        let handle = value.handle.ok_or(())?;
        Ok(LinkFlow {
            handle,
            delivery_count: value.delivery_count,
            link_credit: value.link_credit,
            available: value.available,
            drain: value.drain,
            echo: value.echo,
            properties: value.properties,
        })
    }
}
