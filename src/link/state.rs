//! Link state and the credit-based flow-control state shared between a
//! link handle and the session engine

use fe2o3_amqp_types::definitions::{Fields, Role, SequenceNo};
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::frame::LinkFlow;
use super::LocalHandle;

/// Link states as defined in the AMQP 1.0 specification Part 2.6.19
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// The initial state after construction
    Unattached,

    /// An attach has been sent but none received
    AttachSent,

    /// An attach has been received but none sent
    AttachReceived,

    /// Attach frames have been exchanged
    Attached,

    /// A non-closing detach has been sent
    DetachSent,

    /// A non-closing detach has been received
    DetachReceived,

    /// Non-closing detach frames have been exchanged
    Detached,

    /// A closing detach has been sent
    CloseSent,

    /// A closing detach has been received
    CloseReceived,

    /// Closing detach frames have been exchanged; the link name may not be
    /// reused on this session
    Closed,
}

#[derive(Debug)]
pub(crate) struct LinkFlowStateInner {
    pub initial_delivery_count: SequenceNo,
    pub delivery_count: SequenceNo,
    pub link_credit: u32,
    pub available: u32,
    pub drain: bool,
    pub properties: Option<Fields>,
}

/// Flow-control state of one link.
///
/// Shared between the link handle (which consumes credit on send or tops
/// the window up on receive) and the session engine (which applies
/// incoming Flow frames). All access is through the internal mutex; a
/// blocked sender parks on the notify and re-checks after every state
/// change.
#[derive(Debug)]
pub(crate) struct LinkFlowState {
    role: Role,
    lock: Mutex<LinkFlowStateInner>,
    notify: Notify,
}

impl LinkFlowState {
    pub fn sender(inner: LinkFlowStateInner) -> Self {
        Self {
            role: Role::Sender,
            lock: Mutex::new(inner),
            notify: Notify::new(),
        }
    }

    pub fn receiver(inner: LinkFlowStateInner) -> Self {
        Self {
            role: Role::Receiver,
            lock: Mutex::new(inner),
            notify: Notify::new(),
        }
    }

    pub fn notify(&self) -> &Notify {
        &self.notify
    }

    pub fn link_credit(&self) -> u32 {
        self.lock.lock().link_credit
    }

    pub fn delivery_count(&self) -> SequenceNo {
        self.lock.lock().delivery_count
    }

    pub fn properties(&self) -> Option<Fields> {
        self.lock.lock().properties.clone()
    }

    pub fn initial_delivery_count(&self) -> SequenceNo {
        self.lock.lock().initial_delivery_count
    }

    /// Consumes one credit for an outgoing transfer.
    ///
    /// Returns the delivery count the transfer is assigned, or `None` when
    /// the link has no credit.
    pub fn try_consume_credit(&self) -> Option<SequenceNo> {
        let mut guard = self.lock.lock();
        if guard.link_credit == 0 {
            None
        } else {
            guard.link_credit -= 1;
            let count = guard.delivery_count;
            guard.delivery_count = guard.delivery_count.wrapping_add(1);
            Some(count)
        }
    }

    /// Accounts for one incoming transfer on a receiver link
    pub fn on_incoming_transfer(&self) {
        let mut guard = self.lock.lock();
        guard.link_credit = guard.link_credit.saturating_sub(1);
        guard.delivery_count = guard.delivery_count.wrapping_add(1);
    }

    /// Applies an incoming Flow frame.
    ///
    /// On a sender this recomputes the credit the receiver granted and
    /// wakes blocked sends; a drain demand consumes the remaining credit
    /// by advancing the delivery count and echoes the new state. On a
    /// receiver this tracks the sender's delivery count.
    ///
    /// Returns a Flow to echo back when the peer requested one.
    pub fn on_incoming_flow(&self, flow: LinkFlow, local_handle: LocalHandle) -> Option<LinkFlow> {
        match self.role {
            Role::Sender => self.sender_on_incoming_flow(flow, local_handle),
            Role::Receiver => self.receiver_on_incoming_flow(flow, local_handle),
        }
    }

    fn sender_on_incoming_flow(
        &self,
        flow: LinkFlow,
        local_handle: LocalHandle,
    ) -> Option<LinkFlow> {
        let mut guard = self.lock.lock();

        if let Some(remote_credit) = flow.link_credit {
            // link-credit(snd) := delivery-count(rcv) + link-credit(rcv)
            //                     - delivery-count(snd)
            let remote_count = flow
                .delivery_count
                .unwrap_or(guard.initial_delivery_count);
            guard.link_credit = remote_count
                .wrapping_add(remote_credit)
                .wrapping_sub(guard.delivery_count);
        }
        guard.drain = flow.drain;

        let echo = if flow.drain {
            // On drain the sender burns the remaining credit by advancing
            // its delivery count and reports the new state
            guard.delivery_count = guard.delivery_count.wrapping_add(guard.link_credit);
            guard.link_credit = 0;
            true
        } else {
            flow.echo
        };

        let response = echo.then(|| LinkFlow {
            handle: local_handle.into(),
            delivery_count: Some(guard.delivery_count),
            link_credit: Some(guard.link_credit),
            available: Some(guard.available),
            drain: guard.drain,
            echo: false,
            properties: guard.properties.clone(),
        });
        drop(guard);

        self.notify.notify_waiters();
        response
    }

    fn receiver_on_incoming_flow(
        &self,
        flow: LinkFlow,
        local_handle: LocalHandle,
    ) -> Option<LinkFlow> {
        let mut guard = self.lock.lock();

        if let Some(available) = flow.available {
            guard.available = available;
        }
        if let Some(delivery_count) = flow.delivery_count {
            guard.delivery_count = delivery_count;
        }

        let response = flow.echo.then(|| LinkFlow {
            handle: local_handle.into(),
            delivery_count: Some(guard.delivery_count),
            link_credit: Some(guard.link_credit),
            available: None,
            drain: guard.drain,
            echo: false,
            properties: guard.properties.clone(),
        });
        drop(guard);

        self.notify.notify_waiters();
        response
    }

    /// Sets the receiver's link credit and returns the Flow announcing it
    pub fn set_credit(&self, link_credit: u32, drain: bool, local_handle: LocalHandle) -> LinkFlow {
        let mut guard = self.lock.lock();
        guard.link_credit = link_credit;
        guard.drain = drain;
        LinkFlow {
            handle: local_handle.into(),
            delivery_count: Some(guard.delivery_count),
            link_credit: Some(link_credit),
            available: None,
            drain,
            echo: false,
            properties: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LinkFlow, LinkFlowState, LinkFlowStateInner};
    use crate::link::LocalHandle;

    fn sender_state(credit: u32) -> LinkFlowState {
        LinkFlowState::sender(LinkFlowStateInner {
            initial_delivery_count: 0,
            delivery_count: 0,
            link_credit: credit,
            available: 0,
            drain: false,
            properties: None,
        })
    }

    #[test]
    fn consuming_credit_decrements_and_assigns_counts() {
        let state = sender_state(2);
        assert_eq!(state.try_consume_credit(), Some(0));
        assert_eq!(state.try_consume_credit(), Some(1));
        assert_eq!(state.link_credit(), 0);
        assert_eq!(state.try_consume_credit(), None);
    }

    #[test]
    fn incoming_flow_grants_credit() {
        let state = sender_state(0);
        let flow = LinkFlow {
            link_credit: Some(3),
            delivery_count: Some(0),
            ..Default::default()
        };
        let echo = state.on_incoming_flow(flow, LocalHandle(0));
        assert!(echo.is_none());
        assert_eq!(state.link_credit(), 3);
    }

    #[test]
    fn drain_burns_remaining_credit_and_echoes() {
        let state = sender_state(0);
        let flow = LinkFlow {
            link_credit: Some(5),
            delivery_count: Some(0),
            drain: true,
            ..Default::default()
        };
        let echo = state.on_incoming_flow(flow, LocalHandle(0)).unwrap();
        assert_eq!(state.link_credit(), 0);
        assert_eq!(echo.delivery_count, Some(5));
        assert_eq!(echo.link_credit, Some(0));
        assert!(echo.drain);
    }

    #[test]
    fn credit_granted_after_sends_accounts_for_delivery_count() {
        let state = sender_state(1);
        assert_eq!(state.try_consume_credit(), Some(0));

        // Receiver advertises 1 more credit from its view of count = 0
        let flow = LinkFlow {
            link_credit: Some(2),
            delivery_count: Some(0),
            ..Default::default()
        };
        state.on_incoming_flow(flow, LocalHandle(0));
        assert_eq!(state.link_credit(), 1);
    }
}
