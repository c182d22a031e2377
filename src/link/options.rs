//! Options records for sender and receiver links

use std::time::Duration;

use fe2o3_amqp_types::{
    definitions::{Fields, SenderSettleMode},
    messaging::{Modified, Outcome, TerminusDurability, TerminusExpiryPolicy},
    primitives::Symbol,
};

/// Symbols of the four standard outcomes offered on every link's source
pub(crate) fn default_outcomes() -> Vec<Symbol> {
    vec![
        Symbol::from("amqp:accepted:list"),
        Symbol::from("amqp:rejected:list"),
        Symbol::from("amqp:released:list"),
        Symbol::from("amqp:modified:list"),
    ]
}

/// The default outcome applied when a delivery ends without an explicit
/// one: modified with `delivery-failed` set
pub(crate) fn default_outcome() -> Outcome {
    Outcome::Modified(Modified {
        delivery_failed: Some(true),
        undeliverable_here: None,
        message_annotations: None,
    })
}

/// Reliability mode of a sender link.
///
/// Maps onto the sender-settle-mode negotiated at attach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Deliveries are sent pre-settled and are never retransmitted
    AtMostOnce,

    /// Deliveries stay unsettled until the remote peer settles them
    #[default]
    AtLeastOnce,
}

impl From<DeliveryMode> for SenderSettleMode {
    fn from(mode: DeliveryMode) -> Self {
        match mode {
            DeliveryMode::AtMostOnce => SenderSettleMode::Settled,
            DeliveryMode::AtLeastOnce => SenderSettleMode::Unsettled,
        }
    }
}

/// Options for opening a sender link
#[derive(Debug, Clone)]
pub struct SenderOptions {
    /// Link name; generated as `"sender-{channel}:{counter}"` when absent
    pub name: Option<String>,

    /// Reliability mode; decides the sender-settle-mode of the attach
    pub delivery_mode: DeliveryMode,

    /// Whether remote terminal settlement locally settles the delivery and
    /// completes its tracker without application involvement
    pub auto_settle: bool,

    /// Whether the target is dynamic (address assigned by the peer)
    pub dynamic: bool,

    /// Target capabilities
    pub target_capabilities: Option<Vec<Symbol>>,

    /// Link properties
    pub properties: Option<Fields>,

    /// Capabilities offered on the attach
    pub offered_capabilities: Option<Vec<Symbol>>,

    /// Capabilities desired on the attach
    pub desired_capabilities: Option<Vec<Symbol>>,

    /// Per-link override of the session's send timeout
    pub send_timeout: Option<Duration>,

    /// Per-link override of the session's request timeout
    pub request_timeout: Option<Duration>,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            name: None,
            delivery_mode: DeliveryMode::default(),
            auto_settle: true,
            dynamic: false,
            target_capabilities: None,
            properties: None,
            offered_capabilities: None,
            desired_capabilities: None,
            send_timeout: None,
            request_timeout: None,
        }
    }
}

impl SenderOptions {
    /// Creates the default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the link name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the delivery mode
    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Sets whether remote settlement is applied locally without
    /// application involvement
    pub fn auto_settle(mut self, auto_settle: bool) -> Self {
        self.auto_settle = auto_settle;
        self
    }

    /// Requests a dynamic target
    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    /// Sets the link properties
    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Sets the per-link send timeout
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Sets the per-link request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// Options for opening a receiver link
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Link name; generated as `"receiver-{channel}:{counter}"` when
    /// absent
    pub name: Option<String>,

    /// High-water mark of the credit auto-replenished after every
    /// completed receive. Zero disables replenishment; credit is then
    /// managed with [`add_credit`](crate::Receiver::add_credit).
    pub credit_window: u32,

    /// Whether a consumed delivery is automatically accepted
    pub auto_accept: bool,

    /// Whether an automatic disposition also settles
    pub auto_settle: bool,

    /// Whether the source is dynamic (address assigned by the peer)
    pub dynamic: bool,

    /// Durability of the source terminus
    pub durability: TerminusDurability,

    /// Expiry policy of the source terminus
    pub expiry_policy: TerminusExpiryPolicy,

    /// Source capabilities
    pub source_capabilities: Option<Vec<Symbol>>,

    /// Link properties
    pub properties: Option<Fields>,

    /// Capabilities offered on the attach
    pub offered_capabilities: Option<Vec<Symbol>>,

    /// Capabilities desired on the attach
    pub desired_capabilities: Option<Vec<Symbol>>,

    /// Per-link override of the session's request timeout
    pub request_timeout: Option<Duration>,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            name: None,
            credit_window: 10,
            auto_accept: true,
            auto_settle: true,
            dynamic: false,
            durability: TerminusDurability::None,
            expiry_policy: TerminusExpiryPolicy::SessionEnd,
            source_capabilities: None,
            properties: None,
            offered_capabilities: None,
            desired_capabilities: None,
            request_timeout: None,
        }
    }
}

impl ReceiverOptions {
    /// Creates the default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the link name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the credit window
    pub fn credit_window(mut self, credit_window: u32) -> Self {
        self.credit_window = credit_window;
        self
    }

    /// Sets whether a consumed delivery is automatically accepted
    pub fn auto_accept(mut self, auto_accept: bool) -> Self {
        self.auto_accept = auto_accept;
        self
    }

    /// Sets whether an automatic disposition also settles
    pub fn auto_settle(mut self, auto_settle: bool) -> Self {
        self.auto_settle = auto_settle;
        self
    }

    /// Requests a dynamic source
    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    /// Sets the durability of the source terminus
    pub fn durability(mut self, durability: TerminusDurability) -> Self {
        self.durability = durability;
        self
    }

    /// Sets the expiry policy of the source terminus
    pub fn expiry_policy(mut self, policy: TerminusExpiryPolicy) -> Self {
        self.expiry_policy = policy;
        self
    }

    /// Sets the link properties
    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Sets the per-link request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::definitions::SenderSettleMode;

    use super::{DeliveryMode, ReceiverOptions, SenderOptions};

    #[test]
    fn delivery_mode_maps_to_settle_mode() {
        assert!(matches!(
            SenderSettleMode::from(DeliveryMode::AtMostOnce),
            SenderSettleMode::Settled
        ));
        assert!(matches!(
            SenderSettleMode::from(DeliveryMode::AtLeastOnce),
            SenderSettleMode::Unsettled
        ));
    }

    #[test]
    fn defaults_match_the_documented_contract() {
        let sender = SenderOptions::default();
        assert!(sender.auto_settle);
        assert!(matches!(sender.delivery_mode, DeliveryMode::AtLeastOnce));

        let receiver = ReceiverOptions::default();
        assert_eq!(receiver.credit_window, 10);
        assert!(receiver.auto_accept);
        assert!(receiver.auto_settle);
    }
}
