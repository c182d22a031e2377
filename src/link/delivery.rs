//! The outgoing and incoming message types of a link

use bytes::{Buf, BufMut, BytesMut};
use fe2o3_amqp_types::{
    definitions::{DeliveryNumber, DeliveryTag, MessageFormat},
    messaging::{
        message::__private::{Deserializable, Serializable},
        AmqpValue, Body, Message, MESSAGE_FORMAT,
    },
};
use serde::Serialize;
use serde_amqp::Value;

use crate::Payload;

/// A message about to be sent, together with its transfer-level settings.
///
/// Most callers construct one implicitly through the `From` conversions:
///
/// ```rust,ignore
/// sender.send("hello").await?;
/// sender.send(Sendable::new(message).settled(true)).await?;
/// ```
#[derive(Debug)]
pub struct Sendable {
    pub(crate) message: Message<Body<Value>>,
    pub(crate) message_format: MessageFormat,
    pub(crate) settled: Option<bool>,
}

impl Sendable {
    /// Creates a [`Sendable`] with the default message format
    pub fn new(message: Message<Body<Value>>) -> Self {
        Self {
            message,
            message_format: MESSAGE_FORMAT,
            settled: None,
        }
    }

    /// Message format, see part 2.8.11 of the AMQP 1.0 specification
    pub fn message_format(mut self, message_format: MessageFormat) -> Self {
        self.message_format = message_format;
        self
    }

    /// Whether the message is considered settled at the sender.
    ///
    /// The negotiated sender-settle-mode of the link takes precedence when
    /// it is not `Mixed`.
    pub fn settled(mut self, settled: impl Into<Option<bool>>) -> Self {
        self.settled = settled.into();
        self
    }

    /// Serializes the bare message into a transfer payload
    pub(crate) fn encode(&self) -> Result<Payload, serde_amqp::Error> {
        let mut payload = BytesMut::new();
        let mut serializer = serde_amqp::ser::Serializer::from((&mut payload).writer());
        Serializable(&self.message).serialize(&mut serializer)?;
        Ok(payload.freeze())
    }
}

impl From<Message<Body<Value>>> for Sendable {
    fn from(message: Message<Body<Value>>) -> Self {
        Self::new(message)
    }
}

impl From<Body<Value>> for Sendable {
    fn from(body: Body<Value>) -> Self {
        Self::new(message_of_body(body))
    }
}

impl From<Value> for Sendable {
    fn from(value: Value) -> Self {
        Self::new(message_of_value(value))
    }
}

fn message_of_body(body: Body<Value>) -> Message<Body<Value>> {
    Message {
        header: None,
        delivery_annotations: None,
        message_annotations: None,
        properties: None,
        application_properties: None,
        body,
        footer: None,
    }
}

/// A value body built from anything convertible into an AMQP value
pub(crate) fn message_of_value(value: Value) -> Message<Body<Value>> {
    message_of_body(Body::Value(AmqpValue(value)))
}

/// An incoming delivery.
///
/// Only complete deliveries are surfaced; a delivery spanning multiple
/// transfer frames is accumulated by the receiver and an aborted delivery
/// is discarded.
#[derive(Debug)]
pub struct Delivery {
    pub(crate) delivery_id: DeliveryNumber,
    pub(crate) delivery_tag: DeliveryTag,
    pub(crate) message_format: Option<MessageFormat>,
    pub(crate) remote_settled: bool,
    pub(crate) payload: Payload,

    /// Decoded lazily from the payload on first access
    pub(crate) message: Option<Message<Body<Value>>>,
}

impl Delivery {
    /// The delivery id assigned by the remote session
    pub fn delivery_id(&self) -> DeliveryNumber {
        self.delivery_id
    }

    /// The delivery tag assigned by the sending link
    pub fn delivery_tag(&self) -> &DeliveryTag {
        &self.delivery_tag
    }

    /// Message format carried by the transfer
    pub fn message_format(&self) -> Option<MessageFormat> {
        self.message_format
    }

    /// Whether the sender already settled this delivery
    pub fn remote_settled(&self) -> bool {
        self.remote_settled
    }

    /// The raw accumulated payload bytes
    pub fn raw_payload(&self) -> &Payload {
        &self.payload
    }

    /// Decodes the message from the accumulated payload.
    ///
    /// The decoded message is cached; repeated calls are cheap.
    pub fn message(&mut self) -> Result<&Message<Body<Value>>, serde_amqp::Error> {
        if self.message.is_none() {
            let reader = self.payload.clone().reader();
            let Deserializable(message): Deserializable<Message<Body<Value>>> =
                serde_amqp::from_reader(reader)?;
            self.message = Some(message);
        }
        Ok(self.message.as_ref().unwrap())
    }

    /// Decodes and consumes the delivery into its message
    pub fn into_message(mut self) -> Result<Message<Body<Value>>, serde_amqp::Error> {
        self.message()?;
        Ok(self.message.unwrap())
    }
}

macro_rules! impl_from_for_sendable {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Sendable {
                fn from(value: $ty) -> Self {
                    Self::new(message_of_value(Value::from(value)))
                }
            }
        )*
    };
}

impl_from_for_sendable!(&str, String, i32, i64, u32, u64, f32, f64, bool);

#[cfg(test)]
mod tests {
    use bytes::Buf;
    use fe2o3_amqp_types::messaging::{
        message::__private::Deserializable, Body, Message,
    };
    use serde_amqp::Value;

    use super::{Delivery, Sendable};

    #[test]
    fn sendable_encodes_a_bare_message() {
        let sendable = Sendable::from("hello AMQP");
        let payload = sendable.encode().unwrap();
        assert!(!payload.is_empty());

        let Deserializable(message): Deserializable<Message<Body<Value>>> =
            serde_amqp::from_reader(payload.reader()).unwrap();
        match message.body {
            Body::Value(value) => assert_eq!(value.0, Value::from("hello AMQP")),
            _ => panic!("expecting an AmqpValue body"),
        }
    }

    #[test]
    fn delivery_message_is_cached() {
        let payload = Sendable::from("cached").encode().unwrap();
        let mut delivery = Delivery {
            delivery_id: 0,
            delivery_tag: serde_bytes::ByteBuf::from(vec![0u8]),
            message_format: Some(0),
            remote_settled: false,
            payload,
            message: None,
        };

        delivery.message().unwrap();
        assert!(delivery.message.is_some());
        delivery.message().unwrap();
    }
}
