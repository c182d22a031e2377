//! Low level transport framing
//!
//! Layer 0 is a `tokio_util::codec::LengthDelimitedCodec` over the IO;
//! layer 1 encodes and decodes typed frames (`frames::amqp::Frame` or
//! `frames::sasl::Frame`) into the length-delimited payloads.

use fe2o3_amqp_types::definitions::MIN_MAX_FRAME_SIZE;

use std::{io, marker::PhantomData, task::Poll, time::Duration};

use bytes::BytesMut;
use futures_util::{Future, Sink, SinkExt, Stream, StreamExt};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{instrument, trace};

use crate::{
    connection::ConnectionState,
    frames::{amqp, sasl},
    util::IdleTimeout,
};

pub(crate) mod error;
pub use error::Error;
pub mod protocol_header;

use protocol_header::{ProtocolHeader, ProtocolHeaderCodec};

use self::error::NegotiationError;

pin_project! {
    /// Frame transport over any `AsyncRead + AsyncWrite` IO
    #[derive(Debug)]
    pub struct Transport<Io, Ftype> {
        #[pin]
        framed_write: FramedWrite<WriteHalf<Io>, LengthDelimitedCodec>,

        #[pin]
        framed_read: FramedRead<ReadHalf<Io>, LengthDelimitedCodec>,

        #[pin]
        idle_timeout: Option<IdleTimeout>,

        ftype: PhantomData<Ftype>,
    }
}

impl<Io, Ftype> Transport<Io, Ftype>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Bind to an IO with the pre-negotiation maximum frame size
    pub fn bind(io: Io, max_frame_size: usize, idle_timeout: Option<Duration>) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let framed_write = FramedWrite::new(writer, length_delimited_encoder(max_frame_size));
        let framed_read = FramedRead::new(reader, length_delimited_decoder(max_frame_size));
        Self::bind_to_framed_codec(framed_write, framed_read, idle_timeout)
    }

    fn bind_to_framed_codec(
        framed_write: FramedWrite<WriteHalf<Io>, LengthDelimitedCodec>,
        framed_read: FramedRead<ReadHalf<Io>, LengthDelimitedCodec>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let idle_timeout = idle_timeout
            .filter(|duration| !duration.is_zero())
            .map(IdleTimeout::new);

        Self {
            framed_write,
            framed_read,
            idle_timeout,
            ftype: PhantomData,
        }
    }
}

impl<Io> Transport<Io, sasl::Frame>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Performs the SASL header exchange and binds a SASL frame transport.
    ///
    /// This does not modify the connection state; SASL negotiation happens
    /// before the AMQP header exchange.
    pub async fn negotiate_sasl_header(io: Io) -> Result<Self, NegotiationError> {
        let (reader, writer) = tokio::io::split(io);
        let mut framed_write = FramedWrite::new(writer, ProtocolHeaderCodec::new());
        let mut framed_read = FramedRead::new(reader, ProtocolHeaderCodec::new());

        let proto_header = ProtocolHeader::sasl();
        trace!(?proto_header, "SEND");
        framed_write.send(proto_header.clone()).await?;

        let incoming_header = framed_read.next().await.ok_or_else(|| {
            NegotiationError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Waiting for SASL header exchange",
            ))
        })??;
        trace!(?incoming_header, "RECV");

        if incoming_header != proto_header {
            let buf: [u8; 8] = incoming_header.into();
            return Err(NegotiationError::ProtocolHeaderMismatch(
                bytes::Bytes::copy_from_slice(&buf),
            ));
        }

        let framed_write = framed_write.map_encoder(|_| length_delimited_encoder(MIN_MAX_FRAME_SIZE));
        let framed_read = framed_read.map_decoder(|_| length_delimited_decoder(MIN_MAX_FRAME_SIZE));
        Ok(Self::bind_to_framed_codec(framed_write, framed_read, None))
    }

    /// Consume the SASL transport and return the raw IO halves rejoined
    pub(crate) fn into_io(self) -> Io {
        let reader = self.framed_read.into_inner();
        let writer = self.framed_write.into_inner();
        reader.unsplit(writer)
    }
}

impl<Io> Transport<Io, amqp::Frame>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Performs the AMQP header exchange and binds an AMQP frame transport
    #[instrument(skip_all)]
    pub async fn negotiate_amqp_header(
        io: Io,
        local_state: &mut ConnectionState,
        idle_timeout: Option<Duration>,
    ) -> Result<Self, NegotiationError> {
        let (reader, writer) = tokio::io::split(io);
        let mut framed_write = FramedWrite::new(writer, ProtocolHeaderCodec::new());
        let mut framed_read = FramedRead::new(reader, ProtocolHeaderCodec::new());

        let proto_header = ProtocolHeader::amqp();
        trace!(?proto_header, "SEND");
        match local_state {
            ConnectionState::Start => {
                framed_write.send(proto_header.clone()).await?;
                *local_state = ConnectionState::HeaderSent;
            }
            _ => return Err(NegotiationError::IllegalState),
        }

        let incoming_header = framed_read.next().await.ok_or_else(|| {
            NegotiationError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Waiting for header exchange",
            ))
        })??;
        trace!(?incoming_header, "RECV");

        if incoming_header != proto_header {
            *local_state = ConnectionState::End;
            return Err(NegotiationError::NotImplemented(Some(format!(
                "Expecting {:?}, found {:?}",
                proto_header, incoming_header
            ))));
        }
        *local_state = ConnectionState::HeaderExchange;

        let framed_write = framed_write.map_encoder(|_| length_delimited_encoder(MIN_MAX_FRAME_SIZE));
        let framed_read = framed_read.map_decoder(|_| length_delimited_decoder(MIN_MAX_FRAME_SIZE));
        Ok(Self::bind_to_framed_codec(
            framed_write,
            framed_read,
            idle_timeout,
        ))
    }

    /// Change the max frame size of the length-delimited decoder
    pub fn set_decoder_max_frame_size(&mut self, max_frame_size: usize) -> &mut Self {
        let max_frame_size = std::cmp::max(MIN_MAX_FRAME_SIZE, max_frame_size);
        self.framed_read
            .decoder_mut()
            .set_max_frame_length(max_frame_size);
        self
    }

    /// Change the max frame size of the length-delimited encoder
    pub fn set_encoder_max_frame_size(&mut self, max_frame_size: usize) -> &mut Self {
        let max_frame_size = std::cmp::max(MIN_MAX_FRAME_SIZE, max_frame_size);
        self.framed_write
            .encoder_mut()
            .set_max_frame_length(max_frame_size - 4);
        self
    }

    /// Set the idle timeout of the transport
    pub fn set_idle_timeout(&mut self, duration: Duration) -> &mut Self {
        self.idle_timeout = match duration.is_zero() {
            true => None,
            false => Some(IdleTimeout::new(duration)),
        };
        self
    }
}

#[cfg(feature = "rustls")]
#[cfg_attr(docsrs, doc(cfg(feature = "rustls")))]
impl<Io> Transport<Io, ()>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Perform the TLS protocol header exchange and TLS negotiation with
    /// `tokio-rustls`
    pub async fn connect_tls_with_rustls(
        mut stream: Io,
        domain: &str,
        connector: &tokio_rustls::TlsConnector,
    ) -> Result<tokio_rustls::client::TlsStream<Io>, NegotiationError> {
        use librustls::pki_types::ServerName;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let proto_header = ProtocolHeader::tls();
        let buf: [u8; 8] = proto_header.into();
        stream.write_all(&buf).await?;

        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await?;
        let incoming_header = ProtocolHeader::try_from(buf).map_err(|buf| {
            NegotiationError::ProtocolHeaderMismatch(bytes::Bytes::copy_from_slice(&buf))
        })?;
        if !incoming_header.is_tls() {
            let buf: [u8; 8] = incoming_header.into();
            return Err(NegotiationError::ProtocolHeaderMismatch(
                bytes::Bytes::copy_from_slice(&buf),
            ));
        }

        let domain = ServerName::try_from(domain)
            .map_err(|_| NegotiationError::InvalidDomain)?
            .to_owned();
        let tls = connector.connect(domain, stream).await?;
        Ok(tls)
    }
}

/// Creates a length-delimited encoder handling AMQP and SASL frames.
///
/// The four-byte size prefix counts itself, hence the `-4` adjustments.
fn length_delimited_encoder(max_frame_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(max_frame_size - 4)
        .length_adjustment(-4)
        .new_codec()
}

fn length_delimited_decoder(max_frame_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(max_frame_size)
        .length_adjustment(-4)
        .new_codec()
}

impl<Io> Sink<amqp::Frame> for Transport<Io, amqp::Frame>
where
    Io: AsyncWrite + Unpin,
{
    type Error = Error;

    fn poll_ready(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed_write.poll_ready(cx).map_err(Into::into)
    }

    fn start_send(self: std::pin::Pin<&mut Self>, item: amqp::Frame) -> Result<(), Self::Error> {
        let mut bytesmut = BytesMut::new();
        let mut encoder = amqp::FrameCodec {};
        encoder.encode(item, &mut bytesmut)?;

        let this = self.project();
        this.framed_write
            .start_send(bytesmut.freeze())
            .map_err(Into::into)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed_write.poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed_write.poll_close(cx).map_err(Into::into)
    }
}

impl<Io> Stream for Transport<Io, amqp::Frame>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<amqp::Frame, Error>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.framed_read.poll_next(cx) {
            Poll::Ready(next) => {
                // Any inbound traffic resets the remote idle timer
                if let Some(mut delay) = this.idle_timeout.as_pin_mut() {
                    delay.reset();
                }

                match next {
                    Some(item) => {
                        let mut src = match item {
                            Ok(b) => b,
                            Err(err) => return Poll::Ready(Some(Err(err.into()))),
                        };
                        let mut decoder = amqp::FrameCodec {};
                        Poll::Ready(decoder.decode(&mut src).map_err(Into::into).transpose())
                    }
                    None => Poll::Ready(None),
                }
            }
            Poll::Pending => {
                if let Some(delay) = this.idle_timeout.as_pin_mut() {
                    match delay.poll(cx) {
                        Poll::Ready(_elapsed) => {
                            return Poll::Ready(Some(Err(Error::IdleTimeoutElapsed)))
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }

                Poll::Pending
            }
        }
    }
}

impl<Io> Sink<sasl::Frame> for Transport<Io, sasl::Frame>
where
    Io: AsyncWrite + Unpin,
{
    type Error = NegotiationError;

    fn poll_ready(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed_write.poll_ready(cx).map_err(Into::into)
    }

    fn start_send(self: std::pin::Pin<&mut Self>, item: sasl::Frame) -> Result<(), Self::Error> {
        let mut bytesmut = BytesMut::new();
        let mut encoder = sasl::FrameCodec {};
        encoder.encode(item, &mut bytesmut)?;

        let this = self.project();
        this.framed_write
            .start_send(bytesmut.freeze())
            .map_err(Into::into)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed_write.poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed_write.poll_close(cx).map_err(Into::into)
    }
}

impl<Io> Stream for Transport<Io, sasl::Frame>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<sasl::Frame, NegotiationError>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.framed_read.poll_next(cx) {
            Poll::Ready(next) => match next {
                Some(item) => {
                    let mut src = match item {
                        Ok(b) => b,
                        Err(err) => return Poll::Ready(Some(Err(err.into()))),
                    };
                    let mut decoder = sasl::FrameCodec {};
                    Poll::Ready(decoder.decode(&mut src).map_err(Into::into).transpose())
                }
                None => Poll::Ready(None),
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};

    use crate::connection::ConnectionState;

    use super::{
        amqp::{Frame, FrameBody},
        Transport,
    };

    #[tokio::test]
    async fn header_exchange_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(64);

        let server = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut server_io = server_io;
            let mut buf = [0u8; 8];
            server_io.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf[..4], b"AMQP");
            server_io.write_all(&buf).await.unwrap();
            server_io
        });

        let mut local_state = ConnectionState::Start;
        let transport =
            Transport::negotiate_amqp_header(client_io, &mut local_state, None).await;
        assert!(transport.is_ok());
        assert!(matches!(local_state, ConnectionState::HeaderExchange));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn empty_frame_roundtrip() {
        let (client_io, server_io) = tokio::io::duplex(64);
        let mut client: Transport<_, Frame> = Transport::bind(client_io, 512, None);
        let mut server: Transport<_, Frame> = Transport::bind(server_io, 512, None);

        client.send(Frame::empty()).await.unwrap();
        let frame = server.next().await.unwrap().unwrap();
        assert!(matches!(frame.body, FrameBody::Empty));
    }
}
