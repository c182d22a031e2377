//! A scripted in-process AMQP peer.
//!
//! Tests drive the client against this peer over a `tokio::io::duplex`
//! stream. The peer reads and writes raw frames with the crate's frame
//! codec; each test scripts the exact exchange it expects.

#![allow(dead_code)]

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::{Decoder, Encoder};

use hematite_amqp::frames::amqp::{Frame, FrameBody, FrameCodec};
use hematite_amqp::types::definitions::{self, DeliveryNumber, Handle};
use hematite_amqp::types::messaging::{Accepted, DeliveryState};
use hematite_amqp::types::performatives::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Transfer,
};
use hematite_amqp::types::primitives::Symbol;

pub const AMQP_PROTO_HEADER: [u8; 8] = [b'A', b'M', b'Q', b'P', 0x00, 1, 0, 0];

pub struct ScriptedPeer {
    io: DuplexStream,
}

impl ScriptedPeer {
    pub fn new(io: DuplexStream) -> Self {
        Self { io }
    }

    /// Reads the client's protocol header and echoes it back
    pub async fn exchange_amqp_header(&mut self) {
        let mut buf = [0u8; 8];
        self.io.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, AMQP_PROTO_HEADER, "expecting an AMQP protocol header");
        self.io.write_all(&AMQP_PROTO_HEADER).await.unwrap();
    }

    /// Reads one frame, skipping empty (heartbeat) frames
    pub async fn read_frame(&mut self) -> Frame {
        loop {
            let size = self.io.read_u32().await.unwrap() as usize;
            assert!(size >= 8, "frame size below the minimum");
            let mut body = BytesMut::zeroed(size - 4);
            self.io.read_exact(&mut body).await.unwrap();

            let frame = FrameCodec {}.decode(&mut body).unwrap().unwrap();
            match frame.body {
                FrameBody::Empty => continue,
                _ => return frame,
            }
        }
    }

    pub async fn write_frame(&mut self, frame: Frame) {
        let mut body = BytesMut::new();
        FrameCodec {}.encode(frame, &mut body).unwrap();
        self.io.write_u32((body.len() + 4) as u32).await.unwrap();
        self.io.write_all(&body).await.unwrap();
    }

    /* ----------------------------- Open ----------------------------- */

    pub async fn expect_open(&mut self) -> Open {
        match self.read_frame().await.body {
            FrameBody::Open(open) => open,
            other => panic!("expecting Open, found {:?}", other),
        }
    }

    pub async fn send_open(&mut self, offered_capabilities: Option<Vec<&str>>) {
        let open = Open {
            container_id: "scripted-peer".to_string(),
            hostname: None,
            max_frame_size: 65536.into(),
            channel_max: 255.into(),
            idle_time_out: None,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: offered_capabilities
                .map(|caps| caps.into_iter().map(Symbol::from).collect::<Vec<_>>().into()),
            desired_capabilities: None,
            properties: None,
        };
        self.write_frame(Frame::new(0u16, FrameBody::Open(open))).await;
    }

    /// The common preamble: header exchange, then Open for Open
    pub async fn handshake(&mut self, offered_capabilities: Option<Vec<&str>>) {
        self.exchange_amqp_header().await;
        self.expect_open().await;
        self.send_open(offered_capabilities).await;
    }

    /* ---------------------------- Session ---------------------------- */

    pub async fn expect_begin(&mut self) -> (u16, Begin) {
        let frame = self.read_frame().await;
        match frame.body {
            FrameBody::Begin(begin) => (frame.channel, begin),
            other => panic!("expecting Begin, found {:?}", other),
        }
    }

    pub async fn send_begin(&mut self, channel: u16, remote_channel: u16) {
        let begin = Begin {
            remote_channel: Some(remote_channel),
            next_outgoing_id: 0,
            incoming_window: 2048,
            outgoing_window: 2048,
            handle_max: Handle(u32::MAX),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        self.write_frame(Frame::new(channel, FrameBody::Begin(begin)))
            .await;
    }

    /// Handles the Begin exchange for a client session on channel 0
    pub async fn accept_session(&mut self) {
        let (channel, _begin) = self.expect_begin().await;
        self.send_begin(0, channel).await;
    }

    pub async fn expect_end(&mut self) -> End {
        match self.read_frame().await.body {
            FrameBody::End(end) => end,
            other => panic!("expecting End, found {:?}", other),
        }
    }

    pub async fn send_end(&mut self, channel: u16, error: Option<definitions::Error>) {
        self.write_frame(Frame::new(channel, FrameBody::End(End { error })))
            .await;
    }

    /* ----------------------------- Links ----------------------------- */

    pub async fn expect_attach(&mut self) -> (u16, Attach) {
        let frame = self.read_frame().await;
        match frame.body {
            FrameBody::Attach(attach) => (frame.channel, attach),
            other => panic!("expecting Attach, found {:?}", other),
        }
    }

    /// Echoes an attach back with the role flipped, accepting the link
    pub async fn send_attach_echo(&mut self, channel: u16, attach: &Attach) {
        let role = match attach.role {
            definitions::Role::Sender => definitions::Role::Receiver,
            definitions::Role::Receiver => definitions::Role::Sender,
        };
        let echo = Attach {
            name: attach.name.clone(),
            handle: attach.handle.clone(),
            role,
            snd_settle_mode: attach.snd_settle_mode.clone(),
            rcv_settle_mode: attach.rcv_settle_mode.clone(),
            source: attach.source.clone(),
            target: attach.target.clone(),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: Some(0),
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        self.write_frame(Frame::new(channel, FrameBody::Attach(echo)))
            .await;
    }

    /// Grants link credit to a sender link
    pub async fn send_flow(&mut self, channel: u16, handle: u32, link_credit: u32) {
        let flow = Flow {
            next_incoming_id: Some(0),
            incoming_window: 2048,
            next_outgoing_id: 0,
            outgoing_window: 2048,
            handle: Some(Handle(handle)),
            delivery_count: Some(0),
            link_credit: Some(link_credit),
            available: None,
            drain: false,
            echo: false,
            properties: None,
        };
        self.write_frame(Frame::new(channel, FrameBody::Flow(flow)))
            .await;
    }

    pub async fn expect_flow(&mut self) -> Flow {
        match self.read_frame().await.body {
            FrameBody::Flow(flow) => flow,
            other => panic!("expecting Flow, found {:?}", other),
        }
    }

    pub async fn expect_transfer(&mut self) -> (Transfer, bytes::Bytes) {
        match self.read_frame().await.body {
            FrameBody::Transfer {
                performative,
                payload,
            } => (performative, payload),
            other => panic!("expecting Transfer, found {:?}", other),
        }
    }

    pub async fn send_transfer(
        &mut self,
        channel: u16,
        handle: u32,
        delivery_id: DeliveryNumber,
        payload: bytes::Bytes,
    ) {
        let transfer = Transfer {
            handle: Handle(handle),
            delivery_id: Some(delivery_id),
            delivery_tag: Some(serde_bytes::ByteBuf::from(vec![delivery_id as u8])),
            message_format: Some(0),
            settled: Some(false),
            more: false,
            rcv_settle_mode: None,
            state: None,
            resume: false,
            aborted: false,
            batchable: false,
        };
        self.write_frame(Frame::new(
            channel,
            FrameBody::Transfer {
                performative: transfer,
                payload,
            },
        ))
        .await;
    }

    pub async fn expect_disposition(&mut self) -> Disposition {
        match self.read_frame().await.body {
            FrameBody::Disposition(disposition) => disposition,
            other => panic!("expecting Disposition, found {:?}", other),
        }
    }

    /// Settles a delivery with the given state
    pub async fn send_disposition(
        &mut self,
        channel: u16,
        delivery_id: DeliveryNumber,
        settled: bool,
        state: Option<DeliveryState>,
    ) {
        let disposition = Disposition {
            role: definitions::Role::Receiver,
            first: delivery_id,
            last: None,
            settled,
            state,
            batchable: false,
        };
        self.write_frame(Frame::new(channel, FrameBody::Disposition(disposition)))
            .await;
    }

    pub async fn send_accepted(&mut self, channel: u16, delivery_id: DeliveryNumber) {
        self.send_disposition(
            channel,
            delivery_id,
            true,
            Some(DeliveryState::Accepted(Accepted {})),
        )
        .await;
    }

    pub async fn expect_detach(&mut self) -> Detach {
        match self.read_frame().await.body {
            FrameBody::Detach(detach) => detach,
            other => panic!("expecting Detach, found {:?}", other),
        }
    }

    pub async fn send_detach(
        &mut self,
        channel: u16,
        handle: u32,
        closed: bool,
        error: Option<definitions::Error>,
    ) {
        let detach = Detach {
            handle: Handle(handle),
            closed,
            error,
        };
        self.write_frame(Frame::new(channel, FrameBody::Detach(detach)))
            .await;
    }

    /* ----------------------------- Close ----------------------------- */

    pub async fn expect_close(&mut self) -> Close {
        match self.read_frame().await.body {
            FrameBody::Close(close) => close,
            other => panic!("expecting Close, found {:?}", other),
        }
    }

    pub async fn send_close(&mut self, error: Option<definitions::Error>) {
        self.write_frame(Frame::new(0u16, FrameBody::Close(Close { error })))
            .await;
    }
}

/// A duplex pair sized generously enough that neither side blocks on the
/// scripted exchanges
pub fn duplex_pair() -> (DuplexStream, ScriptedPeer) {
    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    (client_io, ScriptedPeer::new(server_io))
}
