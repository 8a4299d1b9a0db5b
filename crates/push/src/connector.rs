//! Transport port of the push channel.
//!
//! [`Connector`] is the connection factory the channel opens through.
//! [`WsConnector`] is the production implementation over
//! tokio-tungstenite; tests substitute an in-memory connector.

use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::channel::ChannelError;
use crate::close_codes::CLOSE_NORMAL;

/// Close code and reason of a closing handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(CLOSE_NORMAL, "client closed")
    }
}

/// The frames the channel cares about. Binary frames and keep-alives
/// never reach the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close(Option<CloseInfo>),
}

pub type FrameStream = BoxStream<'static, Result<Frame, ChannelError>>;
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ChannelError> + Send>>;

/// An established duplex connection.
pub struct Connection {
    /// Inbound frames in transport order.
    pub frames: FrameStream,
    /// Outbound half, used for the closing handshake.
    pub sink: FrameSink,
}

/// Connection factory.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection to `url`, which already carries the
    /// credential and client id.
    async fn connect(&self, url: &str) -> Result<Connection, ChannelError>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection, ChannelError> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;

        let (sink, stream) = ws_stream.split();

        let frames = stream
            .filter_map(|message| futures::future::ready(inbound_frame(message)))
            .boxed();

        let sink = sink
            .sink_map_err(|e| ChannelError::Protocol(e.to_string()))
            .with(|frame: Frame| futures::future::ready(Ok::<_, ChannelError>(outbound_message(frame))));

        Ok(Connection {
            frames,
            sink: Box::pin(sink),
        })
    }
}

fn inbound_frame(
    message: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<Frame, ChannelError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
        Ok(Message::Close(frame)) => Some(Ok(Frame::Close(frame.map(|f| CloseInfo {
            code: u16::from(f.code),
            reason: f.reason.into_owned(),
        })))),
        // Binary frames carry nothing for this client; ping/pong is
        // answered by tungstenite.
        Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(e) => Some(Err(ChannelError::Protocol(e.to_string()))),
    }
}

fn outbound_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Close(info) => Message::Close(info.map(|info| CloseFrame {
            code: CloseCode::from(info.code),
            reason: info.reason.into(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_close_frames_are_forwarded() {
        assert_eq!(
            inbound_frame(Ok(Message::Text("{}".into()))),
            Some(Ok(Frame::Text("{}".into())))
        );

        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::from(4001),
            reason: "token expired".into(),
        }));
        assert_eq!(
            inbound_frame(Ok(close)),
            Some(Ok(Frame::Close(Some(CloseInfo::new(4001, "token expired")))))
        );
    }

    #[test]
    fn keepalive_and_binary_frames_are_dropped() {
        assert!(inbound_frame(Ok(Message::Ping(vec![1]))).is_none());
        assert!(inbound_frame(Ok(Message::Binary(vec![0, 1]))).is_none());
    }

    #[test]
    fn close_info_round_trips_through_tungstenite() {
        let message = outbound_message(Frame::Close(Some(CloseInfo::normal())));
        match message {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), CLOSE_NORMAL);
                assert_eq!(frame.reason, "client closed");
            }
            other => panic!("Expected Close, got {other:?}"),
        }
    }
}
