//! Push channel client.
//!
//! Provides the single per-session [`PushChannel`], the transport port
//! it connects through ([`Connector`], with the WebSocket implementation
//! [`WsConnector`]), close-code classification, and an opt-in
//! exponential-backoff reconnect helper for the channel's owner.

pub mod channel;
pub mod close_codes;
pub mod connector;
pub mod reconnect;

pub use channel::{
    ChannelConfig, ChannelError, ChannelState, ChannelStatus, CloseReason, LoginBoundary,
    OpenOutcome, PushChannel,
};
pub use connector::{CloseInfo, Connection, Connector, Frame, WsConnector};
pub use reconnect::{reconnect_with_backoff, ReconnectConfig, ReconnectOutcome};
