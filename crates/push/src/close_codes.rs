//! WebSocket close code classification.

use std::ops::RangeInclusive;

/// Normal closure (RFC 6455).
pub const CLOSE_NORMAL: u16 = 1000;

/// Application codes the backend uses when it rejects the session
/// credential (expired, revoked, malformed).
pub const AUTH_CLOSE_CODES: RangeInclusive<u16> = 4000..=4099;

/// How the owner must react to a closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// The server rejected the credential; the session is over.
    AuthRejected,
    /// Anything else; reconnecting is the owner's decision.
    Other,
}

pub fn classify(code: u16, auth_codes: &RangeInclusive<u16>) -> CloseClass {
    if auth_codes.contains(&code) {
        CloseClass::AuthRejected
    } else {
        CloseClass::Other
    }
}
