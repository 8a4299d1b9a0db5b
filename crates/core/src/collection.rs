//! Authoritative collections mirrored by the console view.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::DbId;

/// A server-side list the client refreshes wholesale.
///
/// Jobs declare which collection they populate (a lead import populates
/// [`Collection::Leads`]) and push events name the collection they
/// invalidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Leads,
    Conversations,
    /// Message history of a single conversation.
    Messages(DbId),
    Alerts,
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leads => f.write_str("leads"),
            Self::Conversations => f.write_str("conversations"),
            Self::Messages(id) => write!(f, "messages:{id}"),
            Self::Alerts => f.write_str("alerts"),
        }
    }
}
