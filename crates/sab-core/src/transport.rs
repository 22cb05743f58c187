use async_trait::async_trait;

use crate::{envelope::SignalMessage, Result};

/// Where a reply is addressed. Group delivery is its own variant so nothing
/// above the adapter needs to know how the transport spells group targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Direct(String),
    Group(String),
}

impl Recipient {
    pub fn is_group(&self) -> bool {
        matches!(self, Recipient::Group(_))
    }
}

/// Reference to the message a reply quotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub timestamp: i64,
    pub author: String,
}

/// Messaging side of the bridge.
///
/// `receive` drains whatever arrived since the last poll, in arrival order,
/// with no exactly-once promise; the dispatch loop tolerates replays. `send`
/// pushes one reply and reports failure without retrying.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    async fn receive(&self) -> Result<Vec<SignalMessage>>;

    async fn send(&self, recipient: &Recipient, text: &str, quote: Option<&Quote>) -> Result<()>;
}
