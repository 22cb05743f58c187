//! Data model for events pulled from the messaging transport.
//!
//! Mirrors the JSON that `signal-cli --output=json receive` prints, one
//! envelope per line. Only the fields the bridge reads are modeled; unknown
//! fields are ignored.

use serde::Deserialize;

/// One polled unit: a received message, a linked-device echo of a message the
/// operator sent, a receipt, or housekeeping noise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SignalMessage {
    #[serde(default)]
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub sync_message: Option<SyncMessage>,
    #[serde(default)]
    pub data_message: Option<DataMessage>,
    #[serde(default)]
    pub receipt_message: Option<ReceiptMessage>,
}

/// Envelope branch carrying echoes of the operator's own traffic from a
/// linked device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    #[serde(default)]
    pub sent_message: Option<SentMessage>,
}

/// The echoed message itself. `destination` is what the sending device
/// claims; the bridge never replies to it directly and waits for a delivery
/// receipt instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub group_info: Option<GroupInfo>,
}

/// Envelope branch carrying a message somebody sent to the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub group_info: Option<GroupInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    #[serde(default)]
    pub group_id: Option<String>,
}

/// Acknowledgement that earlier outbound messages reached `source`. Only
/// delivery receipts matter for correlation; read receipts are noise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptMessage {
    #[serde(default)]
    pub when: i64,
    #[serde(default)]
    pub is_delivery: bool,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub timestamps: Vec<i64>,
}

/// How the dispatch loop should treat one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Delivery receipt acknowledging previously sent timestamps.
    Receipt,
    /// A message the operator sent, observed via a linked-device echo.
    Reflected,
    /// A message received from a third party.
    Received,
    /// Nothing the bridge acts on.
    Ignorable,
}

impl Envelope {
    /// Classifies the envelope for routing. Pure; checks the receipt branch
    /// first, then the linked-device echo, then received text.
    pub fn classify(&self) -> EventKind {
        if let Some(receipt) = &self.receipt_message {
            if receipt.is_delivery && !receipt.timestamps.is_empty() {
                return EventKind::Receipt;
            }
        }
        if self.sent_text().is_some() {
            return EventKind::Reflected;
        }
        if self.received_text().is_some() {
            return EventKind::Received;
        }
        EventKind::Ignorable
    }

    /// Text body of a linked-device echo, if present and non-empty.
    pub fn sent_text(&self) -> Option<&str> {
        self.sync_message
            .as_ref()
            .and_then(|sync| sync.sent_message.as_ref())
            .and_then(|sent| non_empty(sent.message.as_deref()))
    }

    /// Text body of a received message, if present and non-empty.
    pub fn received_text(&self) -> Option<&str> {
        self.data_message
            .as_ref()
            .and_then(|data| non_empty(data.message.as_deref()))
    }

    /// Preferred text body: the linked-device echo wins over received text.
    pub fn content(&self) -> Option<&str> {
        self.sent_text().or_else(|| self.received_text())
    }

    /// Timestamp of the inner message, falling back to the envelope's own.
    /// This is the key later acknowledged by delivery receipts.
    pub fn message_timestamp(&self) -> i64 {
        if let Some(sent) = self.sent_message() {
            if sent.timestamp > 0 {
                return sent.timestamp;
            }
        }
        if let Some(data) = &self.data_message {
            if data.timestamp > 0 {
                return data.timestamp;
            }
        }
        self.timestamp
    }

    /// Group identifier of the inner message, echo branch first.
    pub fn group_id(&self) -> Option<&str> {
        let from_sync = self
            .sent_message()
            .and_then(|sent| sent.group_info.as_ref())
            .and_then(|info| non_empty(info.group_id.as_deref()));
        from_sync.or_else(|| {
            self.data_message
                .as_ref()
                .and_then(|data| data.group_info.as_ref())
                .and_then(|info| non_empty(info.group_id.as_deref()))
        })
    }

    /// Claimed destination of a linked-device echo, when the device sent one.
    pub fn sent_destination(&self) -> Option<&str> {
        self.sent_message()
            .and_then(|sent| non_empty(sent.destination.as_deref()))
    }

    fn sent_message(&self) -> Option<&SentMessage> {
        self.sync_message.as_ref().and_then(|sync| sync.sent_message.as_ref())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}
