//! Wire format
//!
//! Inbound frames are JSON objects `{"to": "<username>", "message": "<text>"}`
//! where both fields are optional. Outbound frames are plain text.

use serde::Deserialize;

/// Inbound frame as sent by clients
#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// What the sender asked the relay to do with a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingIntent {
    /// Deliver to a single recipient
    Directed { recipient: String, body: String },
    /// Deliver to everyone connected
    Broadcast { body: String },
}

impl RoutingIntent {
    /// Decode a structured frame.
    ///
    /// A missing, null or empty `to` yields a broadcast. A missing or null
    /// `message` is the empty string.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        let frame: InboundFrame = serde_json::from_str(raw)?;
        let body = frame.message.unwrap_or_default();
        Ok(match frame.to {
            Some(recipient) if !recipient.is_empty() => RoutingIntent::Directed { recipient, body },
            _ => RoutingIntent::Broadcast { body },
        })
    }

    /// Decode a frame, treating anything unparseable as a broadcast of the raw text.
    ///
    /// The second element is `true` when the fallback was taken.
    pub fn decode_or_broadcast(raw: &str) -> (Self, bool) {
        match Self::decode(raw) {
            Ok(intent) => (intent, false),
            Err(_) => (
                RoutingIntent::Broadcast {
                    body: raw.to_string(),
                },
                true,
            ),
        }
    }
}

/// Text delivered to the recipient of a private message
pub fn private_text(sender: &str, body: &str) -> String {
    format!("(private) {sender}: {body}")
}

/// Echo sent back to the author of a private message
pub fn confirmation_text(recipient: &str, body: &str) -> String {
    format!("(to {recipient}) You: {body}")
}

pub fn broadcast_text(sender: &str, body: &str) -> String {
    format!("{sender}: {body}")
}

/// Notice sent to everyone remaining when a connection ends
pub fn departure_text(username: &str) -> String {
    format!("{username} left the chat")
}
