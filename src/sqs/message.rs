use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use uuid::Uuid;

use crate::attribute::{attributes_size, MessageAttributeValue};

use super::types::ReceivedMessage;

/// One stored message. Timestamps are epoch milliseconds from the bus clock.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: String,
    pub body: String,
    pub md5_of_body: String,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
    pub md5_of_message_attributes: Option<String>,
    pub sent_timestamp: i64,
    pub visible_at: i64,
    pub receive_count: u32,
    pub first_receive_timestamp: Option<i64>,
    pub message_group_id: Option<String>,
    pub deduplication_id: Option<String>,
    pub sequence_number: Option<String>,
    pub sender_id: String,
    pub trace_header: Option<String>,
    /// Queue this message was dead-lettered from, if any.
    pub dead_letter_source_arn: Option<String>,
}

impl Message {
    pub fn size(&self) -> usize {
        self.body.len() + attributes_size(&self.message_attributes)
    }

    pub fn is_expired(&self, now: i64, retention_secs: u32) -> bool {
        now - self.sent_timestamp >= i64::from(retention_secs) * 1000
    }

    fn system_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("SenderId".into(), self.sender_id.clone());
        attrs.insert("SentTimestamp".into(), self.sent_timestamp.to_string());
        attrs.insert(
            "ApproximateReceiveCount".into(),
            self.receive_count.to_string(),
        );
        if let Some(first) = self.first_receive_timestamp {
            attrs.insert("ApproximateFirstReceiveTimestamp".into(), first.to_string());
        }
        if let Some(ref group) = self.message_group_id {
            attrs.insert("MessageGroupId".into(), group.clone());
        }
        if let Some(ref dedup) = self.deduplication_id {
            attrs.insert("MessageDeduplicationId".into(), dedup.clone());
        }
        if let Some(ref seq) = self.sequence_number {
            attrs.insert("SequenceNumber".into(), seq.clone());
        }
        if let Some(ref trace) = self.trace_header {
            attrs.insert("AWSTraceHeader".into(), trace.clone());
        }
        if let Some(ref source) = self.dead_letter_source_arn {
            attrs.insert("DeadLetterQueueSourceArn".into(), source.clone());
        }
        attrs
    }

    /// Renders the message as handed to a receiver, with every system and
    /// user attribute; callers narrow them with [`AttributeSelection`].
    pub fn to_received(&self, receipt_handle: &str) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.message_id.clone(),
            receipt_handle: receipt_handle.to_string(),
            body: self.body.clone(),
            md5_of_body: self.md5_of_body.clone(),
            md5_of_message_attributes: self.md5_of_message_attributes.clone(),
            attributes: self.system_attributes(),
            message_attributes: self.message_attributes.clone(),
        }
    }
}

/// Receipt handles encode the owning queue and message so a handle from one
/// queue is rejected by another, plus a nonce that changes on every receive.
pub struct ReceiptHandle;

impl ReceiptHandle {
    pub fn mint(queue_arn: &str, message_id: &str) -> String {
        let raw = format!("{queue_arn} {message_id} {}", Uuid::new_v4());
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Returns `(queue_arn, message_id)` for a well-formed handle.
    pub fn decode(handle: &str) -> Option<(String, String)> {
        let bytes = URL_SAFE_NO_PAD.decode(handle).ok()?;
        let raw = String::from_utf8(bytes).ok()?;
        let mut parts = raw.split(' ');
        let arn = parts.next()?;
        let message_id = parts.next()?;
        parts.next()?;
        Some((arn.to_string(), message_id.to_string()))
    }
}

/// Name filter used for `AttributeNames` and `MessageAttributeNames`:
/// `All` or `.*` selects everything, `prefix.*` selects by prefix.
#[derive(Debug, Clone, Default)]
pub struct AttributeSelection {
    names: Vec<String>,
}

impl AttributeSelection {
    pub fn new(names: Option<Vec<String>>) -> Self {
        AttributeSelection {
            names: names.unwrap_or_default(),
        }
    }

    pub fn all() -> Self {
        AttributeSelection {
            names: vec!["All".into()],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.names.iter().any(|n| {
            n == "All"
                || n == ".*"
                || n == name
                || n
                    .strip_suffix(".*")
                    .is_some_and(|prefix| name.starts_with(prefix) && name[prefix.len()..].starts_with('.'))
        })
    }

    pub fn retain<V>(&self, map: &mut HashMap<String, V>) {
        if self.is_empty() {
            map.clear();
        } else {
            map.retain(|k, _| self.matches(k));
        }
    }
}

/// Narrows a received message to the attributes the caller asked for. The
/// attribute digest always describes the full set, as the real service does.
pub fn filter_received(
    mut msg: ReceivedMessage,
    system: &AttributeSelection,
    user: &AttributeSelection,
) -> ReceivedMessage {
    system.retain(&mut msg.attributes);
    user.retain(&mut msg.message_attributes);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_handle_round_trips_queue_and_message() {
        let handle = ReceiptHandle::mint("arn:aws:sqs:us-east-1:000000000000:q", "m-1");
        let (arn, id) = ReceiptHandle::decode(&handle).unwrap();
        assert_eq!(arn, "arn:aws:sqs:us-east-1:000000000000:q");
        assert_eq!(id, "m-1");
        assert_ne!(handle, ReceiptHandle::mint(&arn, &id));
        assert!(ReceiptHandle::decode("not a handle!").is_none());
    }

    #[test]
    fn selection_supports_all_exact_and_prefix() {
        let sel = AttributeSelection::new(Some(vec!["trace.*".into(), "kind".into()]));
        assert!(sel.matches("kind"));
        assert!(sel.matches("trace.id"));
        assert!(!sel.matches("tracer"));
        assert!(!sel.matches("other"));
        assert!(AttributeSelection::all().matches("anything"));
        assert!(!AttributeSelection::new(None).matches("kind"));
    }
}
