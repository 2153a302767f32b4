//! The publish action of a topic: its subscribers paired with their compiled
//! filter policies, rebuilt whenever the subscriber set or a subscriber's
//! attributes change.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Serialize;
use tracing::{debug, warn};

use crate::attribute::MessageAttributeValue;
use crate::bus::Bus;
use crate::sqs::queue::SendInput;

use super::filter::FilterPolicy;
use super::topic::Subscription;

/// One accepted publish, as handed to every subscriber.
#[derive(Debug, Clone)]
pub struct Publication {
    pub message_id: String,
    pub topic_arn: String,
    pub subject: Option<String>,
    pub message: String,
    pub attributes: HashMap<String, MessageAttributeValue>,
    pub timestamp: i64,
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,
    pub sequence_number: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub filtered: usize,
    pub failed: usize,
}

struct Target {
    subscription: Arc<Subscription>,
    filter: Option<FilterPolicy>,
    raw: bool,
}

#[derive(Default)]
pub struct PublishAction {
    targets: Vec<Target>,
}

impl PublishAction {
    pub fn build(subscriptions: &[Arc<Subscription>]) -> Self {
        let targets = subscriptions
            .iter()
            .filter_map(|sub| {
                let attrs = sub.attributes();
                match attrs.compiled_filter() {
                    Ok(filter) => Some(Target {
                        subscription: sub.clone(),
                        filter,
                        raw: attrs.raw_message_delivery,
                    }),
                    Err(e) => {
                        warn!(subscription = %sub.arn(), error = %e, "filter policy does not compile; subscription skipped");
                        None
                    }
                }
            })
            .collect();
        PublishAction { targets }
    }

    /// Delivers to every matching subscriber in subscription order. Failed
    /// deliveries are logged and counted, never retried.
    pub fn execute(&self, bus: &Bus, publication: &Publication) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for target in &self.targets {
            let sub = &target.subscription;
            if let Some(ref filter) = target.filter {
                if !filter.matches(&publication.attributes, &publication.message) {
                    report.filtered += 1;
                    continue;
                }
            }

            let Some(queue) = bus.queue_by_arn(sub.endpoint()) else {
                report.failed += 1;
                warn!(
                    subscription = %sub.arn(),
                    endpoint = %sub.endpoint(),
                    "subscribed queue does not exist; delivery dropped"
                );
                continue;
            };

            let mut input = if target.raw {
                SendInput::new(publication.message.clone())
                    .with_attributes(publication.attributes.clone())
            } else {
                SendInput::new(envelope(bus, sub, publication))
            };
            input.sender_id = bus.account_id().to_string();
            if queue.is_fifo() {
                input.group_id = publication.group_id.clone();
                input.deduplication_id = publication.deduplication_id.clone();
            }

            match queue.send(input) {
                Ok(outcome) => {
                    report.delivered += 1;
                    debug!(
                        message_id = %publication.message_id,
                        subscription = %sub.arn(),
                        queue_message_id = %outcome.message_id,
                        raw = target.raw,
                        "notification delivered"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        message_id = %publication.message_id,
                        subscription = %sub.arn(),
                        error = %e,
                        "queue rejected notification"
                    );
                }
            }
        }
        report
    }
}

#[derive(Serialize)]
struct EnvelopeAttribute<'a> {
    #[serde(rename = "Type")]
    data_type: &'a str,
    #[serde(rename = "Value")]
    value: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope<'a> {
    #[serde(rename = "Type")]
    kind: &'static str,
    message_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence_number: Option<&'a str>,
    topic_arn: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<&'a str>,
    message: &'a str,
    timestamp: String,
    signature_version: &'static str,
    #[serde(rename = "UnsubscribeURL")]
    unsubscribe_url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    message_attributes: BTreeMap<&'a str, EnvelopeAttribute<'a>>,
}

fn envelope(bus: &Bus, sub: &Subscription, publication: &Publication) -> String {
    let timestamp = DateTime::from_timestamp_millis(publication.timestamp)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    let unsubscribe_url = format!(
        "{}/?Action=Unsubscribe&SubscriptionArn={}",
        bus.config().sns_endpoint,
        utf8_percent_encode(sub.arn(), NON_ALPHANUMERIC)
    );
    let message_attributes = publication
        .attributes
        .iter()
        .map(|(name, attr)| {
            let value = attr
                .string_value
                .as_deref()
                .or(attr.binary_value.as_deref())
                .unwrap_or("");
            (
                name.as_str(),
                EnvelopeAttribute {
                    data_type: &attr.data_type,
                    value,
                },
            )
        })
        .collect();

    let envelope = Envelope {
        kind: "Notification",
        message_id: &publication.message_id,
        sequence_number: publication.sequence_number.as_deref(),
        topic_arn: &publication.topic_arn,
        subject: publication.subject.as_deref(),
        message: &publication.message,
        timestamp,
        signature_version: "1",
        unsubscribe_url,
        message_attributes,
    };
    // Plain string-keyed structs always serialize.
    serde_json::to_string(&envelope).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::BusConfig;
    use crate::sns::topic::SubscriptionAttributes;
    use crate::sqs::attributes::QueueAttributes;
    use crate::sqs::queue::{QueueResource, ReceiveOptions};
    use serde_json::Value;

    fn bus_with_queue(name: &str) -> (Bus, Arc<QueueResource>) {
        let clock = Arc::new(ManualClock::default());
        let bus = Bus::new(BusConfig::default(), clock.clone());
        let queue = Arc::new(QueueResource::new(
            name.into(),
            bus.queue_arn(name),
            bus.queue_url(name),
            QueueAttributes::default(),
            clock,
        ));
        bus.queues.insert(name.into(), queue.clone());
        (bus, queue)
    }

    fn subscription(bus: &Bus, queue: &str, attrs: SubscriptionAttributes) -> Arc<Subscription> {
        let topic_arn = bus.topic_arn("news");
        Arc::new(Subscription::new(
            format!("{topic_arn}:0b7c2f3e"),
            topic_arn,
            "sqs".into(),
            bus.queue_arn(queue),
            bus.account_id().into(),
            attrs,
        ))
    }

    fn publication(bus: &Bus) -> Publication {
        let mut attributes = HashMap::new();
        attributes.insert("kind".to_string(), MessageAttributeValue::string("order"));
        Publication {
            message_id: "6e0d7d52".into(),
            topic_arn: bus.topic_arn("news"),
            subject: Some("hello".into()),
            message: "payload".into(),
            attributes,
            timestamp: 1_704_067_200_123,
            group_id: None,
            deduplication_id: None,
            sequence_number: None,
        }
    }

    #[test]
    fn enveloped_delivery_wraps_message() {
        let (bus, queue) = bus_with_queue("inbox");
        let sub = subscription(&bus, "inbox", SubscriptionAttributes::default());
        let action = PublishAction::build(&[sub.clone()]);

        let report = action.execute(&bus, &publication(&bus));
        assert_eq!(report.delivered, 1);

        let received = queue.receive(ReceiveOptions::default()).unwrap();
        let body: Value = serde_json::from_str(&received.delivered[0].message.body).unwrap();
        assert_eq!(body["Type"], "Notification");
        assert_eq!(body["Message"], "payload");
        assert_eq!(body["Subject"], "hello");
        assert_eq!(body["Timestamp"], "2024-01-01T00:00:00.123Z");
        assert_eq!(body["MessageAttributes"]["kind"]["Value"], "order");
        let unsubscribe = body["UnsubscribeURL"].as_str().unwrap();
        assert!(unsubscribe.starts_with("http://localhost:9911/?Action=Unsubscribe&SubscriptionArn=arn%3Aaws%3Asns"));
        assert!(received.delivered[0].message.message_attributes.is_empty());
    }

    #[test]
    fn filtered_and_missing_targets_are_counted() {
        let (bus, _queue) = bus_with_queue("inbox");
        let invoices = SubscriptionAttributes {
            filter_policy: Some(r#"{"kind":["invoice"]}"#.into()),
            ..Default::default()
        };
        let filtered = subscription(&bus, "inbox", invoices);
        let orphan = subscription(&bus, "gone", SubscriptionAttributes::default());
        let action = PublishAction::build(&[filtered, orphan]);

        let report = action.execute(&bus, &publication(&bus));
        assert_eq!(
            report,
            DeliveryReport {
                delivered: 0,
                filtered: 1,
                failed: 1,
            }
        );
    }
}
