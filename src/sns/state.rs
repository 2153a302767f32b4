//! Topic operations of the [`Bus`], one method per SNS action.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::attribute::{attributes_size, sha256_hex, validate_message_attributes};
use crate::bus::Bus;
use crate::error::{validate_batch_ids, BusError, BusResult};
use crate::sqs::attributes::MAX_MESSAGE_SIZE;
use crate::sqs::state::paginate;

use super::error::error_code;
use super::fanout::Publication;
use super::topic::{Admission, Enrollment, Subscription, SubscriptionAttributes, TopicAttributes, TopicResource, MAX_TAGS};
use super::types::*;

const PAGE_SIZE: usize = 100;
const MAX_SUBJECT_LENGTH: usize = 100;

fn validate_topic_name(name: &str, fifo: bool) -> BusResult<()> {
    let base = name.strip_suffix(".fifo").unwrap_or(name);
    let valid = !base.is_empty()
        && name.len() <= 256
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(BusError::invalid_parameter(
            "Invalid parameter: Topic Name",
        ));
    }
    if fifo != name.ends_with(".fifo") {
        return Err(BusError::invalid_parameter(
            "Invalid parameter: Fifo Topic names must end with .fifo and must be made up of only uppercase and lowercase ASCII letters, numbers, underscores, and hyphens, and must be between 1 and 256 characters long.",
        ));
    }
    Ok(())
}

fn validate_label(label: &str) -> BusResult<()> {
    let valid = !label.is_empty()
        && label.len() <= 100
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(BusError::invalid_parameter(format!(
            "Invalid parameter: Label: {label}"
        )))
    }
}

fn failure(id: String, err: &BusError) -> BatchResultErrorEntry {
    BatchResultErrorEntry {
        id,
        code: error_code(err.kind()).to_string(),
        message: err.message().to_string(),
        sender_fault: true,
    }
}

/// With `MessageStructure=json` the message is an object of per-protocol
/// payloads; queue subscribers get the `sqs` entry, falling back to `default`.
fn select_payload(message: &str, structure: Option<&str>) -> BusResult<String> {
    match structure {
        None | Some("") => Ok(message.to_string()),
        Some("json") => {
            let parsed: Value = serde_json::from_str(message).map_err(|_| {
                BusError::invalid_parameter("Invalid parameter: Message Structure - JSON message body failed to parse")
            })?;
            let default = parsed.get("default").and_then(Value::as_str).ok_or_else(|| {
                BusError::invalid_parameter("Invalid parameter: Message Structure - No default entry in JSON message body")
            })?;
            Ok(parsed
                .get("sqs")
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string())
        }
        Some(other) => Err(BusError::invalid_parameter(format!(
            "Invalid parameter: MessageStructure: Invalid value [{other}]"
        ))),
    }
}

/// One publish before it is admitted and delivered.
struct Draft<'a> {
    message: &'a str,
    subject: Option<&'a str>,
    message_structure: Option<&'a str>,
    attributes: HashMap<String, MessageAttributeValue>,
    group_id: Option<&'a str>,
    deduplication_id: Option<&'a str>,
}

impl<'a> Draft<'a> {
    fn size(&self) -> usize {
        self.message.len() + attributes_size(&self.attributes)
    }
}

impl Bus {
    fn require_topic(&self, arn: &str) -> BusResult<Arc<TopicResource>> {
        self.topic_by_arn(arn)
            .ok_or_else(BusError::topic_does_not_exist)
    }

    fn require_subscription(&self, arn: &str) -> BusResult<Arc<Subscription>> {
        self.subscription_by_arn(arn)
            .ok_or_else(|| BusError::not_found("Subscription does not exist"))
    }

    pub async fn create_topic(&self, req: CreateTopicRequest) -> BusResult<CreateTopicResponse> {
        let requested = req.attributes.unwrap_or_default();
        let fifo = requested
            .get("FifoTopic")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        validate_topic_name(&req.name, fifo)?;

        let tags: HashMap<String, String> = req
            .tags
            .unwrap_or_default()
            .into_iter()
            .map(|t| (t.key, t.value))
            .collect();
        if tags.len() > MAX_TAGS {
            return Err(BusError::over_limit(
                "Could not complete request: tag quota of per resource exceeded",
            ));
        }

        let arn = self.topic_arn(&req.name);
        let mut attributes = TopicAttributes::new(&arn, self.account_id(), fifo);
        attributes.apply_all(&requested, true)?;

        let topic = match self.topics.entry(arn.clone()) {
            Entry::Occupied(existing) => {
                let current = existing.get().get_attributes();
                let differs = requested
                    .iter()
                    .any(|(k, v)| current.get(k).is_some_and(|c| c != v));
                if differs {
                    return Err(BusError::already_exists(
                        "Invalid parameter: Attributes Reason: Topic already exists with different attributes",
                    ));
                }
                return Ok(CreateTopicResponse { topic_arn: arn });
            }
            Entry::Vacant(slot) => {
                let topic = Arc::new(TopicResource::new(
                    req.name.clone(),
                    arn.clone(),
                    self.account_id().to_string(),
                    attributes,
                    self.clock().clone(),
                ));
                slot.insert(topic.clone());
                topic
            }
        };
        if !tags.is_empty() {
            topic.tag(tags)?;
        }
        info!(topic = %req.name, fifo, "topic created");
        Ok(CreateTopicResponse { topic_arn: arn })
    }

    /// Removes the topic together with its subscriptions.
    pub async fn delete_topic(&self, req: DeleteTopicRequest) -> BusResult<()> {
        let (_, topic) = self
            .topics
            .remove(&req.topic_arn)
            .ok_or_else(BusError::topic_does_not_exist)?;
        for sub in topic.close() {
            self.subscriptions.remove(sub.arn());
        }
        info!(topic = %topic.name(), "topic deleted");
        Ok(())
    }

    pub async fn list_topics(&self, req: ListTopicsRequest) -> BusResult<ListTopicsResponse> {
        let arns: Vec<String> = self.topics.iter().map(|t| t.key().clone()).collect();
        let (topics, next_token) = paginate(arns, req.next_token.as_deref(), PAGE_SIZE);
        Ok(ListTopicsResponse { topics, next_token })
    }

    pub async fn get_topic_attributes(
        &self,
        req: GetTopicAttributesRequest,
    ) -> BusResult<GetTopicAttributesResponse> {
        let topic = self.require_topic(&req.topic_arn)?;
        Ok(GetTopicAttributesResponse {
            attributes: topic.get_attributes(),
        })
    }

    pub async fn set_topic_attributes(&self, req: SetTopicAttributesRequest) -> BusResult<()> {
        let topic = self.require_topic(&req.topic_arn)?;
        topic.set_attribute(&req.attribute_name, req.attribute_value.as_deref().unwrap_or(""))
    }

    // --- subscriptions ---

    /// Subscribing the same endpoint twice with the same attributes returns
    /// the existing subscription.
    pub async fn subscribe(&self, req: SubscribeRequest) -> BusResult<SubscribeResponse> {
        let topic = self.require_topic(&req.topic_arn)?;
        if req.protocol != "sqs" {
            return Err(BusError::unsupported(format!(
                "Invalid parameter: Protocol: {} is not supported",
                req.protocol
            )));
        }
        let endpoint = req
            .endpoint
            .filter(|e| e.starts_with("arn:aws:sqs:"))
            .ok_or_else(|| BusError::invalid_parameter("Invalid parameter: SQS endpoint ARN"))?;
        if topic.is_fifo() != endpoint.ends_with(".fifo") {
            return Err(BusError::invalid_parameter(
                "Invalid parameter: Invalid parameter: Endpoint Reason: FIFO SNS topics can only deliver to FIFO SQS queues, and standard topics only to standard queues",
            ));
        }

        let mut attributes = SubscriptionAttributes::default();
        attributes.apply_all(&req.attributes.unwrap_or_default())?;

        let subscription = match topic.enroll(&req.protocol, &endpoint, &attributes, || {
            let arn = format!("{}:{}", topic.arn(), Uuid::new_v4());
            let subscription = Arc::new(Subscription::new(
                arn.clone(),
                topic.arn().to_string(),
                req.protocol.clone(),
                endpoint.clone(),
                self.account_id().to_string(),
                attributes.clone(),
            ));
            self.subscriptions.insert(arn, subscription.clone());
            subscription
        })? {
            Enrollment::Existing(existing) => {
                return Ok(SubscribeResponse {
                    subscription_arn: existing.arn().to_string(),
                })
            }
            Enrollment::Created(subscription) => subscription,
        };
        let arn = subscription.arn().to_string();
        info!(
            subscription = %arn,
            endpoint = %subscription.endpoint(),
            "subscription created"
        );
        Ok(SubscribeResponse {
            subscription_arn: arn,
        })
    }

    pub async fn unsubscribe(&self, req: UnsubscribeRequest) -> BusResult<()> {
        let (_, sub) = self
            .subscriptions
            .remove(&req.subscription_arn)
            .ok_or_else(|| BusError::not_found("Subscription does not exist"))?;
        if let Some(topic) = self.topic_by_arn(sub.topic_arn()) {
            topic.remove_subscription(sub.arn());
        }
        info!(subscription = %sub.arn(), "subscription removed");
        Ok(())
    }

    fn subscription_page(
        &self,
        subs: Vec<Arc<Subscription>>,
        token: Option<&str>,
    ) -> ListSubscriptionsResponse {
        let arns = subs.iter().map(|s| s.arn().to_string()).collect();
        let (page, next_token) = paginate(arns, token, PAGE_SIZE);
        let subscriptions = page
            .iter()
            .filter_map(|arn| subs.iter().find(|s| s.arn() == arn))
            .map(|s| SubscriptionEntry {
                subscription_arn: s.arn().to_string(),
                owner: s.owner().to_string(),
                protocol: s.protocol().to_string(),
                endpoint: s.endpoint().to_string(),
                topic_arn: s.topic_arn().to_string(),
            })
            .collect();
        ListSubscriptionsResponse {
            subscriptions,
            next_token,
        }
    }

    pub async fn list_subscriptions(
        &self,
        req: ListSubscriptionsRequest,
    ) -> BusResult<ListSubscriptionsResponse> {
        let subs = self
            .subscriptions
            .iter()
            .map(|s| s.value().clone())
            .collect();
        Ok(self.subscription_page(subs, req.next_token.as_deref()))
    }

    pub async fn list_subscriptions_by_topic(
        &self,
        req: ListSubscriptionsByTopicRequest,
    ) -> BusResult<ListSubscriptionsResponse> {
        let topic = self.require_topic(&req.topic_arn)?;
        Ok(self.subscription_page(topic.subscriptions(), req.next_token.as_deref()))
    }

    pub async fn get_subscription_attributes(
        &self,
        req: GetSubscriptionAttributesRequest,
    ) -> BusResult<GetSubscriptionAttributesResponse> {
        let sub = self.require_subscription(&req.subscription_arn)?;
        Ok(GetSubscriptionAttributesResponse {
            attributes: sub.get_attributes(),
        })
    }

    pub async fn set_subscription_attributes(
        &self,
        req: SetSubscriptionAttributesRequest,
    ) -> BusResult<()> {
        let sub = self.require_subscription(&req.subscription_arn)?;
        sub.set_attribute(&req.attribute_name, req.attribute_value.as_deref().unwrap_or(""))?;
        if let Some(topic) = self.topic_by_arn(sub.topic_arn()) {
            topic.rebuild();
        }
        Ok(())
    }

    // --- publish ---

    /// Checks one publish and turns it into a [`Publication`]. Nothing is
    /// admitted or delivered here.
    fn prepare_publish(&self, topic: &TopicResource, draft: Draft<'_>) -> BusResult<Publication> {
        if draft.message.is_empty() {
            return Err(BusError::invalid_parameter("Invalid parameter: Empty message"));
        }
        validate_message_attributes(&draft.attributes)?;
        if draft.size() > MAX_MESSAGE_SIZE as usize {
            return Err(BusError::message_too_large(format!(
                "Invalid parameter: Message too long. Message must be shorter than {MAX_MESSAGE_SIZE} bytes."
            )));
        }
        if let Some(subject) = draft.subject {
            if subject.is_empty() || subject.len() > MAX_SUBJECT_LENGTH {
                return Err(BusError::invalid_parameter("Invalid parameter: Subject"));
            }
        }
        let message = select_payload(draft.message, draft.message_structure)?;

        let (group_id, deduplication_id) = if topic.is_fifo() {
            let group = draft.group_id.ok_or_else(|| {
                BusError::invalid_parameter(
                    "Invalid parameter: The MessageGroupId parameter is required for FIFO topics",
                )
            })?;
            let dedup = match draft.deduplication_id {
                Some(id) => id.to_string(),
                None if topic.attributes().content_based_deduplication => {
                    sha256_hex(message.as_bytes())
                }
                None => {
                    return Err(BusError::invalid_parameter(
                        "Invalid parameter: The topic should either have ContentBasedDeduplication enabled or MessageDeduplicationId provided explicitly",
                    ))
                }
            };
            (Some(group.to_string()), Some(dedup))
        } else {
            (None, None)
        };

        Ok(Publication {
            message_id: Uuid::new_v4().to_string(),
            topic_arn: topic.arn().to_string(),
            subject: draft.subject.map(str::to_string),
            message,
            attributes: draft.attributes,
            timestamp: self.clock().now_millis(),
            group_id,
            deduplication_id,
            sequence_number: None,
        })
    }

    /// Admits a prepared publish through the FIFO dedup window and fans it
    /// out to the topic's current subscribers.
    fn deliver(&self, topic: &TopicResource, mut publication: Publication) -> PublishResponse {
        if let Some(dedup) = publication.deduplication_id.clone() {
            match topic.admit(&dedup, &publication.message_id) {
                Admission::Duplicate {
                    message_id,
                    sequence_number,
                } => {
                    debug!(topic = %topic.name(), message_id = %message_id, "duplicate publish suppressed");
                    return PublishResponse {
                        message_id,
                        sequence_number: Some(sequence_number),
                    };
                }
                Admission::Accepted { sequence_number } => {
                    publication.sequence_number = Some(sequence_number);
                }
            }
        }

        let report = topic.publish_action().execute(self, &publication);
        debug!(
            topic = %topic.name(),
            message_id = %publication.message_id,
            delivered = report.delivered,
            filtered = report.filtered,
            failed = report.failed,
            "publish fanned out"
        );
        PublishResponse {
            message_id: publication.message_id,
            sequence_number: publication.sequence_number,
        }
    }

    pub async fn publish(&self, req: PublishRequest) -> BusResult<PublishResponse> {
        let arn = req
            .topic_arn
            .as_deref()
            .or(req.target_arn.as_deref())
            .ok_or_else(|| {
                BusError::invalid_parameter(
                    "Invalid parameter: TopicArn or TargetArn Reason: no value for required parameter",
                )
            })?;
        let topic = self.require_topic(arn)?;
        let publication = self.prepare_publish(
            &topic,
            Draft {
                message: &req.message,
                subject: req.subject.as_deref(),
                message_structure: req.message_structure.as_deref(),
                attributes: req.message_attributes.clone().unwrap_or_default(),
                group_id: req.message_group_id.as_deref(),
                deduplication_id: req.message_deduplication_id.as_deref(),
            },
        )?;
        Ok(self.deliver(&topic, publication))
    }

    /// The aggregate size is checked before any entry is delivered; entries
    /// that fail their own checks are reported individually.
    pub async fn publish_batch(&self, req: PublishBatchRequest) -> BusResult<PublishBatchResponse> {
        let topic = self.require_topic(&req.topic_arn)?;
        let entries = &req.publish_batch_request_entries;
        validate_batch_ids(entries.iter().map(|e| e.id.as_str()))?;

        let drafts: Vec<(String, Draft<'_>)> = entries
            .iter()
            .map(|e| {
                (
                    e.id.clone(),
                    Draft {
                        message: &e.message,
                        subject: e.subject.as_deref(),
                        message_structure: e.message_structure.as_deref(),
                        attributes: e.message_attributes.clone().unwrap_or_default(),
                        group_id: e.message_group_id.as_deref(),
                        deduplication_id: e.message_deduplication_id.as_deref(),
                    },
                )
            })
            .collect();
        let total: usize = drafts.iter().map(|(_, d)| d.size()).sum();
        if total > MAX_MESSAGE_SIZE as usize {
            return Err(BusError::batch_too_long(format!(
                "Invalid parameter: The length of all the batch messages put together is more than the limit of {MAX_MESSAGE_SIZE} bytes."
            )));
        }

        let mut prepared = Vec::with_capacity(drafts.len());
        let mut failed = Vec::new();
        for (id, draft) in drafts {
            match self.prepare_publish(&topic, draft) {
                Ok(publication) => prepared.push((id, publication)),
                Err(e) => failed.push(failure(id, &e)),
            }
        }

        let successful = prepared
            .into_iter()
            .map(|(id, publication)| {
                let response = self.deliver(&topic, publication);
                PublishBatchResultEntry {
                    id,
                    message_id: response.message_id,
                    sequence_number: response.sequence_number,
                }
            })
            .collect();
        Ok(PublishBatchResponse { successful, failed })
    }

    // --- tags and permissions ---

    pub async fn tag_resource(&self, req: TagResourceRequest) -> BusResult<()> {
        let topic = self.require_topic(&req.resource_arn)?;
        topic.tag(req.tags.into_iter().map(|t| (t.key, t.value)).collect())
    }

    pub async fn untag_resource(&self, req: UntagResourceRequest) -> BusResult<()> {
        let topic = self.require_topic(&req.resource_arn)?;
        topic.untag(&req.tag_keys);
        Ok(())
    }

    pub async fn list_tags_for_resource(
        &self,
        req: ListTagsForResourceRequest,
    ) -> BusResult<ListTagsForResourceResponse> {
        let topic = self.require_topic(&req.resource_arn)?;
        let mut tags: Vec<Tag> = topic
            .tags()
            .into_iter()
            .map(|(key, value)| Tag { key, value })
            .collect();
        tags.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(ListTagsForResourceResponse { tags })
    }

    pub async fn add_topic_permission(&self, req: AddPermissionRequest) -> BusResult<()> {
        let topic = self.require_topic(&req.topic_arn)?;
        validate_label(&req.label)?;
        if req.aws_account_ids.is_empty() || req.action_names.is_empty() {
            return Err(BusError::invalid_parameter(
                "Invalid parameter: AWSAccountId and ActionName must not be empty",
            ));
        }
        topic.add_permission(&req.label, &req.aws_account_ids, &req.action_names)
    }

    pub async fn remove_topic_permission(&self, req: RemovePermissionRequest) -> BusResult<()> {
        let topic = self.require_topic(&req.topic_arn)?;
        topic.remove_permission(&req.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn json_structure_prefers_sqs_entry() {
        let msg = r#"{"default":"plain","sqs":"for queues"}"#;
        assert_eq!(select_payload(msg, Some("json")).unwrap(), "for queues");
        assert_eq!(
            select_payload(r#"{"default":"plain"}"#, Some("json")).unwrap(),
            "plain"
        );
        let err = select_payload(r#"{"sqs":"x"}"#, Some("json")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert_eq!(select_payload("raw", None).unwrap(), "raw");
    }

    #[test]
    fn topic_names_follow_type() {
        assert!(validate_topic_name("orders", false).is_ok());
        assert!(validate_topic_name("orders.fifo", true).is_ok());
        assert!(validate_topic_name("orders.fifo", false).is_err());
        assert!(validate_topic_name("orders", true).is_err());
        assert!(validate_topic_name("bad name", false).is_err());
    }
}
