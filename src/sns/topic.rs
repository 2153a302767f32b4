use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};

use crate::clock::Clock;
use crate::dedup::DedupCache;
use crate::error::{BusError, BusResult};

use super::fanout::PublishAction;
use super::filter::{FilterPolicy, FilterScope};

pub const MAX_TAGS: usize = 50;

const DEFAULT_ACTIONS: &[&str] = &[
    "SNS:GetTopicAttributes",
    "SNS:SetTopicAttributes",
    "SNS:AddPermission",
    "SNS:RemovePermission",
    "SNS:DeleteTopic",
    "SNS:Subscribe",
    "SNS:ListSubscriptionsByTopic",
    "SNS:Publish",
];

fn parse_bool(name: &str, value: &str) -> BusResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(BusError::invalid_parameter(format!(
            "Invalid parameter: Attributes Reason: {name}: Invalid value [{value}]. Must be true or false."
        ))),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicAttributes {
    pub display_name: String,
    pub policy: String,
    pub delivery_policy: Option<String>,
    pub kms_master_key_id: Option<String>,
    pub fifo_topic: bool,
    pub content_based_deduplication: bool,
    pub signature_version: String,
    pub tracing_config: String,
}

impl TopicAttributes {
    pub fn new(arn: &str, owner: &str, fifo: bool) -> Self {
        TopicAttributes {
            display_name: String::new(),
            policy: default_policy(arn, owner),
            delivery_policy: None,
            kms_master_key_id: None,
            fifo_topic: fifo,
            content_based_deduplication: false,
            signature_version: "1".into(),
            tracing_config: "PassThrough".into(),
        }
    }

    /// `creating` allows the attributes that are fixed once a topic exists.
    pub fn apply(&mut self, name: &str, value: &str, creating: bool) -> BusResult<()> {
        match name {
            "DisplayName" => self.display_name = value.to_string(),
            "Policy" => {
                serde_json::from_str::<Value>(value).map_err(|_| {
                    BusError::invalid_parameter("Invalid parameter: Policy Error: null")
                })?;
                self.policy = value.to_string();
            }
            "DeliveryPolicy" => {
                self.delivery_policy = (!value.is_empty()).then(|| value.to_string())
            }
            "KmsMasterKeyId" => {
                self.kms_master_key_id = (!value.is_empty()).then(|| value.to_string())
            }
            "SignatureVersion" => match value {
                "1" | "2" => self.signature_version = value.to_string(),
                _ => {
                    return Err(BusError::invalid_parameter(format!(
                        "Invalid parameter: SignatureVersion: Invalid value [{value}]"
                    )))
                }
            },
            "TracingConfig" => match value {
                "PassThrough" | "Active" => self.tracing_config = value.to_string(),
                _ => {
                    return Err(BusError::invalid_parameter(format!(
                        "Invalid parameter: TracingConfig: Invalid value [{value}]"
                    )))
                }
            },
            "FifoTopic" if creating => self.fifo_topic = parse_bool(name, value)?,
            "ContentBasedDeduplication" => {
                let enabled = parse_bool(name, value)?;
                if enabled && !self.fifo_topic {
                    return Err(BusError::invalid_parameter(
                        "Invalid parameter: Attributes Reason: Content-based deduplication can only be set for FIFO topics",
                    ));
                }
                self.content_based_deduplication = enabled;
            }
            _ => {
                return Err(BusError::invalid_parameter(format!(
                    "Invalid parameter: AttributeName: {name}"
                )))
            }
        }
        Ok(())
    }

    pub fn apply_all(&mut self, attrs: &HashMap<String, String>, creating: bool) -> BusResult<()> {
        // FifoTopic decides whether ContentBasedDeduplication is legal.
        if let Some(fifo) = attrs.get("FifoTopic") {
            self.apply("FifoTopic", fifo, creating)?;
        }
        for (name, value) in attrs.iter().filter(|(k, _)| k.as_str() != "FifoTopic") {
            self.apply(name, value, creating)?;
        }
        Ok(())
    }
}

fn default_policy(arn: &str, owner: &str) -> String {
    json!({
        "Version": "2008-10-17",
        "Id": "__default_policy_ID",
        "Statement": [{
            "Sid": "__default_statement_ID",
            "Effect": "Allow",
            "Principal": { "AWS": "*" },
            "Action": DEFAULT_ACTIONS,
            "Resource": arn,
            "Condition": { "StringEquals": { "AWS:SourceOwner": owner } },
        }],
    })
    .to_string()
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubscriptionAttributes {
    pub raw_message_delivery: bool,
    pub filter_policy: Option<String>,
    pub filter_policy_scope: FilterScope,
    pub redrive_policy: Option<String>,
}

impl SubscriptionAttributes {
    pub fn apply(&mut self, name: &str, value: &str) -> BusResult<()> {
        match name {
            "RawMessageDelivery" => self.raw_message_delivery = parse_bool(name, value)?,
            "FilterPolicy" => {
                if value.trim().is_empty() {
                    self.filter_policy = None;
                } else {
                    FilterPolicy::compile(value, self.filter_policy_scope)?;
                    self.filter_policy = Some(value.to_string());
                }
            }
            "FilterPolicyScope" => {
                let scope = FilterScope::parse(value)?;
                if let Some(ref policy) = self.filter_policy {
                    FilterPolicy::compile(policy, scope)?;
                }
                self.filter_policy_scope = scope;
            }
            "RedrivePolicy" => {
                if value.trim().is_empty() {
                    self.redrive_policy = None;
                } else {
                    let parsed: Value = serde_json::from_str(value).map_err(|_| {
                        BusError::invalid_parameter("Invalid parameter: RedrivePolicy: failed to parse JSON.")
                    })?;
                    if parsed.get("deadLetterTargetArn").and_then(Value::as_str).is_none() {
                        return Err(BusError::invalid_parameter(
                            "Invalid parameter: RedrivePolicy: deadLetterTargetArn is missing",
                        ));
                    }
                    self.redrive_policy = Some(value.to_string());
                }
            }
            _ => {
                return Err(BusError::invalid_parameter(format!(
                    "Invalid parameter: AttributeName: {name}"
                )))
            }
        }
        Ok(())
    }

    pub fn apply_all(&mut self, attrs: &HashMap<String, String>) -> BusResult<()> {
        // The scope must be known before the policy is compiled against it.
        if let Some(scope) = attrs.get("FilterPolicyScope") {
            self.filter_policy_scope = FilterScope::parse(scope)?;
        }
        for (name, value) in attrs {
            self.apply(name, value)?;
        }
        Ok(())
    }

    pub fn compiled_filter(&self) -> BusResult<Option<FilterPolicy>> {
        self.filter_policy
            .as_deref()
            .map(|p| FilterPolicy::compile(p, self.filter_policy_scope))
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSnapshot {
    pub subscription_arn: String,
    pub topic_arn: String,
    pub protocol: String,
    pub endpoint: String,
    pub raw_message_delivery: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_policy: Option<String>,
}

/// A queue subscribed to a topic. Subscriptions are confirmed on creation.
#[derive(Debug)]
pub struct Subscription {
    arn: String,
    topic_arn: String,
    protocol: String,
    endpoint: String,
    owner: String,
    attributes: RwLock<SubscriptionAttributes>,
}

impl Subscription {
    pub fn new(
        arn: String,
        topic_arn: String,
        protocol: String,
        endpoint: String,
        owner: String,
        attributes: SubscriptionAttributes,
    ) -> Self {
        Subscription {
            arn,
            topic_arn,
            protocol,
            endpoint,
            owner,
            attributes: RwLock::new(attributes),
        }
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    pub fn topic_arn(&self) -> &str {
        &self.topic_arn
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn attributes(&self) -> SubscriptionAttributes {
        self.attributes.read().clone()
    }

    pub fn get_attributes(&self) -> HashMap<String, String> {
        let attrs = self.attributes.read();
        let mut m = HashMap::new();
        m.insert("SubscriptionArn".into(), self.arn.clone());
        m.insert("TopicArn".into(), self.topic_arn.clone());
        m.insert("Protocol".into(), self.protocol.clone());
        m.insert("Endpoint".into(), self.endpoint.clone());
        m.insert("Owner".into(), self.owner.clone());
        m.insert("ConfirmationWasAuthenticated".into(), "true".into());
        m.insert("PendingConfirmation".into(), "false".into());
        m.insert(
            "RawMessageDelivery".into(),
            attrs.raw_message_delivery.to_string(),
        );
        if let Some(ref fp) = attrs.filter_policy {
            m.insert("FilterPolicy".into(), fp.clone());
            m.insert(
                "FilterPolicyScope".into(),
                attrs.filter_policy_scope.as_str().into(),
            );
        }
        if let Some(ref rp) = attrs.redrive_policy {
            m.insert("RedrivePolicy".into(), rp.clone());
        }
        m
    }

    /// Validates against a copy first so a rejected value leaves the
    /// subscription untouched.
    pub fn set_attribute(&self, name: &str, value: &str) -> BusResult<()> {
        let mut attrs = self.attributes.write();
        let mut candidate = attrs.clone();
        candidate.apply(name, value)?;
        *attrs = candidate;
        Ok(())
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        let attrs = self.attributes.read();
        SubscriptionSnapshot {
            subscription_arn: self.arn.clone(),
            topic_arn: self.topic_arn.clone(),
            protocol: self.protocol.clone(),
            endpoint: self.endpoint.clone(),
            raw_message_delivery: attrs.raw_message_delivery,
            filter_policy: attrs.filter_policy.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSnapshot {
    pub name: String,
    pub arn: String,
    pub fifo: bool,
    pub attributes: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub subscription_arns: Vec<String>,
}

/// Outcome of the FIFO deduplication check on publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted { sequence_number: String },
    Duplicate { message_id: String, sequence_number: String },
}

struct Subscribers {
    list: Vec<Arc<Subscription>>,
    action: Arc<PublishAction>,
    closed: bool,
}

/// Result of [`TopicResource::enroll`].
#[derive(Debug)]
pub enum Enrollment {
    Created(Arc<Subscription>),
    Existing(Arc<Subscription>),
}

struct FifoState {
    dedup: DedupCache<(String, String)>,
    sequence: u64,
}

pub struct TopicResource {
    name: String,
    arn: String,
    owner: String,
    fifo: bool,
    clock: Arc<dyn Clock>,
    attributes: RwLock<TopicAttributes>,
    tags: RwLock<HashMap<String, String>>,
    subscribers: RwLock<Subscribers>,
    fifo_state: Mutex<FifoState>,
}

impl TopicResource {
    pub fn new(
        name: String,
        arn: String,
        owner: String,
        attributes: TopicAttributes,
        clock: Arc<dyn Clock>,
    ) -> Self {
        TopicResource {
            fifo: attributes.fifo_topic,
            attributes: RwLock::new(attributes),
            tags: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Subscribers {
                list: Vec::new(),
                action: Arc::new(PublishAction::default()),
                closed: false,
            }),
            fifo_state: Mutex::new(FifoState {
                dedup: DedupCache::new(),
                sequence: 0,
            }),
            name,
            arn,
            owner,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_fifo(&self) -> bool {
        self.fifo
    }

    pub fn attributes(&self) -> TopicAttributes {
        self.attributes.read().clone()
    }

    // --- subscribers ---

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscribers.read().list.clone()
    }

    /// Returns the subscription already delivering `protocol` to `endpoint`,
    /// or adds the one built by `create`. The lookup, `create` and the insert
    /// all run under the subscriber lock, so concurrent identical calls yield
    /// one subscription and a closed topic accepts none.
    pub fn enroll(
        &self,
        protocol: &str,
        endpoint: &str,
        attributes: &SubscriptionAttributes,
        create: impl FnOnce() -> Arc<Subscription>,
    ) -> BusResult<Enrollment> {
        let mut subs = self.subscribers.write();
        if subs.closed {
            return Err(BusError::topic_does_not_exist());
        }
        if let Some(existing) = subs
            .list
            .iter()
            .find(|s| s.protocol() == protocol && s.endpoint() == endpoint)
        {
            if existing.attributes() != *attributes {
                return Err(BusError::invalid_parameter(
                    "Invalid parameter: Attributes Reason: Subscription already exists with different attributes",
                ));
            }
            return Ok(Enrollment::Existing(existing.clone()));
        }
        let subscription = create();
        subs.list.push(subscription.clone());
        subs.action = Arc::new(PublishAction::build(&subs.list));
        Ok(Enrollment::Created(subscription))
    }

    /// Stops accepting subscriptions and hands back the current ones.
    pub fn close(&self) -> Vec<Arc<Subscription>> {
        let mut subs = self.subscribers.write();
        subs.closed = true;
        subs.action = Arc::new(PublishAction::default());
        std::mem::take(&mut subs.list)
    }

    pub fn remove_subscription(&self, arn: &str) -> Option<Arc<Subscription>> {
        let mut subs = self.subscribers.write();
        let pos = subs.list.iter().position(|s| s.arn() == arn)?;
        let removed = subs.list.remove(pos);
        subs.action = Arc::new(PublishAction::build(&subs.list));
        Some(removed)
    }

    /// Recompiles the publish action after a subscription's attributes changed.
    pub fn rebuild(&self) {
        let mut subs = self.subscribers.write();
        subs.action = Arc::new(PublishAction::build(&subs.list));
    }

    pub fn publish_action(&self) -> Arc<PublishAction> {
        self.subscribers.read().action.clone()
    }

    // --- attributes ---

    pub fn get_attributes(&self) -> HashMap<String, String> {
        let attrs = self.attributes.read();
        let confirmed = self.subscribers.read().list.len();
        let mut m = HashMap::new();
        m.insert("TopicArn".into(), self.arn.clone());
        m.insert("Owner".into(), self.owner.clone());
        m.insert("DisplayName".into(), attrs.display_name.clone());
        m.insert("Policy".into(), attrs.policy.clone());
        m.insert("SubscriptionsConfirmed".into(), confirmed.to_string());
        m.insert("SubscriptionsPending".into(), "0".into());
        m.insert("SubscriptionsDeleted".into(), "0".into());
        m.insert("SignatureVersion".into(), attrs.signature_version.clone());
        m.insert("TracingConfig".into(), attrs.tracing_config.clone());
        m.insert("FifoTopic".into(), attrs.fifo_topic.to_string());
        if attrs.fifo_topic {
            m.insert(
                "ContentBasedDeduplication".into(),
                attrs.content_based_deduplication.to_string(),
            );
        }
        if let Some(ref dp) = attrs.delivery_policy {
            m.insert("DeliveryPolicy".into(), dp.clone());
            m.insert("EffectiveDeliveryPolicy".into(), dp.clone());
        }
        if let Some(ref key) = attrs.kms_master_key_id {
            m.insert("KmsMasterKeyId".into(), key.clone());
        }
        m
    }

    pub fn set_attribute(&self, name: &str, value: &str) -> BusResult<()> {
        let mut attrs = self.attributes.write();
        let mut candidate = attrs.clone();
        candidate.apply(name, value, false)?;
        *attrs = candidate;
        Ok(())
    }

    // --- tags ---

    pub fn tags(&self) -> HashMap<String, String> {
        self.tags.read().clone()
    }

    pub fn tag(&self, tags: HashMap<String, String>) -> BusResult<()> {
        let mut current = self.tags.write();
        let added = tags.keys().filter(|k| !current.contains_key(*k)).count();
        if current.len() + added > MAX_TAGS {
            return Err(BusError::over_limit(
                "Could not complete request: tag quota of per resource exceeded",
            ));
        }
        current.extend(tags);
        Ok(())
    }

    pub fn untag(&self, keys: &[String]) {
        let mut current = self.tags.write();
        for key in keys {
            current.remove(key);
        }
    }

    // --- permissions ---

    pub fn add_permission(
        &self,
        label: &str,
        account_ids: &[String],
        actions: &[String],
    ) -> BusResult<()> {
        let mut attrs = self.attributes.write();
        let mut policy = parse_policy(&attrs.policy)?;
        let statements = statements_mut(&mut policy)?;
        if statements.iter().any(|s| s.get("Sid").and_then(Value::as_str) == Some(label)) {
            return Err(BusError::conflict(format!(
                "Invalid parameter: Statement already exists: {label}"
            )));
        }
        let principals: Vec<String> = account_ids
            .iter()
            .map(|a| format!("arn:aws:iam::{a}:root"))
            .collect();
        let actions: Vec<String> = actions.iter().map(|a| format!("SNS:{a}")).collect();
        statements.push(json!({
            "Sid": label,
            "Effect": "Allow",
            "Principal": { "AWS": principals },
            "Action": actions,
            "Resource": self.arn,
        }));
        attrs.policy = policy.to_string();
        Ok(())
    }

    pub fn remove_permission(&self, label: &str) -> BusResult<()> {
        let mut attrs = self.attributes.write();
        let mut policy = parse_policy(&attrs.policy)?;
        let statements = statements_mut(&mut policy)?;
        let before = statements.len();
        statements.retain(|s| s.get("Sid").and_then(Value::as_str) != Some(label));
        if statements.len() == before {
            return Err(BusError::not_found(format!(
                "Invalid parameter: Label: no statement with label {label}"
            )));
        }
        attrs.policy = policy.to_string();
        Ok(())
    }

    // --- FIFO ---

    /// Runs the deduplication window for one FIFO publish and assigns its
    /// sequence number. A duplicate gets the first publish's identifiers back.
    pub fn admit(&self, deduplication_id: &str, message_id: &str) -> Admission {
        let now = self.clock.now_millis();
        let mut state = self.fifo_state.lock();
        state.dedup.evict_expired(now);
        if let Some((message_id, sequence_number)) = state.dedup.get(deduplication_id, now) {
            return Admission::Duplicate {
                message_id,
                sequence_number,
            };
        }
        state.sequence += 1;
        let sequence_number = format!("{:020}", state.sequence);
        state.dedup.insert(
            deduplication_id.to_string(),
            (message_id.to_string(), sequence_number.clone()),
            now,
        );
        Admission::Accepted { sequence_number }
    }

    pub fn snapshot(&self) -> TopicSnapshot {
        TopicSnapshot {
            name: self.name.clone(),
            arn: self.arn.clone(),
            fifo: self.fifo,
            attributes: self.get_attributes().into_iter().collect(),
            tags: self.tags().into_iter().collect(),
            subscription_arns: self
                .subscriptions()
                .iter()
                .map(|s| s.arn().to_string())
                .collect(),
        }
    }
}

fn parse_policy(policy: &str) -> BusResult<Value> {
    serde_json::from_str(policy)
        .map_err(|e| BusError::invalid_parameter(format!("Invalid parameter: Policy: {e}")))
}

fn statements_mut(policy: &mut Value) -> BusResult<&mut Vec<Value>> {
    let obj = policy
        .as_object_mut()
        .ok_or_else(|| BusError::invalid_parameter("Invalid parameter: Policy: not an object"))?;
    let statements = obj
        .entry("Statement")
        .or_insert_with(|| Value::Array(Vec::new()));
    statements
        .as_array_mut()
        .ok_or_else(|| BusError::invalid_parameter("Invalid parameter: Policy: Statement is not a list"))
}
