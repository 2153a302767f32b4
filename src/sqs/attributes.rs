use std::collections::HashMap;

use crate::error::{BusError, BusResult};

pub const MAX_VISIBILITY_TIMEOUT: u32 = 43_200;
pub const MAX_DELAY_SECONDS: u32 = 900;
pub const MAX_WAIT_TIME_SECONDS: u32 = 20;
pub const MAX_MESSAGE_SIZE: u32 = 262_144;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrivePolicy {
    pub dead_letter_target_arn: String,
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    pub fn from_json(s: &str) -> BusResult<Self> {
        let v: serde_json::Value = serde_json::from_str(s)
            .map_err(|e| BusError::invalid_parameter(format!("Invalid RedrivePolicy JSON: {e}")))?;
        let arn = v
            .get("deadLetterTargetArn")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BusError::invalid_parameter("RedrivePolicy must contain deadLetterTargetArn")
            })?
            .to_string();
        let max_count = v
            .get("maxReceiveCount")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| {
                BusError::invalid_parameter("RedrivePolicy must contain maxReceiveCount")
            })?;
        if !(1..=1000).contains(&max_count) {
            return Err(BusError::invalid_parameter(
                "maxReceiveCount must be between 1 and 1000",
            ));
        }
        Ok(RedrivePolicy {
            dead_letter_target_arn: arn,
            max_receive_count: max_count as u32,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "deadLetterTargetArn": self.dead_letter_target_arn,
            "maxReceiveCount": self.max_receive_count,
        })
        .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedrivePermission {
    AllowAll,
    DenyAll,
    ByQueue(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedriveAllowPolicy {
    pub permission: RedrivePermission,
}

impl RedriveAllowPolicy {
    pub fn from_json(s: &str) -> BusResult<Self> {
        let v: serde_json::Value = serde_json::from_str(s).map_err(|e| {
            BusError::invalid_parameter(format!("Invalid RedriveAllowPolicy JSON: {e}"))
        })?;
        let arns: Vec<String> = v
            .get("sourceQueueArns")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let permission = match v
            .get("redrivePermission")
            .and_then(|v| v.as_str())
            .unwrap_or("allowAll")
        {
            "allowAll" => RedrivePermission::AllowAll,
            "denyAll" => RedrivePermission::DenyAll,
            "byQueue" => {
                if arns.is_empty() || arns.len() > 10 {
                    return Err(BusError::invalid_parameter(
                        "byQueue requires between 1 and 10 sourceQueueArns",
                    ));
                }
                RedrivePermission::ByQueue(arns)
            }
            other => {
                return Err(BusError::invalid_parameter(format!(
                    "Invalid redrivePermission: {other}"
                )))
            }
        };
        Ok(RedriveAllowPolicy { permission })
    }

    pub fn allows(&self, source_arn: &str) -> bool {
        match &self.permission {
            RedrivePermission::AllowAll => true,
            RedrivePermission::DenyAll => false,
            RedrivePermission::ByQueue(arns) => arns.iter().any(|a| a == source_arn),
        }
    }

    pub fn to_json(&self) -> String {
        match &self.permission {
            RedrivePermission::AllowAll => {
                serde_json::json!({ "redrivePermission": "allowAll" }).to_string()
            }
            RedrivePermission::DenyAll => {
                serde_json::json!({ "redrivePermission": "denyAll" }).to_string()
            }
            RedrivePermission::ByQueue(arns) => serde_json::json!({
                "redrivePermission": "byQueue",
                "sourceQueueArns": arns,
            })
            .to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeduplicationScope {
    Queue,
    MessageGroup,
}

impl DeduplicationScope {
    fn as_str(&self) -> &'static str {
        match self {
            DeduplicationScope::Queue => "queue",
            DeduplicationScope::MessageGroup => "messageGroup",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueAttributes {
    pub visibility_timeout: u32,
    pub message_retention_period: u32,
    pub delay_seconds: u32,
    pub maximum_message_size: u32,
    pub receive_message_wait_time_seconds: u32,
    pub redrive_policy: Option<RedrivePolicy>,
    pub redrive_allow_policy: Option<RedriveAllowPolicy>,
    pub fifo_queue: bool,
    pub content_based_deduplication: bool,
    pub deduplication_scope: DeduplicationScope,
    pub fifo_throughput_limit: String,
    pub policy: Option<String>,
    pub sqs_managed_sse_enabled: bool,
    pub kms_master_key_id: Option<String>,
}

impl Default for QueueAttributes {
    fn default() -> Self {
        QueueAttributes {
            visibility_timeout: 30,
            message_retention_period: 345_600,
            delay_seconds: 0,
            maximum_message_size: MAX_MESSAGE_SIZE,
            receive_message_wait_time_seconds: 0,
            redrive_policy: None,
            redrive_allow_policy: None,
            fifo_queue: false,
            content_based_deduplication: false,
            deduplication_scope: DeduplicationScope::Queue,
            fifo_throughput_limit: "perQueue".into(),
            policy: None,
            sqs_managed_sse_enabled: true,
            kms_master_key_id: None,
        }
    }
}

fn parse_bounded(name: &str, value: &str, min: u32, max: u32) -> BusResult<u32> {
    let v: u32 = value
        .trim()
        .parse()
        .map_err(|_| BusError::invalid_parameter(format!("Invalid value for {name}: {value}")))?;
    if !(min..=max).contains(&v) {
        return Err(BusError::invalid_parameter(format!(
            "{name} must be between {min} and {max}"
        )));
    }
    Ok(v)
}

fn parse_bool(name: &str, value: &str) -> BusResult<bool> {
    match value {
        "true" | "True" | "TRUE" => Ok(true),
        "false" | "False" | "FALSE" => Ok(false),
        _ => Err(BusError::invalid_parameter(format!(
            "Invalid value for {name}: {value}"
        ))),
    }
}

impl QueueAttributes {
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("VisibilityTimeout".into(), self.visibility_timeout.to_string());
        m.insert(
            "MessageRetentionPeriod".into(),
            self.message_retention_period.to_string(),
        );
        m.insert("DelaySeconds".into(), self.delay_seconds.to_string());
        m.insert(
            "MaximumMessageSize".into(),
            self.maximum_message_size.to_string(),
        );
        m.insert(
            "ReceiveMessageWaitTimeSeconds".into(),
            self.receive_message_wait_time_seconds.to_string(),
        );
        if let Some(ref rp) = self.redrive_policy {
            m.insert("RedrivePolicy".into(), rp.to_json());
        }
        if let Some(ref rap) = self.redrive_allow_policy {
            m.insert("RedriveAllowPolicy".into(), rap.to_json());
        }
        if let Some(ref policy) = self.policy {
            m.insert("Policy".into(), policy.clone());
        }
        if self.fifo_queue {
            m.insert("FifoQueue".into(), "true".into());
            m.insert(
                "ContentBasedDeduplication".into(),
                self.content_based_deduplication.to_string(),
            );
            m.insert(
                "DeduplicationScope".into(),
                self.deduplication_scope.as_str().into(),
            );
            m.insert(
                "FifoThroughputLimit".into(),
                self.fifo_throughput_limit.clone(),
            );
        }
        m.insert(
            "SqsManagedSseEnabled".into(),
            self.sqs_managed_sse_enabled.to_string(),
        );
        if let Some(ref key) = self.kms_master_key_id {
            m.insert("KmsMasterKeyId".into(), key.clone());
        }
        m
    }

    /// Applies every entry or none: a bad value leaves `self` untouched.
    pub fn apply(&mut self, attrs: &HashMap<String, String>) -> BusResult<()> {
        let mut next = self.clone();
        for (key, value) in attrs {
            match key.as_str() {
                "VisibilityTimeout" => {
                    next.visibility_timeout = parse_bounded(key, value, 0, MAX_VISIBILITY_TIMEOUT)?;
                }
                "MessageRetentionPeriod" => {
                    next.message_retention_period = parse_bounded(key, value, 60, 1_209_600)?;
                }
                "DelaySeconds" => {
                    next.delay_seconds = parse_bounded(key, value, 0, MAX_DELAY_SECONDS)?;
                }
                "MaximumMessageSize" => {
                    next.maximum_message_size = parse_bounded(key, value, 1024, MAX_MESSAGE_SIZE)?;
                }
                "ReceiveMessageWaitTimeSeconds" => {
                    next.receive_message_wait_time_seconds =
                        parse_bounded(key, value, 0, MAX_WAIT_TIME_SECONDS)?;
                }
                "RedrivePolicy" => {
                    next.redrive_policy = if value.is_empty() {
                        None
                    } else {
                        Some(RedrivePolicy::from_json(value)?)
                    };
                }
                "RedriveAllowPolicy" => {
                    next.redrive_allow_policy = if value.is_empty() {
                        None
                    } else {
                        Some(RedriveAllowPolicy::from_json(value)?)
                    };
                }
                "Policy" => {
                    if !value.is_empty() {
                        serde_json::from_str::<serde_json::Value>(value).map_err(|e| {
                            BusError::invalid_parameter(format!("Invalid Policy JSON: {e}"))
                        })?;
                    }
                    next.policy = (!value.is_empty()).then(|| value.clone());
                }
                "FifoQueue" => {
                    if parse_bool(key, value)? != self.fifo_queue {
                        return Err(BusError::invalid_parameter(
                            "FifoQueue cannot be changed after creation",
                        ));
                    }
                }
                "ContentBasedDeduplication" => {
                    if !self.fifo_queue {
                        return Err(BusError::invalid_parameter(
                            "ContentBasedDeduplication is only valid for FIFO queues",
                        ));
                    }
                    next.content_based_deduplication = parse_bool(key, value)?;
                }
                "DeduplicationScope" => {
                    if !self.fifo_queue {
                        return Err(BusError::invalid_parameter(
                            "DeduplicationScope is only valid for FIFO queues",
                        ));
                    }
                    next.deduplication_scope = match value.as_str() {
                        "queue" => DeduplicationScope::Queue,
                        "messageGroup" => DeduplicationScope::MessageGroup,
                        _ => {
                            return Err(BusError::invalid_parameter(
                                "DeduplicationScope must be queue or messageGroup",
                            ))
                        }
                    };
                }
                "FifoThroughputLimit" => {
                    if !self.fifo_queue {
                        return Err(BusError::invalid_parameter(
                            "FifoThroughputLimit is only valid for FIFO queues",
                        ));
                    }
                    if value != "perQueue" && value != "perMessageGroupId" {
                        return Err(BusError::invalid_parameter(
                            "FifoThroughputLimit must be perQueue or perMessageGroupId",
                        ));
                    }
                    next.fifo_throughput_limit = value.clone();
                }
                "SqsManagedSseEnabled" => {
                    next.sqs_managed_sse_enabled = parse_bool(key, value)?;
                }
                "KmsMasterKeyId" => {
                    next.kms_master_key_id = (!value.is_empty()).then(|| value.clone());
                }
                "KmsDataKeyReusePeriodSeconds" => {
                    parse_bounded(key, value, 60, 86_400)?;
                }
                _ => {
                    return Err(BusError::invalid_parameter(format!(
                        "Unknown Attribute {key}."
                    )));
                }
            }
        }
        *self = next;
        Ok(())
    }
}
