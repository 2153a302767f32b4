use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::attribute::{
    attributes_size, md5_hex, md5_of_attributes, sha256_hex, validate_message_attributes,
    MessageAttributeValue,
};
use crate::clock::Clock;
use crate::dedup::DedupCache;
use crate::error::{BusError, BusResult, ErrorKind};

use super::attributes::{
    DeduplicationScope, QueueAttributes, RedrivePolicy, MAX_DELAY_SECONDS, MAX_VISIBILITY_TIMEOUT,
};
use super::message::{Message, ReceiptHandle};

pub const PURGE_COOLDOWN_MILLIS: i64 = 60_000;
pub const MAX_QUEUE_PERMISSIONS: usize = 7;
pub const MAX_TAGS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub account_ids: Vec<String>,
    pub actions: Vec<String>,
}

/// A send as seen by the queue, after the wire adapter has decoded it.
#[derive(Debug, Clone, Default)]
pub struct SendInput {
    pub body: String,
    pub delay_seconds: Option<u32>,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
    pub trace_header: Option<String>,
    pub deduplication_id: Option<String>,
    pub group_id: Option<String>,
    pub sender_id: String,
}

impl SendInput {
    pub fn new(body: impl Into<String>) -> Self {
        SendInput {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_attributes(mut self, attrs: HashMap<String, MessageAttributeValue>) -> Self {
        self.message_attributes = attrs;
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_deduplication_id(mut self, dedup_id: impl Into<String>) -> Self {
        self.deduplication_id = Some(dedup_id.into());
        self
    }

    pub fn with_delay(mut self, seconds: u32) -> Self {
        self.delay_seconds = Some(seconds);
        self
    }

    /// Body plus attributes, the quantity limited by `MaximumMessageSize`.
    pub fn size(&self) -> usize {
        self.body.len() + attributes_size(&self.message_attributes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub message_id: String,
    pub md5_of_body: String,
    pub md5_of_message_attributes: Option<String>,
    pub sequence_number: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReceiveOptions {
    pub max_messages: usize,
    pub visibility_timeout: Option<u32>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        ReceiveOptions {
            max_messages: 1,
            visibility_timeout: None,
        }
    }
}

/// A message handed to a receiver together with the handle minted for it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub receipt_handle: String,
}

/// A message that exceeded its queue's `maxReceiveCount` and must be moved to
/// `target_arn` once the source lock is released.
#[derive(Debug)]
pub struct DeadLetter {
    pub message: Message,
    pub source_arn: String,
    pub target_arn: String,
}

#[derive(Debug, Default)]
pub struct ReceiveOutcome {
    pub delivered: Vec<Delivery>,
    pub dead_letters: Vec<DeadLetter>,
}

#[derive(Debug, Default)]
pub struct ExpiryOutcome {
    pub released: usize,
    pub dropped: usize,
    pub dead_letters: Vec<DeadLetter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageState {
    Ready,
    Delayed,
    InFlight,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub message_id: String,
    pub state: MessageState,
    pub body: String,
    pub receive_count: u32,
    pub sent_timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub name: String,
    pub arn: String,
    pub url: String,
    pub fifo: bool,
    pub attributes: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub messages: Vec<MessageSummary>,
}

struct InFlight {
    message: Message,
    deadline: i64,
}

struct QueueState {
    fifo: bool,
    attributes: QueueAttributes,
    last_modified: i64,
    /// Standard queues: messages in send order, delayed ones included.
    ready: VecDeque<Message>,
    /// FIFO queues: per-group sequences, plus the order groups are served in.
    groups: HashMap<String, VecDeque<Message>>,
    rotation: VecDeque<String>,
    inflight: HashMap<String, InFlight>,
    inflight_groups: HashMap<String, usize>,
    /// Latest receipt handle minted per message id.
    handles: HashMap<String, String>,
    dedup: DedupCache<SendOutcome>,
    sequence: u64,
    tags: HashMap<String, String>,
    permissions: BTreeMap<String, Permission>,
    last_purge: Option<i64>,
}

impl QueueState {
    fn enqueue(&mut self, msg: Message) {
        match msg.message_group_id.clone().filter(|_| self.fifo) {
            Some(group) => {
                let queue = self.groups.entry(group.clone()).or_default();
                if queue.is_empty() && !self.rotation.contains(&group) {
                    self.rotation.push_back(group);
                }
                queue.push_back(msg);
            }
            None => self.ready.push_back(msg),
        }
    }

    /// Puts a message that left in-flight back where it can be received next;
    /// FIFO messages go to the head of their group to keep group order.
    fn requeue(&mut self, msg: Message) {
        match msg.message_group_id.clone().filter(|_| self.fifo) {
            Some(group) => {
                let queue = self.groups.entry(group.clone()).or_default();
                queue.push_front(msg);
                if !self.rotation.contains(&group) {
                    self.rotation.push_front(group);
                }
            }
            None => self.ready.push_back(msg),
        }
    }

    fn begin_inflight(&mut self, mut msg: Message, arn: &str, now: i64, visibility: u32) -> Delivery {
        msg.receive_count += 1;
        msg.first_receive_timestamp.get_or_insert(now);
        let handle = ReceiptHandle::mint(arn, &msg.message_id);
        if self.fifo {
            if let Some(ref group) = msg.message_group_id {
                *self.inflight_groups.entry(group.clone()).or_default() += 1;
            }
        }
        self.handles.insert(msg.message_id.clone(), handle.clone());
        let delivery = Delivery {
            message: msg.clone(),
            receipt_handle: handle.clone(),
        };
        self.inflight.insert(
            handle,
            InFlight {
                message: msg,
                deadline: now + i64::from(visibility) * 1000,
            },
        );
        delivery
    }

    fn end_inflight(&mut self, handle: &str) -> Option<Message> {
        let entry = self.inflight.remove(handle)?;
        if let Some(ref group) = entry.message.message_group_id {
            if let Some(count) = self.inflight_groups.get_mut(group) {
                *count -= 1;
                if *count == 0 {
                    self.inflight_groups.remove(group);
                }
            }
        }
        Some(entry.message)
    }

    fn forget(&mut self, message_id: &str) {
        self.handles.remove(message_id);
    }

    fn take_standard(
        &mut self,
        max: usize,
        now: i64,
        exceeds: impl Fn(&Message) -> bool,
        taken: &mut Vec<Message>,
        over_limit: &mut Vec<Message>,
    ) {
        let retention = self.attributes.message_retention_period;
        let mut kept = VecDeque::with_capacity(self.ready.len());
        while let Some(msg) = self.ready.pop_front() {
            if taken.len() >= max {
                kept.push_back(msg);
                kept.extend(self.ready.drain(..));
                break;
            }
            if msg.is_expired(now, retention) {
                self.handles.remove(&msg.message_id);
                continue;
            }
            if msg.visible_at > now {
                kept.push_back(msg);
            } else if exceeds(&msg) {
                over_limit.push(msg);
            } else {
                taken.push(msg);
            }
        }
        self.ready = kept;
    }

    /// At most one message per group per call; a group with a message in
    /// flight is skipped. Groups that were served move to the back of the
    /// rotation so every group with ready messages gets its turn.
    fn take_fifo(
        &mut self,
        max: usize,
        now: i64,
        exceeds: impl Fn(&Message) -> bool,
        taken: &mut Vec<Message>,
        over_limit: &mut Vec<Message>,
    ) {
        let retention = self.attributes.message_retention_period;
        let order: Vec<String> = self.rotation.iter().cloned().collect();
        let mut served = Vec::new();
        for group in order {
            if taken.len() >= max {
                break;
            }
            if self.inflight_groups.contains_key(&group) {
                continue;
            }
            let Some(queue) = self.groups.get_mut(&group) else {
                continue;
            };
            while let Some(head) = queue.front() {
                if head.is_expired(now, retention) {
                    if let Some(expired) = queue.pop_front() {
                        self.handles.remove(&expired.message_id);
                    }
                    continue;
                }
                if head.visible_at > now {
                    break;
                }
                let Some(msg) = queue.pop_front() else { break };
                if exceeds(&msg) {
                    over_limit.push(msg);
                    continue;
                }
                taken.push(msg);
                served.push(group.clone());
                break;
            }
        }
        self.groups.retain(|_, q| !q.is_empty());
        let groups = &self.groups;
        self.rotation
            .retain(|g| groups.contains_key(g) && !served.contains(g));
        for group in served {
            if self.groups.contains_key(&group) {
                self.rotation.push_back(group);
            }
        }
    }

    fn release_expired(&mut self, arn: &str, now: i64) -> ExpiryOutcome {
        let mut outcome = ExpiryOutcome::default();
        let expired: Vec<String> = self
            .inflight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(handle, _)| handle.clone())
            .collect();
        let redrive = self.attributes.redrive_policy.clone();
        for handle in expired {
            let Some(mut msg) = self.end_inflight(&handle) else {
                continue;
            };
            match redrive {
                Some(ref rp) if msg.receive_count >= rp.max_receive_count => {
                    self.forget(&msg.message_id);
                    outcome.dead_letters.push(DeadLetter {
                        message: msg,
                        source_arn: arn.to_string(),
                        target_arn: rp.dead_letter_target_arn.clone(),
                    });
                }
                _ => {
                    msg.visible_at = now;
                    self.requeue(msg);
                    outcome.released += 1;
                }
            }
        }

        let retention = self.attributes.message_retention_period;
        let before = self.stored_len();
        let mut dropped_ids = Vec::new();
        self.ready.retain(|m| {
            let keep = !m.is_expired(now, retention);
            if !keep {
                dropped_ids.push(m.message_id.clone());
            }
            keep
        });
        for queue in self.groups.values_mut() {
            queue.retain(|m| {
                let keep = !m.is_expired(now, retention);
                if !keep {
                    dropped_ids.push(m.message_id.clone());
                }
                keep
            });
        }
        self.groups.retain(|_, q| !q.is_empty());
        let groups = &self.groups;
        self.rotation.retain(|g| groups.contains_key(g));
        for id in dropped_ids {
            self.handles.remove(&id);
        }
        outcome.dropped = before - self.stored_len();
        self.dedup.evict_expired(now);
        outcome
    }

    fn stored_len(&self) -> usize {
        self.ready.len() + self.groups.values().map(VecDeque::len).sum::<usize>()
    }

    fn stored(&self) -> impl Iterator<Item = &Message> {
        self.ready
            .iter()
            .chain(self.groups.values().flat_map(|q| q.iter()))
    }

    fn next_change_after(&self, now: i64) -> Option<i64> {
        self.stored()
            .map(|m| m.visible_at)
            .chain(self.inflight.values().map(|e| e.deadline))
            .filter(|t| *t > now)
            .min()
    }
}

fn validate_body(body: &str) -> BusResult<()> {
    if body.is_empty() {
        return Err(BusError::invalid_parameter(
            "The request must contain the parameter MessageBody.",
        ));
    }
    let allowed = |c: char| {
        matches!(c, '\u{9}' | '\u{A}' | '\u{D}')
            || ('\u{20}'..='\u{D7FF}').contains(&c)
            || ('\u{E000}'..='\u{FFFD}').contains(&c)
            || ('\u{10000}'..='\u{10FFFF}').contains(&c)
    };
    if !body.chars().all(allowed) {
        return Err(BusError::invalid_parameter(
            "Invalid characters found in the message body.",
        ));
    }
    Ok(())
}

fn validate_fifo_token(name: &str, value: &str) -> BusResult<()> {
    let valid = !value.is_empty()
        && value.len() <= 128
        && value.chars().all(|c| c.is_ascii_graphic());
    if valid {
        Ok(())
    } else {
        Err(BusError::invalid_parameter(format!(
            "Value {value} for parameter {name} is invalid."
        )))
    }
}

/// One queue: its attributes, message stores, in-flight map and dedup cache,
/// all behind a single mutex shared by client calls and background work.
pub struct QueueResource {
    name: String,
    arn: String,
    url: String,
    fifo: bool,
    created_at: i64,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    notify: Notify,
    deleted: AtomicBool,
}

impl QueueResource {
    pub fn new(
        name: String,
        arn: String,
        url: String,
        attributes: QueueAttributes,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_millis();
        QueueResource {
            fifo: attributes.fifo_queue,
            state: Mutex::new(QueueState {
                fifo: attributes.fifo_queue,
                attributes,
                last_modified: now,
                ready: VecDeque::new(),
                groups: HashMap::new(),
                rotation: VecDeque::new(),
                inflight: HashMap::new(),
                inflight_groups: HashMap::new(),
                handles: HashMap::new(),
                dedup: DedupCache::new(),
                sequence: 0,
                tags: HashMap::new(),
                permissions: BTreeMap::new(),
                last_purge: None,
            }),
            name,
            arn,
            url,
            created_at: now,
            clock,
            notify: Notify::new(),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_fifo(&self) -> bool {
        self.fifo
    }

    pub fn attributes(&self) -> QueueAttributes {
        self.state.lock().attributes.clone()
    }

    pub fn redrive_policy(&self) -> Option<RedrivePolicy> {
        self.state.lock().attributes.redrive_policy.clone()
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> BusResult<()> {
        if self.is_deleted() {
            Err(BusError::queue_does_not_exist())
        } else {
            Ok(())
        }
    }

    /// Resolves when a message may have become receivable.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub fn send(&self, input: SendInput) -> BusResult<SendOutcome> {
        self.ensure_live()?;
        validate_body(&input.body)?;
        validate_message_attributes(&input.message_attributes)?;

        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let attrs = &state.attributes;

        let size = input.size();
        if size > attrs.maximum_message_size as usize {
            return Err(BusError::message_too_large(format!(
                "One or more parameters are invalid. Reason: Message must be shorter than {} bytes.",
                attrs.maximum_message_size
            )));
        }

        let delay = match input.delay_seconds {
            Some(_) if self.fifo => {
                return Err(BusError::invalid_parameter(
                    "Value for parameter DelaySeconds is invalid. Reason: The request include parameter that is not valid for this queue type.",
                ))
            }
            Some(d) if d > MAX_DELAY_SECONDS => {
                return Err(BusError::invalid_parameter(format!(
                    "Value {d} for parameter DelaySeconds is invalid. Reason: must be between 0 and {MAX_DELAY_SECONDS}."
                )))
            }
            Some(d) => d,
            None => attrs.delay_seconds,
        };

        let mut dedup_key = None;
        let mut deduplication_id = None;
        if self.fifo {
            let group = input.group_id.as_deref().ok_or_else(|| {
                BusError::invalid_parameter("The request must contain the parameter MessageGroupId.")
            })?;
            validate_fifo_token("MessageGroupId", group)?;
            let dedup_id = match input.deduplication_id {
                Some(ref id) => {
                    validate_fifo_token("MessageDeduplicationId", id)?;
                    id.clone()
                }
                None if attrs.content_based_deduplication => sha256_hex(input.body.as_bytes()),
                None => {
                    return Err(BusError::invalid_parameter(
                        "The queue should either have ContentBasedDeduplication enabled or MessageDeduplicationId provided explicitly",
                    ))
                }
            };
            let key = match attrs.deduplication_scope {
                DeduplicationScope::Queue => dedup_id.clone(),
                DeduplicationScope::MessageGroup => format!("{group}\u{0}{dedup_id}"),
            };
            if let Some(previous) = state.dedup.get(&key, now) {
                debug!(queue = %self.name, message_id = %previous.message_id, "duplicate send suppressed");
                return Ok(previous);
            }
            dedup_key = Some(key);
            deduplication_id = Some(dedup_id);
        } else if input.group_id.is_some() || input.deduplication_id.is_some() {
            return Err(BusError::invalid_parameter(
                "The request include parameter that is not valid for this queue type",
            ));
        }

        let sequence_number = if self.fifo {
            state.sequence += 1;
            Some(format!("{:020}", state.sequence))
        } else {
            None
        };

        let message = Message {
            message_id: Uuid::new_v4().to_string(),
            md5_of_body: md5_hex(input.body.as_bytes()),
            md5_of_message_attributes: md5_of_attributes(&input.message_attributes),
            body: input.body,
            message_attributes: input.message_attributes,
            sent_timestamp: now,
            visible_at: now + i64::from(delay) * 1000,
            receive_count: 0,
            first_receive_timestamp: None,
            message_group_id: input.group_id,
            deduplication_id,
            sequence_number: sequence_number.clone(),
            sender_id: input.sender_id,
            trace_header: input.trace_header,
            dead_letter_source_arn: None,
        };
        let outcome = SendOutcome {
            message_id: message.message_id.clone(),
            md5_of_body: message.md5_of_body.clone(),
            md5_of_message_attributes: message.md5_of_message_attributes.clone(),
            sequence_number,
        };
        if let Some(key) = dedup_key {
            state.dedup.insert(key, outcome.clone(), now);
        }
        state.enqueue(message);
        drop(state);

        self.notify.notify_waiters();
        Ok(outcome)
    }

    /// One non-blocking receive pass. Long polling is layered on top by the
    /// bus using [`QueueResource::notified`] and [`QueueResource::next_wakeup`].
    pub fn receive(&self, options: ReceiveOptions) -> BusResult<ReceiveOutcome> {
        self.ensure_live()?;
        if let Some(v) = options.visibility_timeout {
            if v > MAX_VISIBILITY_TIMEOUT {
                return Err(BusError::invalid_parameter(format!(
                    "Value {v} for parameter VisibilityTimeout is invalid. Reason: must be between 0 and {MAX_VISIBILITY_TIMEOUT}."
                )));
            }
        }
        let max = options.max_messages.clamp(1, 10);
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        let expiry = state.release_expired(&self.arn, now);
        let mut outcome = ReceiveOutcome {
            delivered: Vec::new(),
            dead_letters: expiry.dead_letters,
        };

        let visibility = options
            .visibility_timeout
            .unwrap_or(state.attributes.visibility_timeout);
        let redrive = state.attributes.redrive_policy.clone();
        let exceeds = |m: &Message| {
            redrive
                .as_ref()
                .is_some_and(|rp| m.receive_count + 1 > rp.max_receive_count)
        };

        let mut taken = Vec::new();
        let mut over_limit = Vec::new();
        if self.fifo {
            state.take_fifo(max, now, exceeds, &mut taken, &mut over_limit);
        } else {
            state.take_standard(max, now, exceeds, &mut taken, &mut over_limit);
        }

        if let Some(rp) = redrive {
            for msg in over_limit {
                state.forget(&msg.message_id);
                outcome.dead_letters.push(DeadLetter {
                    message: msg,
                    source_arn: self.arn.clone(),
                    target_arn: rp.dead_letter_target_arn.clone(),
                });
            }
        }

        outcome.delivered = taken
            .into_iter()
            .map(|msg| state.begin_inflight(msg, &self.arn, now, visibility))
            .collect();
        Ok(outcome)
    }

    fn decode_handle(&self, handle: &str) -> BusResult<String> {
        match ReceiptHandle::decode(handle) {
            Some((arn, message_id)) if arn == self.arn => Ok(message_id),
            _ => Err(BusError::invalid_receipt_handle(format!(
                "The input receipt handle \"{handle}\" is not a valid receipt handle."
            ))),
        }
    }

    /// Deletes the message received under `handle`. A handle that has been
    /// superseded by a later receive of the same message is rejected; a handle
    /// whose message is already gone is accepted and ignored.
    pub fn delete(&self, handle: &str) -> BusResult<()> {
        self.ensure_live()?;
        let message_id = self.decode_handle(handle)?;
        let mut state = self.state.lock();
        if state.end_inflight(handle).is_some() {
            state.forget(&message_id);
            drop(state);
            self.notify.notify_waiters();
            return Ok(());
        }
        match state.handles.get(&message_id) {
            Some(current) if current != handle => Err(BusError::invalid_receipt_handle(
                "The receipt handle has expired.",
            )),
            _ => Ok(()),
        }
    }

    pub fn change_visibility(&self, handle: &str, timeout: u32) -> BusResult<()> {
        self.ensure_live()?;
        if timeout > MAX_VISIBILITY_TIMEOUT {
            return Err(BusError::invalid_parameter(format!(
                "Value {timeout} for parameter VisibilityTimeout is invalid. Reason: must be between 0 and {MAX_VISIBILITY_TIMEOUT}."
            )));
        }
        let message_id = self.decode_handle(handle)?;
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        if !state.inflight.contains_key(handle) {
            return match state.handles.get(&message_id) {
                Some(current) if current != handle => Err(BusError::invalid_receipt_handle(
                    "The receipt handle has expired.",
                )),
                _ => Err(BusError::new(
                    ErrorKind::MessageNotInflight,
                    "Message does not exist or is not available for visibility timeout change.",
                )),
            };
        }

        if timeout == 0 {
            if let Some(mut msg) = state.end_inflight(handle) {
                msg.visible_at = now;
                state.requeue(msg);
            }
            drop(state);
            self.notify.notify_waiters();
        } else if let Some(entry) = state.inflight.get_mut(handle) {
            entry.deadline = now + i64::from(timeout) * 1000;
        }
        Ok(())
    }

    pub fn purge(&self) -> BusResult<()> {
        self.ensure_live()?;
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        if let Some(last) = state.last_purge {
            if now - last < PURGE_COOLDOWN_MILLIS {
                return Err(BusError::new(
                    ErrorKind::PurgeInProgress,
                    format!(
                        "Only one PurgeQueue operation on {} is allowed every 60 seconds.",
                        self.name
                    ),
                ));
            }
        }
        state.ready.clear();
        state.groups.clear();
        state.rotation.clear();
        state.inflight.clear();
        state.inflight_groups.clear();
        state.handles.clear();
        state.last_purge = Some(now);
        Ok(())
    }

    /// Releases every in-flight message whose visibility deadline has passed
    /// and drops messages past their retention period.
    pub fn expire(&self) -> ExpiryOutcome {
        let now = self.clock.now_millis();
        let outcome = self.state.lock().release_expired(&self.arn, now);
        if outcome.released > 0 {
            debug!(queue = %self.name, count = outcome.released, "visibility expired");
            self.notify.notify_waiters();
        }
        outcome
    }

    /// Stores a message moved here from `source_arn` after it exceeded the
    /// source's receive limit. Dedup does not apply and receive accounting
    /// starts over.
    pub fn accept_dead_letter(&self, mut msg: Message, source_arn: &str) -> BusResult<()> {
        self.ensure_live()?;
        if self.fifo && msg.message_group_id.is_none() {
            return Err(BusError::invalid_parameter(format!(
                "Dead-letter queue {} is FIFO but the message from {source_arn} has no group",
                self.name
            )));
        }
        if !self.fifo {
            msg.message_group_id = None;
            msg.sequence_number = None;
            msg.deduplication_id = None;
        }
        msg.visible_at = self.clock.now_millis();
        msg.receive_count = 0;
        msg.first_receive_timestamp = None;
        msg.dead_letter_source_arn = Some(source_arn.to_string());
        self.state.lock().enqueue(msg);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Earliest instant at which a delayed message becomes visible or an
    /// in-flight message times out.
    pub fn next_wakeup(&self) -> Option<i64> {
        let now = self.clock.now_millis();
        self.state.lock().next_change_after(now)
    }

    pub fn receive_wait_seconds(&self) -> u32 {
        self.state.lock().attributes.receive_message_wait_time_seconds
    }

    /// Ready (visible), delayed and in-flight counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        let now = self.clock.now_millis();
        let state = self.state.lock();
        let visible = state.stored().filter(|m| m.visible_at <= now).count();
        (visible, state.stored_len() - visible, state.inflight.len())
    }

    pub fn get_attributes(&self, names: Option<&[String]>) -> HashMap<String, String> {
        let all = names.map_or(true, |n| n.is_empty() || n.iter().any(|x| x == "All"));
        let include = |attr: &str| all || names.is_some_and(|n| n.iter().any(|x| x == attr));

        let (visible, delayed, inflight) = self.counts();
        let state = self.state.lock();
        let mut attrs = state.attributes.to_map();
        if state.attributes.policy.is_none() && !state.permissions.is_empty() {
            attrs.insert("Policy".into(), self.permissions_policy(&state.permissions));
        }
        attrs.insert("QueueArn".into(), self.arn.clone());
        attrs.insert("CreatedTimestamp".into(), (self.created_at / 1000).to_string());
        attrs.insert(
            "LastModifiedTimestamp".into(),
            (state.last_modified / 1000).to_string(),
        );
        attrs.insert("ApproximateNumberOfMessages".into(), visible.to_string());
        attrs.insert(
            "ApproximateNumberOfMessagesNotVisible".into(),
            inflight.to_string(),
        );
        attrs.insert(
            "ApproximateNumberOfMessagesDelayed".into(),
            delayed.to_string(),
        );
        attrs.retain(|k, _| include(k));
        attrs
    }

    pub fn set_attributes(&self, attrs: &HashMap<String, String>) -> BusResult<()> {
        self.ensure_live()?;
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        state.attributes.apply(attrs)?;
        state.last_modified = now;
        Ok(())
    }

    pub fn tags(&self) -> HashMap<String, String> {
        self.state.lock().tags.clone()
    }

    pub fn tag(&self, tags: HashMap<String, String>) -> BusResult<()> {
        self.ensure_live()?;
        let mut state = self.state.lock();
        let mut next = state.tags.clone();
        next.extend(tags);
        if next.len() > MAX_TAGS {
            return Err(BusError::invalid_parameter(format!(
                "Too many tags added for queue {}.",
                self.name
            )));
        }
        state.tags = next;
        Ok(())
    }

    pub fn untag(&self, keys: &[String]) -> BusResult<()> {
        self.ensure_live()?;
        let mut state = self.state.lock();
        for key in keys {
            state.tags.remove(key);
        }
        Ok(())
    }

    pub fn add_permission(&self, label: &str, permission: Permission) -> BusResult<()> {
        self.ensure_live()?;
        let mut state = self.state.lock();
        if state.permissions.contains_key(label) {
            return Err(BusError::conflict(format!(
                "Value {label} for parameter Label is invalid. Reason: Already exists."
            )));
        }
        if state.permissions.len() >= MAX_QUEUE_PERMISSIONS {
            return Err(BusError::over_limit(format!(
                "{} statements already exist for queue {}.",
                MAX_QUEUE_PERMISSIONS, self.name
            )));
        }
        state.permissions.insert(label.to_string(), permission);
        Ok(())
    }

    pub fn remove_permission(&self, label: &str) -> BusResult<()> {
        self.ensure_live()?;
        if self.state.lock().permissions.remove(label).is_none() {
            return Err(BusError::invalid_parameter(format!(
                "Value {label} for parameter Label is invalid. Reason: can't find label."
            )));
        }
        Ok(())
    }

    fn permissions_policy(&self, permissions: &BTreeMap<String, Permission>) -> String {
        let statements: Vec<serde_json::Value> = permissions
            .iter()
            .map(|(label, p)| {
                let principals: Vec<String> = p
                    .account_ids
                    .iter()
                    .map(|a| format!("arn:aws:iam::{a}:root"))
                    .collect();
                let actions: Vec<String> = p.actions.iter().map(|a| format!("SQS:{a}")).collect();
                serde_json::json!({
                    "Sid": label,
                    "Effect": "Allow",
                    "Principal": { "AWS": principals },
                    "Action": actions,
                    "Resource": self.arn,
                })
            })
            .collect();
        serde_json::json!({
            "Version": "2012-10-17",
            "Id": format!("{}/SQSDefaultPolicy", self.arn),
            "Statement": statements,
        })
        .to_string()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let now = self.clock.now_millis();
        let attributes = self.get_attributes(None).into_iter().collect();
        let state = self.state.lock();
        let summary = |m: &Message, state_kind: MessageState, visible_at: Option<i64>| MessageSummary {
            message_id: m.message_id.clone(),
            state: state_kind,
            body: m.body.clone(),
            receive_count: m.receive_count,
            sent_timestamp: m.sent_timestamp,
            message_group_id: m.message_group_id.clone(),
            visible_at,
        };
        let mut messages: Vec<MessageSummary> = state
            .stored()
            .map(|m| {
                if m.visible_at > now {
                    summary(m, MessageState::Delayed, Some(m.visible_at))
                } else {
                    summary(m, MessageState::Ready, None)
                }
            })
            .collect();
        messages.extend(
            state
                .inflight
                .values()
                .map(|e| summary(&e.message, MessageState::InFlight, Some(e.deadline))),
        );
        messages.sort_by_key(|m| m.sent_timestamp);
        QueueSnapshot {
            name: self.name.clone(),
            arn: self.arn.clone(),
            url: self.url.clone(),
            fifo: self.fifo,
            attributes,
            tags: state.tags.clone().into_iter().collect(),
            messages,
        }
    }
}
