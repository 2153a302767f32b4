//! Queue operations of the [`Bus`], one method per SQS action.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tracing::info;
use uuid::Uuid;

use crate::bus::Bus;
use crate::error::{validate_batch_ids, BusError, BusResult, ErrorKind};

use super::attributes::{QueueAttributes, RedrivePolicy, MAX_MESSAGE_SIZE, MAX_WAIT_TIME_SECONDS};
use super::error::error_code;
use super::message::{filter_received, AttributeSelection};
use super::move_task::{spawn_move_task, MoveTask, MAX_MOVE_RATE};
use super::queue::{
    Permission, QueueResource, ReceiveOptions, SendInput, SendOutcome, MAX_TAGS,
};
use super::types::*;

fn validate_queue_name(name: &str, fifo: bool) -> BusResult<()> {
    let base = name.strip_suffix(".fifo").unwrap_or(name);
    if name.is_empty() || name.len() > 80 {
        return Err(BusError::invalid_parameter(
            "Queue name must be 1-80 characters",
        ));
    }
    let valid = base
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if base.is_empty() || !valid {
        return Err(BusError::invalid_parameter(
            "Queue name can only contain alphanumeric characters, hyphens, and underscores",
        ));
    }
    if fifo && !name.ends_with(".fifo") {
        return Err(BusError::invalid_parameter(
            "FIFO queue name must end with .fifo",
        ));
    }
    if !fifo && name.ends_with(".fifo") {
        return Err(BusError::invalid_parameter(
            "Non-FIFO queue name must not end with .fifo",
        ));
    }
    Ok(())
}

fn non_negative(name: &str, value: i32) -> BusResult<u32> {
    u32::try_from(value).map_err(|_| {
        BusError::invalid_parameter(format!(
            "Value {value} for parameter {name} is invalid. Reason: must be non-negative."
        ))
    })
}

fn trace_header(system: &Option<HashMap<String, MessageAttributeValue>>) -> Option<String> {
    system
        .as_ref()
        .and_then(|attrs| attrs.get("AWSTraceHeader"))
        .and_then(|v| v.string_value.clone())
}

fn failure(id: String, err: &BusError) -> BatchResultErrorEntry {
    BatchResultErrorEntry {
        id,
        code: error_code(err.kind()).to_string(),
        message: err.message().to_string(),
        sender_fault: true,
    }
}

/// Sorted keys after `token`, at most `max` of them, plus the token for the
/// next page.
pub(crate) fn paginate(mut keys: Vec<String>, token: Option<&str>, max: usize) -> (Vec<String>, Option<String>) {
    keys.sort();
    let start = token.map_or(0, |t| keys.partition_point(|k| k.as_str() <= t));
    let rest = &keys[start..];
    let page: Vec<String> = rest.iter().take(max).cloned().collect();
    let next = (rest.len() > max).then(|| page.last().cloned()).flatten();
    (page, next)
}

fn page_size(max_results: Option<i32>, default: usize, limit: usize) -> BusResult<usize> {
    match max_results {
        None => Ok(default),
        Some(n) if n >= 1 && n as usize <= limit => Ok(n as usize),
        Some(n) => Err(BusError::invalid_parameter(format!(
            "Value {n} for parameter MaxResults is invalid. Reason: must be between 1 and {limit}."
        ))),
    }
}

impl Bus {
    fn require_queue(&self, url: &str) -> BusResult<Arc<QueueResource>> {
        self.queue_by_url(url)
            .ok_or_else(BusError::queue_does_not_exist)
    }

    /// A redrive policy must name an existing queue of the same type whose
    /// allow policy admits `source_arn`.
    fn validate_redrive(&self, source_arn: &str, fifo: bool, policy: &RedrivePolicy) -> BusResult<()> {
        let invalid = |reason: &str| {
            BusError::invalid_parameter(format!(
                "Value {} for parameter RedrivePolicy is invalid. Reason: {reason}",
                policy.to_json()
            ))
        };
        let target = self
            .queue_by_arn(&policy.dead_letter_target_arn)
            .ok_or_else(|| invalid("Dead letter target does not exist."))?;
        if target.is_fifo() != fifo {
            return Err(invalid(
                "Dead-letter target must be the same type of queue as the source.",
            ));
        }
        if let Some(allow) = target.attributes().redrive_allow_policy {
            if !allow.allows(source_arn) {
                return Err(invalid(
                    "Dead-letter target's RedriveAllowPolicy does not permit this queue.",
                ));
            }
        }
        Ok(())
    }

    pub async fn create_queue(&self, req: CreateQueueRequest) -> BusResult<CreateQueueResponse> {
        let requested = req.attributes.unwrap_or_default();
        let fifo = requested
            .get("FifoQueue")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or_else(|| req.queue_name.ends_with(".fifo"));
        validate_queue_name(&req.queue_name, fifo)?;

        let arn = self.queue_arn(&req.queue_name);
        let url = self.queue_url(&req.queue_name);
        let mut attributes = QueueAttributes {
            fifo_queue: fifo,
            ..Default::default()
        };
        attributes.apply(&requested)?;
        if let Some(ref policy) = attributes.redrive_policy {
            self.validate_redrive(&arn, fifo, policy)?;
        }
        if req.tags.as_ref().is_some_and(|t| t.len() > MAX_TAGS) {
            return Err(BusError::invalid_parameter(format!(
                "Too many tags added for queue {}.",
                req.queue_name
            )));
        }

        let queue = match self.queues.entry(req.queue_name.clone()) {
            Entry::Occupied(existing) => {
                let current = existing.get().attributes().to_map();
                let differs = requested
                    .iter()
                    .any(|(k, v)| current.get(k).is_some_and(|c| c != v));
                if differs {
                    return Err(BusError::already_exists(format!(
                        "A queue already exists with the same name and a different value for attribute(s) {}",
                        req.queue_name
                    )));
                }
                return Ok(CreateQueueResponse {
                    queue_url: existing.get().url().to_string(),
                });
            }
            Entry::Vacant(slot) => {
                let queue = Arc::new(QueueResource::new(
                    req.queue_name.clone(),
                    arn,
                    url.clone(),
                    attributes,
                    self.clock().clone(),
                ));
                slot.insert(queue.clone());
                queue
            }
        };
        if let Some(tags) = req.tags {
            queue.tag(tags)?;
        }
        info!(queue = %req.queue_name, fifo, "queue created");
        Ok(CreateQueueResponse { queue_url: url })
    }

    pub async fn delete_queue(&self, req: DeleteQueueRequest) -> BusResult<()> {
        let queue = self.require_queue(&req.queue_url)?;
        self.queues
            .remove_if(queue.name(), |_, q| Arc::ptr_eq(q, &queue));
        queue.mark_deleted();
        info!(queue = %queue.name(), "queue deleted");
        Ok(())
    }

    pub async fn get_queue_url(&self, req: GetQueueUrlRequest) -> BusResult<GetQueueUrlResponse> {
        if let Some(ref owner) = req.queue_owner_aws_account_id {
            if owner != self.account_id() {
                return Err(BusError::queue_does_not_exist());
            }
        }
        self.queue_by_name(&req.queue_name)
            .map(|q| GetQueueUrlResponse {
                queue_url: q.url().to_string(),
            })
            .ok_or_else(BusError::queue_does_not_exist)
    }

    pub async fn list_queues(&self, req: ListQueuesRequest) -> BusResult<ListQueuesResponse> {
        let max = page_size(req.max_results, 1000, 1000)?;
        let prefix = req.queue_name_prefix.unwrap_or_default();
        let names: Vec<String> = self
            .queues
            .iter()
            .filter(|q| q.key().starts_with(&prefix))
            .map(|q| q.key().clone())
            .collect();
        let (page, next_token) = paginate(names, req.next_token.as_deref(), max);
        Ok(ListQueuesResponse {
            queue_urls: page.iter().map(|name| self.queue_url(name)).collect(),
            next_token,
        })
    }

    pub async fn get_queue_attributes(
        &self,
        req: GetQueueAttributesRequest,
    ) -> BusResult<GetQueueAttributesResponse> {
        let queue = self.require_queue(&req.queue_url)?;
        Ok(GetQueueAttributesResponse {
            attributes: queue.get_attributes(req.attribute_names.as_deref()),
        })
    }

    pub async fn set_queue_attributes(&self, req: SetQueueAttributesRequest) -> BusResult<()> {
        let queue = self.require_queue(&req.queue_url)?;
        let mut candidate = queue.attributes();
        candidate.apply(&req.attributes)?;
        if req.attributes.contains_key("RedrivePolicy") {
            if let Some(ref policy) = candidate.redrive_policy {
                self.validate_redrive(queue.arn(), queue.is_fifo(), policy)?;
            }
        }
        queue.set_attributes(&req.attributes)
    }

    pub async fn purge_queue(&self, req: PurgeQueueRequest) -> BusResult<()> {
        let queue = self.require_queue(&req.queue_url)?;
        queue.purge()?;
        info!(queue = %queue.name(), "queue purged");
        Ok(())
    }

    pub async fn send_message(&self, req: SendMessageRequest) -> BusResult<SendMessageResponse> {
        let queue = self.require_queue(&req.queue_url)?;
        let input = SendInput {
            delay_seconds: req
                .delay_seconds
                .map(|d| non_negative("DelaySeconds", d))
                .transpose()?,
            trace_header: trace_header(&req.message_system_attributes),
            message_attributes: req.message_attributes.unwrap_or_default(),
            deduplication_id: req.message_deduplication_id,
            group_id: req.message_group_id,
            sender_id: self.account_id().to_string(),
            body: req.message_body,
        };
        let SendOutcome {
            message_id,
            md5_of_body,
            md5_of_message_attributes,
            sequence_number,
        } = queue.send(input)?;
        Ok(SendMessageResponse {
            message_id,
            md5_of_message_body: md5_of_body,
            md5_of_message_attributes,
            sequence_number,
        })
    }

    pub async fn send_message_batch(
        &self,
        req: SendMessageBatchRequest,
    ) -> BusResult<SendMessageBatchResponse> {
        validate_batch_ids(req.entries.iter().map(|e| e.id.as_str()))?;
        let queue = self.require_queue(&req.queue_url)?;

        let total: usize = req
            .entries
            .iter()
            .map(|e| {
                e.message_body.len()
                    + e.message_attributes
                        .as_ref()
                        .map_or(0, crate::attribute::attributes_size)
            })
            .sum();
        if total > MAX_MESSAGE_SIZE as usize {
            return Err(BusError::batch_too_long(format!(
                "Batch requests cannot be longer than {MAX_MESSAGE_SIZE} bytes. You have sent {total} bytes."
            )));
        }

        let mut successful = Vec::new();
        let mut failed = Vec::new();
        for entry in req.entries {
            let delay = match entry.delay_seconds.map(|d| non_negative("DelaySeconds", d)).transpose() {
                Ok(d) => d,
                Err(e) => {
                    failed.push(failure(entry.id, &e));
                    continue;
                }
            };
            let input = SendInput {
                delay_seconds: delay,
                trace_header: trace_header(&entry.message_system_attributes),
                message_attributes: entry.message_attributes.unwrap_or_default(),
                deduplication_id: entry.message_deduplication_id,
                group_id: entry.message_group_id,
                sender_id: self.account_id().to_string(),
                body: entry.message_body,
            };
            match queue.send(input) {
                Ok(out) => successful.push(SendMessageBatchResultEntry {
                    id: entry.id,
                    message_id: out.message_id,
                    md5_of_message_body: out.md5_of_body,
                    md5_of_message_attributes: out.md5_of_message_attributes,
                    sequence_number: out.sequence_number,
                }),
                Err(e) => failed.push(failure(entry.id, &e)),
            }
        }
        Ok(SendMessageBatchResponse { successful, failed })
    }

    /// Receives up to `MaxNumberOfMessages`, waiting up to the wait time for
    /// the first one. Wake-ups come from sends and visibility changes on the
    /// queue, from the next delayed or in-flight deadline, and from disposal.
    pub async fn receive_message(
        &self,
        req: ReceiveMessageRequest,
    ) -> BusResult<ReceiveMessageResponse> {
        let queue = self.require_queue(&req.queue_url)?;
        let max = req.max_number_of_messages.unwrap_or(1);
        if !(1..=10).contains(&max) {
            return Err(BusError::invalid_parameter(format!(
                "Value {max} for parameter MaxNumberOfMessages is invalid. Reason: Must be between 1 and 10, if provided."
            )));
        }
        let wait = match req.wait_time_seconds {
            Some(w) => {
                let w = non_negative("WaitTimeSeconds", w)?;
                if w > MAX_WAIT_TIME_SECONDS {
                    return Err(BusError::invalid_parameter(format!(
                        "Value {w} for parameter WaitTimeSeconds is invalid. Reason: Must be >= 0 and <= {MAX_WAIT_TIME_SECONDS}, if provided."
                    )));
                }
                w
            }
            None => queue.receive_wait_seconds(),
        };
        let options = ReceiveOptions {
            max_messages: max as usize,
            visibility_timeout: req
                .visibility_timeout
                .map(|v| non_negative("VisibilityTimeout", v))
                .transpose()?,
        };

        let deadline = self.clock().now_millis() + i64::from(wait) * 1000;
        let mut shutdown = self.shutdown_signal();
        let delivered = loop {
            let notified = queue.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outcome = queue.receive(options)?;
            self.route_dead_letters(outcome.dead_letters);
            if !outcome.delivered.is_empty() {
                break outcome.delivered;
            }
            if self.clock().now_millis() >= deadline || self.is_disposed() || queue.is_deleted() {
                break Vec::new();
            }
            let wake = queue
                .next_wakeup()
                .map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = self.clock().sleep_until(wake) => {}
                _ = shutdown.changed() => {}
            }
        };

        let mut system_names = req.attribute_names.unwrap_or_default();
        system_names.extend(req.message_system_attribute_names.unwrap_or_default());
        let system = AttributeSelection::new(Some(system_names));
        let user = AttributeSelection::new(req.message_attribute_names);
        Ok(ReceiveMessageResponse {
            messages: delivered
                .into_iter()
                .map(|d| filter_received(d.message.to_received(&d.receipt_handle), &system, &user))
                .collect(),
        })
    }

    pub async fn delete_message(&self, req: DeleteMessageRequest) -> BusResult<()> {
        self.require_queue(&req.queue_url)?
            .delete(&req.receipt_handle)
    }

    pub async fn delete_message_batch(
        &self,
        req: DeleteMessageBatchRequest,
    ) -> BusResult<DeleteMessageBatchResponse> {
        validate_batch_ids(req.entries.iter().map(|e| e.id.as_str()))?;
        let queue = self.require_queue(&req.queue_url)?;
        let mut successful = Vec::new();
        let mut failed = Vec::new();
        for entry in req.entries {
            match queue.delete(&entry.receipt_handle) {
                Ok(()) => successful.push(BatchResultEntry { id: entry.id }),
                Err(e) => failed.push(failure(entry.id, &e)),
            }
        }
        Ok(DeleteMessageBatchResponse { successful, failed })
    }

    pub async fn change_message_visibility(
        &self,
        req: ChangeMessageVisibilityRequest,
    ) -> BusResult<()> {
        let timeout = non_negative("VisibilityTimeout", req.visibility_timeout)?;
        self.require_queue(&req.queue_url)?
            .change_visibility(&req.receipt_handle, timeout)
    }

    pub async fn change_message_visibility_batch(
        &self,
        req: ChangeMessageVisibilityBatchRequest,
    ) -> BusResult<ChangeMessageVisibilityBatchResponse> {
        validate_batch_ids(req.entries.iter().map(|e| e.id.as_str()))?;
        let queue = self.require_queue(&req.queue_url)?;
        let mut successful = Vec::new();
        let mut failed = Vec::new();
        for entry in req.entries {
            let result = non_negative("VisibilityTimeout", entry.visibility_timeout)
                .and_then(|t| queue.change_visibility(&entry.receipt_handle, t));
            match result {
                Ok(()) => successful.push(BatchResultEntry { id: entry.id }),
                Err(e) => failed.push(failure(entry.id, &e)),
            }
        }
        Ok(ChangeMessageVisibilityBatchResponse { successful, failed })
    }

    pub async fn tag_queue(&self, req: TagQueueRequest) -> BusResult<()> {
        self.require_queue(&req.queue_url)?.tag(req.tags)
    }

    pub async fn untag_queue(&self, req: UntagQueueRequest) -> BusResult<()> {
        self.require_queue(&req.queue_url)?.untag(&req.tag_keys)
    }

    pub async fn list_queue_tags(&self, req: ListQueueTagsRequest) -> BusResult<ListQueueTagsResponse> {
        Ok(ListQueueTagsResponse {
            tags: self.require_queue(&req.queue_url)?.tags(),
        })
    }

    pub async fn add_permission(&self, req: AddPermissionRequest) -> BusResult<()> {
        let queue = self.require_queue(&req.queue_url)?;
        let label_ok = !req.label.is_empty()
            && req.label.len() <= 80
            && req
                .label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !label_ok {
            return Err(BusError::invalid_parameter(format!(
                "Value {} for parameter Label is invalid.",
                req.label
            )));
        }
        if req.aws_account_ids.is_empty() || req.actions.is_empty() {
            return Err(BusError::invalid_parameter(
                "AWSAccountIds and Actions must each contain at least one value",
            ));
        }
        queue.add_permission(
            &req.label,
            Permission {
                account_ids: req.aws_account_ids,
                actions: req.actions,
            },
        )
    }

    pub async fn remove_permission(&self, req: RemovePermissionRequest) -> BusResult<()> {
        self.require_queue(&req.queue_url)?
            .remove_permission(&req.label)
    }

    pub async fn list_dead_letter_source_queues(
        &self,
        req: ListDeadLetterSourceQueuesRequest,
    ) -> BusResult<ListDeadLetterSourceQueuesResponse> {
        let target = self.require_queue(&req.queue_url)?;
        let max = page_size(req.max_results, 1000, 1000)?;
        let sources: Vec<String> = self
            .all_queues()
            .into_iter()
            .filter(|q| {
                q.redrive_policy()
                    .is_some_and(|rp| rp.dead_letter_target_arn == target.arn())
            })
            .map(|q| q.url().to_string())
            .collect();
        let (queue_urls, next_token) = paginate(sources, req.next_token.as_deref(), max);
        Ok(ListDeadLetterSourceQueuesResponse {
            queue_urls,
            next_token,
        })
    }

    // --- message move tasks ---

    fn is_dead_letter_target(&self, arn: &str) -> bool {
        self.all_queues().iter().any(|q| {
            q.redrive_policy()
                .is_some_and(|rp| rp.dead_letter_target_arn == arn)
        })
    }

    /// Starts draining `SourceArn` into `DestinationArn`, or back into each
    /// message's original queue when no destination is given.
    pub async fn start_message_move_task(
        self: &Arc<Self>,
        req: StartMessageMoveTaskRequest,
    ) -> BusResult<StartMessageMoveTaskResponse> {
        let source = self.queue_by_arn(&req.source_arn).ok_or_else(|| {
            BusError::not_found(format!("The resource {} does not exist.", req.source_arn))
        })?;
        if !self.is_dead_letter_target(source.arn()) {
            return Err(BusError::invalid_parameter(
                "Source queue must be configured as a Dead Letter Queue.",
            ));
        }
        if let Some(ref destination) = req.destination_arn {
            if self.queue_by_arn(destination).is_none() {
                return Err(BusError::not_found(format!(
                    "The resource {destination} does not exist."
                )));
            }
        }
        let rate = match req.max_number_of_messages_per_second {
            None => None,
            Some(r) if r >= 1 && r as u32 <= MAX_MOVE_RATE => Some(r as u32),
            Some(r) => {
                return Err(BusError::invalid_parameter(format!(
                    "Value {r} for parameter MaxNumberOfMessagesPerSecond is invalid. Reason: must be between 1 and {MAX_MOVE_RATE}."
                )))
            }
        };

        let handle = Uuid::new_v4().to_string();
        match self.active_moves.entry(source.arn().to_string()) {
            Entry::Occupied(_) => {
                return Err(BusError::conflict(format!(
                    "A message move task is already running for {}",
                    source.arn()
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
            }
        }

        let (visible, delayed, _) = source.counts();
        let task = Arc::new(MoveTask::new(
            handle.clone(),
            source.arn().to_string(),
            req.destination_arn,
            rate,
            self.clock().now_millis(),
            (visible + delayed) as i64,
        ));
        self.move_tasks.insert(handle.clone(), task.clone());
        info!(task = %handle, source = %source.arn(), "message move task started");
        spawn_move_task(self.clone(), task);
        Ok(StartMessageMoveTaskResponse {
            task_handle: handle,
        })
    }

    pub async fn cancel_message_move_task(
        &self,
        req: CancelMessageMoveTaskRequest,
    ) -> BusResult<CancelMessageMoveTaskResponse> {
        let task = self
            .move_tasks
            .get(&req.task_handle)
            .map(|t| t.value().clone())
            .ok_or_else(|| {
                BusError::not_found(format!("Task {} does not exist.", req.task_handle))
            })?;
        if !task.request_cancel() {
            return Err(BusError::new(
                ErrorKind::NotFound,
                format!("Task {} is not running.", req.task_handle),
            ));
        }
        info!(task = %req.task_handle, "message move task cancelling");
        Ok(CancelMessageMoveTaskResponse {
            approximate_number_of_messages_moved: task.moved(),
        })
    }

    /// Most recent first.
    pub async fn list_message_move_tasks(
        &self,
        req: ListMessageMoveTasksRequest,
    ) -> BusResult<ListMessageMoveTasksResponse> {
        if self.queue_by_arn(&req.source_arn).is_none() {
            return Err(BusError::not_found(format!(
                "The resource {} does not exist.",
                req.source_arn
            )));
        }
        let max = page_size(req.max_results, 10, 10)?;
        let mut tasks: Vec<Arc<MoveTask>> = self
            .move_tasks
            .iter()
            .filter(|t| t.value().source_arn() == req.source_arn)
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by_key(|t| std::cmp::Reverse(t.started_at()));
        Ok(ListMessageMoveTasksResponse {
            results: tasks.iter().take(max).map(|t| t.to_result()).collect(),
        })
    }
}
