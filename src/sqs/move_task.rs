use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::Bus;
use crate::error::{BusError, BusResult};

use super::message::Message;
use super::queue::{QueueResource, ReceiveOptions, SendInput};
use super::types::MessageMoveTaskResult;

/// Messages per second when the caller does not set a rate.
pub const DEFAULT_MOVE_RATE: u32 = 500;
pub const MAX_MOVE_RATE: u32 = 500;
/// Visibility given to messages while a batch is being moved.
const MOVE_VISIBILITY_SECONDS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveTaskStatus {
    Running,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl MoveTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveTaskStatus::Running => "RUNNING",
            MoveTaskStatus::Cancelling => "CANCELLING",
            MoveTaskStatus::Cancelled => "CANCELLED",
            MoveTaskStatus::Completed => "COMPLETED",
            MoveTaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, MoveTaskStatus::Running | MoveTaskStatus::Cancelling)
    }
}

/// A background drain of one queue into another. Progress and status are
/// shared with the bus so callers can list and cancel it while it runs.
pub struct MoveTask {
    handle: String,
    source_arn: String,
    destination_arn: Option<String>,
    max_per_second: Option<u32>,
    started_at: i64,
    messages_to_move: i64,
    moved: AtomicI64,
    status: Mutex<MoveTaskStatus>,
    failure_reason: Mutex<Option<String>>,
    cancel: AtomicBool,
}

impl MoveTask {
    pub fn new(
        handle: String,
        source_arn: String,
        destination_arn: Option<String>,
        max_per_second: Option<u32>,
        started_at: i64,
        messages_to_move: i64,
    ) -> Self {
        MoveTask {
            handle,
            source_arn,
            destination_arn,
            max_per_second,
            started_at,
            messages_to_move,
            moved: AtomicI64::new(0),
            status: Mutex::new(MoveTaskStatus::Running),
            failure_reason: Mutex::new(None),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn source_arn(&self) -> &str {
        &self.source_arn
    }

    pub fn status(&self) -> MoveTaskStatus {
        *self.status.lock()
    }

    pub fn moved(&self) -> i64 {
        self.moved.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    fn rate(&self) -> u32 {
        self.max_per_second.unwrap_or(DEFAULT_MOVE_RATE).max(1)
    }

    /// Asks a running task to stop after its current batch. Returns false
    /// when the task is not running.
    pub fn request_cancel(&self) -> bool {
        let mut status = self.status.lock();
        if *status != MoveTaskStatus::Running {
            return false;
        }
        *status = MoveTaskStatus::Cancelling;
        self.cancel.store(true, Ordering::SeqCst);
        true
    }

    fn finish(&self, status: MoveTaskStatus) {
        *self.status.lock() = status;
    }

    fn fail(&self, reason: String) {
        *self.failure_reason.lock() = Some(reason);
        self.finish(MoveTaskStatus::Failed);
    }

    pub fn to_result(&self) -> MessageMoveTaskResult {
        MessageMoveTaskResult {
            task_handle: self.handle.clone(),
            status: self.status().as_str().to_string(),
            source_arn: self.source_arn.clone(),
            destination_arn: self.destination_arn.clone(),
            approximate_number_of_messages_moved: self.moved(),
            approximate_number_of_messages_to_move: self.messages_to_move,
            max_number_of_messages_per_second: self.max_per_second.map(|r| r as i32),
            started_timestamp: self.started_at,
            failure_reason: self.failure_reason.lock().clone(),
        }
    }
}

pub(crate) fn spawn_move_task(bus: Arc<Bus>, task: Arc<MoveTask>) -> JoinHandle<()> {
    tokio::spawn(async move {
        run(&bus, &task).await;
        bus.active_moves
            .remove_if(task.source_arn(), |_, handle| handle == task.handle());
        info!(
            task = %task.handle(),
            status = task.status().as_str(),
            moved = task.moved(),
            "message move task finished"
        );
    })
}

async fn run(bus: &Bus, task: &MoveTask) {
    let rate = task.rate();
    let batch = rate.min(10) as usize;
    let mut shutdown = bus.shutdown_signal();

    loop {
        if task.cancel.load(Ordering::SeqCst) {
            task.finish(MoveTaskStatus::Cancelled);
            return;
        }
        let Some(source) = bus.queue_by_arn(task.source_arn()) else {
            task.fail("Source queue no longer exists".into());
            warn!(task = %task.handle(), "message move task failed: source queue deleted");
            return;
        };
        match move_batch(bus, task, &source, batch) {
            Ok(0) => {
                task.finish(MoveTaskStatus::Completed);
                return;
            }
            Ok(moved) => {
                let pause = Duration::from_millis(moved as u64 * 1000 / u64::from(rate));
                tokio::select! {
                    _ = bus.clock().sleep(pause) => {}
                    _ = shutdown.changed() => {
                        task.finish(MoveTaskStatus::Cancelled);
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(task = %task.handle(), error = %e, "message move task failed");
                task.fail(e.message().to_string());
                return;
            }
        }
    }
}

/// Receives up to `batch` messages from the source, sends each to its
/// destination and deletes it from the source. Messages not moved because of
/// an error are made visible again.
fn move_batch(
    bus: &Bus,
    task: &MoveTask,
    source: &QueueResource,
    batch: usize,
) -> BusResult<usize> {
    let outcome = source.receive(ReceiveOptions {
        max_messages: batch,
        visibility_timeout: Some(MOVE_VISIBILITY_SECONDS),
    })?;
    bus.route_dead_letters(outcome.dead_letters);

    let mut moved = 0;
    let mut deliveries = outcome.delivered.into_iter();
    while let Some(delivery) = deliveries.next() {
        let result = move_one(bus, task, &delivery.message)
            .and_then(|()| source.delete(&delivery.receipt_handle));
        if let Err(e) = result {
            for pending in std::iter::once(delivery).chain(deliveries) {
                let _ = source.change_visibility(&pending.receipt_handle, 0);
            }
            return Err(e);
        }
        task.moved.fetch_add(1, Ordering::SeqCst);
        moved += 1;
    }
    Ok(moved)
}

fn move_one(bus: &Bus, task: &MoveTask, msg: &Message) -> BusResult<()> {
    let destination_arn = task
        .destination_arn
        .as_deref()
        .or(msg.dead_letter_source_arn.as_deref())
        .ok_or_else(|| {
            BusError::invalid_parameter(format!(
                "Message {} has no source queue to move back to",
                msg.message_id
            ))
        })?;
    let destination = bus
        .queue_by_arn(destination_arn)
        .ok_or_else(BusError::queue_does_not_exist)?;

    let fifo = destination.is_fifo();
    let input = SendInput {
        body: msg.body.clone(),
        delay_seconds: None,
        message_attributes: msg.message_attributes.clone(),
        trace_header: msg.trace_header.clone(),
        deduplication_id: fifo.then(|| msg.message_id.clone()),
        group_id: msg.message_group_id.clone().filter(|_| fifo),
        sender_id: msg.sender_id.clone(),
    };
    destination.send(input)?;
    Ok(())
}
