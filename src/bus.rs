//! The resource registry every operation goes through.
//!
//! A [`Bus`] owns all queues, topics, subscriptions and move tasks of one
//! emulated account. Registries are concurrent maps; each resource guards its
//! own state, so operations on different queues never contend. Background
//! work (the visibility sweeper, move tasks) observes the bus's shutdown
//! signal and stops once [`Bus::dispose`] is called.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::BusConfig;
use crate::observer::{Service, UsageObserver, UsageRecord};
use crate::sns::topic::{Subscription, SubscriptionSnapshot, TopicResource, TopicSnapshot};
use crate::sqs::move_task::MoveTask;
use crate::sqs::queue::{DeadLetter, QueueResource, QueueSnapshot};
use crate::sqs::types::MessageMoveTaskResult;

/// Counts from one pass of the visibility sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub released: usize,
    pub dead_lettered: usize,
    pub dropped: usize,
}

/// Read-only view of everything the bus holds.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusSnapshot {
    pub account_id: String,
    pub region: String,
    pub queues: Vec<QueueSnapshot>,
    pub topics: Vec<TopicSnapshot>,
    pub subscriptions: Vec<SubscriptionSnapshot>,
    pub move_tasks: Vec<MessageMoveTaskResult>,
    pub recent_operations: Vec<UsageRecord>,
}

pub struct Bus {
    config: BusConfig,
    clock: Arc<dyn Clock>,
    observer: Option<Arc<dyn UsageObserver>>,
    /// Keyed by queue name.
    pub(crate) queues: DashMap<String, Arc<QueueResource>>,
    /// Keyed by topic ARN.
    pub(crate) topics: DashMap<String, Arc<TopicResource>>,
    /// Keyed by subscription ARN.
    pub(crate) subscriptions: DashMap<String, Arc<Subscription>>,
    /// Keyed by task handle.
    pub(crate) move_tasks: DashMap<String, Arc<MoveTask>>,
    /// Source queue ARN to the handle of its running move task.
    pub(crate) active_moves: DashMap<String, String>,
    shutdown: watch::Sender<bool>,
}

impl Bus {
    pub fn new(config: BusConfig, clock: Arc<dyn Clock>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Bus {
            config,
            clock,
            observer: None,
            queues: DashMap::new(),
            topics: DashMap::new(),
            subscriptions: DashMap::new(),
            move_tasks: DashMap::new(),
            active_moves: DashMap::new(),
            shutdown,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn UsageObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn account_id(&self) -> &str {
        &self.config.account_id
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    // --- identity ---

    pub fn queue_url(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.sqs_endpoint, self.config.account_id, name
        )
    }

    pub fn queue_arn(&self, name: &str) -> String {
        format!(
            "arn:aws:sqs:{}:{}:{}",
            self.config.region, self.config.account_id, name
        )
    }

    pub fn topic_arn(&self, name: &str) -> String {
        format!(
            "arn:aws:sns:{}:{}:{}",
            self.config.region, self.config.account_id, name
        )
    }

    /// Maps a queue URL to the queue's ARN without looking the queue up.
    pub fn queue_arn_for_url(&self, url: &str) -> Option<String> {
        queue_name_from_url(url).map(|name| self.queue_arn(name))
    }

    // --- lookup ---

    pub fn queue_by_name(&self, name: &str) -> Option<Arc<QueueResource>> {
        self.queues.get(name).map(|q| q.value().clone())
    }

    pub fn queue_by_url(&self, url: &str) -> Option<Arc<QueueResource>> {
        queue_name_from_url(url).and_then(|name| self.queue_by_name(name))
    }

    pub fn queue_by_arn(&self, arn: &str) -> Option<Arc<QueueResource>> {
        let name = arn.rsplit(':').next()?;
        self.queue_by_name(name).filter(|q| q.arn() == arn)
    }

    pub fn topic_by_arn(&self, arn: &str) -> Option<Arc<TopicResource>> {
        self.topics.get(arn).map(|t| t.value().clone())
    }

    pub fn subscription_by_arn(&self, arn: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.get(arn).map(|s| s.value().clone())
    }

    pub(crate) fn all_queues(&self) -> Vec<Arc<QueueResource>> {
        self.queues.iter().map(|q| q.value().clone()).collect()
    }

    // --- cross-queue movement ---

    /// Delivers messages removed from their source queue to the dead-letter
    /// queue named by their redrive policy. A missing target drops the message.
    pub fn route_dead_letters(&self, dead_letters: Vec<DeadLetter>) -> usize {
        let mut routed = 0;
        for dl in dead_letters {
            let message_id = dl.message.message_id.clone();
            match self.queue_by_arn(&dl.target_arn) {
                Some(dlq) => match dlq.accept_dead_letter(dl.message, &dl.source_arn) {
                    Ok(()) => {
                        routed += 1;
                        debug!(
                            message_id = %message_id,
                            source = %dl.source_arn,
                            target = %dl.target_arn,
                            "message moved to dead-letter queue"
                        );
                    }
                    Err(e) => warn!(
                        message_id = %message_id,
                        target = %dl.target_arn,
                        error = %e,
                        "dead-letter queue rejected message; dropped"
                    ),
                },
                None => warn!(
                    message_id = %message_id,
                    target = %dl.target_arn,
                    "dead-letter queue does not exist; message dropped"
                ),
            }
        }
        routed
    }

    /// Releases expired in-flight messages on every queue, dead-lettering
    /// those over their receive limit.
    pub fn sweep_expired(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for queue in self.all_queues() {
            let outcome = queue.expire();
            report.released += outcome.released;
            report.dropped += outcome.dropped;
            report.dead_lettered += self.route_dead_letters(outcome.dead_letters);
        }
        report
    }

    // --- observation ---

    pub(crate) fn record(
        &self,
        service: Service,
        action: &'static str,
        resource_arn: Option<String>,
        success: bool,
    ) {
        if let Some(ref observer) = self.observer {
            observer.record(UsageRecord {
                service,
                action,
                resource_arn,
                success,
                timestamp: self.clock.now_millis(),
            });
        }
    }

    pub fn snapshot(&self) -> BusSnapshot {
        let mut queues: Vec<QueueSnapshot> =
            self.all_queues().iter().map(|q| q.snapshot()).collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));

        let topic_list: Vec<Arc<TopicResource>> =
            self.topics.iter().map(|t| t.value().clone()).collect();
        let mut topics: Vec<TopicSnapshot> = topic_list.iter().map(|t| t.snapshot()).collect();
        topics.sort_by(|a, b| a.arn.cmp(&b.arn));

        let sub_list: Vec<Arc<Subscription>> = self
            .subscriptions
            .iter()
            .map(|s| s.value().clone())
            .collect();
        let mut subscriptions: Vec<SubscriptionSnapshot> =
            sub_list.iter().map(|s| s.snapshot()).collect();
        subscriptions.sort_by(|a, b| a.subscription_arn.cmp(&b.subscription_arn));

        let task_list: Vec<Arc<MoveTask>> =
            self.move_tasks.iter().map(|t| t.value().clone()).collect();
        let mut move_tasks: Vec<MessageMoveTaskResult> =
            task_list.iter().map(|t| t.to_result()).collect();
        move_tasks.sort_by_key(|t| t.started_timestamp);

        BusSnapshot {
            account_id: self.config.account_id.clone(),
            region: self.config.region.clone(),
            queues,
            topics,
            subscriptions,
            move_tasks,
            recent_operations: self
                .observer
                .as_ref()
                .map(|o| o.recent())
                .unwrap_or_default(),
        }
    }

    // --- lifecycle ---

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stops background work. Pending long polls return empty.
    pub fn dispose(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        for task in self.move_tasks.iter() {
            task.value().request_cancel();
        }
        info!("bus disposed");
    }
}

fn queue_name_from_url(url: &str) -> Option<&str> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn identity_follows_config() {
        let bus = Bus::new(BusConfig::default(), Arc::new(ManualClock::default()));
        assert_eq!(
            bus.queue_url("jobs"),
            "http://localhost:9324/000000000000/jobs"
        );
        assert_eq!(bus.queue_arn("jobs"), "arn:aws:sqs:us-east-1:000000000000:jobs");
        assert_eq!(bus.topic_arn("news"), "arn:aws:sns:us-east-1:000000000000:news");
        assert_eq!(
            bus.queue_arn_for_url("http://elsewhere:1/000000000000/jobs/").as_deref(),
            Some("arn:aws:sqs:us-east-1:000000000000:jobs")
        );
    }

    #[test]
    fn dispose_is_idempotent() {
        let bus = Bus::new(BusConfig::default(), Arc::new(ManualClock::default()));
        let signal = bus.shutdown_signal();
        bus.dispose();
        bus.dispose();
        assert!(*signal.borrow());
        assert!(bus.is_disposed());
    }
}
