use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Service {
    #[serde(rename = "sqs")]
    Sqs,
    #[serde(rename = "sns")]
    Sns,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Sqs => "sqs",
            Service::Sns => "sns",
        }
    }
}

/// One completed operation, as reported to a [`UsageObserver`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub service: Service,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_arn: Option<String>,
    pub success: bool,
    pub timestamp: i64,
}

/// Passive hook invoked after every operation routed through a wire adapter.
pub trait UsageObserver: Send + Sync {
    fn record(&self, record: UsageRecord);

    /// Records still held by the observer, oldest first.
    fn recent(&self) -> Vec<UsageRecord> {
        Vec::new()
    }
}

/// Keeps the most recent operations for the admin snapshot.
pub struct RecentOperations {
    capacity: usize,
    records: Mutex<VecDeque<UsageRecord>>,
}

impl RecentOperations {
    pub fn new(capacity: usize) -> Self {
        RecentOperations {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Oldest first.
    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().iter().cloned().collect()
    }
}

impl Default for RecentOperations {
    fn default() -> Self {
        RecentOperations::new(200)
    }
}

impl UsageObserver for RecentOperations {
    fn record(&self, record: UsageRecord) {
        tracing::trace!(
            service = record.service.as_str(),
            action = record.action,
            success = record.success,
            "operation recorded"
        );
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    fn recent(&self) -> Vec<UsageRecord> {
        self.records()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(action: &'static str) -> UsageRecord {
        UsageRecord {
            service: Service::Sqs,
            action,
            resource_arn: None,
            success: true,
            timestamp: 0,
        }
    }

    #[test]
    fn drops_oldest_when_full() {
        let recent = RecentOperations::new(2);
        recent.record(record("CreateQueue"));
        recent.record(record("SendMessage"));
        recent.record(record("ReceiveMessage"));
        let actions: Vec<_> = recent.records().iter().map(|r| r.action).collect();
        assert_eq!(actions, vec!["SendMessage", "ReceiveMessage"]);
    }
}
