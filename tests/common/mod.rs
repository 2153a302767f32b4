#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use aws_messaging_local::sqs::queue::QueueResource;
use aws_messaging_local::sqs::types::{CreateQueueRequest, ReceiveMessageRequest, ReceivedMessage};
use aws_messaging_local::{Bus, BusConfig, ManualClock};

pub fn bus() -> (Arc<Bus>, ManualClock) {
    let clock = ManualClock::default();
    let bus = Arc::new(Bus::new(BusConfig::default(), Arc::new(clock.clone())));
    (bus, clock)
}

pub fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub async fn create_queue(bus: &Bus, name: &str, pairs: &[(&str, &str)]) -> String {
    bus.create_queue(CreateQueueRequest {
        queue_name: name.into(),
        attributes: Some(attrs(pairs)),
        tags: None,
    })
    .await
    .unwrap()
    .queue_url
}

pub fn queue(bus: &Bus, name: &str) -> Arc<QueueResource> {
    bus.queue_by_name(name).unwrap()
}

pub async fn receive(bus: &Bus, url: &str, max: i32) -> Vec<ReceivedMessage> {
    bus.receive_message(ReceiveMessageRequest {
        queue_url: url.into(),
        max_number_of_messages: Some(max),
        attribute_names: Some(vec!["All".into()]),
        message_attribute_names: Some(vec!["All".into()]),
        ..Default::default()
    })
    .await
    .unwrap()
    .messages
}
