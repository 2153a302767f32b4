mod common;

use std::collections::HashMap;

use aws_messaging_local::attribute::MessageAttributeValue;
use aws_messaging_local::sns::types::*;
use aws_messaging_local::{Bus, ErrorKind};
use serde_json::Value;

use common::{attrs, bus, create_queue, queue, receive};

async fn create_topic(bus: &Bus, name: &str, pairs: &[(&str, &str)]) -> String {
    bus.create_topic(CreateTopicRequest {
        name: name.into(),
        attributes: Some(attrs(pairs)),
        tags: None,
    })
    .await
    .unwrap()
    .topic_arn
}

async fn subscribe(bus: &Bus, topic_arn: &str, queue_name: &str, pairs: &[(&str, &str)]) -> String {
    bus.subscribe(SubscribeRequest {
        topic_arn: topic_arn.into(),
        protocol: "sqs".into(),
        endpoint: Some(bus.queue_arn(queue_name)),
        attributes: Some(attrs(pairs)),
        return_subscription_arn: Some(true),
    })
    .await
    .unwrap()
    .subscription_arn
}

fn kind(value: &str) -> Option<HashMap<String, MessageAttributeValue>> {
    Some(HashMap::from([(
        "kind".to_string(),
        MessageAttributeValue::string(value),
    )]))
}

fn publish(topic_arn: &str, message: &str, kind_value: &str) -> PublishRequest {
    PublishRequest {
        topic_arn: Some(topic_arn.into()),
        message: message.into(),
        message_attributes: kind(kind_value),
        ..Default::default()
    }
}

#[tokio::test]
async fn raw_and_filtered_enveloped_subscribers() {
    let (bus, _clock) = bus();
    let q1 = create_queue(&bus, "raw-inbox", &[]).await;
    let q2 = create_queue(&bus, "orders-inbox", &[]).await;
    let topic = create_topic(&bus, "events", &[]).await;
    subscribe(&bus, &topic, "raw-inbox", &[("RawMessageDelivery", "true")]).await;
    let filtered = subscribe(
        &bus,
        &topic,
        "orders-inbox",
        &[("FilterPolicy", r#"{"kind":["order"]}"#)],
    )
    .await;

    let published = bus.publish(publish(&topic, "first", "order")).await.unwrap();

    let raw = receive(&bus, &q1, 10).await;
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].body, "first");
    assert_eq!(raw[0].message_attributes["kind"], MessageAttributeValue::string("order"));

    let wrapped = receive(&bus, &q2, 10).await;
    assert_eq!(wrapped.len(), 1);
    let envelope: Value = serde_json::from_str(&wrapped[0].body).unwrap();
    assert_eq!(envelope["Type"], "Notification");
    assert_eq!(envelope["MessageId"], published.message_id.as_str());
    assert_eq!(envelope["TopicArn"], topic.as_str());
    assert_eq!(envelope["Message"], "first");
    assert_eq!(envelope["MessageAttributes"]["kind"]["Type"], "String");
    assert_eq!(envelope["MessageAttributes"]["kind"]["Value"], "order");
    assert!(envelope["Timestamp"].as_str().unwrap().ends_with('Z'));
    assert!(envelope["UnsubscribeURL"].as_str().unwrap().contains("Action=Unsubscribe"));

    bus.publish(publish(&topic, "second", "invoice")).await.unwrap();
    assert_eq!(receive(&bus, &q1, 10).await.len(), 1);
    assert!(receive(&bus, &q2, 10).await.is_empty());

    // Dropping the filter takes effect on the next publish.
    bus.set_subscription_attributes(SetSubscriptionAttributesRequest {
        subscription_arn: filtered,
        attribute_name: "FilterPolicy".into(),
        attribute_value: Some(String::new()),
    })
    .await
    .unwrap();
    bus.publish(publish(&topic, "third", "invoice")).await.unwrap();
    assert_eq!(receive(&bus, &q2, 10).await.len(), 1);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (bus, _clock) = bus();
    let url = create_queue(&bus, "inbox", &[]).await;
    let topic = create_topic(&bus, "events", &[]).await;
    let sub = subscribe(&bus, &topic, "inbox", &[]).await;

    // Subscribing again with the same attributes is idempotent.
    assert_eq!(subscribe(&bus, &topic, "inbox", &[]).await, sub);

    bus.unsubscribe(UnsubscribeRequest {
        subscription_arn: sub,
    })
    .await
    .unwrap();
    bus.publish(publish(&topic, "lost", "order")).await.unwrap();
    assert!(receive(&bus, &url, 10).await.is_empty());

    let listed = bus
        .list_subscriptions_by_topic(ListSubscriptionsByTopicRequest {
            topic_arn: topic,
            next_token: None,
        })
        .await
        .unwrap();
    assert!(listed.subscriptions.is_empty());
}

#[tokio::test]
async fn oversized_publish_delivers_nowhere() {
    let (bus, _clock) = bus();
    create_queue(&bus, "inbox", &[]).await;
    let topic = create_topic(&bus, "events", &[]).await;
    subscribe(&bus, &topic, "inbox", &[("RawMessageDelivery", "true")]).await;

    let body = "x".repeat(262_144);
    let err = bus.publish(publish(&topic, &body, "order")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MessageTooLarge);
    assert_eq!(queue(&bus, "inbox").counts(), (0, 0, 0));

    let entry = |id: &str| PublishBatchEntry {
        id: id.into(),
        message: "y".repeat(150_000),
        ..Default::default()
    };
    let err = bus
        .publish_batch(PublishBatchRequest {
            topic_arn: topic,
            publish_batch_request_entries: vec![entry("a"), entry("b")],
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BatchRequestTooLong);
    assert_eq!(queue(&bus, "inbox").counts(), (0, 0, 0));
}

#[tokio::test]
async fn fifo_topic_suppresses_duplicate_publishes() {
    let (bus, _clock) = bus();
    let url = create_queue(&bus, "ledger.fifo", &[("FifoQueue", "true")]).await;
    let topic = create_topic(
        &bus,
        "ledger.fifo",
        &[("FifoTopic", "true"), ("ContentBasedDeduplication", "true")],
    )
    .await;
    subscribe(&bus, &topic, "ledger.fifo", &[("RawMessageDelivery", "true")]).await;

    let send = || PublishRequest {
        topic_arn: Some(topic.clone()),
        message: "credit 10".into(),
        message_group_id: Some("acct-1".into()),
        ..Default::default()
    };
    let first = bus.publish(send()).await.unwrap();
    let second = bus.publish(send()).await.unwrap();
    assert_eq!(first.message_id, second.message_id);
    assert!(first.sequence_number.is_some());

    let delivered = receive(&bus, &url, 10).await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].attributes["MessageGroupId"], "acct-1");

    let missing_group = bus
        .publish(PublishRequest {
            message_group_id: None,
            ..send()
        })
        .await
        .unwrap_err();
    assert_eq!(missing_group.kind(), ErrorKind::InvalidParameter);

    let standard_queue = bus
        .subscribe(SubscribeRequest {
            topic_arn: topic.clone(),
            protocol: "sqs".into(),
            endpoint: Some(bus.queue_arn("plain")),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(standard_queue.kind(), ErrorKind::InvalidParameter);
}

#[tokio::test]
async fn non_queue_protocols_are_unsupported() {
    let (bus, _clock) = bus();
    let topic = create_topic(&bus, "events", &[]).await;
    let err = bus
        .subscribe(SubscribeRequest {
            topic_arn: topic,
            protocol: "email".into(),
            endpoint: Some("ops@example.com".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[tokio::test]
async fn deleting_a_topic_removes_its_subscriptions() {
    let (bus, _clock) = bus();
    create_queue(&bus, "inbox", &[]).await;
    let topic = create_topic(&bus, "events", &[]).await;
    subscribe(&bus, &topic, "inbox", &[]).await;

    bus.delete_topic(DeleteTopicRequest {
        topic_arn: topic.clone(),
    })
    .await
    .unwrap();
    let all = bus
        .list_subscriptions(ListSubscriptionsRequest::default())
        .await
        .unwrap();
    assert!(all.subscriptions.is_empty());
    let err = bus.publish(publish(&topic, "x", "order")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_subscribes_deliver_once() {
    let (bus, _clock) = bus();
    let url = create_queue(&bus, "inbox", &[]).await;
    let topic = create_topic(&bus, "events", &[]).await;

    let calls: Vec<_> = (0..16)
        .map(|_| {
            let bus = bus.clone();
            let topic = topic.clone();
            tokio::spawn(async move { subscribe(&bus, &topic, "inbox", &[]).await })
        })
        .collect();
    let mut arns = Vec::new();
    for call in calls {
        arns.push(call.await.unwrap());
    }
    arns.dedup();
    assert_eq!(arns.len(), 1);

    let all = bus
        .list_subscriptions(ListSubscriptionsRequest::default())
        .await
        .unwrap();
    assert_eq!(all.subscriptions.len(), 1);

    bus.publish(publish(&topic, "once", "order")).await.unwrap();
    assert_eq!(receive(&bus, &url, 10).await.len(), 1);
}
