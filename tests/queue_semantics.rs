mod common;

use std::collections::HashSet;
use std::time::Duration;

use aws_messaging_local::sqs::types::*;
use aws_messaging_local::ErrorKind;

use common::{attrs, bus, create_queue, queue, receive};

fn fifo_send(url: &str, body: &str, group: &str, dedup: &str) -> SendMessageRequest {
    SendMessageRequest {
        queue_url: url.into(),
        message_body: body.into(),
        message_group_id: Some(group.into()),
        message_deduplication_id: Some(dedup.into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn duplicate_sends_within_window_are_idempotent() {
    let (bus, clock) = bus();
    let url = create_queue(&bus, "orders.fifo", &[("FifoQueue", "true")]).await;

    let first = bus.send_message(fifo_send(&url, "a", "g", "d1")).await.unwrap();
    let second = bus.send_message(fifo_send(&url, "a", "g", "d1")).await.unwrap();
    assert_eq!(first.message_id, second.message_id);
    assert_eq!(queue(&bus, "orders.fifo").counts(), (1, 0, 0));

    clock.advance(Duration::from_secs(5 * 60 + 1));
    let third = bus.send_message(fifo_send(&url, "a", "g", "d1")).await.unwrap();
    assert_ne!(third.message_id, first.message_id);
    assert_eq!(queue(&bus, "orders.fifo").counts(), (2, 0, 0));
}

#[tokio::test]
async fn group_is_delivered_in_order_one_at_a_time() {
    let (bus, _clock) = bus();
    let url = create_queue(
        &bus,
        "jobs.fifo",
        &[("FifoQueue", "true"), ("ContentBasedDeduplication", "true")],
    )
    .await;
    for body in ["A", "B", "C"] {
        bus.send_message(SendMessageRequest {
            queue_url: url.clone(),
            message_body: body.into(),
            message_group_id: Some("G".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        let batch = receive(&bus, &url, 10).await;
        assert_eq!(batch.len(), 1, "one message per group may be in flight");
        // The group stays locked while its message is in flight.
        assert!(receive(&bus, &url, 10).await.is_empty());

        let msg = &batch[0];
        assert_eq!(msg.attributes["MessageGroupId"], "G");
        seen.push(msg.body.clone());
        bus.delete_message(DeleteMessageRequest {
            queue_url: url.clone(),
            receipt_handle: msg.receipt_handle.clone(),
        })
        .await
        .unwrap();
    }
    assert_eq!(seen, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn groups_share_receives_fairly() {
    let (bus, _clock) = bus();
    let url = create_queue(
        &bus,
        "mixed.fifo",
        &[("FifoQueue", "true"), ("ContentBasedDeduplication", "true")],
    )
    .await;
    for (group, body) in [("g1", "1a"), ("g1", "1b"), ("g2", "2a"), ("g3", "3a")] {
        bus.send_message(SendMessageRequest {
            queue_url: url.clone(),
            message_body: body.into(),
            message_group_id: Some(group.into()),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    let batch = receive(&bus, &url, 10).await;
    let mut bodies: Vec<&str> = batch.iter().map(|m| m.body.as_str()).collect();
    bodies.sort();
    assert_eq!(bodies, vec!["1a", "2a", "3a"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_receives_never_share_a_group() {
    let (bus, _clock) = bus();
    let url = create_queue(
        &bus,
        "locked.fifo",
        &[("FifoQueue", "true"), ("ContentBasedDeduplication", "true")],
    )
    .await;
    for i in 0..20 {
        bus.send_message(SendMessageRequest {
            queue_url: url.clone(),
            message_body: format!("m{i}"),
            message_group_id: Some("G".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    let receivers: Vec<_> = (0..16)
        .map(|_| {
            let bus = bus.clone();
            let url = url.clone();
            tokio::spawn(async move { receive(&bus, &url, 10).await })
        })
        .collect();
    let mut delivered = Vec::new();
    for receiver in receivers {
        delivered.extend(receiver.await.unwrap());
    }
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].body, "m0");
}

#[tokio::test]
async fn long_poll_waits_for_a_send_or_its_deadline() {
    let (bus, clock) = bus();
    let url = create_queue(&bus, "polled", &[]).await;
    let poll = |wait: i32| {
        let bus = bus.clone();
        let url = url.clone();
        tokio::spawn(async move {
            bus.receive_message(ReceiveMessageRequest {
                queue_url: url,
                wait_time_seconds: Some(wait),
                ..Default::default()
            })
            .await
            .unwrap()
            .messages
        })
    };

    let waiting = poll(20);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!waiting.is_finished());
    bus.send_message(SendMessageRequest {
        queue_url: url.clone(),
        message_body: "late".into(),
        ..Default::default()
    })
    .await
    .unwrap();
    let woke = waiting.await.unwrap();
    assert_eq!(woke.len(), 1);
    assert_eq!(woke[0].body, "late");

    let idle = poll(5);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!idle.is_finished());
    clock.advance(Duration::from_secs(5));
    assert!(idle.await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_message_becomes_visible_again() {
    let (bus, clock) = bus();
    let url = create_queue(&bus, "work", &[]).await;
    bus.send_message(SendMessageRequest {
        queue_url: url.clone(),
        message_body: "payload".into(),
        ..Default::default()
    })
    .await
    .unwrap();

    let first = bus
        .receive_message(ReceiveMessageRequest {
            queue_url: url.clone(),
            visibility_timeout: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(first.messages.len(), 1);
    assert!(receive(&bus, &url, 1).await.is_empty());

    clock.advance(Duration::from_secs(3));
    let again = receive(&bus, &url, 1).await;
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].message_id, first.messages[0].message_id);
    assert_eq!(again[0].attributes["ApproximateReceiveCount"], "2");
    assert_ne!(again[0].receipt_handle, first.messages[0].receipt_handle);

    // The superseded handle no longer identifies the message.
    let stale = bus
        .delete_message(DeleteMessageRequest {
            queue_url: url.clone(),
            receipt_handle: first.messages[0].receipt_handle.clone(),
        })
        .await;
    assert_eq!(stale.unwrap_err().kind(), ErrorKind::InvalidReceiptHandle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_racing_expiry_resolves_each_message_once() {
    const SENT: usize = 200;
    let (bus, clock) = bus();
    let url = create_queue(&bus, "race", &[("VisibilityTimeout", "1")]).await;
    for i in 0..SENT {
        bus.send_message(SendMessageRequest {
            queue_url: url.clone(),
            message_body: format!("m{i}"),
            ..Default::default()
        })
        .await
        .unwrap();
    }
    let mut handles = Vec::new();
    loop {
        let batch = receive(&bus, &url, 10).await;
        if batch.is_empty() {
            break;
        }
        handles.extend(batch.into_iter().map(|m| m.receipt_handle));
    }
    assert_eq!(handles.len(), SENT);
    clock.advance(Duration::from_secs(2));

    let sweeper = {
        let bus = bus.clone();
        tokio::task::spawn_blocking(move || {
            (0..50).map(|_| bus.sweep_expired().released).sum::<usize>()
        })
    };
    for handle in handles {
        bus.delete_message(DeleteMessageRequest {
            queue_url: url.clone(),
            receipt_handle: handle,
        })
        .await
        .unwrap();
    }
    let released = sweeper.await.unwrap();
    // Anything still in flight expired before the sweeper finished.
    let released = released + bus.sweep_expired().released;

    // Released messages stay in the queue; every other message is deleted.
    let (visible, delayed, inflight) = queue(&bus, "race").counts();
    assert_eq!((visible, delayed, inflight), (released, 0, 0));

    let mut ids = HashSet::new();
    loop {
        let batch = receive(&bus, &url, 10).await;
        if batch.is_empty() {
            break;
        }
        for m in batch {
            assert!(ids.insert(m.message_id), "message delivered twice");
        }
    }
    assert_eq!(ids.len(), released);
}

#[tokio::test]
async fn second_expiry_moves_message_to_dead_letter_queue() {
    let (bus, clock) = bus();
    let dlq_url = create_queue(&bus, "work-dlq", &[]).await;
    let dlq_arn = queue(&bus, "work-dlq").arn().to_string();
    let policy = format!(r#"{{"deadLetterTargetArn":"{dlq_arn}","maxReceiveCount":2}}"#);
    let url = create_queue(
        &bus,
        "work",
        &[("RedrivePolicy", policy.as_str()), ("VisibilityTimeout", "5")],
    )
    .await;
    bus.send_message(SendMessageRequest {
        queue_url: url.clone(),
        message_body: "poison".into(),
        ..Default::default()
    })
    .await
    .unwrap();

    assert_eq!(receive(&bus, &url, 1).await.len(), 1);
    clock.advance(Duration::from_secs(6));
    assert_eq!(bus.sweep_expired().released, 1);

    assert_eq!(receive(&bus, &url, 1).await.len(), 1);
    clock.advance(Duration::from_secs(6));
    let report = bus.sweep_expired();
    assert_eq!(report.dead_lettered, 1);

    assert_eq!(queue(&bus, "work").counts(), (0, 0, 0));
    let moved = receive(&bus, &dlq_url, 1).await;
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].body, "poison");

    let sources = bus
        .list_dead_letter_source_queues(ListDeadLetterSourceQueuesRequest {
            queue_url: dlq_url,
            max_results: None,
            next_token: None,
        })
        .await
        .unwrap();
    assert_eq!(sources.queue_urls, vec![url]);
}

#[tokio::test]
async fn set_attributes_round_trip_leaves_others_untouched() {
    let (bus, _clock) = bus();
    let url = create_queue(&bus, "settings", &[("DelaySeconds", "4")]).await;

    bus.set_queue_attributes(SetQueueAttributesRequest {
        queue_url: url.clone(),
        attributes: attrs(&[("VisibilityTimeout", "45"), ("MaximumMessageSize", "2048")]),
    })
    .await
    .unwrap();

    let got = bus
        .get_queue_attributes(GetQueueAttributesRequest {
            queue_url: url.clone(),
            attribute_names: Some(vec!["All".into()]),
        })
        .await
        .unwrap()
        .attributes;
    assert_eq!(got["VisibilityTimeout"], "45");
    assert_eq!(got["MaximumMessageSize"], "2048");
    assert_eq!(got["DelaySeconds"], "4");
    assert_eq!(got["MessageRetentionPeriod"], "345600");

    let rejected = bus
        .set_queue_attributes(SetQueueAttributesRequest {
            queue_url: url.clone(),
            attributes: attrs(&[("VisibilityTimeout", "10"), ("DelaySeconds", "901")]),
        })
        .await;
    assert_eq!(rejected.unwrap_err().kind(), ErrorKind::InvalidParameter);
    let after = queue(&bus, "settings").attributes();
    assert_eq!(after.visibility_timeout, 45);
}

#[tokio::test]
async fn batch_send_reports_entries_individually() {
    let (bus, _clock) = bus();
    let url = create_queue(&bus, "batch", &[]).await;
    let entry = |id: &str, body: &str, delay: Option<i32>| SendMessageBatchEntry {
        id: id.into(),
        message_body: body.into(),
        delay_seconds: delay,
        ..Default::default()
    };

    let resp = bus
        .send_message_batch(SendMessageBatchRequest {
            queue_url: url.clone(),
            entries: vec![entry("ok", "x", None), entry("late", "y", Some(5000))],
        })
        .await
        .unwrap();
    assert_eq!(resp.successful.len(), 1);
    assert_eq!(resp.successful[0].id, "ok");
    assert_eq!(resp.failed.len(), 1);
    assert_eq!(resp.failed[0].id, "late");

    let dup = bus
        .send_message_batch(SendMessageBatchRequest {
            queue_url: url,
            entries: vec![entry("same", "x", None), entry("same", "y", None)],
        })
        .await;
    assert_eq!(dup.unwrap_err().kind(), ErrorKind::BatchEntryIdsNotDistinct);
}

#[tokio::test]
async fn queue_tags_merge_and_respect_limit() {
    let (bus, _clock) = bus();
    let url = create_queue(&bus, "tagged", &[]).await;
    bus.tag_queue(TagQueueRequest {
        queue_url: url.clone(),
        tags: attrs(&[("team", "payments"), ("env", "dev")]),
    })
    .await
    .unwrap();
    bus.untag_queue(UntagQueueRequest {
        queue_url: url.clone(),
        tag_keys: vec!["env".into()],
    })
    .await
    .unwrap();

    let many: Vec<(String, String)> = (0..50).map(|i| (format!("k{i}"), "v".into())).collect();
    let too_many = bus
        .tag_queue(TagQueueRequest {
            queue_url: url.clone(),
            tags: many.into_iter().collect(),
        })
        .await;
    assert_eq!(too_many.unwrap_err().kind(), ErrorKind::InvalidParameter);

    let tags = bus
        .list_queue_tags(ListQueueTagsRequest { queue_url: url })
        .await
        .unwrap()
        .tags;
    assert_eq!(tags, attrs(&[("team", "payments")]));
}
