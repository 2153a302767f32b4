mod common;

use std::sync::Arc;
use std::time::Duration;

use aws_messaging_local::sqs::types::*;
use aws_messaging_local::{Bus, ErrorKind};

use common::{bus, create_queue, queue};

async fn task_state(bus: &Bus, source_arn: &str) -> MessageMoveTaskResult {
    let listed = bus
        .list_message_move_tasks(ListMessageMoveTasksRequest {
            source_arn: source_arn.into(),
            max_results: None,
        })
        .await
        .unwrap();
    listed.results.into_iter().next().unwrap()
}

/// Yields to the spawned task until `done` holds for its listed state.
async fn wait_until(
    bus: &Bus,
    source_arn: &str,
    done: impl Fn(&MessageMoveTaskResult) -> bool,
) -> MessageMoveTaskResult {
    for _ in 0..1000 {
        let state = task_state(bus, source_arn).await;
        if done(&state) {
            return state;
        }
        tokio::task::yield_now().await;
    }
    panic!("move task never reached the expected state");
}

/// A dead-letter queue and the queue that redrives into it.
async fn redrive_pair(bus: &Arc<Bus>, max_receive_count: u32) -> (String, String) {
    create_queue(bus, "orders-dlq", &[]).await;
    let dlq_arn = queue(bus, "orders-dlq").arn().to_string();
    let policy = format!(
        r#"{{"deadLetterTargetArn":"{dlq_arn}","maxReceiveCount":{max_receive_count}}}"#
    );
    create_queue(
        bus,
        "orders",
        &[("RedrivePolicy", policy.as_str()), ("VisibilityTimeout", "1")],
    )
    .await;
    let source_arn = queue(bus, "orders").arn().to_string();
    (dlq_arn, source_arn)
}

async fn send(bus: &Bus, url: &str, body: &str) {
    bus.send_message(SendMessageRequest {
        queue_url: url.into(),
        message_body: body.into(),
        ..Default::default()
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn cancelled_task_stops_after_current_batch() {
    let (bus, clock) = bus();
    let (dlq_arn, orders_arn) = redrive_pair(&bus, 3).await;
    let dlq_url = bus.queue_url("orders-dlq");
    for body in ["one", "two", "three"] {
        send(&bus, &dlq_url, body).await;
    }

    let started = bus
        .start_message_move_task(StartMessageMoveTaskRequest {
            source_arn: dlq_arn.clone(),
            destination_arn: Some(orders_arn),
            max_number_of_messages_per_second: Some(1),
        })
        .await
        .unwrap();

    let running = wait_until(&bus, &dlq_arn, |t| t.approximate_number_of_messages_moved == 1).await;
    assert_eq!(running.status, "RUNNING");
    assert_eq!(running.task_handle, started.task_handle);
    assert_eq!(running.approximate_number_of_messages_to_move, 3);

    let second = bus
        .start_message_move_task(StartMessageMoveTaskRequest {
            source_arn: dlq_arn.clone(),
            destination_arn: None,
            max_number_of_messages_per_second: None,
        })
        .await;
    assert_eq!(second.unwrap_err().kind(), ErrorKind::Conflict);

    let cancelled = bus
        .cancel_message_move_task(CancelMessageMoveTaskRequest {
            task_handle: started.task_handle.clone(),
        })
        .await
        .unwrap();
    assert_eq!(cancelled.approximate_number_of_messages_moved, 1);
    assert_eq!(task_state(&bus, &dlq_arn).await.status, "CANCELLING");

    clock.advance(Duration::from_secs(1));
    let finished = wait_until(&bus, &dlq_arn, |t| t.status == "CANCELLED").await;
    assert_eq!(finished.approximate_number_of_messages_moved, 1);

    assert_eq!(queue(&bus, "orders").counts(), (1, 0, 0));
    assert_eq!(queue(&bus, "orders-dlq").counts(), (2, 0, 0));

    let again = bus
        .cancel_message_move_task(CancelMessageMoveTaskRequest {
            task_handle: started.task_handle,
        })
        .await;
    assert_eq!(again.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn task_without_destination_returns_messages_to_their_source() {
    let (bus, clock) = bus();
    let (dlq_arn, _) = redrive_pair(&bus, 1).await;
    let orders_url = bus.queue_url("orders");
    send(&bus, &orders_url, "poison").await;

    let received = bus
        .receive_message(ReceiveMessageRequest {
            queue_url: orders_url.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(received.messages.len(), 1);
    clock.advance(Duration::from_secs(2));
    assert_eq!(bus.sweep_expired().dead_lettered, 1);
    assert_eq!(queue(&bus, "orders-dlq").counts(), (1, 0, 0));

    bus.start_message_move_task(StartMessageMoveTaskRequest {
        source_arn: dlq_arn.clone(),
        destination_arn: None,
        max_number_of_messages_per_second: None,
    })
    .await
    .unwrap();

    wait_until(&bus, &dlq_arn, |t| t.approximate_number_of_messages_moved == 1).await;
    clock.advance(Duration::from_secs(1));
    let done = wait_until(&bus, &dlq_arn, |t| t.status == "COMPLETED").await;
    assert_eq!(done.approximate_number_of_messages_moved, 1);

    assert_eq!(queue(&bus, "orders").counts(), (1, 0, 0));
    assert_eq!(queue(&bus, "orders-dlq").counts(), (0, 0, 0));
}

#[tokio::test]
async fn only_dead_letter_queues_can_be_drained() {
    let (bus, _clock) = bus();
    let (_, orders_arn) = redrive_pair(&bus, 3).await;
    let err = bus
        .start_message_move_task(StartMessageMoveTaskRequest {
            source_arn: orders_arn,
            destination_arn: None,
            max_number_of_messages_per_second: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}

#[tokio::test]
async fn message_without_origin_fails_the_task_and_stays_put() {
    let (bus, _clock) = bus();
    let (dlq_arn, _) = redrive_pair(&bus, 3).await;
    // Sent straight to the dead-letter queue, so it has no queue to return to.
    send(&bus, &bus.queue_url("orders-dlq"), "stray").await;

    bus.start_message_move_task(StartMessageMoveTaskRequest {
        source_arn: dlq_arn.clone(),
        destination_arn: None,
        max_number_of_messages_per_second: None,
    })
    .await
    .unwrap();

    let failed = wait_until(&bus, &dlq_arn, |t| t.status == "FAILED").await;
    assert_eq!(failed.approximate_number_of_messages_moved, 0);
    assert!(failed
        .failure_reason
        .as_deref()
        .is_some_and(|reason| reason.contains("no source queue")));

    assert_eq!(queue(&bus, "orders-dlq").counts(), (1, 0, 0));
    assert_eq!(queue(&bus, "orders").counts(), (0, 0, 0));
}
