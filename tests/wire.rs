use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use aws_messaging_local::observer::RecentOperations;
use aws_messaging_local::{sns, sqs, Bus, BusConfig, ManualClock};

fn observed_bus() -> Arc<Bus> {
    let clock = ManualClock::default();
    Arc::new(
        Bus::new(BusConfig::default(), Arc::new(clock))
            .with_observer(Arc::new(RecentOperations::new(50))),
    )
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn sqs_call(app: &Router, action: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::post("/")
        .header("content-type", "application/x-amz-json-1.0")
        .header("x-amz-target", format!("AmazonSQS.{action}"))
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let text = body_text(resp).await;
    let value = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap()
    };
    (status, value)
}

async fn sns_call(app: &Router, form: &str) -> (StatusCode, String) {
    let req = Request::post("/")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(form.to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, body_text(resp).await)
}

#[tokio::test]
async fn sqs_json_round_trip() {
    let bus = observed_bus();
    let app = sqs::server::create_router(bus.clone());

    let (status, created) = sqs_call(&app, "CreateQueue", json!({"QueueName": "inbox"})).await;
    assert_eq!(status, StatusCode::OK);
    let url = created["QueueUrl"].as_str().unwrap().to_string();
    assert!(url.ends_with("/inbox"));

    let (status, sent) = sqs_call(
        &app,
        "SendMessage",
        json!({"QueueUrl": url, "MessageBody": "hello"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sent["MD5OfMessageBody"], "5d41402abc4b2a76b9719d911017c592");

    let (status, received) = sqs_call(
        &app,
        "ReceiveMessage",
        json!({"QueueUrl": url, "MaxNumberOfMessages": 10}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let messages = received["Messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["Body"], "hello");
    assert_eq!(messages[0]["MessageId"], sent["MessageId"]);
}

#[tokio::test]
async fn sqs_errors_carry_aws_type() {
    let app = sqs::server::create_router(observed_bus());

    let (status, err) = sqs_call(
        &app,
        "GetQueueUrl",
        json!({"QueueName": "missing"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["__type"], "com.amazonaws.sqs#QueueDoesNotExist");

    let (status, err) = sqs_call(
        &app,
        "CancelMessageMoveTask",
        json!({"TaskHandle": "no-such-task"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["__type"], "com.amazonaws.sqs#ResourceNotFoundException");

    let (status, err) = sqs_call(&app, "Frobnicate", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["__type"], "com.amazonaws.sqs#InvalidAction");
}

#[tokio::test]
async fn snapshot_reports_resources_and_recent_operations() {
    let bus = observed_bus();
    let app = sqs::server::create_router(bus.clone());
    sqs_call(&app, "CreateQueue", json!({"QueueName": "audit"})).await;
    sqs_call(&app, "GetQueueUrl", json!({"QueueName": "nope"})).await;

    let resp = app
        .clone()
        .oneshot(Request::get("/_admin/snapshot").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let snapshot: Value = serde_json::from_str(&body_text(resp).await).unwrap();

    assert_eq!(snapshot["queues"][0]["name"], "audit");
    let ops = snapshot["recentOperations"].as_array().unwrap();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0]["action"], "CreateQueue");
    assert_eq!(ops[0]["success"], true);
    assert_eq!(ops[1]["action"], "GetQueueUrl");
    assert_eq!(ops[1]["success"], false);
}

#[tokio::test]
async fn sns_query_protocol() {
    let bus = observed_bus();
    let app = sns::server::create_router(bus.clone());

    let (status, xml) = sns_call(&app, "Action=CreateTopic&Name=news").await;
    assert_eq!(status, StatusCode::OK);
    let arn = bus.topic_arn("news");
    assert!(xml.contains("<CreateTopicResponse"));
    assert!(xml.contains(&format!("<TopicArn>{arn}</TopicArn>")));

    let (status, xml) = sns_call(&app, "Action=ListTopics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(xml.contains(&arn));

    let missing = "Action=GetTopicAttributes&TopicArn=arn%3Aaws%3Asns%3Aus-east-1%3A000000000000%3Anone";
    let (status, xml) = sns_call(&app, missing).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(xml.contains("<Code>NotFound</Code>"));

    let (status, xml) = sns_call(&app, "Action=Frobnicate").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(xml.contains("<Code>InvalidAction</Code>"));
}
