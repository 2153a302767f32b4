use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;

use crate::bus::Bus;
use crate::error::{BusError, ErrorKind};
use crate::observer::Service;

use super::error::SqsError;
use super::types::*;

const ACTIONS: &[&str] = &[
    "CreateQueue",
    "DeleteQueue",
    "GetQueueUrl",
    "ListQueues",
    "GetQueueAttributes",
    "SetQueueAttributes",
    "PurgeQueue",
    "SendMessage",
    "SendMessageBatch",
    "ReceiveMessage",
    "DeleteMessage",
    "DeleteMessageBatch",
    "ChangeMessageVisibility",
    "ChangeMessageVisibilityBatch",
    "TagQueue",
    "UntagQueue",
    "ListQueueTags",
    "AddPermission",
    "RemovePermission",
    "ListDeadLetterSourceQueues",
    "StartMessageMoveTask",
    "CancelMessageMoveTask",
    "ListMessageMoveTasks",
];

macro_rules! dispatch {
    ($bus:expr, $action:expr, $body:expr, $req_type:ty, $method:ident) => {{
        let resource = resource_of(&$bus, &$body);
        let result = match serde_json::from_value::<$req_type>($body) {
            Ok(req) => $bus.$method(req).await,
            Err(e) => Err(BusError::invalid_parameter(e.to_string())),
        };
        $bus.record(Service::Sqs, $action, resource, result.is_ok());
        Ok(Json(result.map_err(|e| SqsError::during($action, e))?).into_response())
    }};
}

macro_rules! dispatch_empty {
    ($bus:expr, $action:expr, $body:expr, $req_type:ty, $method:ident) => {{
        let resource = resource_of(&$bus, &$body);
        let result = match serde_json::from_value::<$req_type>($body) {
            Ok(req) => $bus.$method(req).await,
            Err(e) => Err(BusError::invalid_parameter(e.to_string())),
        };
        $bus.record(Service::Sqs, $action, resource, result.is_ok());
        result.map_err(|e| SqsError::during($action, e))?;
        Ok(Json(serde_json::json!({})).into_response())
    }};
}

/// The ARN an operation acts on, as far as the request names one.
fn resource_of(bus: &Bus, body: &Value) -> Option<String> {
    let field = |name: &str| body.get(name).and_then(Value::as_str);
    if let Some(url) = field("QueueUrl") {
        return bus.queue_arn_for_url(url);
    }
    if let Some(name) = field("QueueName") {
        return Some(bus.queue_arn(name));
    }
    if let Some(arn) = field("SourceArn") {
        return Some(arn.to_string());
    }
    field("TaskHandle")
        .and_then(|h| bus.move_tasks.get(h).map(|t| t.source_arn().to_string()))
}

async fn handle_request(
    State(bus): State<Arc<Bus>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, SqsError> {
    let target = headers
        .get("x-amz-target")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| BusError::new(ErrorKind::InvalidAction, "Missing X-Amz-Target header"))?;

    let action = target
        .strip_prefix("AmazonSQS.")
        .and_then(|name| ACTIONS.iter().copied().find(|a| *a == name))
        .ok_or_else(|| {
            BusError::new(ErrorKind::InvalidAction, format!("Unknown action: {target}"))
        })?;

    let body: Value = if body.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(&body).map_err(|e| BusError::invalid_parameter(e.to_string()))?
    };

    match action {
        "CreateQueue" => dispatch!(bus, action, body, CreateQueueRequest, create_queue),
        "DeleteQueue" => dispatch_empty!(bus, action, body, DeleteQueueRequest, delete_queue),
        "GetQueueUrl" => dispatch!(bus, action, body, GetQueueUrlRequest, get_queue_url),
        "ListQueues" => dispatch!(bus, action, body, ListQueuesRequest, list_queues),
        "GetQueueAttributes" => {
            dispatch!(bus, action, body, GetQueueAttributesRequest, get_queue_attributes)
        }
        "SetQueueAttributes" => {
            dispatch_empty!(bus, action, body, SetQueueAttributesRequest, set_queue_attributes)
        }
        "PurgeQueue" => dispatch_empty!(bus, action, body, PurgeQueueRequest, purge_queue),
        "SendMessage" => dispatch!(bus, action, body, SendMessageRequest, send_message),
        "SendMessageBatch" => {
            dispatch!(bus, action, body, SendMessageBatchRequest, send_message_batch)
        }
        "ReceiveMessage" => {
            dispatch!(bus, action, body, ReceiveMessageRequest, receive_message)
        }
        "DeleteMessage" => {
            dispatch_empty!(bus, action, body, DeleteMessageRequest, delete_message)
        }
        "DeleteMessageBatch" => {
            dispatch!(bus, action, body, DeleteMessageBatchRequest, delete_message_batch)
        }
        "ChangeMessageVisibility" => {
            dispatch_empty!(
                bus,
                action,
                body,
                ChangeMessageVisibilityRequest,
                change_message_visibility
            )
        }
        "ChangeMessageVisibilityBatch" => {
            dispatch!(
                bus,
                action,
                body,
                ChangeMessageVisibilityBatchRequest,
                change_message_visibility_batch
            )
        }
        "TagQueue" => dispatch_empty!(bus, action, body, TagQueueRequest, tag_queue),
        "UntagQueue" => dispatch_empty!(bus, action, body, UntagQueueRequest, untag_queue),
        "ListQueueTags" => dispatch!(bus, action, body, ListQueueTagsRequest, list_queue_tags),
        "AddPermission" => {
            dispatch_empty!(bus, action, body, AddPermissionRequest, add_permission)
        }
        "RemovePermission" => {
            dispatch_empty!(bus, action, body, RemovePermissionRequest, remove_permission)
        }
        "ListDeadLetterSourceQueues" => {
            dispatch!(
                bus,
                action,
                body,
                ListDeadLetterSourceQueuesRequest,
                list_dead_letter_source_queues
            )
        }
        "StartMessageMoveTask" => {
            dispatch!(
                bus,
                action,
                body,
                StartMessageMoveTaskRequest,
                start_message_move_task
            )
        }
        "CancelMessageMoveTask" => {
            dispatch!(
                bus,
                action,
                body,
                CancelMessageMoveTaskRequest,
                cancel_message_move_task
            )
        }
        "ListMessageMoveTasks" => {
            dispatch!(
                bus,
                action,
                body,
                ListMessageMoveTasksRequest,
                list_message_move_tasks
            )
        }
        _ => Err(BusError::new(ErrorKind::InvalidAction, format!("Unknown action: {action}")).into()),
    }
}

// --- administrative endpoints ---
//
// Each one runs the same bus operation a client call would.

async fn snapshot(State(bus): State<Arc<Bus>>) -> Response {
    Json(bus.snapshot()).into_response()
}

async fn admin_delete_message(
    State(bus): State<Arc<Bus>>,
    Json(req): Json<DeleteMessageRequest>,
) -> Result<Response, SqsError> {
    bus.delete_message(req).await?;
    Ok(Json(serde_json::json!({})).into_response())
}

async fn admin_start_redrive(
    State(bus): State<Arc<Bus>>,
    Json(req): Json<StartMessageMoveTaskRequest>,
) -> Result<Response, SqsError> {
    let started = bus
        .start_message_move_task(req)
        .await
        .map_err(|e| SqsError::during("StartMessageMoveTask", e))?;
    Ok(Json(started).into_response())
}

async fn admin_cancel_redrive(
    State(bus): State<Arc<Bus>>,
    Json(req): Json<CancelMessageMoveTaskRequest>,
) -> Result<Response, SqsError> {
    let cancelled = bus
        .cancel_message_move_task(req)
        .await
        .map_err(|e| SqsError::during("CancelMessageMoveTask", e))?;
    Ok(Json(cancelled).into_response())
}

async fn admin_publish(
    State(bus): State<Arc<Bus>>,
    Json(req): Json<crate::sns::types::PublishRequest>,
) -> Result<Response, SqsError> {
    Ok(Json(bus.publish(req).await?).into_response())
}

pub fn create_router(bus: Arc<Bus>) -> Router {
    Router::new()
        .route("/", post(handle_request))
        .route("/_admin/snapshot", get(snapshot))
        .route("/_admin/delete-message", post(admin_delete_message))
        .route("/_admin/redrive", post(admin_start_redrive))
        .route("/_admin/redrive/cancel", post(admin_cancel_redrive))
        .route("/_admin/publish", post(admin_publish))
        .with_state(bus)
}
