use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::{BusError, ErrorKind};

/// Actions whose missing resource is a move task or its source, reported as
/// `ResourceNotFoundException` rather than `QueueDoesNotExist`.
const MOVE_TASK_ACTIONS: &[&str] = &[
    "StartMessageMoveTask",
    "CancelMessageMoveTask",
    "ListMessageMoveTasks",
];

/// A bus error rendered in the SQS JSON protocol.
#[derive(Debug, Clone)]
pub struct SqsError {
    pub error: BusError,
    /// The failed action, when known.
    pub action: Option<&'static str>,
}

impl SqsError {
    pub fn during(action: &'static str, error: BusError) -> Self {
        SqsError {
            error,
            action: Some(action),
        }
    }

    pub fn code(&self) -> &'static str {
        match (self.error.kind(), self.action) {
            (ErrorKind::NotFound, Some(action)) if MOVE_TASK_ACTIONS.contains(&action) => {
                "ResourceNotFoundException"
            }
            (kind, _) => error_code(kind),
        }
    }
}

impl From<BusError> for SqsError {
    fn from(error: BusError) -> Self {
        SqsError {
            error,
            action: None,
        }
    }
}

/// AWS error code for an engine error kind, as used in `__type` and in batch
/// result entries.
pub fn error_code(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "QueueDoesNotExist",
        ErrorKind::AlreadyExists => "QueueAlreadyExists",
        ErrorKind::InvalidParameter | ErrorKind::Conflict => "InvalidParameterValue",
        ErrorKind::MessageTooLarge => "InvalidParameterValue",
        ErrorKind::BatchRequestTooLong => "BatchRequestTooLong",
        ErrorKind::InvalidReceiptHandle => "ReceiptHandleIsInvalid",
        ErrorKind::MessageNotInflight => "MessageNotInflight",
        ErrorKind::Unsupported => "UnsupportedOperation",
        ErrorKind::PurgeInProgress => "PurgeQueueInProgress",
        ErrorKind::OverLimit => "OverLimit",
        ErrorKind::EmptyBatchRequest => "EmptyBatchRequest",
        ErrorKind::TooManyEntriesInBatchRequest => "TooManyEntriesInBatchRequest",
        ErrorKind::BatchEntryIdsNotDistinct => "BatchEntryIdsNotDistinct",
        ErrorKind::InvalidBatchEntryId => "InvalidBatchEntryId",
        ErrorKind::InvalidAction => "InvalidAction",
    }
}

fn status_code(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::AlreadyExists | ErrorKind::PurgeInProgress => StatusCode::CONFLICT,
        ErrorKind::OverLimit => StatusCode::FORBIDDEN,
        _ => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for SqsError {
    fn into_response(self) -> Response {
        let body = json!({
            "__type": format!("com.amazonaws.sqs#{}", self.code()),
            "message": self.error.message(),
        });
        (status_code(self.error.kind()), axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_sqs_codes() {
        assert_eq!(error_code(ErrorKind::NotFound), "QueueDoesNotExist");
        assert_eq!(error_code(ErrorKind::InvalidReceiptHandle), "ReceiptHandleIsInvalid");
        let resp = SqsError::from(BusError::new(ErrorKind::PurgeInProgress, "wait")).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn missing_move_task_is_not_a_missing_queue() {
        let missing = BusError::not_found("Task t-1 does not exist.");
        assert_eq!(
            SqsError::during("CancelMessageMoveTask", missing.clone()).code(),
            "ResourceNotFoundException"
        );
        assert_eq!(SqsError::during("GetQueueUrl", missing.clone()).code(), "QueueDoesNotExist");
        assert_eq!(SqsError::from(missing).code(), "QueueDoesNotExist");
    }
}
