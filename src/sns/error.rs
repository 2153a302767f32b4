use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quick_xml::escape::escape;
use uuid::Uuid;

use crate::error::{BusError, ErrorKind};

/// A bus error rendered as an SNS query-protocol `ErrorResponse`.
#[derive(Debug, Clone)]
pub struct SnsError(pub BusError);

impl From<BusError> for SnsError {
    fn from(err: BusError) -> Self {
        SnsError(err)
    }
}

pub fn error_code(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "NotFound",
        ErrorKind::AlreadyExists
        | ErrorKind::InvalidParameter
        | ErrorKind::MessageTooLarge
        | ErrorKind::InvalidReceiptHandle
        | ErrorKind::MessageNotInflight
        | ErrorKind::Conflict
        | ErrorKind::Unsupported
        | ErrorKind::PurgeInProgress => "InvalidParameter",
        ErrorKind::BatchRequestTooLong => "BatchRequestTooLong",
        ErrorKind::OverLimit => "TagLimitExceeded",
        ErrorKind::EmptyBatchRequest => "EmptyBatchRequest",
        ErrorKind::TooManyEntriesInBatchRequest => "TooManyEntriesInBatchRequest",
        ErrorKind::BatchEntryIdsNotDistinct => "BatchEntryIdsNotDistinct",
        ErrorKind::InvalidBatchEntryId => "InvalidBatchEntryId",
        ErrorKind::InvalidAction => "InvalidAction",
    }
}

fn status_code(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for SnsError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let body = format!(
            r#"<ErrorResponse xmlns="http://sns.amazonaws.com/doc/2010-03-31/">
  <Error>
    <Type>Sender</Type>
    <Code>{}</Code>
    <Message>{}</Message>
  </Error>
  <RequestId>{}</RequestId>
</ErrorResponse>"#,
            error_code(kind),
            escape(self.0.message()),
            Uuid::new_v4(),
        );
        (status_code(kind), [("content-type", "text/xml")], body).into_response()
    }
}
