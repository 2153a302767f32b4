use std::fmt;

/// Stable, machine-readable failure category produced by the engine.
///
/// The wire adapters map each kind to a status code and an AWS error code;
/// the kind itself never changes meaning between versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidParameter,
    MessageTooLarge,
    BatchRequestTooLong,
    InvalidReceiptHandle,
    MessageNotInflight,
    Conflict,
    Unsupported,
    PurgeInProgress,
    OverLimit,
    EmptyBatchRequest,
    TooManyEntriesInBatchRequest,
    BatchEntryIdsNotDistinct,
    InvalidBatchEntryId,
    InvalidAction,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::InvalidParameter => "InvalidParameter",
            ErrorKind::MessageTooLarge => "MessageTooLarge",
            ErrorKind::BatchRequestTooLong => "BatchRequestTooLong",
            ErrorKind::InvalidReceiptHandle => "InvalidReceiptHandle",
            ErrorKind::MessageNotInflight => "MessageNotInflight",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::PurgeInProgress => "PurgeInProgress",
            ErrorKind::OverLimit => "OverLimit",
            ErrorKind::EmptyBatchRequest => "EmptyBatchRequest",
            ErrorKind::TooManyEntriesInBatchRequest => "TooManyEntriesInBatchRequest",
            ErrorKind::BatchEntryIdsNotDistinct => "BatchEntryIdsNotDistinct",
            ErrorKind::InvalidBatchEntryId => "InvalidBatchEntryId",
            ErrorKind::InvalidAction => "InvalidAction",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct BusError {
    kind: ErrorKind,
    message: String,
}

impl BusError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        BusError {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameter, message)
    }

    pub fn message_too_large(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MessageTooLarge, message)
    }

    pub fn batch_too_long(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BatchRequestTooLong, message)
    }

    pub fn invalid_receipt_handle(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidReceiptHandle, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn over_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OverLimit, message)
    }

    pub(crate) fn queue_does_not_exist() -> Self {
        Self::not_found("The specified queue does not exist.")
    }

    pub(crate) fn topic_does_not_exist() -> Self {
        Self::not_found("Topic does not exist")
    }
}

pub type BusResult<T> = Result<T, BusError>;

/// Shared batch-shape validation: 1..=10 entries, distinct ids made of
/// alphanumerics, hyphens and underscores (at most 80 characters).
pub fn validate_batch_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> BusResult<()> {
    let ids: Vec<&str> = ids.into_iter().collect();
    if ids.is_empty() {
        return Err(BusError::new(
            ErrorKind::EmptyBatchRequest,
            "Batch request must contain at least one entry",
        ));
    }
    if ids.len() > 10 {
        return Err(BusError::new(
            ErrorKind::TooManyEntriesInBatchRequest,
            "Batch request must contain at most 10 entries",
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for id in ids {
        let valid = !id.is_empty()
            && id.len() <= 80
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(BusError::new(
                ErrorKind::InvalidBatchEntryId,
                format!("Invalid batch entry Id: {id}"),
            ));
        }
        if !seen.insert(id) {
            return Err(BusError::new(
                ErrorKind::BatchEntryIdsNotDistinct,
                format!("Batch entry Id {id} is repeated"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_ids_are_checked_in_order() {
        let none: [&str; 0] = [];
        assert_eq!(
            validate_batch_ids(none).unwrap_err().kind(),
            ErrorKind::EmptyBatchRequest
        );
        assert_eq!(
            validate_batch_ids(["a", "a"]).unwrap_err().kind(),
            ErrorKind::BatchEntryIdsNotDistinct
        );
        assert_eq!(
            validate_batch_ids(["ok", "not ok"]).unwrap_err().kind(),
            ErrorKind::InvalidBatchEntryId
        );
        let eleven: Vec<String> = (0..11).map(|i| format!("m{i}")).collect();
        assert_eq!(
            validate_batch_ids(eleven.iter().map(String::as_str))
                .unwrap_err()
                .kind(),
            ErrorKind::TooManyEntriesInBatchRequest
        );
        assert!(validate_batch_ids(["a-1", "b_2"]).is_ok());
    }

    #[test]
    fn display_carries_kind_and_message() {
        let err = BusError::not_found("nope");
        assert_eq!(err.to_string(), "NotFound: nope");
        assert_eq!(err.kind().as_str(), "NotFound");
    }
}
