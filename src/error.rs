use crate::document::DocumentStatus;

/// Problems with a submission or decision request that the caller can fix.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Acting user is not authenticated")]
    Unauthenticated,
    #[error("Title must not be empty")]
    EmptyTitle,
    #[error("Document type is not set")]
    MissingDocumentType,
    #[error("At least one approver is required")]
    NoApprovers,
    #[error("Approver at position {0} has an empty user id")]
    EmptyApproverId(usize),
    #[error("Referrer at position {0} has an empty user id")]
    EmptyReferrerId(usize),
    #[error("User id {0:?} contains a NUL character")]
    InvalidUserId(String),
    #[error("Approver {0} appears more than once in the chain")]
    DuplicateApprover(String),
    #[error("Approval chain of {len} exceeds the limit of {max}")]
    TooManyApprovers { len: usize, max: usize },
    #[error("A comment is required when rejecting")]
    MissingRejectComment,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("failed to decode record: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("id {0:?} cannot be used as a key")]
    InvalidKey(String),
    #[error("failed to mint id: {0}")]
    Identity(String),
    #[error("{0}")]
    Unavailable(String),
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for StoreError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        StoreError::Encode(value.to_string())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Document {0} not found")]
    NotFound(String),
    #[error("Notification {0} not found")]
    NotificationNotFound(u64),
    #[error("Document {document_id} has already been processed ({status})")]
    AlreadyProcessed {
        document_id: String,
        status: DocumentStatus,
    },
    #[error("User {user_id} may not act on document {document_id}")]
    NotAuthorized {
        document_id: String,
        user_id: String,
    },
    #[error("Approval chain out of sync: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Coarse bucket a caller maps onto its own response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Input,
    NotFound,
    Conflict,
    Forbidden,
    Server,
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Validation(_) => ErrorCategory::Input,
            EngineError::NotFound(_) | EngineError::NotificationNotFound(_) => {
                ErrorCategory::NotFound
            }
            EngineError::AlreadyProcessed { .. } => ErrorCategory::Conflict,
            EngineError::NotAuthorized { .. } => ErrorCategory::Forbidden,
            EngineError::InvalidState(_) | EngineError::Store(_) => ErrorCategory::Server,
        }
    }

    /// Message safe to show an end user. Internal failures stay generic.
    pub fn user_message(&self) -> String {
        match self.category() {
            ErrorCategory::Input => self.to_string(),
            ErrorCategory::NotFound => "The requested item does not exist.".into(),
            ErrorCategory::Conflict => "This document has already been handled.".into(),
            ErrorCategory::Forbidden => "You do not have permission to act on this document.".into(),
            ErrorCategory::Server => "Something went wrong, please try again later.".into(),
        }
    }
}
