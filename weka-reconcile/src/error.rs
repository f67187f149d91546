//! Reconciliation error types.

use thiserror::Error;

use crate::policy::EntityKind;
use crate::state::{DeclaredState, Resource};

/// Errors that can occur while reconciling an entity against the Weka API.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Missing or invalid bootstrap inputs. No remote call was attempted.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Login rejected or an unexpected token type was returned.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The response carried a structured error envelope, whatever its status.
    #[error("Error from Weka API: {message}")]
    RemoteRejected { status: u16, message: String },

    /// Non-200 status without a structured error envelope.
    #[error(
        "Non-200 status from Weka API: {status}{}",
        .message.as_ref().map(|m| format!(", message: {m}")).unwrap_or_default()
    )]
    RemoteHttp { status: u16, message: Option<String> },

    /// A success body that does not decode into the expected record.
    #[error("unexpected payload from Weka API ({context}): {detail}")]
    UnexpectedPayload { context: String, detail: String },

    /// The entity is absent on the remote side.
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },

    /// A CreateOnly or ForceReplace field was changed through Update.
    #[error("cannot update field {field} of {kind} in place")]
    ImmutableFieldChanged { kind: EntityKind, field: String },

    /// The remote entity is in a shape this engine does not manage.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// A declared value failed boundary validation.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Connection, timeout or body read failure.
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ReconcileError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unexpected(context: impl Into<String>, detail: impl ToString) -> Self {
        Self::UnexpectedPayload {
            context: context.into(),
            detail: detail.to_string(),
        }
    }

    /// Whether a direct lookup failure means the entity does not exist.
    ///
    /// The API reports missing entities either as a 404 or as a message
    /// mentioning "not found", sometimes with a 200 status.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::RemoteRejected { status, message } => {
                *status == 404 || mentions_not_found(message)
            }
            Self::RemoteHttp { status, message } => {
                *status == 404 || message.as_deref().is_some_and(mentions_not_found)
            }
            _ => false,
        }
    }
}

fn mentions_not_found(message: &str) -> bool {
    message.to_ascii_lowercase().contains("not found")
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Failure of an Update, carrying whatever was committed before it.
///
/// `actual` is the instance as the remote side now holds it: the previous
/// state plus the fields of every sub-call that succeeded. It is `None` when
/// a replacement deleted the old entity but failed to create the new one.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct UpdateFailure {
    #[source]
    pub error: ReconcileError,
    pub actual: Option<Resource>,
}

impl UpdateFailure {
    pub fn untouched(error: ReconcileError, id: &str, previous: &DeclaredState) -> Self {
        Self {
            error,
            actual: Some(Resource::new(id, previous.clone())),
        }
    }
}
