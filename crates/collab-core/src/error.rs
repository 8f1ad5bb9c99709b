//! Action boundary errors and results.
//!
//! User-facing actions never propagate errors across a session boundary: they
//! catch them and report an `ActionResult`, so a failed background write
//! cannot end an editing session.

use crate::document::DocumentError;
use crate::store::StoreError;
use crate::transport::TransportError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// What went wrong in an action, as seen by the caller.
#[derive(Debug, Error, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "camelCase")]
pub enum ActionError {
    /// No authenticated user. Blocks access; never retried.
    #[error("Authentication required")]
    AuthenticationRequired,

    /// A note, grant or reminder is missing. Shown as an empty state.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The store failed. Logged; the next natural trigger retries.
    #[error("Store failure: {0}")]
    TransientStoreFailure(String),

    /// Relay unreachable. Local edits continue.
    #[error("Relay disconnected: {0}")]
    TransportDisconnected(String),

    /// Stored content could not be read into the block model.
    #[error("Malformed content: {0}")]
    MalformedContent(String),

    /// The request itself was rejected.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<StoreError> for ActionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => ActionError::NotFound(key),
            StoreError::Invalid(msg) => ActionError::MalformedContent(msg),
            other => ActionError::TransientStoreFailure(other.to_string()),
        }
    }
}

impl From<DocumentError> for ActionError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::BlockNotFound(id) => ActionError::NotFound(format!("block {id}")),
            DocumentError::OutOfRange { .. } | DocumentError::InvalidBlock(_) => {
                ActionError::InvalidInput(e.to_string())
            }
            other => ActionError::MalformedContent(other.to_string()),
        }
    }
}

impl From<TransportError> for ActionError {
    fn from(e: TransportError) -> Self {
        ActionError::TransportDisconnected(e.to_string())
    }
}

/// `{ success, data, error }` result value returned by every action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
}

impl<T> ActionResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: ActionError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<T, ActionError> {
        match (self.data, self.error) {
            (Some(data), None) if self.success => Ok(data),
            (_, Some(error)) => Err(error),
            _ => Err(ActionError::TransientStoreFailure("empty result".into())),
        }
    }
}

impl<T> From<Result<T, ActionError>> for ActionResult<T> {
    fn from(result: Result<T, ActionError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => {
                error!("Action failed: {}", e);
                Self::failed(e)
            }
        }
    }
}

/// The authenticated user on whose behalf an action runs.
///
/// Claims retrieval belongs to the auth provider; actions only need the email
/// used as the user id.
#[derive(Debug, Clone, PartialEq)]
pub struct Caller {
    user_id: Option<String>,
}

impl Caller {
    pub fn authenticated(email: impl Into<String>) -> Self {
        Self {
            user_id: Some(email.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    /// User id, or `AuthenticationRequired`.
    pub fn require(&self) -> Result<&str, ActionError> {
        self.user_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(ActionError::AuthenticationRequired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_json_shape() {
        let ok: ActionResult<String> = Ok("n1".to_string()).into();
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], "n1");
        assert!(json.get("error").is_none());

        let failed: ActionResult<String> = Err(ActionError::NotFound("notes/n1".into())).into();
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["kind"], "notFound");
        assert_eq!(json["error"]["message"], "notes/n1");
    }

    #[test]
    fn test_store_error_mapping() {
        assert_eq!(
            ActionError::from(StoreError::Unavailable("down".into())),
            ActionError::TransientStoreFailure("Store unavailable: down".into())
        );
        assert!(matches!(
            ActionError::from(StoreError::NotFound("x".into())),
            ActionError::NotFound(_)
        ));
    }

    #[test]
    fn test_caller() {
        assert_eq!(Caller::authenticated("a@x").require(), Ok("a@x"));
        assert_eq!(Caller::anonymous().require(), Err(ActionError::AuthenticationRequired));
        assert_eq!(Caller::authenticated("").require(), Err(ActionError::AuthenticationRequired));
    }

    #[test]
    fn test_into_result() {
        assert_eq!(ActionResult::ok(3).into_result(), Ok(3));
        let failed: ActionResult<i32> = ActionResult::failed(ActionError::AuthenticationRequired);
        assert_eq!(failed.into_result(), Err(ActionError::AuthenticationRequired));
    }
}
