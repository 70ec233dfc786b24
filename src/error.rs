use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, sync::Arc};

/// EIP-1193 `userRejectedRequest`.
pub const USER_REJECTED_REQUEST_CODE: i64 = 4001;

/// JSON-RPC `invalidParams`.
pub const INVALID_PARAMS_CODE: i64 = -32602;

/// The three call sites of a smart contract account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountHook {
    Prepare,
    Update,
    Sign,
}

impl fmt::Display for AccountHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Prepare => "prepareUserOperation",
            Self::Update => "updateUserOperation",
            Self::Sign => "signUserOperation",
        })
    }
}

/// Errors surfaced by the controller and stored on failed operations.
///
/// Collaborator failures keep their `anyhow` chain behind an `Arc` so the
/// error can be cloned to every caller awaiting the same operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UserOperationError {
    #[error("invalid user operation request: {0}")]
    InvalidRequest(String),

    #[error("unknown network client id: {0}")]
    UnknownNetwork(String),

    #[error("invalid {hook} response from smart contract account: {reason}")]
    InvalidAccountResponse { hook: AccountHook, reason: String },

    #[error("smart contract account {hook} failed: {error:#}")]
    Account {
        hook: AccountHook,
        error: Arc<anyhow::Error>,
    },

    #[error("provider request failed: {0:#}")]
    Provider(Arc<anyhow::Error>),

    #[error("bundler request failed: {error:#}")]
    Bundler {
        error: Arc<anyhow::Error>,
        rpc: Option<Value>,
    },

    #[error("approval request failed: {message}")]
    Approval { code: Option<i64>, message: String },

    #[error("{0}")]
    Rejected(String),

    #[error("approval result callback failed: {0:#}")]
    CallbackFailed(Arc<anyhow::Error>),

    #[error("{}", .0.message)]
    Failed(UserOperationErrorRecord),
}

impl UserOperationError {
    pub fn account(hook: AccountHook, error: anyhow::Error) -> Self {
        Self::Account {
            hook,
            error: Arc::new(error),
        }
    }

    pub fn provider(error: anyhow::Error) -> Self {
        Self::Provider(Arc::new(error))
    }

    /// Wraps a bundler failure, keeping the JSON-RPC error object if the
    /// bundler returned one.
    pub fn bundler(error: anyhow::Error) -> Self {
        let rpc = error
            .downcast_ref::<crate::rpc::JsonRpcError>()
            .map(|e| e.to_value());
        Self::Bundler {
            error: Arc::new(error),
            rpc,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::UnknownNetwork(_) => "UnknownNetwork",
            Self::InvalidAccountResponse { .. } => "InvalidAccountResponse",
            Self::Account { .. } => "AccountError",
            Self::Provider(_) => "ProviderError",
            Self::Bundler { .. } => "BundlerError",
            Self::Approval { .. } => "ApprovalError",
            Self::Rejected(_) => "UserRejectedRequest",
            Self::CallbackFailed(_) => "CallbackFailed",
            Self::Failed(record) => &record.name,
        }
    }

    pub fn code(&self) -> Option<i64> {
        match self {
            Self::InvalidRequest(_) | Self::UnknownNetwork(_) => Some(INVALID_PARAMS_CODE),
            Self::Rejected(_) => Some(USER_REJECTED_REQUEST_CODE),
            Self::Approval { code, .. } => *code,
            Self::Bundler { rpc, .. } => rpc
                .as_ref()
                .and_then(|v| v.get("code"))
                .and_then(Value::as_i64),
            Self::Failed(record) => record.code,
            _ => None,
        }
    }

    pub fn is_user_rejection(&self) -> bool {
        self.code() == Some(USER_REJECTED_REQUEST_CODE)
    }

    fn stack(&self) -> Option<String> {
        match self {
            Self::Account { error, .. }
            | Self::Provider(error)
            | Self::Bundler { error, .. }
            | Self::CallbackFailed(error) => Some(format!("{error:?}")),
            Self::Failed(record) => record.stack.clone(),
            _ => None,
        }
    }

    fn rpc(&self) -> Option<Value> {
        match self {
            Self::Bundler { rpc, .. } => rpc.clone(),
            Self::Failed(record) => record.rpc.clone(),
            _ => None,
        }
    }
}

/// Serializable failure stored on a metadata record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationErrorRecord {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub rpc: Option<Value>,
}

impl UserOperationErrorRecord {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            code: None,
            rpc: None,
        }
    }
}

impl From<&UserOperationError> for UserOperationErrorRecord {
    fn from(error: &UserOperationError) -> Self {
        if let UserOperationError::Failed(record) = error {
            return record.clone();
        }
        Self {
            name: error.name().to_string(),
            message: error.to_string(),
            stack: error.stack(),
            code: error.code(),
            rpc: error.rpc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn record_captures_name_message_and_code() {
        let err = UserOperationError::InvalidRequest("missing from".into());
        let record = UserOperationErrorRecord::from(&err);
        assert_eq!(record.name, "InvalidRequest");
        assert_eq!(record.message, "invalid user operation request: missing from");
        assert_eq!(record.code, Some(INVALID_PARAMS_CODE));
        assert!(record.stack.is_none());
    }

    #[test]
    fn record_keeps_anyhow_chain_as_stack() {
        let err = UserOperationError::provider(
            anyhow!("connection refused").context("eth_getCode failed"),
        );
        let record = UserOperationErrorRecord::from(&err);
        assert_eq!(record.name, "ProviderError");
        assert_eq!(
            record.message,
            "provider request failed: eth_getCode failed: connection refused"
        );
        assert!(record.stack.unwrap().contains("connection refused"));
    }

    #[test]
    fn failed_error_round_trips_its_record() {
        let mut original = UserOperationErrorRecord::new("UserOperationFailed", "reverted");
        original.code = Some(-32500);
        let err = UserOperationError::Failed(original.clone());
        assert_eq!(err.to_string(), "reverted");
        assert_eq!(UserOperationErrorRecord::from(&err), original);
    }

    #[test]
    fn rejection_is_detected_by_code() {
        let rejected = UserOperationError::Rejected("User rejected the request.".into());
        assert!(rejected.is_user_rejection());
        assert!(!UserOperationError::Approval {
            code: Some(-32603),
            message: "internal".into()
        }
        .is_user_rejection());
    }
}
