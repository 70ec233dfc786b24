use crate::error::{UserOperationError, USER_REJECTED_REQUEST_CODE};
use crate::types::TransactionParams;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

pub const APPROVAL_TYPE_TRANSACTION: &str = "transaction";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub origin: String,
    #[serde(rename = "type")]
    pub approval_type: String,
    pub request_data: ApprovalRequestData,
    pub expects_result: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequestData {
    pub tx_id: String,
}

impl ApprovalRequest {
    /// A transaction approval keyed by the user operation id.
    pub fn transaction(id: &str, origin: &str) -> Self {
        Self {
            id: id.to_string(),
            origin: origin.to_string(),
            approval_type: APPROVAL_TYPE_TRANSACTION.to_string(),
            request_data: ApprovalRequestData {
                tx_id: id.to_string(),
            },
            expects_result: true,
        }
    }
}

/// Notified once the operation either reaches the bundler or fails, so the
/// approval UI can release its pending state.
pub trait ApprovalResultCallbacks: Send + Sync {
    fn success(&self) -> anyhow::Result<()>;
    fn error(&self, error: &UserOperationError);
}

/// The transaction as edited by the user in the approval prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditedTransaction {
    pub tx_params: TransactionParams,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalValue {
    #[serde(default)]
    pub tx_meta: Option<EditedTransaction>,
}

#[derive(Clone, Default)]
pub struct ApprovalResult {
    pub result_callbacks: Option<Arc<dyn ApprovalResultCallbacks>>,
    pub value: Option<ApprovalValue>,
}

impl fmt::Debug for ApprovalResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalResult")
            .field("result_callbacks", &self.result_callbacks.is_some())
            .field("value", &self.value)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ApprovalError {
    pub code: Option<i64>,
    pub message: String,
}

impl ApprovalError {
    pub fn rejected() -> Self {
        Self {
            code: Some(USER_REJECTED_REQUEST_CODE),
            message: "User rejected the request.".to_string(),
        }
    }
}

impl From<ApprovalError> for UserOperationError {
    fn from(err: ApprovalError) -> Self {
        if err.code == Some(USER_REJECTED_REQUEST_CODE) {
            Self::Rejected(err.message)
        } else {
            Self::Approval {
                code: err.code,
                message: err.message,
            }
        }
    }
}

/// Capability broker that surfaces approval prompts to a human.
#[async_trait]
pub trait ApprovalBroker: Send + Sync {
    async fn add_request(&self, request: ApprovalRequest) -> Result<ApprovalResult, ApprovalError>;
}

/// Approves everything without edits. For headless hosts that gate
/// operations elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalBroker for AutoApprove {
    async fn add_request(&self, request: ApprovalRequest) -> Result<ApprovalResult, ApprovalError> {
        tracing::debug!(id = %request.id, "auto-approving user operation");
        Ok(ApprovalResult::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_request_is_keyed_by_operation_id() {
        let req = ApprovalRequest::transaction("op-1", "https://dapp.example");
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["type"], "transaction");
        assert_eq!(v["requestData"]["txId"], "op-1");
        assert_eq!(v["expectsResult"], true);
    }

    #[test]
    fn rejection_code_maps_to_rejected_error() {
        let err: UserOperationError = ApprovalError::rejected().into();
        assert!(matches!(err, UserOperationError::Rejected(_)));

        let err: UserOperationError = ApprovalError {
            code: Some(-32603),
            message: "prompt closed".into(),
        }
        .into();
        assert!(matches!(err, UserOperationError::Approval { .. }));
    }
}
