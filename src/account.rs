//! The pluggable smart contract account seam.
//!
//! The controller never builds account-specific payloads itself: sender,
//! nonce, call data, paymaster data and signature all come from an
//! implementation of [`SmartContractAccount`]. Responses are checked by
//! [`crate::validation`] before they are merged into a record.

use crate::encoding::u64_quantity;
use crate::types::UserOperation;
use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareUserOperationRequest {
    #[serde(with = "u64_quantity")]
    pub chain_id: u64,
    pub data: Option<Bytes>,
    pub from: Address,
    pub to: Option<Address>,
    pub value: Option<U256>,
}

/// Gas limits an account may supply itself, skipping bundler estimation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationGasLimits {
    pub call_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub verification_gas_limit: U256,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareUserOperationResponse {
    /// Bundler endpoint the operation will be submitted to.
    pub bundler: String,
    pub call_data: Bytes,
    #[serde(default)]
    pub dummy_paymaster_and_data: Option<Bytes>,
    #[serde(default)]
    pub dummy_signature: Option<Bytes>,
    #[serde(default)]
    pub gas: Option<UserOperationGasLimits>,
    #[serde(default)]
    pub init_code: Option<Bytes>,
    pub nonce: U256,
    pub sender: Address,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserOperationRequest {
    pub user_operation: UserOperation,
    #[serde(with = "u64_quantity")]
    pub chain_id: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserOperationResponse {
    /// `None` (or empty) for self-sponsored operations.
    #[serde(default)]
    pub paymaster_and_data: Option<Bytes>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUserOperationRequest {
    pub user_operation: UserOperation,
    #[serde(with = "u64_quantity")]
    pub chain_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUserOperationResponse {
    pub signature: Bytes,
}

#[async_trait]
pub trait SmartContractAccount: Send + Sync {
    async fn prepare_user_operation(
        &self,
        request: PrepareUserOperationRequest,
    ) -> anyhow::Result<PrepareUserOperationResponse>;

    async fn update_user_operation(
        &self,
        request: UpdateUserOperationRequest,
    ) -> anyhow::Result<UpdateUserOperationResponse>;

    async fn sign_user_operation(
        &self,
        request: SignUserOperationRequest,
    ) -> anyhow::Result<SignUserOperationResponse>;
}

/// Picks the account for one request: the per-request override when given,
/// otherwise the controller default. Resolved before the pipeline starts.
pub fn resolve_account(
    requested: Option<&Arc<dyn SmartContractAccount>>,
    default: &Arc<dyn SmartContractAccount>,
) -> Arc<dyn SmartContractAccount> {
    requested.cloned().unwrap_or_else(|| Arc::clone(default))
}
