use crate::encoding::u64_quantity;
use crate::error::{UserOperationError, UserOperationErrorRecord};
use crate::network::NetworkClient;
use crate::types::{
    TransactionParams, TransactionType, UserFeeLevel, UserOperationMetadata, UserOperationStatus,
};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

const SELECTOR_TRANSFER: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
const SELECTOR_APPROVE: [u8; 4] = [0x09, 0x5e, 0xa7, 0xb3];
const SELECTOR_TRANSFER_FROM: [u8; 4] = [0x23, 0xb8, 0x72, 0xdd];

/// Classifies a call by its target and 4-byte selector.
pub async fn classify_transaction(
    network: &dyn NetworkClient,
    to: Option<Address>,
    data: Option<&Bytes>,
) -> Result<TransactionType, UserOperationError> {
    let Some(to) = to else {
        return Ok(TransactionType::DeployContract);
    };

    let code = network
        .get_code(to)
        .await
        .map_err(UserOperationError::provider)?;
    if code.is_empty() {
        return Ok(TransactionType::SimpleSend);
    }

    Ok(data.map_or(TransactionType::ContractInteraction, |d| {
        classify_selector(d)
    }))
}

fn classify_selector(data: &[u8]) -> TransactionType {
    match data.get(..4) {
        Some(s) if s == SELECTOR_TRANSFER => TransactionType::TokenMethodTransfer,
        Some(s) if s == SELECTOR_APPROVE => TransactionType::TokenMethodApprove,
        Some(s) if s == SELECTOR_TRANSFER_FROM => TransactionType::TokenMethodTransferFrom,
        _ => TransactionType::ContractInteraction,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionStatus {
    Unapproved,
    Approved,
    Signed,
    Submitted,
    Confirmed,
    Failed,
}

impl From<UserOperationStatus> for TransactionStatus {
    fn from(status: UserOperationStatus) -> Self {
        match status {
            UserOperationStatus::Unapproved => Self::Unapproved,
            UserOperationStatus::Approved => Self::Approved,
            UserOperationStatus::Signed => Self::Signed,
            UserOperationStatus::Submitted => Self::Submitted,
            UserOperationStatus::Confirmed => Self::Confirmed,
            UserOperationStatus::Failed => Self::Failed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub gas_used: U256,
    pub effective_gas_price: U256,
}

/// A user operation as seen by transaction-oriented consumers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMeta {
    pub id: String,
    #[serde(with = "u64_quantity")]
    pub chain_id: u64,
    pub origin: String,
    pub status: TransactionStatus,
    pub time: u64,
    pub tx_params: TransactionParams,
    pub hash: Option<H256>,
    #[serde(rename = "type")]
    pub transaction_type: Option<TransactionType>,
    pub user_fee_level: Option<UserFeeLevel>,
    pub error: Option<UserOperationErrorRecord>,
    pub is_user_operation: bool,
    pub base_fee_per_gas: Option<U256>,
    pub tx_receipt: Option<TransactionReceipt>,
}

impl From<&UserOperationMetadata> for TransactionMeta {
    fn from(metadata: &UserOperationMetadata) -> Self {
        let op = &metadata.user_operation;
        let original = metadata.transaction_params.clone().unwrap_or_default();

        // Sponsored operations cost the sender nothing.
        let (max_fee_per_gas, max_priority_fee_per_gas) = if op.uses_paymaster() {
            (U256::zero(), U256::zero())
        } else {
            (op.max_fee_per_gas, op.max_priority_fee_per_gas)
        };

        let tx_params = TransactionParams {
            from: op.sender,
            gas: Some(op.total_gas_limit()),
            gas_price: None,
            max_fee_per_gas: Some(max_fee_per_gas),
            max_priority_fee_per_gas: Some(max_priority_fee_per_gas),
            ..original
        };

        let tx_receipt = match (metadata.actual_gas_cost, metadata.actual_gas_used) {
            (Some(cost), Some(used)) if !used.is_zero() => Some(TransactionReceipt {
                gas_used: used,
                effective_gas_price: cost / used,
            }),
            _ => None,
        };

        Self {
            id: metadata.id.clone(),
            chain_id: metadata.chain_id,
            origin: metadata.origin.clone(),
            status: metadata.status.into(),
            time: metadata.time,
            tx_params,
            hash: metadata.transaction_hash,
            transaction_type: metadata.transaction_type,
            user_fee_level: metadata.user_fee_level,
            error: metadata.error.clone(),
            is_user_operation: true,
            base_fee_per_gas: metadata.base_fee_per_gas,
            tx_receipt,
        }
    }
}
