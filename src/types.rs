use crate::encoding::{lenient_u256, u64_quantity};
use crate::error::UserOperationErrorRecord;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// Note: EntryPoint v0.7 uses a *different* packed struct layout.
///
/// `Default` is the empty operation a new record starts with: zero sender,
/// zero quantities and empty byte strings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// Returns a tuple matching the Solidity struct layout, suitable for
    /// calling `EntryPoint.getUserOpHash((...))`.
    #[allow(clippy::type_complexity)]
    pub fn as_abi_tuple(
        &self,
    ) -> (
        Address,
        U256,
        Bytes,
        Bytes,
        U256,
        U256,
        U256,
        U256,
        U256,
        Bytes,
        Bytes,
    ) {
        (
            self.sender,
            self.nonce,
            self.init_code.clone(),
            self.call_data.clone(),
            self.call_gas_limit,
            self.verification_gas_limit,
            self.pre_verification_gas,
            self.max_fee_per_gas,
            self.max_priority_fee_per_gas,
            self.paymaster_and_data.clone(),
            self.signature.clone(),
        )
    }

    pub fn uses_paymaster(&self) -> bool {
        !self.paymaster_and_data.is_empty()
    }

    pub fn total_gas_limit(&self) -> U256 {
        self.call_gas_limit
            .saturating_add(self.verification_gas_limit)
            .saturating_add(self.pre_verification_gas)
    }
}

/// Lifecycle of a user operation. Variants are declared in lifecycle order,
/// so the derived `Ord` is the forward direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UserOperationStatus {
    Unapproved,
    Approved,
    Signed,
    Submitted,
    Confirmed,
    Failed,
}

impl UserOperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }

    /// Whether a record may move from `self` to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || next > self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionType {
    SimpleSend,
    ContractInteraction,
    DeployContract,
    TokenMethodTransfer,
    TokenMethodTransferFrom,
    TokenMethodApprove,
    Swap,
    SwapApproval,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UserFeeLevel {
    Medium,
    DappSuggested,
    Custom,
}

/// Plain transaction shape a user operation can be created from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionParams {
    pub from: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<U256>,
}

/// Request for a user operation that does not model a plain transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddUserOperationRequest {
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub data: Option<Bytes>,
    #[serde(default)]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub max_priority_fee_per_gas: Option<U256>,
}

impl From<&TransactionParams> for AddUserOperationRequest {
    fn from(tx: &TransactionParams) -> Self {
        // Legacy gas price stands in for both EIP-1559 fields.
        let (max_fee_per_gas, max_priority_fee_per_gas) = match tx.gas_price {
            Some(price) => (Some(price), Some(price)),
            None => (tx.max_fee_per_gas, tx.max_priority_fee_per_gas),
        };
        Self {
            from: tx.from,
            to: tx.to,
            value: tx.value,
            data: tx.data.clone().filter(|d| !d.is_empty()),
            max_fee_per_gas,
            max_priority_fee_per_gas,
        }
    }
}

/// Provenance for operations created by the swaps flow.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapsMetadata {
    #[serde(default)]
    pub approval_tx_id: Option<String>,
    #[serde(default)]
    pub destination_token_address: Option<String>,
    #[serde(default)]
    pub destination_token_amount: Option<String>,
    #[serde(default)]
    pub destination_token_decimals: Option<u32>,
    #[serde(default)]
    pub destination_token_symbol: Option<String>,
    #[serde(default)]
    pub source_token_address: Option<String>,
    #[serde(default)]
    pub source_token_amount: Option<String>,
    #[serde(default)]
    pub source_token_decimals: Option<u32>,
    #[serde(default)]
    pub source_token_symbol: Option<String>,
    #[serde(default)]
    pub swap_meta_data: Option<serde_json::Value>,
    #[serde(default)]
    pub swap_token_value: Option<String>,
}

/// The canonical record of one user operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationMetadata {
    pub id: String,
    pub status: UserOperationStatus,
    #[serde(with = "u64_quantity")]
    pub chain_id: u64,
    pub origin: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub time: u64,
    #[serde(default)]
    pub transaction_params: Option<TransactionParams>,
    #[serde(default)]
    pub transaction_type: Option<TransactionType>,
    pub user_operation: UserOperation,
    #[serde(default)]
    pub hash: Option<H256>,
    #[serde(default)]
    pub transaction_hash: Option<H256>,
    #[serde(default)]
    pub error: Option<UserOperationErrorRecord>,
    #[serde(default)]
    pub bundler_url: Option<String>,
    #[serde(default)]
    pub swaps_metadata: Option<SwapsMetadata>,
    #[serde(default)]
    pub user_fee_level: Option<UserFeeLevel>,
    #[serde(default, deserialize_with = "lenient_u256::deserialize")]
    pub actual_gas_cost: Option<U256>,
    #[serde(default, deserialize_with = "lenient_u256::deserialize")]
    pub actual_gas_used: Option<U256>,
    #[serde(default, deserialize_with = "lenient_u256::deserialize")]
    pub base_fee_per_gas: Option<U256>,
}

/// Persisted controller state: `{ "userOperations": { id: metadata } }`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationControllerState {
    #[serde(default)]
    pub user_operations: BTreeMap<String, UserOperationMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_only_moves_forward() {
        use UserOperationStatus::*;
        assert!(Unapproved.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Signed));
        assert!(Signed.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Confirmed));
        assert!(Unapproved.can_transition_to(Failed));
        assert!(Submitted.can_transition_to(Failed));

        assert!(!Signed.can_transition_to(Approved));
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Submitted));
        assert!(Confirmed.can_transition_to(Confirmed));
    }

    #[test]
    fn transaction_params_map_gas_price_to_both_fee_fields() {
        let tx = TransactionParams {
            from: Address::repeat_byte(0x11),
            to: Some(Address::repeat_byte(0x22)),
            data: Some(Bytes::new()),
            gas_price: Some(U256::from(5u64)),
            ..Default::default()
        };
        let request = AddUserOperationRequest::from(&tx);
        assert_eq!(request.max_fee_per_gas, Some(U256::from(5u64)));
        assert_eq!(request.max_priority_fee_per_gas, Some(U256::from(5u64)));
        assert_eq!(request.data, None);
    }

    #[test]
    fn metadata_round_trips_persisted_shape() {
        let raw = json!({
            "id": "user-op-1",
            "status": "confirmed",
            "chainId": "0xaa36a7",
            "origin": "https://app.uniswap.org",
            "time": 1738710499635u64,
            "transactionParams": null,
            "userOperation": {
                "sender": "0x0dcd1bf9a1b36ce34237eeafef220932846bcd82",
                "nonce": "0x0",
                "initCode": "0x",
                "callData": "0x",
                "callGasLimit": "0x5208",
                "verificationGasLimit": "0x5208",
                "preVerificationGas": "0x5208",
                "maxFeePerGas": "0x4a817c800",
                "maxPriorityFeePerGas": "0x4a817c800",
                "paymasterAndData": "0x",
                "signature": "0x"
            },
            "hash": "0xabcd1234abcd1234abcd1234abcd1234abcd1234abcd1234abcd1234abcd1234",
            "transactionHash": null,
            "error": null,
            "bundlerUrl": "https://bundler.example.com",
            "swapsMetadata": null,
            "userFeeLevel": "medium",
            "actualGasCost": "0x1234",
            "actualGasUsed": 22136,
            "baseFeePerGas": null
        });

        let metadata: UserOperationMetadata = serde_json::from_value(raw).unwrap();
        assert_eq!(metadata.chain_id, 11_155_111);
        assert_eq!(metadata.status, UserOperationStatus::Confirmed);
        assert_eq!(metadata.actual_gas_used, Some(U256::from(0x5678u64)));
        assert_eq!(metadata.user_operation.call_gas_limit, U256::from(21_000u64));

        let encoded = serde_json::to_value(&metadata).unwrap();
        assert_eq!(encoded["chainId"], "0xaa36a7");
        assert_eq!(encoded["userFeeLevel"], "medium");
        let decoded: UserOperationMetadata = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, metadata);
    }
}
