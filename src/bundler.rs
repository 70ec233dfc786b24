use crate::encoding::{self, lenient_u256, parse_h256, parse_u256_value};
use crate::rpc::JsonRpcClient;
use crate::types::UserOperation;
use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, H256, U256};
use serde::Deserialize;
use serde_json::Value;

/// ERC-4337 bundler JSON-RPC client.
#[derive(Debug, Clone)]
pub struct BundlerClient {
    rpc: JsonRpcClient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasEstimates {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

/// Result of `eth_getUserOperationReceipt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
    pub success: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, deserialize_with = "lenient_u256::deserialize")]
    pub actual_gas_cost: Option<U256>,
    #[serde(default, deserialize_with = "lenient_u256::deserialize")]
    pub actual_gas_used: Option<U256>,
    pub receipt: TransactionReceiptSummary,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceiptSummary {
    pub transaction_hash: H256,
    #[serde(default)]
    pub block_hash: Option<H256>,
}

impl BundlerClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            rpc: JsonRpcClient::new(url),
        }
    }

    pub fn url(&self) -> &str {
        self.rpc.url()
    }

    pub async fn estimate_user_operation_gas(
        &self,
        user_op: &UserOperation,
        entrypoint: Address,
    ) -> Result<GasEstimates> {
        let params = op_params(user_op, entrypoint)?;
        let res = self
            .rpc
            .request("eth_estimateUserOperationGas", params)
            .await
            .context("eth_estimateUserOperationGas failed")?;

        Ok(GasEstimates {
            call_gas_limit: parse_u256_field(&res, "callGasLimit")?,
            verification_gas_limit: parse_u256_field(&res, "verificationGasLimit")?,
            pre_verification_gas: parse_u256_field(&res, "preVerificationGas")?,
        })
    }

    pub async fn send_user_operation(
        &self,
        user_op: &UserOperation,
        entrypoint: Address,
    ) -> Result<H256> {
        let params = op_params(user_op, entrypoint)?;
        let res = self
            .rpc
            .request("eth_sendUserOperation", params)
            .await
            .context("eth_sendUserOperation failed")?;
        parse_userop_hash(&res)
    }

    /// Returns `None` while the operation has not been included yet.
    pub async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationReceipt>> {
        let params = serde_json::json!([encoding::to_hex(user_op_hash)]);
        let res = self
            .rpc
            .request("eth_getUserOperationReceipt", params)
            .await
            .context("eth_getUserOperationReceipt failed")?;
        if res.is_null() {
            return Ok(None);
        }
        let receipt = serde_json::from_value(res).context("malformed user operation receipt")?;
        Ok(Some(receipt))
    }
}

fn op_params(user_op: &UserOperation, entrypoint: Address) -> Result<Value> {
    Ok(serde_json::json!([
        encoding::user_op_to_json(user_op)?,
        encoding::to_hex(entrypoint)
    ]))
}

fn parse_u256_field(v: &Value, key: &str) -> Result<U256> {
    let field = v
        .get(key)
        .ok_or_else(|| anyhow!("missing or invalid field {key}"))?;
    parse_u256_value(field).with_context(|| format!("invalid field {key}"))
}

fn parse_userop_hash(res: &Value) -> Result<H256> {
    // Most bundlers return the userOpHash directly as a JSON string; some wrap it.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(anyhow!(
            "unexpected eth_sendUserOperation result shape (expected string or {{result: ...}}): {}",
            res
        ));
    };

    parse_h256(hash_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        matchers::{body_partial_json, method},
        Mock, MockServer, ResponseTemplate,
    };

    const HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    #[test]
    fn parse_userop_hash_accepts_known_shapes() {
        let expected = parse_h256(HASH).unwrap();
        for res in [
            json!(HASH),
            json!({ "result": HASH }),
            json!({ "userOpHash": HASH }),
            json!({ "userOperationHash": HASH }),
        ] {
            assert_eq!(parse_userop_hash(&res).unwrap(), expected);
        }
    }

    #[test]
    fn parse_userop_hash_rejects_unknown_shape() {
        let res = json!({ "foo": "bar" });
        assert!(parse_userop_hash(&res).is_err());
    }

    #[tokio::test]
    async fn estimate_accepts_hex_and_numeric_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_estimateUserOperationGas" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {
                    "callGasLimit": "0x5208",
                    "verificationGasLimit": 100000,
                    "preVerificationGas": "0xc350"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let bundler = BundlerClient::new(server.uri());
        let est = bundler
            .estimate_user_operation_gas(&UserOperation::default(), Address::zero())
            .await
            .unwrap();
        assert_eq!(
            est,
            GasEstimates {
                call_gas_limit: U256::from(21_000u64),
                verification_gas_limit: U256::from(100_000u64),
                pre_verification_gas: U256::from(50_000u64),
            }
        );
    }

    #[tokio::test]
    async fn receipt_is_none_until_included() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": null })),
            )
            .mount(&server)
            .await;

        let bundler = BundlerClient::new(server.uri());
        let receipt = bundler
            .get_user_operation_receipt(parse_h256(HASH).unwrap())
            .await
            .unwrap();
        assert!(receipt.is_none());
    }

    #[tokio::test]
    async fn receipt_parses_gas_cost_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {
                    "userOpHash": HASH,
                    "success": true,
                    "actualGasCost": "0x1234",
                    "actualGasUsed": "0x5678",
                    "receipt": {
                        "transactionHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
                        "blockHash": "0x3333333333333333333333333333333333333333333333333333333333333333"
                    }
                }
            })))
            .mount(&server)
            .await;

        let bundler = BundlerClient::new(server.uri());
        let receipt = bundler
            .get_user_operation_receipt(parse_h256(HASH).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.actual_gas_cost, Some(U256::from(0x1234u64)));
        assert_eq!(receipt.actual_gas_used, Some(U256::from(0x5678u64)));
        assert!(receipt.receipt.block_hash.is_some());
    }
}
