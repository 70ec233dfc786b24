use crate::config::PaymasterConfig;
use crate::encoding;
use crate::rpc::JsonRpcClient;
use crate::types::UserOperation;
use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, Bytes};
use serde_json::Value;

/// Minimal ERC-7677 paymaster web service client.
///
/// Implements `pm_getPaymasterStubData` (used while estimating gas) and
/// `pm_getPaymasterData` (the final sponsorship), so any ERC-7677 provider works.
#[derive(Debug, Clone)]
pub struct PaymasterClient {
    rpc: JsonRpcClient,
    policy_id: String,
    webhook_data: Option<String>,
}

impl PaymasterClient {
    pub fn new(config: &PaymasterConfig) -> Self {
        Self {
            rpc: JsonRpcClient::new(config.url.clone()),
            policy_id: config.policy_id.clone(),
            webhook_data: config.webhook_data.clone(),
        }
    }

    pub async fn get_paymaster_stub_data(
        &self,
        user_op: &UserOperation,
        entrypoint: Address,
        chain_id: u64,
    ) -> Result<Bytes> {
        let res = self
            .rpc
            .request(
                "pm_getPaymasterStubData",
                self.params(user_op, entrypoint, chain_id)?,
            )
            .await
            .context("pm_getPaymasterStubData RPC failed")?;
        parse_v06_paymaster_and_data(&res)
    }

    pub async fn get_paymaster_data(
        &self,
        user_op: &UserOperation,
        entrypoint: Address,
        chain_id: u64,
    ) -> Result<Bytes> {
        let res = self
            .rpc
            .request(
                "pm_getPaymasterData",
                self.params(user_op, entrypoint, chain_id)?,
            )
            .await
            .context("pm_getPaymasterData RPC failed")?;
        parse_v06_paymaster_and_data(&res)
    }

    fn params(&self, user_op: &UserOperation, entrypoint: Address, chain_id: u64) -> Result<Value> {
        let mut ctx = serde_json::json!({ "policyId": self.policy_id });
        if let (Some(wd), Some(obj)) = (self.webhook_data.as_ref(), ctx.as_object_mut()) {
            // context is free-form; Alchemy Gas Manager expects `webhookData`.
            obj.insert("webhookData".to_string(), Value::String(wd.clone()));
        }

        Ok(serde_json::json!([
            encoding::user_op_to_json(user_op)?,
            encoding::to_hex(entrypoint),
            encoding::quantity(chain_id),
            ctx
        ]))
    }
}

fn parse_v06_paymaster_and_data(result: &Value) -> Result<Bytes> {
    // ERC-7677 returns v0.6 data at the top level: { "paymasterAndData": "0x..." }
    // Alchemy wraps it per entry point version: { "entrypointV06Response": { ... } }
    let field = match result.get("paymasterAndData") {
        Some(v) => v,
        None => result
            .get("entrypointV06Response")
            .or_else(|| result.get("entryPointV06Response"))
            .and_then(|v06| v06.get("paymasterAndData"))
            .ok_or_else(|| {
                anyhow!(
                    "missing paymasterAndData (expected top-level paymasterAndData or entrypointV06Response.paymasterAndData)"
                )
            })?,
    };

    let s = field
        .as_str()
        .ok_or_else(|| anyhow!("paymasterAndData is not a string"))?;
    let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))
        .context("invalid hex in paymasterAndData")?;
    Ok(Bytes::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        matchers::{body_partial_json, method},
        Mock, MockServer, ResponseTemplate,
    };

    const PM_DATA: &str = "0xdeadbeef";

    fn expected_bytes() -> Bytes {
        Bytes::from(vec![0xde, 0xad, 0xbe, 0xef])
    }

    #[test]
    fn parse_paymaster_and_data_top_level() {
        let res = json!({ "paymasterAndData": PM_DATA });
        assert_eq!(parse_v06_paymaster_and_data(&res).unwrap(), expected_bytes());
    }

    #[test]
    fn parse_paymaster_and_data_nested_v06_responses() {
        for key in ["entrypointV06Response", "entryPointV06Response"] {
            let res = json!({ key: { "paymasterAndData": PM_DATA } });
            assert_eq!(parse_v06_paymaster_and_data(&res).unwrap(), expected_bytes());
        }
    }

    #[test]
    fn parse_paymaster_and_data_ignores_v07_only_response() {
        let res = json!({ "entrypointV07Response": { "paymasterAndData": PM_DATA } });
        assert!(parse_v06_paymaster_and_data(&res).is_err());
    }

    #[tokio::test]
    async fn paymaster_request_carries_policy_context() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "pm_getPaymasterData",
                "params": [{}, "0x5ff137d4b0fdcd49dca30c7cf57e578a026d2789", "0x14a34", {
                    "policyId": "policy-1",
                    "webhookData": "hook"
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": { "paymasterAndData": PM_DATA }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = PaymasterClient::new(&PaymasterConfig {
            url: server.uri(),
            policy_id: "policy-1".into(),
            webhook_data: Some("hook".into()),
        });
        let entrypoint: Address = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789".parse().unwrap();
        let data = client
            .get_paymaster_data(&UserOperation::default(), entrypoint, 84_532)
            .await
            .unwrap();
        assert_eq!(data, expected_bytes());
    }
}
