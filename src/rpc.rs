use anyhow::{anyhow, Context, Result};
use serde_json::Value;

/// A JSON-RPC `error` object returned by a bundler or paymaster.
#[derive(Debug, Clone, thiserror::Error)]
#[error("RPC error {code}: {message}")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl JsonRpcError {
    fn from_value(v: &Value) -> Self {
        Self {
            code: v.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: v
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| v.to_string()),
            data: v.get("data").cloned(),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut v = serde_json::json!({
            "code": self.code,
            "message": self.message,
        });
        if let (Some(data), Some(obj)) = (self.data.as_ref(), v.as_object_mut()) {
            obj.insert("data".to_string(), data.clone());
        }
        v
    }
}

/// Minimal JSON-RPC 2.0 client over HTTP POST.
#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    url: String,
    http: reqwest::Client,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        tracing::debug!(url = %self.url, method, "sending JSON-RPC request");

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to decode JSON")?;

        if let Some(err) = body.get("error") {
            return Err(JsonRpcError::from_value(err).into());
        }

        if !status.is_success() {
            return Err(anyhow!("HTTP {}: {}", status, body));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| anyhow!("missing result field"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        matchers::{body_partial_json, method},
        Mock, MockServer, ResponseTemplate,
    };

    #[tokio::test]
    async fn request_returns_result_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_chainId" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": "0x1" })),
            )
            .mount(&server)
            .await;

        let client = JsonRpcClient::new(server.uri());
        let res = client.request("eth_chainId", json!([])).await.unwrap();
        assert_eq!(res, json!("0x1"));
    }

    #[tokio::test]
    async fn request_surfaces_rpc_error_object() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": -32500, "message": "AA21 didn't pay prefund" }
            })))
            .mount(&server)
            .await;

        let client = JsonRpcClient::new(server.uri());
        let err = client
            .request("eth_sendUserOperation", json!([]))
            .await
            .unwrap_err();
        let rpc = err.downcast_ref::<JsonRpcError>().unwrap();
        assert_eq!(rpc.code, -32500);
        assert_eq!(rpc.message, "AA21 didn't pay prefund");
        assert_eq!(rpc.to_value()["code"], -32500);
    }
}
