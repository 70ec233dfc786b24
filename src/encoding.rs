use crate::types::UserOperation;
use anyhow::{anyhow, bail, Context, Result};
use ethers::types::{H256, U256};
use serde_json::Value;

/// `0x`-prefixed lowercase hex of any byte string (addresses, hashes, calldata).
pub fn to_hex(bytes: impl AsRef<[u8]>) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// JSON-RPC quantity: minimal hex digits, `0x0` for zero.
pub fn quantity(v: impl Into<U256>) -> String {
    let v = v.into();
    match v.is_zero() {
        true => "0x0".to_string(),
        false => format!("0x{v:x}"),
    }
}

/// Wire form of a v0.6 operation as bundlers and paymasters expect it.
pub fn user_op_to_json(op: &UserOperation) -> Result<Value> {
    serde_json::to_value(op).context("failed to encode user operation")
}

pub fn parse_u256_quantity(s: &str) -> Result<U256> {
    match s.trim_start_matches("0x") {
        "" => Ok(U256::zero()),
        digits => U256::from_str_radix(digits, 16).with_context(|| format!("invalid quantity {s}")),
    }
}

/// Bundlers disagree on whether gas values are hex quantities or JSON numbers.
pub fn parse_u256_value(v: &Value) -> Result<U256> {
    match v {
        Value::String(s) => parse_u256_quantity(s),
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| anyhow!("expected unsigned integer, got {n}")),
        other => Err(anyhow!("expected quantity, got {other}")),
    }
}

pub fn parse_h256(s: &str) -> Result<H256> {
    let bytes = hex::decode(s.trim_start_matches("0x")).context("invalid hash hex")?;
    if bytes.len() != 32 {
        bail!("expected 32-byte hash, got {} bytes", bytes.len());
    }
    Ok(H256::from_slice(&bytes))
}

/// Serde helpers for `u64` values carried as JSON-RPC quantities (`"0xaa36a7"`).
pub mod u64_quantity {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{value:x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| D::Error::custom(format!("invalid chain id {n}"))),
            Value::String(s) => match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16).map_err(D::Error::custom),
                None => s.parse::<u64>().map_err(D::Error::custom),
            },
            other => Err(D::Error::custom(format!("invalid chain id {other}"))),
        }
    }
}

/// Lenient `Option<U256>` deserializer accepting hex strings, numbers or null.
pub mod lenient_u256 {
    use serde::{de::Error, Deserialize, Deserializer};
    use serde_json::Value;

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<ethers::types::U256>, D::Error> {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(v) => super::parse_u256_value(&v)
                .map(Some)
                .map_err(|e| D::Error::custom(format!("{e:#}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quantity_formatting_matches_json_rpc() {
        assert_eq!(quantity(0u64), "0x0");
        assert_eq!(quantity(255u64), "0xff");
        assert_eq!(parse_u256_quantity("0x").unwrap(), U256::zero());
        assert_eq!(parse_u256_quantity("0x5208").unwrap(), U256::from(21_000u64));
    }

    #[test]
    fn parse_u256_value_accepts_numbers_and_hex() {
        assert_eq!(parse_u256_value(&json!(21000)).unwrap(), U256::from(21_000u64));
        assert_eq!(parse_u256_value(&json!("0x5208")).unwrap(), U256::from(21_000u64));
        assert!(parse_u256_value(&json!(true)).is_err());
    }

    #[test]
    fn parse_h256_rejects_short_input() {
        assert!(parse_h256("0x1234").is_err());
    }

    #[test]
    fn user_op_json_uses_camel_case_quantities() {
        let op = UserOperation {
            nonce: U256::from(7u64),
            ..Default::default()
        };
        let v = user_op_to_json(&op).unwrap();
        assert_eq!(v["nonce"], "0x7");
        assert_eq!(v["callGasLimit"], "0x0");
        assert_eq!(v["initCode"], "0x");
        assert_eq!(
            v["sender"],
            "0x0000000000000000000000000000000000000000"
        );
    }
}
