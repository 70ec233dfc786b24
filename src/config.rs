use crate::controller::DEFAULT_ENTRYPOINT;
use anyhow::{anyhow, bail, Context, Result};
use ethers::types::{Address, U256};
use serde::Deserialize;
use std::{collections::HashSet, env, fs, path::Path, path::PathBuf, time::Duration};

const DEFAULT_STATE_FILE: &str = "userop-state.json";
const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRaw {
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default)]
    pub poll_interval_seconds: Option<u64>,
    pub networks: Vec<NetworkRaw>,
    pub account: AccountRaw,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRaw {
    pub id: String,
    pub rpc: String,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    #[serde(default)]
    pub chain_id: Option<u64>,
    pub bundler: String,
    #[serde(default)]
    pub paymaster: Option<PaymasterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRaw {
    pub factory: String,
    #[serde(default)]
    pub salt: Option<u64>,
}

/// ERC-7677 paymaster web service settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymasterConfig {
    pub url: String,
    pub policy_id: String,
    #[serde(default)]
    pub webhook_data: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub id: String,
    pub rpc_url: String,
    /// Expected chain id; checked against the provider when set.
    pub chain_id: Option<u64>,
    pub bundler_url: String,
    pub paymaster: Option<PaymasterConfig>,
}

#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub factory: Address,
    pub salt: U256,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub entrypoint: Address,
    pub state_file: PathBuf,
    pub poll_interval: Duration,
    pub networks: Vec<NetworkConfig>,
    pub account: AccountConfig,
}

impl ControllerConfig {
    /// The named network, or the first configured one.
    pub fn network(&self, id: Option<&str>) -> Result<&NetworkConfig> {
        match id {
            Some(id) => self
                .networks
                .iter()
                .find(|n| n.id == id)
                .ok_or_else(|| anyhow!("network '{id}' is not configured")),
            None => self
                .networks
                .first()
                .ok_or_else(|| anyhow!("no networks configured")),
        }
    }
}

pub fn load_config(path: &Path) -> Result<ControllerConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config json at {}", path.display()))?;
    let raw: ConfigRaw = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config json at {}", path.display()))?;
    parse_config(raw)
}

/// Validates a raw config. A network's `rpcEnvVar`, when set in the
/// environment, wins over its inline `rpc`.
pub fn parse_config(raw: ConfigRaw) -> Result<ControllerConfig> {
    if raw.networks.is_empty() {
        bail!("config must define at least one network");
    }

    let mut seen = HashSet::new();
    for network in &raw.networks {
        if network.id.trim().is_empty() {
            bail!("network id must not be empty");
        }
        if !seen.insert(network.id.as_str()) {
            bail!("duplicate network id '{}'", network.id);
        }
    }

    let poll_seconds = raw
        .poll_interval_seconds
        .unwrap_or(DEFAULT_POLL_INTERVAL_SECONDS);
    if poll_seconds == 0 {
        bail!("pollIntervalSeconds must be > 0");
    }

    let entrypoint = parse_addr(raw.entry_point.as_deref().unwrap_or(DEFAULT_ENTRYPOINT))
        .context("invalid entryPoint address")?;
    let factory = parse_addr(&raw.account.factory).context("invalid account factory address")?;

    let networks = raw
        .networks
        .into_iter()
        .map(|n| {
            let rpc_url = n
                .rpc_env_var
                .as_ref()
                .and_then(|var| env::var(var).ok())
                .unwrap_or_else(|| n.rpc.clone());

            if rpc_url.contains("alchemy.com/v2/") || rpc_url.contains("infura.io/v3/") {
                tracing::warn!(
                    network = %n.id,
                    "RPC URL looks like it may contain an API key; consider rpcEnvVar or USEROP_RPC_URL instead of committing it."
                );
            }

            NetworkConfig {
                id: n.id,
                rpc_url,
                chain_id: n.chain_id,
                bundler_url: n.bundler,
                paymaster: n.paymaster,
            }
        })
        .collect();

    Ok(ControllerConfig {
        entrypoint,
        state_file: raw
            .state_file
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE)),
        poll_interval: Duration::from_secs(poll_seconds),
        networks,
        account: AccountConfig {
            factory,
            salt: U256::from(raw.account.salt.unwrap_or_default()),
        },
    })
}

fn parse_addr(s: &str) -> Result<Address> {
    s.parse::<Address>().map_err(|e| anyhow!("{e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(networks: serde_json::Value) -> ConfigRaw {
        serde_json::from_value(json!({
            "networks": networks,
            "account": { "factory": "0x9406Cc6185a346906296840746125a0E44976454" }
        }))
        .unwrap()
    }

    fn network(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "rpc": "https://sepolia.base.org",
            "bundler": "https://bundler.example.com/rpc"
        })
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = parse_config(raw(json!([network("base-sepolia")]))).unwrap();
        assert_eq!(cfg.entrypoint, parse_addr(DEFAULT_ENTRYPOINT).unwrap());
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.state_file, PathBuf::from("userop-state.json"));
        assert_eq!(cfg.account.salt, U256::zero());
        assert_eq!(cfg.network(None).unwrap().id, "base-sepolia");
        assert!(cfg.network(Some("mainnet")).is_err());
    }

    #[test]
    fn rejects_duplicate_network_ids() {
        let err = parse_config(raw(json!([network("a"), network("a")]))).unwrap_err();
        assert!(err.to_string().contains("duplicate network id"));
    }

    #[test]
    fn rejects_empty_networks_and_zero_poll_interval() {
        assert!(parse_config(raw(json!([]))).is_err());

        let mut cfg = raw(json!([network("a")]));
        cfg.poll_interval_seconds = Some(0);
        assert!(parse_config(cfg).is_err());
    }

    #[test]
    fn rpc_env_var_wins_over_inline_rpc() {
        env::set_var("USEROP_CONFIG_TEST_RPC", "http://127.0.0.1:8545");
        let mut from_env = network("a");
        from_env["rpcEnvVar"] = json!("USEROP_CONFIG_TEST_RPC");
        let mut unset = network("b");
        unset["rpcEnvVar"] = json!("USEROP_CONFIG_TEST_RPC_UNSET");

        let cfg = parse_config(raw(json!([from_env, unset, network("c")]))).unwrap();
        assert_eq!(cfg.networks[0].rpc_url, "http://127.0.0.1:8545");
        assert_eq!(cfg.networks[1].rpc_url, "https://sepolia.base.org");
        assert_eq!(cfg.networks[2].rpc_url, "https://sepolia.base.org");
    }

    #[test]
    fn load_config_reads_paymaster_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("userop.json");
        fs::write(
            &path,
            json!({
                "pollIntervalSeconds": 2,
                "networks": [{
                    "id": "base-sepolia",
                    "rpc": "https://sepolia.base.org",
                    "chainId": 84532,
                    "bundler": "https://bundler.example.com/rpc",
                    "paymaster": { "url": "https://pm.example.com", "policyId": "p-1" }
                }],
                "account": { "factory": "0x9406Cc6185a346906296840746125a0E44976454", "salt": 7 }
            })
            .to_string(),
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        let net = cfg.network(Some("base-sepolia")).unwrap();
        assert_eq!(net.chain_id, Some(84_532));
        assert_eq!(net.paymaster.as_ref().unwrap().policy_id, "p-1");
        assert_eq!(cfg.account.salt, U256::from(7u64));
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
    }
}
