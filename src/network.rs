use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, H256, U256};
use std::collections::HashMap;
use std::sync::Arc;

/// The chain RPC calls the controller and tracker need.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;
    async fn gas_price(&self) -> Result<U256>;
    async fn get_code(&self, address: Address) -> Result<Bytes>;
    async fn base_fee_per_gas(&self, block_hash: H256) -> Result<Option<U256>>;
}

/// [`NetworkClient`] backed by any ethers middleware stack.
#[derive(Debug)]
pub struct EthersNetworkClient<M> {
    client: Arc<M>,
}

impl<M> EthersNetworkClient<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<M> NetworkClient for EthersNetworkClient<M>
where
    M: Middleware + 'static,
    M::Error: 'static,
{
    async fn chain_id(&self) -> Result<u64> {
        Ok(self
            .client
            .get_chainid()
            .await
            .context("eth_chainId failed")?
            .as_u64())
    }

    async fn gas_price(&self) -> Result<U256> {
        self.client
            .get_gas_price()
            .await
            .context("failed to fetch gas price")
    }

    async fn get_code(&self, address: Address) -> Result<Bytes> {
        self.client
            .get_code(address, None)
            .await
            .context("eth_getCode failed")
    }

    async fn base_fee_per_gas(&self, block_hash: H256) -> Result<Option<U256>> {
        let block = self
            .client
            .get_block(block_hash)
            .await
            .context("eth_getBlockByHash failed")?;
        Ok(block.and_then(|b| b.base_fee_per_gas))
    }
}

/// Network client ids mapped to their RPC handles.
#[derive(Clone, Default)]
pub struct NetworkRegistry {
    networks: HashMap<String, Arc<dyn NetworkClient>>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network(mut self, id: impl Into<String>, client: Arc<dyn NetworkClient>) -> Self {
        self.networks.insert(id.into(), client);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn NetworkClient>> {
        self.networks.get(id).cloned()
    }
}
