use crate::error::UserOperationError;
use crate::network::NetworkClient;
use crate::types::UserFeeLevel;
use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::types::U256;

/// Suggested EIP-1559 fees for one level, in decimal gwei.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeeLevelEstimate {
    pub suggested_max_fee_per_gas: String,
    pub suggested_max_priority_fee_per_gas: String,
}

/// Network fee estimates as produced by a gas-fee service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GasFeeEstimates {
    FeeMarket { medium: FeeLevelEstimate },
    /// Medium legacy gas price, decimal gwei.
    Legacy { medium: String },
    /// Plain `eth_gasPrice`, decimal gwei.
    EthGasPrice { gas_price: String },
    None,
}

#[async_trait]
pub trait GasFeeEstimator: Send + Sync {
    async fn get_gas_fee_estimates(&self, chain_id: u64) -> Result<GasFeeEstimates>;
}

/// Estimator for hosts without a fee service; fees fall back to `eth_gasPrice`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGasFeeEstimates;

#[async_trait]
impl GasFeeEstimator for NoGasFeeEstimates {
    async fn get_gas_fee_estimates(&self, _chain_id: u64) -> Result<GasFeeEstimates> {
        Ok(GasFeeEstimates::None)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedGasFees {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub user_fee_level: UserFeeLevel,
}

/// Fees explicitly requested by the caller, if any.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestedFees {
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
}

/// Resolves the fee fields of an operation.
///
/// Explicit request fees win; otherwise the estimator's medium level is used,
/// and the provider's `eth_gasPrice` when the estimator has nothing.
pub async fn resolve_gas_fees(
    estimator: &dyn GasFeeEstimator,
    network: &dyn NetworkClient,
    chain_id: u64,
    requested: RequestedFees,
    internal_origin: bool,
) -> Result<ResolvedGasFees, UserOperationError> {
    if let (Some(max_fee), Some(max_priority)) =
        (requested.max_fee_per_gas, requested.max_priority_fee_per_gas)
    {
        return Ok(ResolvedGasFees {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: max_priority,
            user_fee_level: if internal_origin {
                UserFeeLevel::Custom
            } else {
                UserFeeLevel::DappSuggested
            },
        });
    }

    let estimates = estimator
        .get_gas_fee_estimates(chain_id)
        .await
        .map_err(UserOperationError::provider)?;

    let to_wei = |gwei: &str| gwei_to_wei(gwei).map_err(UserOperationError::provider);

    let (max_fee_per_gas, max_priority_fee_per_gas) = match estimates {
        GasFeeEstimates::FeeMarket { medium } => (
            to_wei(&medium.suggested_max_fee_per_gas)?,
            to_wei(&medium.suggested_max_priority_fee_per_gas)?,
        ),
        GasFeeEstimates::Legacy { medium } => {
            let price = to_wei(&medium)?;
            (price, price)
        }
        GasFeeEstimates::EthGasPrice { gas_price } => {
            let price = to_wei(&gas_price)?;
            (price, price)
        }
        GasFeeEstimates::None => {
            let price = network
                .gas_price()
                .await
                .map_err(UserOperationError::provider)?;
            (price, price)
        }
    };

    tracing::debug!(chain_id, %max_fee_per_gas, "resolved gas fees from network estimates");

    Ok(ResolvedGasFees {
        max_fee_per_gas,
        max_priority_fee_per_gas,
        user_fee_level: UserFeeLevel::Medium,
    })
}

/// Converts a decimal gwei string (e.g. `"1.5"`) to wei.
pub fn gwei_to_wei(gwei: &str) -> Result<U256> {
    let units = ethers::utils::parse_units(gwei, "gwei")
        .with_context(|| format!("invalid gwei amount: {gwei}"))?;
    Ok(units.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, Bytes, H256};

    struct FixedEstimates(GasFeeEstimates);

    #[async_trait]
    impl GasFeeEstimator for FixedEstimates {
        async fn get_gas_fee_estimates(&self, _chain_id: u64) -> Result<GasFeeEstimates> {
            Ok(self.0.clone())
        }
    }

    struct GasPriceOnly(U256);

    #[async_trait]
    impl NetworkClient for GasPriceOnly {
        async fn chain_id(&self) -> Result<u64> {
            Ok(1)
        }
        async fn gas_price(&self) -> Result<U256> {
            Ok(self.0)
        }
        async fn get_code(&self, _address: Address) -> Result<Bytes> {
            Ok(Bytes::new())
        }
        async fn base_fee_per_gas(&self, _block_hash: H256) -> Result<Option<U256>> {
            Ok(None)
        }
    }

    const GWEI: u64 = 1_000_000_000;

    #[test]
    fn gwei_conversion_handles_fractions() {
        assert_eq!(gwei_to_wei("1").unwrap(), U256::from(GWEI));
        assert_eq!(gwei_to_wei("1.5").unwrap(), U256::from(1_500_000_000u64));
        assert!(gwei_to_wei("abc").is_err());
    }

    #[tokio::test]
    async fn explicit_fees_win_over_estimates() {
        let estimator = FixedEstimates(GasFeeEstimates::Legacy { medium: "50".into() });
        let fees = resolve_gas_fees(
            &estimator,
            &GasPriceOnly(U256::one()),
            1,
            RequestedFees {
                max_fee_per_gas: Some(U256::from(10u64)),
                max_priority_fee_per_gas: Some(U256::from(2u64)),
            },
            false,
        )
        .await
        .unwrap();
        assert_eq!(fees.max_fee_per_gas, U256::from(10u64));
        assert_eq!(fees.max_priority_fee_per_gas, U256::from(2u64));
        assert_eq!(fees.user_fee_level, UserFeeLevel::DappSuggested);
    }

    #[tokio::test]
    async fn fee_market_estimates_use_medium_level() {
        let estimator = FixedEstimates(GasFeeEstimates::FeeMarket {
            medium: FeeLevelEstimate {
                suggested_max_fee_per_gas: "30".into(),
                suggested_max_priority_fee_per_gas: "2".into(),
            },
        });
        let fees = resolve_gas_fees(
            &estimator,
            &GasPriceOnly(U256::one()),
            1,
            RequestedFees::default(),
            true,
        )
        .await
        .unwrap();
        assert_eq!(fees.max_fee_per_gas, U256::from(30 * GWEI));
        assert_eq!(fees.max_priority_fee_per_gas, U256::from(2 * GWEI));
        assert_eq!(fees.user_fee_level, UserFeeLevel::Medium);
    }

    #[tokio::test]
    async fn missing_estimates_fall_back_to_provider_gas_price() {
        let fees = resolve_gas_fees(
            &NoGasFeeEstimates,
            &GasPriceOnly(U256::from(7u64)),
            1,
            RequestedFees {
                max_fee_per_gas: Some(U256::from(10u64)),
                max_priority_fee_per_gas: None,
            },
            false,
        )
        .await
        .unwrap();
        assert_eq!(fees.max_fee_per_gas, U256::from(7u64));
        assert_eq!(fees.max_priority_fee_per_gas, U256::from(7u64));
    }
}
