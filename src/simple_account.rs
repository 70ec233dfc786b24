use crate::account::{
    PrepareUserOperationRequest, PrepareUserOperationResponse, SignUserOperationRequest,
    SignUserOperationResponse, SmartContractAccount, UpdateUserOperationRequest,
    UpdateUserOperationResponse,
};
use crate::controller::DUMMY_SIGNATURE;
use crate::paymaster::PaymasterClient;
use crate::types::UserOperation;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ethers::abi::{Abi, AbiParser, Token};
use ethers::prelude::*;
use std::sync::Arc;

/// eth-infinitism `SimpleAccount` owned by a local key, deployed through
/// `SimpleAccountFactory` on first use.
#[derive(Debug)]
pub struct SimpleAccount<M> {
    client: Arc<M>,
    owner: LocalWallet,
    factory: Address,
    salt: U256,
    entrypoint: Address,
    bundler_url: String,
    paymaster: Option<PaymasterClient>,
}

impl<M: Middleware + 'static> SimpleAccount<M> {
    pub fn new(
        client: Arc<M>,
        owner: LocalWallet,
        factory: Address,
        salt: U256,
        entrypoint: Address,
        bundler_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            owner,
            factory,
            salt,
            entrypoint,
            bundler_url: bundler_url.into(),
            paymaster: None,
        }
    }

    /// Sponsor every operation through an ERC-7677 paymaster web service.
    pub fn with_paymaster(mut self, paymaster: PaymasterClient) -> Self {
        self.paymaster = Some(paymaster);
        self
    }

    pub fn owner(&self) -> Address {
        self.owner.address()
    }

    /// Counterfactual account address and whether it is deployed yet.
    pub async fn address(&self) -> Result<(Address, bool)> {
        let factory_abi = AbiParser::default()
            .parse(&["function getAddress(address owner, uint256 salt) view returns (address)"])?;
        let factory = Contract::new(self.factory, factory_abi, self.client.clone());

        let account: Address = factory
            .method("getAddress", (self.owner(), self.salt))?
            .call()
            .await
            .context("factory.getAddress failed")?;

        let code = self
            .client
            .get_code(account, None)
            .await
            .context("eth_getCode failed")?;

        Ok((account, !code.as_ref().is_empty()))
    }

    async fn nonce(&self, account: Address) -> Result<U256> {
        let entrypoint_abi = AbiParser::default()
            .parse(&["function getNonce(address sender, uint192 key) view returns (uint256)"])?;
        let entrypoint = Contract::new(self.entrypoint, entrypoint_abi, self.client.clone());

        entrypoint
            .method("getNonce", (account, U256::zero()))?
            .call()
            .await
            .context("entryPoint.getNonce failed")
    }

    /// `EntryPoint.getUserOpHash(op)`, computed on chain.
    pub async fn user_operation_hash(&self, op: &UserOperation) -> Result<H256> {
        let entrypoint_abi: Abi = serde_json::from_str(
            r#"[{"inputs":[{"components":[{"internalType":"address","name":"sender","type":"address"},{"internalType":"uint256","name":"nonce","type":"uint256"},{"internalType":"bytes","name":"initCode","type":"bytes"},{"internalType":"bytes","name":"callData","type":"bytes"},{"internalType":"uint256","name":"callGasLimit","type":"uint256"},{"internalType":"uint256","name":"verificationGasLimit","type":"uint256"},{"internalType":"uint256","name":"preVerificationGas","type":"uint256"},{"internalType":"uint256","name":"maxFeePerGas","type":"uint256"},{"internalType":"uint256","name":"maxPriorityFeePerGas","type":"uint256"},{"internalType":"bytes","name":"paymasterAndData","type":"bytes"},{"internalType":"bytes","name":"signature","type":"bytes"}],"internalType":"struct UserOperation","name":"userOp","type":"tuple"}],"name":"getUserOpHash","outputs":[{"internalType":"bytes32","name":"","type":"bytes32"}],"stateMutability":"view","type":"function"}]"#,
        )
        .context("failed to parse EntryPoint ABI")?;
        let entrypoint = Contract::new(self.entrypoint, entrypoint_abi, self.client.clone());

        entrypoint
            .method("getUserOpHash", (op.as_abi_tuple(),))?
            .call()
            .await
            .context("entryPoint.getUserOpHash failed")
    }
}

/// `factory ++ createAccount(owner, salt)` calldata.
pub fn init_code(factory: Address, owner: Address, salt: U256) -> Result<Bytes> {
    let create_account = AbiParser::default()
        .parse_function("function createAccount(address owner, uint256 salt) returns (address)")?;
    let calldata = create_account
        .encode_input(&[Token::Address(owner), Token::Uint(salt)])
        .context("failed to build createAccount calldata")?;

    let mut v = Vec::with_capacity(20 + calldata.len());
    v.extend_from_slice(factory.as_bytes());
    v.extend_from_slice(&calldata);
    Ok(Bytes::from(v))
}

/// `SimpleAccount.execute(dest, value, func)` calldata.
pub fn execute_call_data(to: Address, value: U256, data: &[u8]) -> Result<Bytes> {
    let execute = AbiParser::default()
        .parse_function("function execute(address dest, uint256 value, bytes func)")?;
    let calldata = execute
        .encode_input(&[
            Token::Address(to),
            Token::Uint(value),
            Token::Bytes(data.to_vec()),
        ])
        .context("failed to build execute calldata")?;
    Ok(Bytes::from(calldata))
}

#[async_trait]
impl<M: Middleware + 'static> SmartContractAccount for SimpleAccount<M> {
    async fn prepare_user_operation(
        &self,
        request: PrepareUserOperationRequest,
    ) -> Result<PrepareUserOperationResponse> {
        let (sender, deployed) = self.address().await?;
        if request.from != sender && request.from != self.owner() {
            bail!(
                "request from {:?} is neither the smart account {:?} nor its owner",
                request.from,
                sender
            );
        }

        // Contract deployment from a SimpleAccount is not supported.
        let Some(to) = request.to else {
            bail!("SimpleAccount cannot deploy contracts; a target address is required");
        };

        let nonce = self.nonce(sender).await?;
        let init_code = if deployed {
            Bytes::new()
        } else {
            init_code(self.factory, self.owner(), self.salt)?
        };
        let call_data = execute_call_data(
            to,
            request.value.unwrap_or_default(),
            request.data.as_deref().unwrap_or_default(),
        )?;

        tracing::debug!(
            %sender,
            deployed,
            %nonce,
            chain_id = request.chain_id,
            "prepared SimpleAccount user operation"
        );

        let dummy_paymaster_and_data = match &self.paymaster {
            Some(pm) => {
                let op = UserOperation {
                    sender,
                    nonce,
                    init_code: init_code.clone(),
                    call_data: call_data.clone(),
                    ..Default::default()
                };
                Some(
                    pm.get_paymaster_stub_data(&op, self.entrypoint, request.chain_id)
                        .await?,
                )
            }
            None => None,
        };

        Ok(PrepareUserOperationResponse {
            bundler: self.bundler_url.clone(),
            call_data,
            dummy_paymaster_and_data,
            dummy_signature: Some(DUMMY_SIGNATURE.parse()?),
            gas: None,
            init_code: Some(init_code),
            nonce,
            sender,
        })
    }

    async fn update_user_operation(
        &self,
        request: UpdateUserOperationRequest,
    ) -> Result<UpdateUserOperationResponse> {
        let Some(pm) = &self.paymaster else {
            return Ok(UpdateUserOperationResponse::default());
        };
        let paymaster_and_data = pm
            .get_paymaster_data(&request.user_operation, self.entrypoint, request.chain_id)
            .await?;
        Ok(UpdateUserOperationResponse {
            paymaster_and_data: Some(paymaster_and_data),
        })
    }

    async fn sign_user_operation(
        &self,
        request: SignUserOperationRequest,
    ) -> Result<SignUserOperationResponse> {
        let hash = self.user_operation_hash(&request.user_operation).await?;
        let sig = self
            .owner
            .sign_message(hash.as_bytes())
            .await
            .context("failed to sign userOpHash")?;
        Ok(SignUserOperationResponse {
            signature: Bytes::from(sig.to_vec()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_code_prefixes_factory_address() {
        let factory = Address::repeat_byte(0xfa);
        let code = init_code(factory, Address::repeat_byte(0x01), U256::from(3u64)).unwrap();
        assert_eq!(&code[..20], factory.as_bytes());
        // createAccount(address,uint256)
        assert_eq!(&code[20..24], &[0x5f, 0xbf, 0xb9, 0xcf]);
        assert_eq!(code.len(), 20 + 4 + 64);
    }

    #[test]
    fn execute_call_data_encodes_dynamic_bytes() {
        let data =
            execute_call_data(Address::repeat_byte(0xaa), U256::one(), &[0xde, 0xad]).unwrap();
        // execute(address,uint256,bytes)
        assert_eq!(&data[..4], &[0xb6, 0x1d, 0x27, 0xf6]);
        // head (3 words) + length word + one padded data word
        assert_eq!(data.len(), 4 + 32 * 5);
        assert_eq!(&data[4 + 32 * 4..4 + 32 * 4 + 2], &[0xde, 0xad]);
    }

    #[test]
    fn dummy_signature_is_65_bytes() {
        let sig: Bytes = DUMMY_SIGNATURE.parse().unwrap();
        assert_eq!(sig.len(), 65);
    }
}
