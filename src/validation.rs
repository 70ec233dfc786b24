use crate::account::{
    PrepareUserOperationResponse, SignUserOperationResponse, UpdateUserOperationResponse,
};
use crate::controller::AddUserOperationOptions;
use crate::error::{AccountHook, UserOperationError};
use crate::types::{AddUserOperationRequest, TransactionParams};
use ethers::types::Address;

/// Smallest non-empty `paymasterAndData`: the paymaster address itself.
const MIN_PAYMASTER_AND_DATA_LEN: usize = 20;

fn invalid(msg: impl Into<String>) -> UserOperationError {
    UserOperationError::InvalidRequest(msg.into())
}

pub fn validate_add_user_operation_request(
    request: &AddUserOperationRequest,
) -> Result<(), UserOperationError> {
    if request.from == Address::zero() {
        return Err(invalid("from must not be the zero address"));
    }
    if request.to == Some(Address::zero()) {
        return Err(invalid("to must not be the zero address"));
    }

    match (request.max_fee_per_gas, request.max_priority_fee_per_gas) {
        (Some(max_fee), Some(max_priority)) if max_priority > max_fee => {
            return Err(invalid(
                "maxPriorityFeePerGas must not exceed maxFeePerGas",
            ));
        }
        (Some(_), None) | (None, Some(_)) => {
            return Err(invalid(
                "maxFeePerGas and maxPriorityFeePerGas must be provided together",
            ));
        }
        _ => {}
    }

    let has_data = request.data.as_ref().is_some_and(|d| !d.is_empty());
    if request.to.is_none() && !has_data {
        return Err(invalid("either to or data must be provided"));
    }

    Ok(())
}

pub fn validate_transaction_params(tx: &TransactionParams) -> Result<(), UserOperationError> {
    if tx.gas_price.is_some()
        && (tx.max_fee_per_gas.is_some() || tx.max_priority_fee_per_gas.is_some())
    {
        return Err(invalid(
            "gasPrice cannot be combined with maxFeePerGas or maxPriorityFeePerGas",
        ));
    }
    validate_add_user_operation_request(&AddUserOperationRequest::from(tx))
}

pub fn validate_add_user_operation_options(
    options: &AddUserOperationOptions,
) -> Result<(), UserOperationError> {
    if options.network_client_id.trim().is_empty() {
        return Err(invalid("networkClientId must not be empty"));
    }
    if options.origin.as_deref().is_some_and(|o| o.trim().is_empty()) {
        return Err(invalid("origin must not be empty"));
    }
    Ok(())
}

fn invalid_response(hook: AccountHook, reason: impl Into<String>) -> UserOperationError {
    UserOperationError::InvalidAccountResponse {
        hook,
        reason: reason.into(),
    }
}

pub fn validate_prepare_response(
    response: &PrepareUserOperationResponse,
) -> Result<(), UserOperationError> {
    let hook = AccountHook::Prepare;

    let bundler = reqwest::Url::parse(&response.bundler)
        .map_err(|e| invalid_response(hook, format!("bundler is not a valid URL: {e}")))?;
    if !matches!(bundler.scheme(), "http" | "https") {
        return Err(invalid_response(hook, "bundler must be an http(s) URL"));
    }

    if response.sender == Address::zero() {
        return Err(invalid_response(hook, "sender must not be the zero address"));
    }

    if let Some(gas) = &response.gas {
        if gas.call_gas_limit.is_zero()
            || gas.verification_gas_limit.is_zero()
            || gas.pre_verification_gas.is_zero()
        {
            return Err(invalid_response(hook, "gas limits must be non-zero"));
        }
    }

    if response.dummy_signature.as_ref().is_some_and(|s| s.is_empty()) {
        return Err(invalid_response(hook, "dummySignature must not be empty"));
    }

    Ok(())
}

pub fn validate_update_response(
    response: &UpdateUserOperationResponse,
) -> Result<(), UserOperationError> {
    match &response.paymaster_and_data {
        Some(data) if !data.is_empty() && data.len() < MIN_PAYMASTER_AND_DATA_LEN => {
            Err(invalid_response(
                AccountHook::Update,
                format!(
                    "paymasterAndData must start with a paymaster address, got {} bytes",
                    data.len()
                ),
            ))
        }
        _ => Ok(()),
    }
}

pub fn validate_sign_response(
    response: &SignUserOperationResponse,
) -> Result<(), UserOperationError> {
    if response.signature.is_empty() {
        return Err(invalid_response(AccountHook::Sign, "signature must not be empty"));
    }
    Ok(())
}
