//! ERC-4337 user operation lifecycle controller.
//!
//! Drives user operations (EntryPoint v0.6) from request to on-chain
//! confirmation through pluggable collaborators: a [`SmartContractAccount`],
//! a bundler, a [`GasFeeEstimator`] and an [`ApprovalBroker`].

pub mod account;
pub mod approval;
pub mod bundler;
pub mod config;
pub mod controller;
pub mod encoding;
pub mod error;
pub mod events;
pub mod gas_fees;
pub mod network;
pub mod paymaster;
pub mod rpc;
pub mod simple_account;
pub mod store;
pub mod tracker;
pub mod transaction;
pub mod types;
pub mod validation;

pub use account::SmartContractAccount;
pub use approval::{ApprovalBroker, AutoApprove};
pub use controller::{
    AddUserOperationOptions, UserOperationController, UserOperationControllerArgs,
    UserOperationHandle,
};
pub use error::{UserOperationError, UserOperationErrorRecord};
pub use events::{TrackerEvent, UserOperationEvent};
pub use gas_fees::{GasFeeEstimator, NoGasFeeEstimates};
pub use network::{EthersNetworkClient, NetworkClient, NetworkRegistry};
pub use store::{JsonFileStore, StateStore};
pub use types::{
    AddUserOperationRequest, TransactionParams, UserOperation, UserOperationControllerState,
    UserOperationMetadata, UserOperationStatus,
};
