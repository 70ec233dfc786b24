//! The user operation lifecycle.
//!
//! [`UserOperationController::add_user_operation`] validates a request and
//! records an `unapproved` operation. Nothing else happens until the caller
//! awaits [`UserOperationHandle::hash`], which spawns the pipeline once:
//!
//! prepare (account + fees + gas) -> paymaster -> approval -> sign -> submit
//!
//! Confirmation is reported separately by a [`PendingUserOperationTracker`]
//! started with [`UserOperationController::start_polling`].

use crate::account::{
    resolve_account, PrepareUserOperationRequest, SignUserOperationRequest, SmartContractAccount,
    UpdateUserOperationRequest,
};
use crate::approval::{ApprovalBroker, ApprovalRequest, ApprovalResultCallbacks};
use crate::bundler::BundlerClient;
use crate::error::{AccountHook, UserOperationError, UserOperationErrorRecord};
use crate::events::{EventHub, TrackerEvent, UserOperationEvent};
use crate::gas_fees::{resolve_gas_fees, GasFeeEstimator, RequestedFees};
use crate::network::{NetworkClient, NetworkRegistry};
use crate::store::StateStore;
use crate::tracker::{MetadataSnapshot, PendingUserOperationTracker, USER_OPERATION_FAILED};
use crate::transaction::{classify_transaction, TransactionMeta};
use crate::types::{
    AddUserOperationRequest, SwapsMetadata, TransactionParams, TransactionType, UserFeeLevel,
    UserOperation, UserOperationControllerState, UserOperationMetadata, UserOperationStatus,
};
use crate::validation::{
    validate_add_user_operation_options, validate_add_user_operation_request,
    validate_prepare_response, validate_sign_response, validate_transaction_params,
    validate_update_response,
};
use ethers::types::{Address, Bytes, H256, U256};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

/// EntryPoint v0.6.
pub const DEFAULT_ENTRYPOINT: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";

/// Origin of operations created by the host itself.
pub const INTERNAL_ORIGIN: &str = "internal";

/// Placeholder signature used for gas estimation when the account does not
/// supply one.
pub const DUMMY_SIGNATURE: &str = "0xfffffffffffffffffffffffffffffff0000000000000000000000000000000007aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa1c";

/// Name of the error stored on operations found mid-pipeline at startup.
pub const USER_OPERATION_INTERRUPTED: &str = "UserOperationInterrupted";

const GAS_BUFFER: u64 = 2;

fn default_dummy_signature() -> Bytes {
    DUMMY_SIGNATURE.parse().unwrap_or_default()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

pub struct UserOperationControllerArgs {
    pub entrypoint: Address,
    pub networks: NetworkRegistry,
    pub gas_fee_estimator: Arc<dyn GasFeeEstimator>,
    pub approval: Arc<dyn ApprovalBroker>,
    /// Used for every request that does not name its own account.
    pub default_account: Arc<dyn SmartContractAccount>,
    /// Previously persisted state to resume from.
    pub state: UserOperationControllerState,
    pub store: Arc<dyn StateStore>,
}

/// Per-request options for [`UserOperationController::add_user_operation`].
#[derive(Clone)]
pub struct AddUserOperationOptions {
    pub network_client_id: String,
    /// Defaults to [`INTERNAL_ORIGIN`].
    pub origin: Option<String>,
    pub require_approval: bool,
    pub smart_contract_account: Option<Arc<dyn SmartContractAccount>>,
    pub swaps: Option<SwapsMetadata>,
    /// Skips classification when set.
    pub transaction_type: Option<TransactionType>,
}

impl AddUserOperationOptions {
    pub fn new(network_client_id: impl Into<String>) -> Self {
        Self {
            network_client_id: network_client_id.into(),
            origin: None,
            require_approval: true,
            smart_contract_account: None,
            swaps: None,
            transaction_type: None,
        }
    }
}

/// Everything the pipeline needs that is fixed when the operation is added.
struct OperationContext {
    id: String,
    chain_id: u64,
    network: Arc<dyn NetworkClient>,
    account: Arc<dyn SmartContractAccount>,
    request: AddUserOperationRequest,
    require_approval: bool,
    transaction_type: Option<TransactionType>,
    internal: bool,
}

struct Inner {
    entrypoint: Address,
    networks: NetworkRegistry,
    gas_fee_estimator: Arc<dyn GasFeeEstimator>,
    approval: Arc<dyn ApprovalBroker>,
    default_account: Arc<dyn SmartContractAccount>,
    state: RwLock<UserOperationControllerState>,
    store: Arc<dyn StateStore>,
    hub: EventHub,
    tracker_tx: mpsc::UnboundedSender<TrackerEvent>,
    trackers: Mutex<Vec<AbortHandle>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let trackers = self
            .trackers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for tracker in trackers.drain(..) {
            tracker.abort();
        }
    }
}

/// Cheap to clone; all clones share one state map.
#[derive(Clone)]
pub struct UserOperationController {
    inner: Arc<Inner>,
}

impl UserOperationController {
    /// Must be called from within a tokio runtime.
    pub fn new(args: UserOperationControllerArgs) -> Self {
        let (tracker_tx, mut tracker_rx) = mpsc::unbounded_channel();

        let mut state = args.state;
        let interrupted = mark_interrupted(&mut state);

        let inner = Arc::new(Inner {
            entrypoint: args.entrypoint,
            networks: args.networks,
            gas_fee_estimator: args.gas_fee_estimator,
            approval: args.approval,
            default_account: args.default_account,
            state: RwLock::new(state),
            store: args.store,
            hub: EventHub::new(),
            tracker_tx,
            trackers: Mutex::new(Vec::new()),
        });

        if interrupted > 0 {
            tracing::warn!(count = interrupted, "marked interrupted user operations as failed");
            inner.persist(&inner.snapshot());
        }

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = tracker_rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_tracker_event(event);
            }
        });

        Self { inner }
    }

    pub async fn add_user_operation(
        &self,
        request: AddUserOperationRequest,
        options: AddUserOperationOptions,
    ) -> Result<UserOperationHandle, UserOperationError> {
        validate_add_user_operation_request(&request)?;
        validate_add_user_operation_options(&options)?;
        self.add(request, None, options).await
    }

    /// Like [`Self::add_user_operation`], for an operation that models a
    /// plain transaction. The record keeps `transactionParams` and every
    /// change is also published as a [`TransactionMeta`].
    pub async fn add_user_operation_from_transaction(
        &self,
        transaction: TransactionParams,
        options: AddUserOperationOptions,
    ) -> Result<UserOperationHandle, UserOperationError> {
        validate_transaction_params(&transaction)?;
        validate_add_user_operation_options(&options)?;
        let request = AddUserOperationRequest::from(&transaction);
        self.add(request, Some(transaction), options).await
    }

    async fn add(
        &self,
        request: AddUserOperationRequest,
        transaction: Option<TransactionParams>,
        options: AddUserOperationOptions,
    ) -> Result<UserOperationHandle, UserOperationError> {
        let network = self
            .inner
            .networks
            .get(&options.network_client_id)
            .ok_or_else(|| UserOperationError::UnknownNetwork(options.network_client_id.clone()))?;
        let chain_id = network
            .chain_id()
            .await
            .map_err(UserOperationError::provider)?;

        let account = resolve_account(
            options.smart_contract_account.as_ref(),
            &self.inner.default_account,
        );
        let origin = options
            .origin
            .unwrap_or_else(|| INTERNAL_ORIGIN.to_string());

        let metadata = UserOperationMetadata {
            id: Uuid::new_v4().to_string(),
            status: UserOperationStatus::Unapproved,
            chain_id,
            origin: origin.clone(),
            time: now_ms(),
            transaction_params: transaction,
            transaction_type: options.transaction_type,
            user_operation: UserOperation::default(),
            hash: None,
            transaction_hash: None,
            error: None,
            bundler_url: None,
            swaps_metadata: options.swaps,
            user_fee_level: None,
            actual_gas_cost: None,
            actual_gas_used: None,
            base_fee_per_gas: None,
        };

        tracing::info!(
            id = %metadata.id,
            chain_id,
            origin = %origin,
            network = %options.network_client_id,
            "user operation added"
        );

        self.inner.update_metadata(metadata.clone());
        self.inner.hub.emit(UserOperationEvent::Added(metadata.clone()));

        let context = OperationContext {
            id: metadata.id.clone(),
            chain_id,
            network,
            account,
            request,
            require_approval: options.require_approval,
            transaction_type: options.transaction_type,
            internal: origin == INTERNAL_ORIGIN,
        };

        Ok(UserOperationHandle {
            id: metadata.id,
            shared: Arc::new(HandleShared {
                inner: Arc::clone(&self.inner),
                context: Arc::new(context),
                outcome: OnceLock::new(),
            }),
        })
    }

    /// Spawns a tracker reporting confirmations for one network.
    pub async fn start_polling(
        &self,
        network_client_id: &str,
        poll_interval: Duration,
    ) -> Result<JoinHandle<()>, UserOperationError> {
        let network = self
            .inner
            .networks
            .get(network_client_id)
            .ok_or_else(|| UserOperationError::UnknownNetwork(network_client_id.to_string()))?;
        let chain_id = network
            .chain_id()
            .await
            .map_err(UserOperationError::provider)?;

        let weak = Arc::downgrade(&self.inner);
        let snapshot: MetadataSnapshot = Arc::new(move || {
            weak.upgrade()
                .map(|inner| inner.snapshot().user_operations.into_values().collect())
                .unwrap_or_default()
        });

        let tracker = PendingUserOperationTracker::new(
            chain_id,
            network,
            snapshot,
            self.inner.tracker_tx.clone(),
            poll_interval,
        );
        let handle = tokio::spawn(tracker.run());
        self.inner
            .trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.abort_handle());
        Ok(handle)
    }

    /// Sender for trackers driven outside the controller.
    pub fn tracker_events(&self) -> mpsc::UnboundedSender<TrackerEvent> {
        self.inner.tracker_tx.clone()
    }

    pub fn state(&self) -> UserOperationControllerState {
        self.inner.snapshot()
    }

    pub fn user_operation(&self, id: &str) -> Option<UserOperationMetadata> {
        self.inner.get(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserOperationEvent> {
        self.inner.hub.subscribe()
    }
}

/// Fails every record that was mid-pipeline when state was last saved.
/// Their pipelines cannot be resumed.
fn mark_interrupted(state: &mut UserOperationControllerState) -> usize {
    let mut count = 0;
    for metadata in state.user_operations.values_mut() {
        if matches!(
            metadata.status,
            UserOperationStatus::Unapproved
                | UserOperationStatus::Approved
                | UserOperationStatus::Signed
        ) {
            metadata.status = UserOperationStatus::Failed;
            metadata.error = Some(UserOperationErrorRecord::new(
                USER_OPERATION_INTERRUPTED,
                "User operation was interrupted before it was submitted",
            ));
            count += 1;
        }
    }
    count
}

impl Inner {
    fn snapshot(&self) -> UserOperationControllerState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn get(&self, id: &str) -> Option<UserOperationMetadata> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .user_operations
            .get(id)
            .cloned()
    }

    fn persist(&self, state: &UserOperationControllerState) {
        if let Err(err) = self.store.save(state) {
            tracing::error!(error = %format!("{err:#}"), "failed to persist user operation state");
        }
    }

    /// Replaces the stored record, persists and publishes. Returns `false`
    /// (and changes nothing) if the update would move status backwards.
    fn update_metadata(&self, metadata: UserOperationMetadata) -> bool {
        let snapshot = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(current) = state.user_operations.get(&metadata.id) {
                if !current.status.can_transition_to(metadata.status) {
                    tracing::warn!(
                        id = %metadata.id,
                        from = ?current.status,
                        to = ?metadata.status,
                        "dropping user operation update that would regress status"
                    );
                    return false;
                }
            }
            state
                .user_operations
                .insert(metadata.id.clone(), metadata.clone());
            let snapshot = state.clone();
            // Saved under the lock so writes land in mutation order.
            self.persist(&snapshot);
            snapshot
        };

        self.hub.emit(UserOperationEvent::StateUpdated(snapshot));
        if metadata.transaction_params.is_some() {
            self.hub.emit(UserOperationEvent::TransactionUpdated(
                TransactionMeta::from(&metadata),
            ));
        }
        true
    }

    fn delete_metadata(&self, id: &str) {
        let snapshot = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.user_operations.remove(id);
            let snapshot = state.clone();
            self.persist(&snapshot);
            snapshot
        };
        self.hub.emit(UserOperationEvent::StateUpdated(snapshot));
    }

    fn on_tracker_event(&self, event: TrackerEvent) {
        match event {
            TrackerEvent::Confirmed(metadata) => {
                let id = metadata.id.clone();
                if self.update_metadata(metadata.clone()) {
                    self.hub.emit(UserOperationEvent::Confirmed(metadata.clone()));
                    self.hub.resolve(&id, Ok(metadata));
                }
            }
            TrackerEvent::Failed { metadata, error } => {
                let id = metadata.id.clone();
                if self.update_metadata(metadata.clone()) {
                    self.hub.emit(UserOperationEvent::Failed {
                        metadata,
                        error: error.clone(),
                    });
                    self.hub.resolve(&id, Err(error));
                }
            }
            TrackerEvent::Updated(metadata) => {
                self.update_metadata(metadata);
            }
        }
    }

    fn current(&self, id: &str) -> Result<UserOperationMetadata, UserOperationError> {
        self.get(id).ok_or_else(|| {
            UserOperationError::InvalidRequest(format!("user operation {id} no longer exists"))
        })
    }

    async fn execute(&self, ctx: &OperationContext) -> Result<H256, UserOperationError> {
        let mut callbacks = None;
        match self.run_pipeline(ctx, &mut callbacks).await {
            Ok(hash) => Ok(hash),
            Err(err) => {
                self.fail(ctx, &err);
                if let Some(callbacks) = callbacks {
                    callbacks.error(&err);
                }
                Err(err)
            }
        }
    }

    async fn run_pipeline(
        &self,
        ctx: &OperationContext,
        callbacks: &mut Option<Arc<dyn ApprovalResultCallbacks>>,
    ) -> Result<H256, UserOperationError> {
        let mut metadata = self.current(&ctx.id)?;

        self.prepare(ctx, &mut metadata, &ctx.request).await?;
        self.add_paymaster_data(ctx, &mut metadata).await?;

        if ctx.require_approval {
            *callbacks = self.approve(ctx, &mut metadata).await?;
        } else {
            tracing::debug!(id = %ctx.id, "approval not required");
        }
        metadata.status = UserOperationStatus::Approved;
        self.update_metadata(metadata.clone());

        self.sign(ctx, &mut metadata).await?;
        let hash = self.submit(&mut metadata).await?;

        if let Some(callbacks) = callbacks.as_ref() {
            callbacks
                .success()
                .map_err(|e| UserOperationError::CallbackFailed(Arc::new(e)))?;
        }
        Ok(hash)
    }

    async fn prepare(
        &self,
        ctx: &OperationContext,
        metadata: &mut UserOperationMetadata,
        request: &AddUserOperationRequest,
    ) -> Result<(), UserOperationError> {
        tracing::info!(id = %ctx.id, chain_id = ctx.chain_id, "preparing user operation");

        metadata.transaction_type = match ctx.transaction_type {
            Some(supplied) => Some(supplied),
            None => Some(
                classify_transaction(ctx.network.as_ref(), request.to, request.data.as_ref())
                    .await?,
            ),
        };

        let response = ctx
            .account
            .prepare_user_operation(PrepareUserOperationRequest {
                chain_id: ctx.chain_id,
                data: request.data.clone(),
                from: request.from,
                to: request.to,
                value: request.value,
            })
            .await
            .map_err(|e| UserOperationError::account(AccountHook::Prepare, e))?;
        validate_prepare_response(&response)?;

        let op = &mut metadata.user_operation;
        op.sender = response.sender;
        op.nonce = response.nonce;
        op.call_data = response.call_data;
        op.init_code = response.init_code.unwrap_or_default();
        op.paymaster_and_data = response.dummy_paymaster_and_data.unwrap_or_default();
        op.signature = response
            .dummy_signature
            .unwrap_or_else(default_dummy_signature);
        metadata.bundler_url = Some(response.bundler.clone());

        let fees = resolve_gas_fees(
            self.gas_fee_estimator.as_ref(),
            ctx.network.as_ref(),
            ctx.chain_id,
            RequestedFees {
                max_fee_per_gas: request.max_fee_per_gas,
                max_priority_fee_per_gas: request.max_priority_fee_per_gas,
            },
            ctx.internal,
        )
        .await?;
        op.max_fee_per_gas = fees.max_fee_per_gas;
        op.max_priority_fee_per_gas = fees.max_priority_fee_per_gas;
        metadata.user_fee_level = Some(fees.user_fee_level);

        match response.gas {
            Some(gas) => {
                op.call_gas_limit = gas.call_gas_limit;
                op.verification_gas_limit = gas.verification_gas_limit;
                op.pre_verification_gas = gas.pre_verification_gas;
            }
            None => {
                let payload = UserOperation {
                    call_gas_limit: U256::one(),
                    verification_gas_limit: U256::one(),
                    pre_verification_gas: U256::one(),
                    ..op.clone()
                };
                let estimate = BundlerClient::new(response.bundler)
                    .estimate_user_operation_gas(&payload, self.entrypoint)
                    .await
                    .map_err(UserOperationError::bundler)?;

                let buffer = U256::from(GAS_BUFFER);
                op.call_gas_limit = estimate.call_gas_limit.saturating_mul(buffer);
                op.verification_gas_limit = estimate.verification_gas_limit.saturating_mul(buffer);
                op.pre_verification_gas = estimate.pre_verification_gas.saturating_mul(buffer);
            }
        }

        tracing::debug!(
            id = %ctx.id,
            sender = %op.sender,
            nonce = %op.nonce,
            call_gas_limit = %op.call_gas_limit,
            verification_gas_limit = %op.verification_gas_limit,
            pre_verification_gas = %op.pre_verification_gas,
            "prepared user operation"
        );

        self.update_metadata(metadata.clone());
        Ok(())
    }

    async fn add_paymaster_data(
        &self,
        ctx: &OperationContext,
        metadata: &mut UserOperationMetadata,
    ) -> Result<(), UserOperationError> {
        tracing::info!(id = %ctx.id, "requesting paymaster data");

        let response = ctx
            .account
            .update_user_operation(UpdateUserOperationRequest {
                user_operation: metadata.user_operation.clone(),
                chain_id: ctx.chain_id,
            })
            .await
            .map_err(|e| UserOperationError::account(AccountHook::Update, e))?;
        validate_update_response(&response)?;

        metadata.user_operation.paymaster_and_data =
            response.paymaster_and_data.unwrap_or_default();
        self.update_metadata(metadata.clone());
        Ok(())
    }

    async fn approve(
        &self,
        ctx: &OperationContext,
        metadata: &mut UserOperationMetadata,
    ) -> Result<Option<Arc<dyn ApprovalResultCallbacks>>, UserOperationError> {
        tracing::info!(id = %ctx.id, origin = %metadata.origin, "requesting approval");

        let result = self
            .approval
            .add_request(ApprovalRequest::transaction(&ctx.id, &metadata.origin))
            .await?;

        let edited = result
            .value
            .and_then(|v| v.tx_meta)
            .map(|tx_meta| tx_meta.tx_params);
        if let Some(edited) = edited {
            self.apply_edits(ctx, metadata, edited).await?;
        }

        Ok(result.result_callbacks)
    }

    /// Reconciles the operation with a transaction edited during approval.
    async fn apply_edits(
        &self,
        ctx: &OperationContext,
        metadata: &mut UserOperationMetadata,
        edited: TransactionParams,
    ) -> Result<(), UserOperationError> {
        let edited_request = AddUserOperationRequest::from(&edited);
        let original = &ctx.request;

        let edited_fees = match (
            edited_request.max_fee_per_gas,
            edited_request.max_priority_fee_per_gas,
        ) {
            (Some(max_fee), Some(max_priority)) => Some((max_fee, max_priority)),
            _ => None,
        };
        let op = &metadata.user_operation;
        let fees_changed = edited_fees.is_some_and(|(max_fee, max_priority)| {
            max_fee != op.max_fee_per_gas || max_priority != op.max_priority_fee_per_gas
        });
        let data_changed = edited_request.data != original.data.clone().filter(|d| !d.is_empty());
        let value_changed =
            edited_request.value.unwrap_or_default() != original.value.unwrap_or_default();

        if let Some((max_fee, max_priority)) = edited_fees.filter(|_| fees_changed) {
            tracing::info!(
                id = %ctx.id,
                max_fee_per_gas = %max_fee,
                max_priority_fee_per_gas = %max_priority,
                "updated gas fees after approval"
            );
            metadata.user_operation.max_fee_per_gas = max_fee;
            metadata.user_operation.max_priority_fee_per_gas = max_priority;
            metadata.user_fee_level = Some(UserFeeLevel::Custom);
        }

        if let Some(params) = metadata.transaction_params.as_mut() {
            *params = TransactionParams {
                from: params.from,
                ..edited.clone()
            };
        }

        // Paymaster signatures cover the fee fields; without a paymaster a
        // fee edit needs no new account data.
        let regenerate = data_changed
            || value_changed
            || (fees_changed && metadata.user_operation.uses_paymaster());

        if regenerate {
            tracing::info!(
                id = %ctx.id,
                data_changed,
                value_changed,
                fees_changed,
                "regenerating user operation after approval edits"
            );
            let (max_fee_per_gas, max_priority_fee_per_gas) = match edited_fees {
                Some((max_fee, max_priority)) => (Some(max_fee), Some(max_priority)),
                None => (original.max_fee_per_gas, original.max_priority_fee_per_gas),
            };
            let request = AddUserOperationRequest {
                from: original.from,
                to: edited_request.to.or(original.to),
                value: edited_request.value,
                data: edited_request.data,
                max_fee_per_gas,
                max_priority_fee_per_gas,
            };
            self.prepare(ctx, metadata, &request).await?;
            if fees_changed {
                metadata.user_fee_level = Some(UserFeeLevel::Custom);
            }
            self.add_paymaster_data(ctx, metadata).await?;
        } else {
            self.update_metadata(metadata.clone());
        }
        Ok(())
    }

    async fn sign(
        &self,
        ctx: &OperationContext,
        metadata: &mut UserOperationMetadata,
    ) -> Result<(), UserOperationError> {
        tracing::info!(id = %ctx.id, "signing user operation");

        let response = ctx
            .account
            .sign_user_operation(SignUserOperationRequest {
                user_operation: metadata.user_operation.clone(),
                chain_id: ctx.chain_id,
            })
            .await
            .map_err(|e| UserOperationError::account(AccountHook::Sign, e))?;
        validate_sign_response(&response)?;

        metadata.user_operation.signature = response.signature;
        metadata.status = UserOperationStatus::Signed;
        self.update_metadata(metadata.clone());
        Ok(())
    }

    async fn submit(
        &self,
        metadata: &mut UserOperationMetadata,
    ) -> Result<H256, UserOperationError> {
        let bundler_url =
            metadata
                .bundler_url
                .clone()
                .ok_or_else(|| UserOperationError::InvalidAccountResponse {
                    hook: AccountHook::Prepare,
                    reason: "no bundler URL was recorded".to_string(),
                })?;

        tracing::info!(id = %metadata.id, bundler = %bundler_url, "submitting user operation");

        let hash = BundlerClient::new(bundler_url)
            .send_user_operation(&metadata.user_operation, self.entrypoint)
            .await
            .map_err(UserOperationError::bundler)?;

        metadata.hash = Some(hash);
        metadata.status = UserOperationStatus::Submitted;
        self.update_metadata(metadata.clone());

        tracing::info!(id = %metadata.id, %hash, "user operation submitted");
        Ok(hash)
    }

    fn fail(&self, ctx: &OperationContext, error: &UserOperationError) {
        let Some(mut metadata) = self.get(&ctx.id) else {
            return;
        };

        if error.is_user_rejection() {
            tracing::info!(id = %ctx.id, "user operation rejected; removing");
            self.delete_metadata(&ctx.id);
        } else {
            tracing::warn!(
                id = %ctx.id,
                status = ?metadata.status,
                error = %error,
                "user operation failed"
            );
            metadata.status = UserOperationStatus::Failed;
            metadata.error = Some(UserOperationErrorRecord::from(error));
            self.update_metadata(metadata.clone());
        }

        self.hub.emit(UserOperationEvent::Failed {
            metadata,
            error: error.clone(),
        });
        self.hub.resolve(&ctx.id, Err(error.clone()));
    }
}

type HashOutcome = Option<Result<H256, UserOperationError>>;

struct HandleShared {
    inner: Arc<Inner>,
    context: Arc<OperationContext>,
    outcome: OnceLock<watch::Receiver<HashOutcome>>,
}

impl HandleShared {
    /// Spawns the pipeline. Its result is published on the returned channel
    /// and survives every caller being dropped.
    fn start(&self) -> watch::Receiver<HashOutcome> {
        let (tx, rx) = watch::channel(None);
        let inner = Arc::clone(&self.inner);
        let context = Arc::clone(&self.context);
        tokio::spawn(async move {
            let outcome = inner.execute(&context).await;
            let _ = tx.send(Some(outcome));
        });
        rx
    }
}

/// Returned by `add_user_operation`. Clones share one pipeline run.
#[derive(Clone)]
pub struct UserOperationHandle {
    id: String,
    shared: Arc<HandleShared>,
}

impl UserOperationHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The bundler's user operation hash. The first call starts the
    /// pipeline; every call, concurrent or later, gets the same outcome.
    /// Dropping a call does not cancel the pipeline.
    pub async fn hash(&self) -> Result<H256, UserOperationError> {
        let mut rx = self.shared.outcome.get_or_init(|| self.shared.start()).clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(UserOperationError::Failed(UserOperationErrorRecord::new(
                USER_OPERATION_INTERRUPTED,
                "User operation pipeline stopped before producing a hash",
            )))
        })
    }

    /// Waits for submission, then for the on-chain outcome. Resolves with
    /// the bundle transaction hash, or the stored error if the operation
    /// failed.
    pub async fn transaction_hash(&self) -> Result<Option<H256>, UserOperationError> {
        let waiter = self.shared.inner.hub.wait_for(&self.id);
        self.hash().await?;

        if let Some(metadata) = self.shared.inner.get(&self.id) {
            match metadata.status {
                UserOperationStatus::Confirmed => return Ok(metadata.transaction_hash),
                UserOperationStatus::Failed => {
                    let record = metadata.error.unwrap_or_else(|| {
                        UserOperationErrorRecord::new(USER_OPERATION_FAILED, "User operation failed")
                    });
                    return Err(UserOperationError::Failed(record));
                }
                _ => {}
            }
        }

        match waiter.await {
            Ok(outcome) => outcome.map(|metadata| metadata.transaction_hash),
            Err(_) => Err(UserOperationError::Failed(UserOperationErrorRecord::new(
                USER_OPERATION_INTERRUPTED,
                "Controller stopped before the user operation was confirmed",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, status: UserOperationStatus) -> UserOperationMetadata {
        UserOperationMetadata {
            id: id.into(),
            status,
            chain_id: 1,
            origin: INTERNAL_ORIGIN.into(),
            time: 0,
            transaction_params: None,
            transaction_type: None,
            user_operation: UserOperation::default(),
            hash: None,
            transaction_hash: None,
            error: None,
            bundler_url: None,
            swaps_metadata: None,
            user_fee_level: None,
            actual_gas_cost: None,
            actual_gas_used: None,
            base_fee_per_gas: None,
        }
    }

    #[test]
    fn dummy_signature_decodes() {
        assert_eq!(default_dummy_signature().len(), 65);
    }

    #[test]
    fn restored_in_flight_operations_are_failed() {
        let mut state = UserOperationControllerState::default();
        for (id, status) in [
            ("a", UserOperationStatus::Unapproved),
            ("b", UserOperationStatus::Signed),
            ("c", UserOperationStatus::Submitted),
            ("d", UserOperationStatus::Confirmed),
        ] {
            state.user_operations.insert(id.into(), record(id, status));
        }

        assert_eq!(mark_interrupted(&mut state), 2);
        let ops = &state.user_operations;
        assert_eq!(ops["a"].status, UserOperationStatus::Failed);
        assert_eq!(
            ops["b"].error.as_ref().unwrap().name,
            USER_OPERATION_INTERRUPTED
        );
        assert_eq!(ops["c"].status, UserOperationStatus::Submitted);
        assert_eq!(ops["d"].status, UserOperationStatus::Confirmed);
    }

    #[test]
    fn options_require_approval_by_default() {
        let options = AddUserOperationOptions::new("sepolia");
        assert!(options.require_approval);
        assert!(options.origin.is_none());
    }
}
