use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::prelude::*;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use userop_controller::config::{load_config, ControllerConfig, NetworkConfig};
use userop_controller::encoding;
use userop_controller::paymaster::PaymasterClient;
use userop_controller::simple_account::SimpleAccount;
use userop_controller::{
    AddUserOperationOptions, AddUserOperationRequest, AutoApprove, EthersNetworkClient,
    JsonFileStore, NetworkRegistry, NoGasFeeEstimates, UserOperationController,
    UserOperationControllerArgs,
};

#[derive(Parser, Debug)]
#[command(name = "userop", version, about = "ERC-4337 user operation controller CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the counterfactual smart account address (and deployment status).
    Account(AccountArgs),

    /// Build, sponsor, sign and submit a single call from the smart account.
    Send(SendArgs),

    /// Print user operations recorded in the state file.
    List(ListArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Controller config (networks, bundler, paymaster, account factory).
    #[arg(long, default_value = "userop.json")]
    config: PathBuf,

    /// Override the RPC URL of the selected network.
    #[arg(long, env = "USEROP_RPC_URL")]
    rpc: Option<String>,

    /// Network id from the config. Defaults to the first network.
    #[arg(long)]
    network: Option<String>,
}

#[derive(Args, Debug)]
struct OwnerArgs {
    /// Smart account owner private key.
    ///
    /// Recommended: set via env var USEROP_OWNER_PRIVATE_KEY.
    #[arg(long, env = "USEROP_OWNER_PRIVATE_KEY", hide_env_values = true)]
    owner_private_key: Option<String>,
}

#[derive(Args, Debug)]
struct AccountArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    owner: OwnerArgs,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    owner: OwnerArgs,

    /// Call target.
    #[arg(long)]
    to: String,

    /// Value in wei (decimal).
    #[arg(long, default_value = "0")]
    value: String,

    /// Calldata (hex).
    #[arg(long, default_value = "0x")]
    data: String,

    /// Do not wait for the user operation to be included.
    #[arg(long)]
    no_wait: bool,

    /// Max seconds to wait for inclusion. Use 0 to disable timeout.
    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Controller config (only `stateFile` is read).
    #[arg(long, default_value = "userop.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Always write logs to stderr so stdout can be used for script-friendly outputs.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Account(args) => cmd_account(args).await,
        Command::Send(args) => cmd_send(args).await,
        Command::List(args) => cmd_list(args),
    }
}

async fn connect(
    common: &CommonArgs,
) -> Result<(ControllerConfig, NetworkConfig, Arc<Provider<Http>>)> {
    let cfg = load_config(&common.config)?;
    let network = cfg.network(common.network.as_deref())?.clone();
    let rpc_url = common.rpc.clone().unwrap_or_else(|| network.rpc_url.clone());

    let provider =
        Provider::<Http>::try_from(rpc_url.as_str())?.interval(Duration::from_millis(350));

    let chain_id = provider.get_chainid().await?.as_u64();
    if let Some(expected) = network.chain_id {
        if chain_id != expected {
            return Err(anyhow!(
                "chainId mismatch: config has {}, RPC returned {}",
                expected,
                chain_id
            ));
        }
    }

    Ok((cfg, network, Arc::new(provider)))
}

fn load_owner(owner: &OwnerArgs) -> Result<LocalWallet> {
    let owner_pk = owner
        .owner_private_key
        .clone()
        .ok_or_else(|| anyhow!("missing USEROP_OWNER_PRIVATE_KEY (or --owner-private-key)"))?;
    LocalWallet::from_str(&owner_pk).context("invalid owner private key")
}

fn build_account(
    cfg: &ControllerConfig,
    network: &NetworkConfig,
    client: Arc<Provider<Http>>,
    wallet: LocalWallet,
) -> SimpleAccount<Provider<Http>> {
    let account = SimpleAccount::new(
        client,
        wallet,
        cfg.account.factory,
        cfg.account.salt,
        cfg.entrypoint,
        network.bundler_url.clone(),
    );
    match network.paymaster.as_ref() {
        Some(pm) => account.with_paymaster(PaymasterClient::new(pm)),
        None => account,
    }
}

async fn cmd_account(args: AccountArgs) -> Result<()> {
    let (cfg, network, client) = connect(&args.common).await?;
    let wallet = load_owner(&args.owner)?;
    let account = build_account(&cfg, &network, client, wallet);

    let (address, deployed) = account.address().await?;

    println!("network:        {}", network.id);
    println!("entryPoint:     {}", encoding::to_hex(cfg.entrypoint));
    println!("factory:        {}", encoding::to_hex(cfg.account.factory));
    println!("owner:          {}", encoding::to_hex(account.owner()));
    println!("smartAccount:   {}", encoding::to_hex(address));
    println!("isDeployed:     {}", deployed);

    Ok(())
}

async fn cmd_send(args: SendArgs) -> Result<()> {
    let (cfg, network, client) = connect(&args.common).await?;
    let wallet = load_owner(&args.owner)?;

    let to = Address::from_str(&args.to).context("invalid --to address")?;
    let value = U256::from_dec_str(&args.value).context("invalid --value (expected decimal wei)")?;
    let data = Bytes::from_str(&args.data).context("invalid --data hex")?;

    let account = build_account(&cfg, &network, client.clone(), wallet);
    let (sender, deployed) = account.address().await?;
    tracing::info!(%sender, deployed, network = %network.id, "using smart account");

    let store = JsonFileStore::new(cfg.state_file.clone());
    let state = store.load()?;

    let controller = UserOperationController::new(UserOperationControllerArgs {
        entrypoint: cfg.entrypoint,
        networks: NetworkRegistry::new().with_network(
            network.id.clone(),
            Arc::new(EthersNetworkClient::new(client)),
        ),
        gas_fee_estimator: Arc::new(NoGasFeeEstimates),
        approval: Arc::new(AutoApprove),
        default_account: Arc::new(account),
        state,
        store: Arc::new(store),
    });

    let handle = controller
        .add_user_operation(
            AddUserOperationRequest {
                from: sender,
                to: Some(to),
                value: Some(value),
                data: Some(data).filter(|d| !d.is_empty()),
                ..Default::default()
            },
            AddUserOperationOptions {
                require_approval: false,
                ..AddUserOperationOptions::new(network.id.clone())
            },
        )
        .await?;

    println!("id:             {}", handle.id());

    let hash = handle.hash().await?;
    println!("userOpHash:     {}", encoding::to_hex(hash));

    if args.no_wait {
        println!("--no-wait set: not waiting for inclusion.");
        return Ok(());
    }

    let tracker = controller
        .start_polling(&network.id, cfg.poll_interval)
        .await?;

    let tx_hash = if args.max_wait_seconds == 0 {
        handle.transaction_hash().await?
    } else {
        tokio::time::timeout(
            Duration::from_secs(args.max_wait_seconds),
            handle.transaction_hash(),
        )
        .await
        .map_err(|_| {
            anyhow!(
                "timed out after {}s waiting for user operation {}",
                args.max_wait_seconds,
                handle.id()
            )
        })??
    };
    tracker.abort();

    match tx_hash {
        Some(tx) => println!("transaction:    {}", encoding::to_hex(tx)),
        None => println!("transaction:    (unknown)"),
    }

    Ok(())
}

fn cmd_list(args: ListArgs) -> Result<()> {
    let cfg = load_config(&args.config)?;
    let state = JsonFileStore::new(cfg.state_file).load()?;

    if state.user_operations.is_empty() {
        println!("no user operations recorded");
        return Ok(());
    }

    let mut ops: Vec<_> = state.user_operations.into_values().collect();
    ops.sort_by_key(|md| md.time);

    for md in ops {
        println!(
            "{}  {:<10}  chain={}  hash={}  tx={}{}",
            md.id,
            format!("{:?}", md.status).to_lowercase(),
            md.chain_id,
            md.hash.map(encoding::to_hex).unwrap_or_else(|| "-".into()),
            md.transaction_hash
                .map(encoding::to_hex)
                .unwrap_or_else(|| "-".into()),
            md.error
                .map(|e| format!("  error={}", e.message))
                .unwrap_or_default(),
        );
    }

    Ok(())
}
