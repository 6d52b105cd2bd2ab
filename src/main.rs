use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vault_config_operator::controller::{
    self, BackoffPolicy, ConditionsAware, ControllerSettings, ControllerState, ReconcilerSettings,
};
use vault_config_operator::crd::{
    DatabaseSecretEngineRole, DatabaseSecretEngineStaticRole, KubernetesAuthEngineRole,
};
use vault_config_operator::vault::VaultClient;
use vault_config_operator::Error;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show managed resource counts
    Info(InfoArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Vault server address
    #[arg(long, env = "VAULT_ADDR")]
    vault_addr: String,

    /// Operator namespace, holds the leader election lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Only watch resources in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    workers: usize,

    /// Seconds between full resyncs of every cached resource
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 300)]
    resync_interval_secs: u64,

    /// Timeout for a single Vault request
    #[arg(long, env = "REMOTE_TIMEOUT_SECS", default_value_t = 10)]
    remote_timeout_secs: u64,

    /// Failed attempts before a resource is reported Degraded
    #[arg(long, env = "MAX_RETRIES", default_value_t = 8)]
    max_retries: u32,

    #[arg(long, env = "BACKOFF_BASE_SECS", default_value_t = 5)]
    backoff_base_secs: u64,

    #[arg(long, env = "BACKOFF_MAX_SECS", default_value_t = 300)]
    backoff_max_secs: u64,

    /// Remaining share of a token's TTL at which it is renewed
    #[arg(long, env = "TOKEN_RENEW_FRACTION", default_value_t = 0.1)]
    token_renew_fraction: f64,

    /// Lifetime requested for service account tokens used at login
    #[arg(long, env = "TOKEN_REQUEST_EXPIRATION_SECS", default_value_t = 600)]
    token_request_expiration_secs: i64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Run as leader unconditionally
    #[arg(long, env = "DISABLE_LEADER_ELECTION")]
    disable_leader_election: bool,

    /// Port for health and metrics endpoints
    #[cfg(feature = "rest-api")]
    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    api_port: u16,
}

impl RunArgs {
    fn controller_settings(&self) -> Result<ControllerSettings, Error> {
        if self.workers == 0 {
            return Err(Error::ConfigError("--workers must be at least 1".to_string()));
        }
        if !(self.token_renew_fraction > 0.0 && self.token_renew_fraction < 1.0) {
            return Err(Error::ConfigError(format!(
                "--token-renew-fraction must be between 0 and 1, got {}",
                self.token_renew_fraction
            )));
        }
        if self.backoff_base_secs > self.backoff_max_secs {
            return Err(Error::ConfigError(
                "--backoff-base-secs must not exceed --backoff-max-secs".to_string(),
            ));
        }

        Ok(ControllerSettings {
            workers: self.workers,
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            watch_namespace: self.watch_namespace.clone(),
            token_renew_fraction: self.token_renew_fraction,
            token_request_expiration_secs: self.token_request_expiration_secs,
            reconciler: ReconcilerSettings {
                backoff: BackoffPolicy {
                    base: Duration::from_secs(self.backoff_base_secs),
                    max: Duration::from_secs(self.backoff_max_secs),
                    max_retries: self.max_retries,
                    jitter: true,
                },
                ..Default::default()
            },
        })
    }
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Only count resources in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Vault Config Operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn count_kind<K>(client: &kube::Client, namespace: Option<&str>) -> Result<(), Error>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + ConditionsAware
        + Clone
        + DeserializeOwned
        + Debug,
{
    let api: Api<K> = match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let list = api.list(&Default::default()).await.map_err(Error::KubeError)?;
    let ready = list.items.iter().filter(|obj| obj.is_ready()).count();
    println!("{}: {} ({} ready)", K::kind(&()), list.items.len(), ready);
    Ok(())
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    let namespace = args.watch_namespace.as_deref();

    count_kind::<DatabaseSecretEngineStaticRole>(&client, namespace).await?;
    count_kind::<DatabaseSecretEngineRole>(&client, namespace).await?;
    count_kind::<KubernetesAuthEngineRole>(&client, namespace).await?;
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    info!(
        "Starting Vault Config Operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let settings = args.controller_settings()?;
    let vault = Arc::new(VaultClient::new(
        args.vault_addr.clone(),
        Duration::from_secs(args.remote_timeout_secs),
    )?);
    info!("Using Vault at {}", args.vault_addr);

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let (leader_tx, leader_rx) = watch::channel(false);
    let _leader_tx = if args.disable_leader_election {
        info!("Leader election disabled, running as leader");
        leader_tx.send_replace(true);
        Some(leader_tx)
    } else {
        let lease_namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
        let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });

        info!("Leader election using holder ID: {}", holder_identity);

        let lease_client = client.clone();
        tokio::spawn(async move {
            run_leader_election(lease_client, &lease_namespace, &holder_identity, leader_tx).await;
        });
        None
    };

    let state = Arc::new(ControllerState {
        client,
        settings,
        leader: leader_rx.clone(),
    });

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let port = args.api_port;
        tokio::spawn(async move {
            if let Err(e) = vault_config_operator::rest_api::run_server(api_state, port).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    let (term_tx, term_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        term_tx.send_replace(true);
    });

    let mut leader = leader_rx;
    let mut terminated = term_rx.clone();
    loop {
        tokio::select! {
            res = leader.wait_for(|is_leader| *is_leader) => {
                if res.is_err() {
                    return Err(Error::ConfigError("Leader election stopped".to_string()));
                }
            }
            _ = terminated.wait_for(|t| *t) => break,
        }

        info!("Leadership held, starting controller");
        let mut lost = leader.clone();
        let mut stop = term_rx.clone();
        let shutdown = async move {
            tokio::select! {
                _ = lost.wait_for(|is_leader| !*is_leader) => {
                    warn!("Leadership lost, stopping controller");
                }
                _ = stop.wait_for(|t| *t) => {}
            }
        };

        controller::run_controller(state.clone(), vault.clone(), shutdown).await?;

        if *term_rx.borrow() {
            break;
        }
    }

    info!("Vault Config Operator stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

const LEASE_NAME: &str = "vault-config-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

async fn run_leader_election(
    client: kube::Client,
    namespace: &str,
    identity: &str,
    is_leader: watch::Sender<bool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);

    loop {
        match try_acquire_or_renew(&leases, namespace, identity).await {
            Ok(true) => {
                if !*is_leader.borrow() {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                is_leader.send_if_modified(|held| !std::mem::replace(held, true));
                tokio::time::sleep(RENEW_INTERVAL).await;
            }
            Ok(false) => {
                if *is_leader.borrow() {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
                is_leader.send_if_modified(|held| std::mem::replace(held, false));
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
                is_leader.send_if_modified(|held| std::mem::replace(held, false));
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    match leases.get(LEASE_NAME).await {
        Ok(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

            let resource_version = existing.metadata.resource_version.clone();

            if current_holder == Some(identity) {
                let patch = lease_patch(
                    resource_version,
                    serde_json::json!({
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }),
                );
                return patch_lease(leases, &patch).await;
            }

            let expired = spec
                .and_then(|s| s.renew_time.as_ref())
                .map(|renew| {
                    let duration = spec
                        .and_then(|s| s.lease_duration_seconds)
                        .unwrap_or(LEASE_DURATION_SECS);
                    now > renew.0 + chrono::Duration::seconds(duration as i64)
                })
                .unwrap_or(true);

            if !expired {
                return Ok(false);
            }

            info!("Lease held by {:?} has expired, taking over", current_holder);
            let patch = lease_patch(
                resource_version,
                serde_json::json!({
                    "holderIdentity": identity,
                    "acquireTime": MicroTime(now),
                    "renewTime": MicroTime(now),
                    "leaseDurationSeconds": LEASE_DURATION_SECS,
                }),
            );
            patch_lease(leases, &patch).await
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(k8s_openapi::api::coordination::v1::LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            match leases.create(&PostParams::default(), &lease).await {
                Ok(_) => {
                    info!("Created lease {} with holder {}", LEASE_NAME, identity);
                    Ok(true)
                }
                // Another replica created it first
                Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

/// Merge patch for the lease spec, conditional on the version that was read
fn lease_patch(resource_version: Option<String>, spec: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "resourceVersion": resource_version },
        "spec": spec,
    })
}

/// Apply a lease patch; losing the race to another writer is not an error
async fn patch_lease(leases: &Api<Lease>, patch: &serde_json::Value) -> Result<bool, kube::Error> {
    match leases
        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(patch))
        .await
    {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(err)) if err.code == 409 => {
            info!("Lease {} was updated concurrently", LEASE_NAME);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
