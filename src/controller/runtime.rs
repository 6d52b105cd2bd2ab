//! Cluster runtime: watchers, resync and the worker pool
//!
//! Each resource kind gets a reflector-backed watcher. Every touched object
//! records its generation in the ledger and enqueues its key; a periodic
//! resync enqueues every cached object. Workers look the key up in the
//! matching store and hand the object to the shared [`Reconciler`].

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{future::join_all, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, ListParams},
    runtime::{
        reflector::{self, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Client, Resource,
};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::auth::{AuthManager, DEFAULT_RENEW_FRACTION};
use super::finalizers::KubeStatusSink;
use super::identity::KubeTokenRequest;
use super::object::{ManagedObject, ObjectKey};
use super::queue::{run_workers, GenerationLedger, WorkQueue};
use super::reconciler::{Reconciler, ReconcilerSettings};
use crate::crd::{DatabaseSecretEngineRole, DatabaseSecretEngineStaticRole, KubernetesAuthEngineRole};
use crate::error::{Error, Result};
use crate::vault::VaultApi;

/// Tunables for the controller, built from CLI flags
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub workers: usize,
    pub resync_interval: Duration,
    /// Restrict watches to one namespace; all namespaces when `None`
    pub watch_namespace: Option<String>,
    pub token_renew_fraction: f64,
    pub token_request_expiration_secs: i64,
    pub reconciler: ReconcilerSettings,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(300),
            watch_namespace: None,
            token_renew_fraction: DEFAULT_RENEW_FRACTION,
            token_request_expiration_secs: 600,
            reconciler: ReconcilerSettings::default(),
        }
    }
}

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub settings: ControllerSettings,
    /// Current leadership, updated by leader election
    pub leader: watch::Receiver<bool>,
}

impl ControllerState {
    pub fn is_leader(&self) -> bool {
        *self.leader.borrow()
    }
}

fn api_for<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Fail fast when a CRD is not installed
async fn ensure_crd<K>(client: &Client, namespace: Option<&str>) -> Result<()>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug,
{
    let api: Api<K> = api_for(client, namespace);
    match api.list(&ListParams::default().limit(1)).await {
        Ok(_) => {
            info!("{} CRD is available", K::kind(&()));
            Ok(())
        }
        Err(e) => {
            error!(
                "{} CRD not found. Please install the CRDs first: {:?}",
                K::kind(&()),
                e
            );
            Err(Error::ConfigError(format!("{} CRD not installed", K::kind(&()))))
        }
    }
}

/// Start a reflector for `K`, feeding touched objects into the queue
fn watch_kind<K>(
    client: &Client,
    namespace: Option<&str>,
    queue: Arc<WorkQueue<ObjectKey>>,
    ledger: Arc<GenerationLedger>,
) -> (Store<K>, tokio::task::JoinHandle<()>)
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + ManagedObject
        + Clone
        + DeserializeOwned
        + Debug
        + 'static,
{
    let api: Api<K> = api_for(client, namespace);
    let (reader, writer) = reflector::store();
    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .touched_objects();

    let task = tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(obj) => {
                    let key = obj.object_key();
                    ledger.observe(&key, obj.generation());
                    debug!(object = %key, generation = ?obj.generation(), "Watch event");
                    queue.add(key);
                }
                Err(e) => warn!("{} watch error: {}", K::kind(&()), e),
            }
        }
    });
    (reader, task)
}

/// Object caches and shared collaborators used by workers
struct Context<V: VaultApi> {
    static_roles: Store<DatabaseSecretEngineStaticRole>,
    roles: Store<DatabaseSecretEngineRole>,
    auth_roles: Store<KubernetesAuthEngineRole>,
    reconciler: Reconciler<V, KubeTokenRequest>,
    sink: KubeStatusSink,
}

impl<V: VaultApi + 'static> Context<V> {
    async fn process(&self, key: ObjectKey) -> Option<Duration> {
        if key.kind == DatabaseSecretEngineStaticRole::kind(&()) {
            self.reconcile_from(&self.static_roles, &key).await
        } else if key.kind == DatabaseSecretEngineRole::kind(&()) {
            self.reconcile_from(&self.roles, &key).await
        } else if key.kind == KubernetesAuthEngineRole::kind(&()) {
            self.reconcile_from(&self.auth_roles, &key).await
        } else {
            warn!(object = %key, "No store for kind");
            None
        }
    }

    async fn reconcile_from<K>(&self, store: &Store<K>, key: &ObjectKey) -> Option<Duration>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + ManagedObject
            + Clone
            + DeserializeOwned
            + Debug
            + serde::Serialize
            + 'static,
    {
        let obj_ref = ObjectRef::<K>::new(&key.name).within(&key.namespace);
        match store.get(&obj_ref) {
            Some(obj) => {
                let outcome = self.reconciler.reconcile(obj.as_ref(), &self.sink).await;
                outcome.requeue_after
            }
            None => {
                debug!(object = %key, "Object no longer exists");
                self.reconciler.forget(key);
                None
            }
        }
    }

    fn resync(&self, queue: &WorkQueue<ObjectKey>) {
        let ledger = self.reconciler.ledger();
        let mut keys = Vec::new();
        for obj in self.static_roles.state() {
            ledger.observe(&obj.object_key(), obj.generation());
            keys.push(obj.object_key());
        }
        for obj in self.roles.state() {
            ledger.observe(&obj.object_key(), obj.generation());
            keys.push(obj.object_key());
        }
        for obj in self.auth_roles.state() {
            ledger.observe(&obj.object_key(), obj.generation());
            keys.push(obj.object_key());
        }
        debug!(count = keys.len(), "Resync");
        for key in keys {
            queue.add(key);
        }
    }
}

/// Main entry point to start the controller
///
/// Runs until `shutdown` resolves, then stops accepting work, lets workers
/// finish their current cycle and clears the token cache.
pub async fn run_controller<V, F>(state: Arc<ControllerState>, vault: Arc<V>, shutdown: F) -> Result<()>
where
    V: VaultApi + 'static,
    F: Future<Output = ()> + Send,
{
    let client = state.client.clone();
    let settings = state.settings.clone();
    let namespace = settings.watch_namespace.as_deref();

    info!(
        workers = settings.workers,
        resync_secs = settings.resync_interval.as_secs(),
        namespace = namespace.unwrap_or("<all>"),
        "Starting Vault config controller"
    );

    ensure_crd::<DatabaseSecretEngineStaticRole>(&client, namespace).await?;
    ensure_crd::<DatabaseSecretEngineRole>(&client, namespace).await?;
    ensure_crd::<KubernetesAuthEngineRole>(&client, namespace).await?;

    let identity = Arc::new(KubeTokenRequest::new(
        client.clone(),
        settings.token_request_expiration_secs,
    ));
    let auth = Arc::new(AuthManager::new(
        vault.clone(),
        identity,
        settings.token_renew_fraction,
    ));
    let ledger = Arc::new(GenerationLedger::default());
    let queue = Arc::new(WorkQueue::<ObjectKey>::new());

    let (static_roles, static_task) =
        watch_kind::<DatabaseSecretEngineStaticRole>(&client, namespace, queue.clone(), ledger.clone());
    let (roles, roles_task) =
        watch_kind::<DatabaseSecretEngineRole>(&client, namespace, queue.clone(), ledger.clone());
    let (auth_roles, auth_task) =
        watch_kind::<KubernetesAuthEngineRole>(&client, namespace, queue.clone(), ledger.clone());
    let watchers = [static_task, roles_task, auth_task];

    let ctx = Arc::new(Context {
        static_roles,
        roles,
        auth_roles,
        reconciler: Reconciler::new(vault, auth.clone(), ledger, settings.reconciler.clone()),
        sink: KubeStatusSink::new(client.clone()),
    });

    let resync_task = {
        let ctx = ctx.clone();
        let queue = queue.clone();
        let interval = settings.resync_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                ctx.resync(&queue);
            }
        })
    };

    let workers = {
        let ctx = ctx.clone();
        tokio::spawn(run_workers(
            queue.clone(),
            settings.workers,
            move |key: ObjectKey| {
                let ctx = ctx.clone();
                async move { ctx.process(key).await }
            },
        ))
    };

    shutdown.await;
    info!("Shutting down controller");

    queue.shutdown();
    resync_task.abort();
    for task in &watchers {
        task.abort();
    }
    if let Err(e) = workers.await {
        warn!("Worker pool ended abnormally: {}", e);
    }
    join_all(watchers).await;
    auth.clear();

    info!("Controller stopped");
    Ok(())
}
