//! Generic reconciler for every Vault-backed resource kind
//!
//! One cycle drives a single resource from its declared spec to the matching
//! Vault object:
//!
//! ```text
//! Pending -> Authenticating -> Fetching -> NoOp | Creating | Updating -> Reporting -> Done
//!                                       \-> Deleting -> Deleted
//! ```
//!
//! Failures end in `Retrying` (requeued with backoff) or `Failed` (terminal
//! until the spec generation changes).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::auth::{is_token_rejection, AuthManager};
use super::backoff::{AttemptTracker, BackoffPolicy};
use super::conditions::{
    clear_condition, conflict_condition, degraded_condition, failed_condition,
    failed_for_generation, find_condition, not_progressing_condition, not_ready_condition,
    ready_condition, upsert_condition, CONDITION_TYPE_CONFLICT, CONDITION_TYPE_DEGRADED,
    CONDITION_TYPE_FAILED, CONDITION_TYPE_PROGRESSING, REASON_AUTH_FAILURE, REASON_IN_SYNC,
    REASON_RECONCILED, REASON_RETRIES_EXHAUSTED, REASON_TRANSIENT_ERROR,
    REASON_VALIDATION_FAILED,
};
use super::identity::IdentityTokenSource;
use super::object::{ManagedObject, StatusSink};
use super::queue::GenerationLedger;
use crate::crd::RemoteObjectStatus;
use crate::error::{Error, ErrorClass, Result};
use crate::vault::{DeleteOutcome, Payload, VaultApi, VaultPath, VaultToken};

/// Where a reconcile cycle is, or where it ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Authenticating,
    Fetching,
    NoOp,
    Creating,
    Updating,
    Deleting,
    Reporting,
    Done,
    Deleted,
    Retrying,
    Failed,
}

/// Result of one reconcile cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Terminal phase of the cycle
    pub phase: Phase,
    /// When the key should be processed again; `None` waits for the next event or resync
    pub requeue_after: Option<Duration>,
    /// Remote mutations issued (writes and deletes)
    pub writes: u32,
    /// The result was discarded because a newer generation arrived mid-cycle
    pub superseded: bool,
}

impl CycleOutcome {
    fn new(phase: Phase, requeue_after: Option<Duration>, writes: u32) -> Self {
        Self {
            phase,
            requeue_after,
            writes,
            superseded: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReconcilerSettings {
    pub backoff: BackoffPolicy,
    /// Delay before a conflicting resource is tried again
    pub conflict_retry: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            conflict_retry: Duration::from_secs(300),
        }
    }
}

pub struct Reconciler<V, I> {
    vault: Arc<V>,
    auth: Arc<AuthManager<V, I>>,
    ledger: Arc<GenerationLedger>,
    attempts: AttemptTracker,
    settings: ReconcilerSettings,
}

impl<V, I> Reconciler<V, I>
where
    V: VaultApi,
    I: IdentityTokenSource,
{
    pub fn new(
        vault: Arc<V>,
        auth: Arc<AuthManager<V, I>>,
        ledger: Arc<GenerationLedger>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            vault,
            auth,
            ledger,
            attempts: AttemptTracker::default(),
            settings,
        }
    }

    pub fn auth(&self) -> &Arc<AuthManager<V, I>> {
        &self.auth
    }

    pub fn ledger(&self) -> &Arc<GenerationLedger> {
        &self.ledger
    }

    /// Run one reconcile cycle for `obj`
    #[instrument(skip_all, fields(object = %obj.object_key(), generation = ?obj.generation()))]
    pub async fn reconcile<K, S>(&self, obj: &K, sink: &S) -> CycleOutcome
    where
        K: ManagedObject,
        S: StatusSink<K>,
    {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        let key = obj.object_key();
        self.ledger.observe(&key, obj.generation());

        let outcome = if obj.is_being_deleted() {
            self.finalize(obj, sink).await
        } else {
            self.apply(obj, sink).await
        };

        debug!(phase = ?outcome.phase, writes = outcome.writes, superseded = outcome.superseded, "Cycle finished");

        #[cfg(feature = "metrics")]
        super::metrics::observe_reconcile_duration_seconds(
            &key.kind,
            started.elapsed().as_secs_f64(),
        );

        outcome
    }

    async fn apply<K, S>(&self, obj: &K, sink: &S) -> CycleOutcome
    where
        K: ManagedObject,
        S: StatusSink<K>,
    {
        let generation = obj.generation();

        if failed_for_generation(obj.conditions(), generation) {
            debug!("Spec already failed validation at this generation, skipping");
            return CycleOutcome::new(Phase::Failed, None, 0);
        }

        let path = match obj.validate().and_then(|_| obj.remote_path()) {
            Ok(path) => path,
            Err(e) => return self.report_failure(obj, sink, e, 0).await,
        };

        if !obj.has_finalizer() {
            if let Err(e) = sink.add_finalizer(obj).await {
                return self.report_failure(obj, sink, e, 0).await;
            }
        }

        let mut writes = 0;
        match self.sync(obj, &path, &mut writes).await {
            Ok(action) => self.report_success(obj, sink, &path, action, writes).await,
            Err(e) => self.report_failure(obj, sink, e, writes).await,
        }
    }

    /// Bring the Vault object at `path` in line with the spec
    ///
    /// Returns `NoOp`, `Creating` or `Updating` for the action taken.
    async fn sync<K: ManagedObject>(
        &self,
        obj: &K,
        path: &VaultPath,
        writes: &mut u32,
    ) -> Result<Phase> {
        debug!(phase = ?Phase::Authenticating, "Acquiring Vault token");
        let mut token = self
            .auth
            .acquire(obj.auth_configuration(), &obj.identity_namespace())
            .await?;

        debug!(phase = ?Phase::Fetching, %path, "Reading remote object");
        let observed = self.read_remote(obj, &mut token, path).await?;
        if obj.is_equivalent_to_desired_state(observed.as_ref()) {
            debug!(phase = ?Phase::NoOp, %path, "Remote object already matches spec");
            return Ok(Phase::NoOp);
        }

        let desired = obj.desired_payload();
        let action = if observed.is_none() {
            Phase::Creating
        } else {
            Phase::Updating
        };
        debug!(phase = ?action, %path, "Writing remote object");

        match self.write_remote(obj, &mut token, path, &desired).await {
            Ok(()) => {
                *writes += 1;
                self.record_write(obj, action);
                Ok(action)
            }
            Err(Error::Conflict(detail)) => {
                info!(%path, "Write conflicted ({}), re-reading once", detail);
                let observed = self.read_remote(obj, &mut token, path).await?;
                if obj.is_equivalent_to_desired_state(observed.as_ref()) {
                    return Ok(Phase::NoOp);
                }
                self.write_remote(obj, &mut token, path, &desired).await?;
                *writes += 1;
                let action = if observed.is_none() {
                    Phase::Creating
                } else {
                    Phase::Updating
                };
                self.record_write(obj, action);
                Ok(action)
            }
            Err(e) => Err(e),
        }
    }

    async fn finalize<K, S>(&self, obj: &K, sink: &S) -> CycleOutcome
    where
        K: ManagedObject,
        S: StatusSink<K>,
    {
        let key = obj.object_key();
        if !obj.has_finalizer() {
            self.forget(&key);
            return CycleOutcome::new(Phase::Deleted, None, 0);
        }

        let mut writes = 0;
        let deleted = match obj.remote_path() {
            Ok(path) => self.delete(obj, &path, &mut writes).await,
            Err(e) => {
                info!("Path is unresolvable ({}), nothing was written to Vault", e);
                Ok(())
            }
        };

        let result = match deleted {
            Ok(()) => sink.remove_finalizer(obj).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!("Removed remote object and released finalizer");
                self.forget(&key);
                CycleOutcome::new(Phase::Deleted, None, writes)
            }
            Err(e) => {
                let attempt = self.attempts.record_failure(&key);
                let delay = self.settings.backoff.delay(attempt);
                warn!(class = e.class().as_str(), attempt, "Remote cleanup failed, retrying in {:?}: {}", delay, e);
                self.record_error(obj, e.class());
                self.emit(obj, sink, "CleanupFailed", &e.to_string()).await;
                CycleOutcome::new(Phase::Retrying, Some(delay), writes)
            }
        }
    }

    async fn delete<K: ManagedObject>(
        &self,
        obj: &K,
        path: &VaultPath,
        writes: &mut u32,
    ) -> Result<()> {
        let mut token = self
            .auth
            .acquire(obj.auth_configuration(), &obj.identity_namespace())
            .await?;

        debug!(phase = ?Phase::Deleting, %path, "Deleting remote object");
        match self.delete_remote(obj, &mut token, path).await? {
            DeleteOutcome::Deleted => {
                *writes += 1;
                self.record_write(obj, Phase::Deleting);
            }
            DeleteOutcome::NotFound => debug!(%path, "Remote object already absent"),
        }
        Ok(())
    }

    async fn read_remote<K: ManagedObject>(
        &self,
        obj: &K,
        token: &mut VaultToken,
        path: &VaultPath,
    ) -> Result<Option<Payload>> {
        match self.vault.read(token, path).await {
            Err(e) if is_token_rejection(&e) => {
                self.refresh_token(obj, token).await?;
                self.settle(obj, token, self.vault.read(token, path).await).await
            }
            other => other,
        }
    }

    async fn write_remote<K: ManagedObject>(
        &self,
        obj: &K,
        token: &mut VaultToken,
        path: &VaultPath,
        payload: &Payload,
    ) -> Result<()> {
        match self.vault.write(token, path, payload).await {
            Err(e) if is_token_rejection(&e) => {
                self.refresh_token(obj, token).await?;
                self.settle(obj, token, self.vault.write(token, path, payload).await)
                    .await
            }
            other => other,
        }
    }

    async fn delete_remote<K: ManagedObject>(
        &self,
        obj: &K,
        token: &mut VaultToken,
        path: &VaultPath,
    ) -> Result<DeleteOutcome> {
        match self.vault.delete(token, path).await {
            Err(e) if is_token_rejection(&e) => {
                self.refresh_token(obj, token).await?;
                self.settle(obj, token, self.vault.delete(token, path).await)
                    .await
            }
            other => other,
        }
    }

    /// Evict a token the server refused and log in again
    async fn refresh_token<K: ManagedObject>(&self, obj: &K, token: &mut VaultToken) -> Result<()> {
        let cfg = obj.auth_configuration();
        let namespace = obj.identity_namespace();
        debug!("Vault rejected the cached token, logging in again");
        self.auth.evict(cfg, &namespace, token).await;
        *token = self.auth.acquire(cfg, &namespace).await?;
        Ok(())
    }

    /// A second rejection with a fresh token is final for this cycle
    async fn settle<K: ManagedObject, T>(
        &self,
        obj: &K,
        token: &VaultToken,
        result: Result<T>,
    ) -> Result<T> {
        if let Err(e) = &result {
            if is_token_rejection(e) {
                self.auth
                    .evict(obj.auth_configuration(), &obj.identity_namespace(), token)
                    .await;
            }
        }
        result
    }

    async fn report_success<K, S>(
        &self,
        obj: &K,
        sink: &S,
        path: &VaultPath,
        action: Phase,
        writes: u32,
    ) -> CycleOutcome
    where
        K: ManagedObject,
        S: StatusSink<K>,
    {
        let key = obj.object_key();
        let generation = obj.generation();
        self.attempts.reset(&key);

        let (reason, message) = match action {
            Phase::NoOp => (REASON_IN_SYNC, format!("{path} matches the declared spec")),
            Phase::Creating => (REASON_RECONCILED, format!("Created {path}")),
            _ => (REASON_RECONCILED, format!("Updated {path}")),
        };

        let mut status = current_status(obj);
        upsert_condition(
            &mut status,
            ready_condition(reason, &message).with_generation(generation),
        );
        for type_ in [
            CONDITION_TYPE_FAILED,
            CONDITION_TYPE_CONFLICT,
            CONDITION_TYPE_DEGRADED,
        ] {
            clear_condition(&mut status, type_, generation, "Reconciled successfully");
        }
        if find_condition(&status.conditions, CONDITION_TYPE_PROGRESSING).is_some() {
            upsert_condition(
                &mut status,
                not_progressing_condition(REASON_RECONCILED, "No change in progress")
                    .with_generation(generation),
            );
        }
        status.observed_generation = generation;

        if action != Phase::NoOp {
            info!(%path, action = ?action, "Reconciled remote object");
        }
        self.finish(obj, sink, status, CycleOutcome::new(Phase::Done, None, writes))
            .await
    }

    async fn report_failure<K, S>(&self, obj: &K, sink: &S, err: Error, writes: u32) -> CycleOutcome
    where
        K: ManagedObject,
        S: StatusSink<K>,
    {
        let key = obj.object_key();
        let generation = obj.generation();
        let class = err.class();
        let message = err.to_string();
        self.record_error(obj, class);

        let mut status = current_status(obj);
        let outcome = match class {
            ErrorClass::Validation => {
                warn!("Spec rejected: {}", message);
                self.attempts.reset(&key);
                upsert_condition(
                    &mut status,
                    failed_condition(REASON_VALIDATION_FAILED, &message).with_generation(generation),
                );
                upsert_condition(
                    &mut status,
                    not_ready_condition(REASON_VALIDATION_FAILED, &message)
                        .with_generation(generation),
                );
                self.emit(obj, sink, REASON_VALIDATION_FAILED, &message).await;
                CycleOutcome::new(Phase::Failed, None, writes)
            }
            ErrorClass::Conflict => {
                warn!("Remote object keeps changing underneath us: {}", message);
                upsert_condition(
                    &mut status,
                    conflict_condition(&message).with_generation(generation),
                );
                CycleOutcome::new(Phase::Retrying, Some(self.settings.conflict_retry), writes)
            }
            ErrorClass::Auth | ErrorClass::Transient => {
                let attempt = self.attempts.record_failure(&key);
                let delay = self.settings.backoff.delay(attempt);
                warn!(class = class.as_str(), attempt, "Reconcile failed, retrying in {:?}: {}", delay, message);

                if class == ErrorClass::Auth {
                    upsert_condition(
                        &mut status,
                        not_ready_condition(REASON_AUTH_FAILURE, &message)
                            .with_generation(generation),
                    );
                } else {
                    upsert_condition(
                        &mut status,
                        not_progressing_condition(REASON_TRANSIENT_ERROR, &message)
                            .with_generation(generation),
                    );
                }
                if self.settings.backoff.exhausted(attempt + 1) {
                    upsert_condition(
                        &mut status,
                        degraded_condition(
                            REASON_RETRIES_EXHAUSTED,
                            &format!("{} consecutive failures, last: {message}", attempt + 1),
                        )
                        .with_generation(generation),
                    );
                    self.emit(obj, sink, REASON_RETRIES_EXHAUSTED, &message).await;
                }
                CycleOutcome::new(Phase::Retrying, Some(delay), writes)
            }
        };

        self.finish(obj, sink, status, outcome).await
    }

    /// Reporting: write status unless a newer generation superseded this cycle
    async fn finish<K, S>(
        &self,
        obj: &K,
        sink: &S,
        status: RemoteObjectStatus,
        outcome: CycleOutcome,
    ) -> CycleOutcome
    where
        K: ManagedObject,
        S: StatusSink<K>,
    {
        debug!(phase = ?Phase::Reporting, "Reporting status");
        if self.ledger.is_stale(&obj.object_key(), obj.generation()) {
            info!("Newer generation observed during the cycle, discarding result");
            return CycleOutcome {
                phase: Phase::Pending,
                requeue_after: Some(Duration::ZERO),
                writes: outcome.writes,
                superseded: true,
            };
        }

        if obj.remote_status() == Some(&status) {
            return outcome;
        }
        match sink.patch_status(obj, &status).await {
            Ok(()) => outcome,
            Err(e) => {
                warn!("Failed to update status: {}", e);
                let attempt = self.attempts.record_failure(&obj.object_key());
                CycleOutcome {
                    phase: Phase::Retrying,
                    requeue_after: Some(self.settings.backoff.delay(attempt)),
                    ..outcome
                }
            }
        }
    }

    async fn emit<K, S>(&self, obj: &K, sink: &S, reason: &str, message: &str)
    where
        K: ManagedObject,
        S: StatusSink<K>,
    {
        if let Err(e) = sink.emit_event(obj, "Warning", reason, message).await {
            debug!("Failed to emit event: {}", e);
        }
    }

    /// Drop per-key bookkeeping for an object that no longer exists
    pub fn forget(&self, key: &super::object::ObjectKey) {
        self.attempts.reset(key);
        self.ledger.forget(key);
    }

    /// Consecutive failed cycles recorded for `key`
    pub fn failed_attempts(&self, key: &super::object::ObjectKey) -> u32 {
        self.attempts.get(key)
    }

    #[allow(unused_variables)]
    fn record_write<K: ManagedObject>(&self, obj: &K, action: Phase) {
        #[cfg(feature = "metrics")]
        {
            let operation = match action {
                Phase::Creating => "create",
                Phase::Deleting => "delete",
                _ => "update",
            };
            super::metrics::inc_remote_write(&obj.object_key().kind, operation);
        }
    }

    #[allow(unused_variables)]
    fn record_error<K: ManagedObject>(&self, obj: &K, class: ErrorClass) {
        #[cfg(feature = "metrics")]
        super::metrics::inc_reconcile_error(&obj.object_key().kind, class.as_str());
    }
}

fn current_status<K: ManagedObject>(obj: &K) -> RemoteObjectStatus {
    obj.remote_status().cloned().unwrap_or_default()
}
