//! Upload workers and the credential monitor.

use crate::artifact::Artifact;
use crate::config::SharedSettings;
use crate::error::AgentError;
use crate::queue::{Lease, RetryOutcome, UploadQueue};
use crate::remote::{PutOptions, RemoteStore, TransferError};
use crate::shutdown::Shutdown;
use crate::storage::{LocalStore, StorageError};
use crate::transparency::SharedTransparencyLog;
use std::sync::Arc;

/// Result of processing one lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Uploaded,
    /// Already present remotely; the staged copy was released without a put
    AlreadyRemote,
    Retrying { attempts: u32 },
    Failed { attempts: u32 },
    /// Credentials rejected; the entry went back to pending and workers paused
    Suspended,
}

/// One member of the worker pool.
pub struct UploadWorker {
    id: usize,
    queue: Arc<UploadQueue>,
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    settings: SharedSettings,
    transparency: SharedTransparencyLog,
}

impl UploadWorker {
    pub fn new(
        id: usize,
        queue: Arc<UploadQueue>,
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        settings: SharedSettings,
        transparency: SharedTransparencyLog,
    ) -> Self {
        Self {
            id,
            queue,
            store,
            remote,
            settings,
            transparency,
        }
    }

    /// Drain the queue until shutdown. A lease taken before shutdown is
    /// always carried to a state transition before the worker exits.
    pub async fn run(self, mut shutdown: Shutdown) {
        tracing::debug!(worker = self.id, "upload worker started");
        while let Some(lease) = self.queue.next_due(&mut shutdown).await {
            self.process(lease).await;
        }
        tracing::debug!(worker = self.id, "upload worker stopped");
    }

    pub async fn process(&self, lease: Lease) -> Attempt {
        let artifact = lease.artifact;
        let settings = self.settings.current();
        let key = artifact.remote_key(&settings.key_prefix);

        let body = match self.store.read(&artifact) {
            Ok(body) => body,
            Err(e @ StorageError::NotFound(_)) => {
                let error = TransferError::Permanent {
                    status: None,
                    message: format!("staged copy missing: {e}"),
                };
                return self.fail(&artifact, &error);
            }
            Err(e) => {
                return self.retry(&artifact, &TransferError::Transient(e.to_string()));
            }
        };

        // A recovered or retried artifact may have reached the store before
        // the last attempt lost its acknowledgement.
        if lease.recovered || artifact.attempts > 0 {
            match self.remote.exists(&key).await {
                Ok(true) => {
                    tracing::info!(
                        artifact_id = %artifact.id,
                        key = %key,
                        "artifact already in remote store"
                    );
                    self.finish(&artifact);
                    return Attempt::AlreadyRemote;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(artifact_id = %artifact.id, error = %e, "existence check failed");
                }
            }
        }

        let options = PutOptions {
            content_type: artifact.kind().content_type().to_string(),
            encrypt_at_rest: settings.encrypt_at_rest,
            compress: settings.compress,
        };

        match self.remote.put(&key, body, &options).await {
            Ok(()) => {
                tracing::info!(
                    worker = self.id,
                    artifact_id = %artifact.id,
                    attempt = artifact.attempts + 1,
                    key = %key,
                    "artifact uploaded"
                );
                self.finish(&artifact);
                Attempt::Uploaded
            }
            Err(e @ TransferError::Transient(_)) => self.retry(&artifact, &e),
            Err(e @ TransferError::Credential(_)) => {
                tracing::warn!(
                    artifact_id = %artifact.id,
                    attempt = artifact.attempts + 1,
                    error_class = e.class(),
                    error = %e,
                    "credentials rejected, pausing uploads"
                );
                if let Err(qe) = self.queue.suspend(artifact.id, &e) {
                    tracing::error!(artifact_id = %artifact.id, error = %qe, "queue transition failed");
                }
                Attempt::Suspended
            }
            Err(e @ TransferError::Permanent { .. }) => self.fail(&artifact, &e),
        }
    }

    fn finish(&self, artifact: &Artifact) {
        if let Err(e) = self.queue.complete(artifact.id) {
            tracing::error!(artifact_id = %artifact.id, error = %e, "queue transition failed");
        }
        if let Err(e) = self.store.remove(artifact) {
            tracing::warn!(artifact_id = %artifact.id, error = %e, "could not release staged copy");
        }
        self.transparency.record_uploaded();
    }

    fn retry(&self, artifact: &Artifact, error: &TransferError) -> Attempt {
        match self.queue.retry(artifact.id, error) {
            Ok(RetryOutcome::Scheduled { attempts, delay }) => {
                tracing::warn!(
                    artifact_id = %artifact.id,
                    attempt = attempts,
                    error_class = error.class(),
                    error = %error,
                    retry_in_secs = delay.as_secs_f64(),
                    "upload failed, will retry"
                );
                let mut updated = artifact.clone();
                updated.attempts = attempts;
                if let Err(e) = self.store.record_attempts(&updated) {
                    tracing::warn!(artifact_id = %artifact.id, error = %e, "could not persist attempt count");
                }
                Attempt::Retrying { attempts }
            }
            Ok(RetryOutcome::Exhausted { attempts }) => {
                self.quarantine(artifact, attempts, error);
                Attempt::Failed { attempts }
            }
            Err(e) => {
                tracing::error!(artifact_id = %artifact.id, error = %e, "queue transition failed");
                Attempt::Failed {
                    attempts: artifact.attempts,
                }
            }
        }
    }

    fn fail(&self, artifact: &Artifact, error: &TransferError) -> Attempt {
        let attempts = match self.queue.fail(artifact.id, error) {
            Ok(attempts) => attempts,
            Err(e) => {
                tracing::error!(artifact_id = %artifact.id, error = %e, "queue transition failed");
                artifact.attempts
            }
        };
        self.quarantine(artifact, attempts, error);
        Attempt::Failed { attempts }
    }

    fn quarantine(&self, artifact: &Artifact, attempts: u32, error: &TransferError) {
        tracing::error!(
            artifact_id = %artifact.id,
            kind = ?artifact.kind(),
            file = %artifact.file_name(),
            attempt = attempts,
            error_class = error.class(),
            error = %error,
            "artifact failed permanently"
        );
        match self.store.quarantine(artifact, &error.to_string()) {
            Ok(path) => tracing::info!(artifact_id = %artifact.id, path = ?path, "artifact moved to failed/"),
            Err(e) => tracing::warn!(artifact_id = %artifact.id, error = %e, "could not quarantine artifact"),
        }
        self.transparency.record_failed();
    }
}

/// Check credentials until they are accepted, at most `max_checks` times.
///
/// Transient failures count as "not a credential problem" and end the check.
pub async fn verify_credentials(
    remote: &dyn RemoteStore,
    settings: &SharedSettings,
    shutdown: &mut Shutdown,
) -> Result<(), AgentError> {
    let max_checks = settings.current().max_credential_refreshes.max(1);
    let mut last_error = String::new();

    for check in 1..=max_checks {
        match remote.check_credentials().await {
            Ok(()) => return Ok(()),
            Err(TransferError::Credential(e)) => {
                tracing::warn!(check, max_checks, error = %e, "credentials not accepted yet");
                last_error = e;
            }
            Err(e) => {
                tracing::warn!(error = %e, error_class = e.class(), "credential check inconclusive, continuing");
                return Ok(());
            }
        }
        if check < max_checks {
            let interval = settings.current().credential_check_interval;
            if !shutdown.sleep(interval).await {
                return Ok(());
            }
        }
    }

    Err(AgentError::NoCredentials {
        attempts: max_checks,
        last_error,
    })
}

/// While the queue is paused for credentials, re-check them on the
/// configured interval and resume the workers once they are accepted.
pub async fn monitor_credentials(
    queue: Arc<UploadQueue>,
    remote: Arc<dyn RemoteStore>,
    settings: SharedSettings,
    mut shutdown: Shutdown,
) {
    let mut paused = queue.subscribe_paused();
    loop {
        tokio::select! {
            _ = shutdown.requested() => break,
            changed = async { paused.wait_for(|p| *p).await.map(|_| ()) } => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let mut checks = 0u32;
        loop {
            let interval = settings.current().credential_check_interval;
            if !shutdown.sleep(interval).await {
                return;
            }
            checks += 1;
            match remote.check_credentials().await {
                Ok(()) => {
                    tracing::info!(checks, "credentials accepted");
                    queue.resume();
                    break;
                }
                Err(e) => {
                    tracing::warn!(checks, error_class = e.class(), error = %e, "uploads still paused");
                }
            }
        }
    }
}
