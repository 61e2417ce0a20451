//! End-to-end tests of the agent against an in-memory object store.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use input_sentinel::capture::NoopCapture;
use input_sentinel::config::ConfigError;
use input_sentinel::remote::PutOptions;
use input_sentinel::transparency::create_shared_log;
use input_sentinel::{
    Agent, AgentError, AgentParts, Artifact, ArtifactPayload, Clock, ImageData, InputEvent,
    LocalStore, RemoteStore, Settings, SettingsProvider, TransferError,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MemoryStore {
    objects: Mutex<Vec<String>>,
    /// Puts fail transiently while this is set
    offline: AtomicBool,
    /// Puts and credential checks (after the first) fail while this is set
    expired: AtomicBool,
    checks: AtomicU32,
    puts: AtomicU32,
    /// Fail each key's first put with a transient error
    flaky: bool,
    attempted: Mutex<Vec<String>>,
}

impl MemoryStore {
    fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        _body: Vec<u8>,
        _options: &PutOptions,
    ) -> Result<(), TransferError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransferError::Transient("connection refused".into()));
        }
        if self.expired.load(Ordering::SeqCst) {
            return Err(TransferError::Credential("token expired".into()));
        }
        if self.flaky {
            let mut attempted = self.attempted.lock().unwrap();
            if !attempted.iter().any(|k| k == key) {
                attempted.push(key.to_string());
                return Err(TransferError::Transient("503 slow down".into()));
            }
        }
        let mut objects = self.objects.lock().unwrap();
        if !objects.iter().any(|k| k == key) {
            objects.push(key.to_string());
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, TransferError> {
        Ok(self.objects.lock().unwrap().iter().any(|k| k == key))
    }

    async fn check_credentials(&self) -> Result<(), TransferError> {
        let first = self.checks.fetch_add(1, Ordering::SeqCst) == 0;
        if !first && self.expired.load(Ordering::SeqCst) {
            return Err(TransferError::Credential("token expired".into()));
        }
        Ok(())
    }
}

struct FixedSettings(Settings);

impl SettingsProvider for FixedSettings {
    fn reload(&self) -> Result<Settings, ConfigError> {
        Ok(self.0.clone())
    }
}

fn settings(dir: &Path) -> Settings {
    Settings {
        capture_screenshots: false,
        evaluate_interval: Duration::from_millis(100),
        backoff_base: Duration::from_millis(50),
        backoff_cap: Duration::from_millis(200),
        credential_check_interval: Duration::from_millis(50),
        settings_poll_interval: Duration::from_secs(3600),
        timezone_poll_interval: Duration::from_secs(3600),
        workers: 2,
        staging_path: dir.join("staging"),
        data_path: dir.join("data"),
        ..Settings::default()
    }
}

fn agent(settings: Settings, remote: Arc<MemoryStore>) -> Agent {
    Agent::new(AgentParts {
        provider: Arc::new(FixedSettings(settings.clone())),
        settings,
        clock: Arc::new(Clock::system()),
        remote,
        capture: Arc::new(NoopCapture),
        transparency: create_shared_log(),
    })
    .unwrap()
}

fn stage_screenshots(staging: &Path, count: usize) -> Vec<Artifact> {
    let store = LocalStore::open(staging).unwrap();
    let clock = Clock::system();
    (0..count)
        .map(|i| {
            let artifact = Artifact::screenshot(vec![i as u8; 64], &clock);
            store.stage(&artifact).unwrap();
            artifact
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recovered_artifacts_are_uploaded_despite_transient_failures() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let staged = stage_screenshots(&settings.staging_path, 5);

    let remote = Arc::new(MemoryStore {
        flaky: true,
        ..MemoryStore::default()
    });
    let agent = agent(settings.clone(), remote.clone());
    let trigger = agent.shutdown_trigger();
    let (_hook, events) = crossbeam_channel::bounded::<InputEvent>(16);

    let run = tokio::spawn(agent.run(events));
    tokio::time::sleep(Duration::from_secs(1)).await;
    trigger.trigger();
    let summary = run.await.unwrap().unwrap();

    assert_eq!(summary.recovered, 5);
    assert_eq!(summary.queue.uploaded, 5);
    assert_eq!(summary.left_pending, 0);

    let keys = remote.keys();
    for artifact in &staged {
        assert!(keys.contains(&artifact.remote_key(&settings.key_prefix)));
    }
    let store = LocalStore::open(&settings.staging_path).unwrap();
    assert!(store.recover().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_keeps_every_pending_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        max_attempts: 100,
        ..settings(dir.path())
    };
    let staged = stage_screenshots(&settings.staging_path, 4);

    let remote = Arc::new(MemoryStore::default());
    remote.offline.store(true, Ordering::SeqCst);
    let agent = agent(settings.clone(), remote.clone());
    let trigger = agent.shutdown_trigger();
    let (_hook, events) = crossbeam_channel::bounded::<InputEvent>(16);

    let run = tokio::spawn(agent.run(events));
    tokio::time::sleep(Duration::from_millis(400)).await;
    trigger.trigger();
    let summary = run.await.unwrap().unwrap();

    assert_eq!(summary.queue.uploaded, 0);
    assert_eq!(summary.left_pending, 4);

    let store = LocalStore::open(&settings.staging_path).unwrap();
    let recovered = store.recover().unwrap();
    assert_eq!(recovered.len(), 4);
    for artifact in &staged {
        let found = recovered.iter().find(|a| a.id == artifact.id).unwrap();
        assert!(found.attempts >= 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_credential_outage_pauses_then_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let staged = stage_screenshots(&settings.staging_path, 3);

    let remote = Arc::new(MemoryStore::default());
    remote.expired.store(true, Ordering::SeqCst);
    let agent = agent(settings.clone(), remote.clone());
    let queue = agent.queue().clone();
    let trigger = agent.shutdown_trigger();
    let (_hook, events) = crossbeam_channel::bounded::<InputEvent>(16);

    let run = tokio::spawn(agent.run(events));
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(queue.is_paused());
    assert!(remote.keys().is_empty());
    for artifact in &staged {
        let entry = queue.entry(&artifact.id).unwrap();
        assert_eq!(entry.artifact.attempts, 0);
    }

    remote.expired.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!queue.is_paused());
    assert_eq!(remote.keys().len(), 3);

    trigger.trigger();
    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.queue.uploaded, 3);
    assert_eq!(summary.queue.failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_startup_fails_without_credentials() {
    struct Locked;

    #[async_trait]
    impl RemoteStore for Locked {
        async fn put(&self, _: &str, _: Vec<u8>, _: &PutOptions) -> Result<(), TransferError> {
            Err(TransferError::Credential("denied".into()))
        }
        async fn exists(&self, _: &str) -> Result<bool, TransferError> {
            Ok(false)
        }
        async fn check_credentials(&self) -> Result<(), TransferError> {
            Err(TransferError::Credential("denied".into()))
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        max_credential_refreshes: 2,
        credential_check_interval: Duration::from_millis(10),
        ..settings(dir.path())
    };
    let agent = Agent::new(AgentParts {
        provider: Arc::new(FixedSettings(settings.clone())),
        settings,
        clock: Arc::new(Clock::system()),
        remote: Arc::new(Locked),
        capture: Arc::new(NoopCapture),
        transparency: create_shared_log(),
    })
    .unwrap();
    let (_hook, events) = crossbeam_channel::bounded::<InputEvent>(16);

    let err = agent.run(events).await.unwrap_err();
    assert!(matches!(err, AgentError::NoCredentials { attempts: 2, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_regular_typing_is_logged_and_uploaded() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let remote = Arc::new(MemoryStore::default());
    let agent = agent(settings.clone(), remote.clone());
    let trigger = agent.shutdown_trigger();
    let (hook, events) = crossbeam_channel::bounded::<InputEvent>(64);

    let run = tokio::spawn(agent.run(events));

    let base = Utc::now() - ChronoDuration::seconds(1);
    for i in 0..10 {
        hook.send(InputEvent::key(4, base + ChronoDuration::milliseconds(i * 50)))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    trigger.trigger();
    run.await.unwrap().unwrap();

    let keys = remote.keys();
    assert_eq!(keys.len(), 1, "one detection log expected, got {keys:?}");
    assert!(keys[0].starts_with("uploads/log_"));
    assert!(keys[0].ends_with(".txt"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_already_uploaded_artifact_is_not_duplicated() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let staged = stage_screenshots(&settings.staging_path, 1);
    let key = staged[0].remote_key(&settings.key_prefix);

    // The previous run uploaded the object but crashed before releasing the staged copy.
    let remote = Arc::new(MemoryStore::default());
    remote.objects.lock().unwrap().push(key.clone());

    let agent = agent(settings.clone(), remote.clone());
    let trigger = agent.shutdown_trigger();
    let (_hook, events) = crossbeam_channel::bounded::<InputEvent>(16);
    let run = tokio::spawn(agent.run(events));
    tokio::time::sleep(Duration::from_millis(300)).await;
    trigger.trigger();
    run.await.unwrap().unwrap();

    assert_eq!(remote.keys(), vec![key]);
    assert_eq!(remote.puts.load(Ordering::SeqCst), 0);
    let store = LocalStore::open(&settings.staging_path).unwrap();
    assert!(store.recover().unwrap().is_empty());
}

#[tokio::test]
async fn test_recovery_fills_queue_only_to_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        queue_capacity: 2,
        ..settings(dir.path())
    };
    let staged = stage_screenshots(&settings.staging_path, 20);

    let agent = agent(settings, Arc::new(MemoryStore::default()));
    assert_eq!(agent.recover().unwrap(), 2);
    assert_eq!(agent.queue().len(), 2);

    let queued: Vec<_> = staged
        .iter()
        .filter_map(|a| agent.queue().entry(&a.id))
        .collect();
    assert_eq!(queued.len(), 2);
    for entry in queued {
        assert_eq!(
            entry.artifact.payload,
            ArtifactPayload::Screenshot(ImageData::Staged)
        );
    }
    assert_eq!(agent.store().pending().unwrap().len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backlog_beyond_capacity_drains_through_refill() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        queue_capacity: 2,
        staging_scan_interval: Duration::from_millis(100),
        ..settings(dir.path())
    };
    let staged = stage_screenshots(&settings.staging_path, 6);

    let remote = Arc::new(MemoryStore::default());
    let agent = agent(settings.clone(), remote.clone());
    let trigger = agent.shutdown_trigger();
    let (_hook, events) = crossbeam_channel::bounded::<InputEvent>(16);

    let run = tokio::spawn(agent.run(events));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    trigger.trigger();
    let summary = run.await.unwrap().unwrap();

    assert_eq!(summary.recovered, 2);
    assert_eq!(summary.queue.uploaded, 6);
    let keys = remote.keys();
    for artifact in &staged {
        assert!(keys.contains(&artifact.remote_key(&settings.key_prefix)));
    }
    let store = LocalStore::open(&settings.staging_path).unwrap();
    assert!(store.recover().unwrap().is_empty());
}
