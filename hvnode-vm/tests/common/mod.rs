#![allow(dead_code)]

use async_trait::async_trait;
use hvnode_core::backend::ops;
use hvnode_core::config::HvnodeConfig;
use hvnode_core::patterns::Clock;
use hvnode_core::{BackendResult, HvnodeError, HvnodeResult, ManagementBackend, RemoteExec};
use hvnode_vm::image::{HttpFetcher, ImageIndex, JsonFileStore};
use hvnode_vm::{Driver, ImageCache, MachineContext};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hvnode=debug")
        .with_test_writer()
        .try_init();
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// `{"Machine": {Name, IPAddress, State}}` payload.
pub fn machine_result(name: &str, ip: &str, state: &str) -> BackendResult {
    BackendResult::ok().with_payload(
        "Machine",
        json!({ "Name": name, "IPAddress": ip, "State": state }),
    )
}

/// Backend answering from per-operation queues.
///
/// When an operation's queue is empty the default for that operation is
/// used, and plain success when there is none.
#[derive(Default)]
pub struct MockBackend {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    queued: Mutex<HashMap<String, VecDeque<BackendResult>>>,
    defaults: Mutex<HashMap<String, BackendResult>>,
    unavailable: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, operation: &str, result: BackendResult) {
        self.queued
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn set_default(&self, operation: &str, result: BackendResult) {
        self.defaults
            .lock()
            .unwrap()
            .insert(operation.to_string(), result);
    }

    /// Make `operation` fail as if the backend process could not be run.
    pub fn make_unavailable(&self, operation: &str) {
        self.unavailable
            .lock()
            .unwrap()
            .insert(operation.to_string());
    }

    /// Make `operation` never return.
    pub fn make_hang(&self, operation: &str) {
        self.hanging.lock().unwrap().insert(operation.to_string());
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.calls().into_iter().map(|(op, _)| op).collect()
    }

    pub fn calls_to(&self, operation: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, args)| args)
            .collect()
    }
}

#[async_trait]
impl ManagementBackend for MockBackend {
    async fn call(&self, operation: &str, args: &[String]) -> HvnodeResult<BackendResult> {
        self.calls
            .lock()
            .unwrap()
            .push((operation.to_string(), args.to_vec()));

        if self.hanging.lock().unwrap().contains(operation) {
            std::future::pending::<()>().await;
        }
        if self.unavailable.lock().unwrap().contains(operation) {
            return Err(HvnodeError::backend_unavailable("mock backend offline"));
        }

        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front);
        Ok(queued
            .or_else(|| self.defaults.lock().unwrap().get(operation).cloned())
            .unwrap_or_else(BackendResult::ok))
    }
}

/// Remote executor answering from a queue; success once it is empty.
#[derive(Default)]
pub struct MockRemote {
    runs: Mutex<Vec<(String, String)>>,
    replies: Mutex<VecDeque<Result<String, String>>>,
    always_fail: Mutex<bool>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_failure(&self, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn fail_always(&self) {
        *self.always_fail.lock().unwrap() = true;
    }

    pub fn runs(&self) -> Vec<(String, String)> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExec for MockRemote {
    async fn run(&self, address: &str, command_line: &str) -> HvnodeResult<String> {
        self.runs
            .lock()
            .unwrap()
            .push((address.to_string(), command_line.to_string()));

        let reply = if *self.always_fail.lock().unwrap() {
            Err("connection refused".to_string())
        } else {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        };

        reply.map_err(|details| HvnodeError::CommandFailed {
            command: command_line.to_string(),
            machine: address.to_string(),
            details,
        })
    }
}

/// Clock that returns immediately and remembers every requested pause.
#[derive(Default)]
pub struct RecordingClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

/// Isolated directories, mocks and configuration for one test.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: HvnodeConfig,
    pub backend: Arc<MockBackend>,
    pub remote: Arc<MockRemote>,
    pub clock: Arc<RecordingClock>,
}

impl TestEnv {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut config = HvnodeConfig::test(dir.path());
        // Real backoff values; the recording clock never actually sleeps.
        config.lifecycle.retry_backoff = Duration::from_secs(10);
        config.paths.ensure_exist().unwrap();

        Self {
            dir,
            config,
            backend: MockBackend::new(),
            remote: MockRemote::new(),
            clock: RecordingClock::new(),
        }
    }

    pub fn context(&self) -> MachineContext {
        MachineContext::from_config(self.backend.clone(), self.remote.clone(), &self.config)
            .unwrap()
            .with_clock(self.clock.clone())
    }

    pub fn index_path(&self) -> PathBuf {
        self.config
            .paths
            .config_dir
            .join(&self.config.images.index_file)
    }

    pub async fn open_cache(&self) -> ImageCache {
        ImageCache::open(
            self.config.paths.image_cache_dir.clone(),
            self.config.images.file_prefix.clone(),
            Box::new(JsonFileStore::new(self.index_path())),
            Arc::new(HttpFetcher::new()),
        )
        .await
        .unwrap()
    }

    /// Write `data` as a source payload and return its path.
    pub fn write_source(&self, name: &str, data: &[u8]) -> PathBuf {
        let sources = self.dir.path().join("sources");
        std::fs::create_dir_all(&sources).unwrap();
        let path = sources.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    /// Write a manifest listing `(version, checksum, source)` entries.
    pub fn write_manifest(&self, entries: &[(&str, &str, &str)]) -> String {
        let mut manifest = serde_json::Map::new();
        for (version, checksum, source) in entries {
            manifest.insert(
                version.to_string(),
                json!({
                    "ImageK8sVersion": version,
                    "ImageChecksum": checksum,
                    "ImageSourceURL": source,
                    "ImageStatus": "NotDownloaded",
                }),
            );
        }
        let path = self.dir.path().join("manifest.json");
        std::fs::write(&path, serde_json::to_vec(&manifest).unwrap()).unwrap();
        path.display().to_string()
    }

    /// Cache with `version` already downloaded from `payload`.
    pub async fn cache_with_image(&self, version: &str, payload: &[u8]) -> ImageCache {
        let source = self.write_source(&format!("kutti-{}.vhdx", version), payload);
        let checksum = sha256_hex(payload);
        let manifest = self.write_manifest(&[(version, &checksum, source.to_str().unwrap())]);

        let mut cache = self.open_cache().await;
        cache.refresh_catalog(&manifest).await.unwrap();
        cache.fetch_image(version).await.unwrap();
        cache
    }

    pub async fn driver_with(&self, cache: ImageCache) -> Driver {
        Driver::new(self.config.clone(), self.context(), cache)
    }

    pub fn persisted_index(&self) -> ImageIndex {
        serde_json::from_slice(&std::fs::read(self.index_path()).unwrap()).unwrap()
    }

    pub fn qualified(&self, cluster: &str, name: &str) -> String {
        format!("tester-{}-{}", cluster, name)
    }

    pub fn disk_path(&self, cluster: &str, name: &str) -> PathBuf {
        self.config
            .paths
            .disk_dir
            .join(format!("{}.vhdx", self.qualified(cluster, name)))
    }

    pub fn machine_path(&self, cluster: &str, name: &str) -> PathBuf {
        self.config
            .paths
            .machine_dir
            .join(self.qualified(cluster, name))
    }
}

/// Script the backend for a create that boots, gets `ip` and stops cleanly.
pub fn script_happy_create(backend: &MockBackend, qualified: &str, ip: &str) {
    backend.push(ops::WAIT_MACHINE, machine_result(qualified, ip, "Running"));
    backend.set_default(ops::GET_MACHINE, machine_result(qualified, ip, "Running"));
    backend.push(ops::WAIT_MACHINE, machine_result(qualified, ip, "Off"));
}
