#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tempfile::TempDir;
use url::Url;

use pressroom::application::engine::{
    Backpressure, Engine, EngineError, EngineLauncher, EnginePage, EnginePool, PdfOptions,
    PoolConfig,
};
use pressroom::application::orchestrator::{JobsConfig, RenderService, SubmitRenderJob};
use pressroom::application::render::{RenderConfig, RenderExecutor};
use pressroom::application::scheduler::DeferredTasks;
use pressroom::application::uploads::{
    AttachmentRef, RecordStore, RecordStoreError, UploadCoordinator,
};
use pressroom::config::ArtifactSettings;
use pressroom::domain::jobs::RecordId;
use pressroom::infra::artifacts::ArtifactStore;

pub const FAKE_PDF: &[u8] = b"%PDF-1.7\n% fake engine output\n%%EOF";

#[derive(Debug, Clone, Copy, Default)]
pub enum LoadBehavior {
    #[default]
    Instant,
    Delay(Duration),
    Hang,
}

#[derive(Debug, Clone, Copy, Default)]
pub enum PrintBehavior {
    #[default]
    Pdf,
    Empty,
    Fail,
    Hang,
    Delay(Duration),
}

/// Knobs and counters shared by every fake engine a launcher starts.
#[derive(Default)]
pub struct FakeControl {
    launches: AtomicUsize,
    failing_launches: AtomicUsize,
    shutdowns: AtomicUsize,
    pages_opened: AtomicUsize,
    pages_closed: AtomicUsize,
    pages_open: AtomicUsize,
    max_pages_open: AtomicUsize,
    idle_waits: AtomicUsize,
    load: Mutex<LoadBehavior>,
    network_busy: Mutex<Duration>,
    print: Mutex<PrintBehavior>,
    engines: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_print(&self, behavior: PrintBehavior) {
        *self.print.lock().unwrap() = behavior;
    }

    pub fn set_load(&self, behavior: LoadBehavior) {
        *self.load.lock().unwrap() = behavior;
    }

    /// Keep requests in flight for `busy` after each document loads.
    pub fn set_network_busy(&self, busy: Duration) {
        *self.network_busy.lock().unwrap() = busy;
    }

    /// Make the next `count` launches fail.
    pub fn fail_launches(&self, count: usize) {
        self.failing_launches.store(count, Ordering::SeqCst);
    }

    /// Every engine started so far stops answering health checks.
    pub fn crash_all(&self) {
        for alive in self.engines.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn pages_opened(&self) -> usize {
        self.pages_opened.load(Ordering::SeqCst)
    }

    pub fn pages_closed(&self) -> usize {
        self.pages_closed.load(Ordering::SeqCst)
    }

    pub fn pages_open(&self) -> usize {
        self.pages_open.load(Ordering::SeqCst)
    }

    pub fn max_pages_open(&self) -> usize {
        self.max_pages_open.load(Ordering::SeqCst)
    }

    pub fn idle_waits(&self) -> usize {
        self.idle_waits.load(Ordering::SeqCst)
    }

    fn print_behavior(&self) -> PrintBehavior {
        *self.print.lock().unwrap()
    }
}

pub struct FakeLauncher {
    control: Arc<FakeControl>,
}

impl FakeLauncher {
    pub fn new(control: Arc<FakeControl>) -> Arc<Self> {
        Arc::new(Self { control })
    }
}

#[async_trait]
impl EngineLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn Engine>, EngineError> {
        self.control.launches.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .control
            .failing_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if failing.is_ok() {
            return Err(EngineError::launch("fake launch failure"));
        }

        let alive = Arc::new(AtomicBool::new(true));
        self.control.engines.lock().unwrap().push(Arc::clone(&alive));
        Ok(Arc::new(FakeEngine {
            control: Arc::clone(&self.control),
            alive,
            stopped: AtomicBool::new(false),
        }))
    }
}

struct FakeEngine {
    control: Arc<FakeControl>,
    alive: Arc<AtomicBool>,
    stopped: AtomicBool,
}

#[async_trait]
impl Engine for FakeEngine {
    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn open_page(&self) -> Result<Arc<dyn EnginePage>, EngineError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(EngineError::unavailable("fake engine is down"));
        }
        self.control.pages_opened.fetch_add(1, Ordering::SeqCst);
        let open = self.control.pages_open.fetch_add(1, Ordering::SeqCst) + 1;
        self.control.max_pages_open.fetch_max(open, Ordering::SeqCst);
        Ok(Arc::new(FakePage {
            control: Arc::clone(&self.control),
            closed: AtomicBool::new(false),
        }))
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.control.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct FakePage {
    control: Arc<FakeControl>,
    closed: AtomicBool,
}

#[async_trait]
impl EnginePage for FakePage {
    async fn load_html(&self, _html: &str) -> Result<(), EngineError> {
        let behavior = *self.control.load.lock().unwrap();
        match behavior {
            LoadBehavior::Instant => {}
            LoadBehavior::Delay(delay) => tokio::time::sleep(delay).await,
            LoadBehavior::Hang => std::future::pending().await,
        }
        Ok(())
    }

    async fn wait_for_network_idle(&self, quiet: Duration) -> Result<(), EngineError> {
        self.control.idle_waits.fetch_add(1, Ordering::SeqCst);
        let busy = *self.control.network_busy.lock().unwrap();
        tokio::time::sleep(busy + quiet).await;
        Ok(())
    }

    async fn print_pdf(&self, _options: &PdfOptions) -> Result<Vec<u8>, EngineError> {
        match self.control.print_behavior() {
            PrintBehavior::Pdf => Ok(FAKE_PDF.to_vec()),
            PrintBehavior::Empty => Ok(Vec::new()),
            PrintBehavior::Fail => Err(EngineError::operation("fake print failure")),
            PrintBehavior::Hang => std::future::pending().await,
            PrintBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(FAKE_PDF.to_vec())
            }
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.control.pages_closed.fetch_add(1, Ordering::SeqCst);
            self.control.pages_open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub enum StoreBehavior {
    #[default]
    Accept,
    Reject(u16),
    Hang,
}

#[derive(Default)]
pub struct FakeRecordStore {
    behavior: Mutex<StoreBehavior>,
    attached: Mutex<Vec<(String, AttachmentRef)>>,
}

impl FakeRecordStore {
    pub fn new(behavior: StoreBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            attached: Mutex::new(Vec::new()),
        })
    }

    pub fn attached(&self) -> Vec<(String, AttachmentRef)> {
        self.attached.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for FakeRecordStore {
    async fn attach(
        &self,
        record_id: &RecordId,
        attachment: &AttachmentRef,
    ) -> Result<(), RecordStoreError> {
        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            StoreBehavior::Accept => {
                self.attached
                    .lock()
                    .unwrap()
                    .push((record_id.as_str().to_string(), attachment.clone()));
                Ok(())
            }
            StoreBehavior::Reject(status) => Err(RecordStoreError::Rejected {
                status,
                body: "fake rejection".to_string(),
            }),
            StoreBehavior::Hang => std::future::pending().await,
        }
    }
}

pub fn pool_config(instances: u32, contexts: u32, backpressure: Backpressure) -> PoolConfig {
    PoolConfig {
        max_instances: instances,
        max_contexts_per_instance: contexts,
        backpressure,
        launch_attempts: 2,
    }
}

pub fn fake_pool(config: PoolConfig, control: &Arc<FakeControl>) -> EnginePool {
    EnginePool::new(config, FakeLauncher::new(Arc::clone(control)))
}

pub struct HarnessOptions {
    pub pool: PoolConfig,
    pub render: RenderConfig,
    pub jobs: JobsConfig,
    pub upload_timeout: Duration,
    pub serving_window: Duration,
    pub store: StoreBehavior,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            pool: pool_config(1, 2, Backpressure::Block),
            render: RenderConfig {
                load_timeout: Duration::from_secs(1),
                settle: Duration::ZERO,
                context_timeout: Duration::from_secs(2),
                pdf: PdfOptions::default(),
            },
            jobs: JobsConfig {
                overall_timeout: Duration::from_secs(5),
                reap_grace: Duration::from_secs(1),
                max_html_bytes: 1 << 20,
            },
            upload_timeout: Duration::from_secs(1),
            serving_window: Duration::from_secs(60),
            store: StoreBehavior::Accept,
        }
    }
}

/// A render service wired to fake engines, a fake record store and a
/// temporary serving directory.
pub struct Harness {
    pub service: RenderService,
    pub control: Arc<FakeControl>,
    pub store: Arc<FakeRecordStore>,
    pub artifacts: Arc<ArtifactStore>,
    dir: TempDir,
}

impl Harness {
    pub fn new(options: HarnessOptions) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let control = FakeControl::new();
        let store = FakeRecordStore::new(options.store);

        let settings = ArtifactSettings {
            directory: dir.path().join("pdfs"),
            public_base_url: Url::parse("http://pdf.test").expect("base url"),
            serving_prefix: "pdfs".to_string(),
            serving_window: options.serving_window,
        };
        let artifacts =
            Arc::new(ArtifactStore::new(&settings, DeferredTasks::new()).expect("artifact store"));

        let service = RenderService::new(
            fake_pool(options.pool, &control),
            RenderExecutor::new(options.render),
            Arc::clone(&artifacts),
            UploadCoordinator::new(store.clone(), options.upload_timeout),
            options.jobs,
        );

        Self {
            service,
            control,
            store,
            artifacts,
            dir,
        }
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.dir.path().join("pdfs")
    }

    /// Names of the files currently in the serving directory.
    pub fn artifact_files(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.artifact_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Poll until the serving directory is empty or `within` passes.
    pub async fn wait_for_empty_dir(&self, within: Duration) -> bool {
        let until = tokio::time::Instant::now() + within;
        loop {
            if self.artifact_files().is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= until {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

pub fn job(record_id: &str, label: Option<&str>) -> SubmitRenderJob {
    SubmitRenderJob {
        html: "<!doctype html><html><body><h1>Invoice</h1></body></html>".to_string(),
        record_id: record_id.to_string(),
        label: label.map(str::to_string),
    }
}
