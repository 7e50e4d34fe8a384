//! Chromium driver for the engine pool, built on `headless_chrome`.
//!
//! `headless_chrome` talks to the browser over a blocking DevTools client, so
//! every call is moved onto the blocking thread pool. The async side only sees
//! the [`Engine`] and [`EnginePage`] traits.

use std::{
    collections::HashSet,
    ffi::{OsStr, OsString},
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use headless_chrome::{
    Browser, LaunchOptions, Tab,
    protocol::cdp::{Network, types::Event},
    types::PrintToPdfOptions,
};
use tokio::task;
use tracing::{debug, info, warn};

use crate::{
    application::engine::{Engine, EngineError, EngineLauncher, EnginePage, PdfOptions},
    config::EngineSettings,
};

/// Flags that keep a container-hosted Chromium small and quiet.
const DEFAULT_ARGS: &[&str] = &[
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-background-networking",
    "--no-first-run",
    "--hide-scrollbars",
    "--mute-audio",
];

/// How often an idle wait re-checks the in-flight request set.
const NETWORK_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    path: Option<PathBuf>,
    sandbox: bool,
    idle_timeout: Duration,
    args: Vec<OsString>,
}

impl ChromeLauncher {
    pub fn new(settings: &EngineSettings) -> Self {
        let args = DEFAULT_ARGS
            .iter()
            .map(OsString::from)
            .chain(settings.extra_args.iter().map(OsString::from))
            .collect();

        Self {
            path: settings.chrome_path.clone(),
            sandbox: settings.sandbox,
            idle_timeout: settings.idle_timeout,
            args,
        }
    }

    fn launch_blocking(&self) -> Result<Browser, EngineError> {
        let args: Vec<&OsStr> = self.args.iter().map(OsString::as_os_str).collect();
        let options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(self.sandbox)
            .path(self.path.clone())
            .idle_browser_timeout(self.idle_timeout)
            .args(args)
            .build()
            .map_err(|err| EngineError::launch(format!("invalid launch options: {err}")))?;

        Browser::new(options).map_err(|err| EngineError::launch(err.to_string()))
    }
}

#[async_trait]
impl EngineLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Arc<dyn Engine>, EngineError> {
        let launcher = self.clone();
        let browser = task::spawn_blocking(move || launcher.launch_blocking())
            .await
            .map_err(|err| EngineError::launch(format!("launch task failed: {err}")))??;

        let version = browser
            .get_version()
            .map(|version| version.product)
            .unwrap_or_else(|_| "unknown".to_string());
        info!(
            target = "pressroom::engine",
            op = "launch",
            result = "ok",
            version = %version,
            "chromium started"
        );

        Ok(Arc::new(ChromeEngine {
            browser: Mutex::new(Some(browser)),
        }))
    }
}

/// One Chromium process. Dropping the inner [`Browser`] terminates it.
pub struct ChromeEngine {
    browser: Mutex<Option<Browser>>,
}

impl ChromeEngine {
    fn browser(&self) -> Option<Browser> {
        self.browser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Engine for ChromeEngine {
    async fn is_alive(&self) -> bool {
        let Some(browser) = self.browser() else {
            return false;
        };
        task::spawn_blocking(move || browser.get_version().is_ok())
            .await
            .unwrap_or(false)
    }

    async fn open_page(&self) -> Result<Arc<dyn EnginePage>, EngineError> {
        let browser = self
            .browser()
            .ok_or_else(|| EngineError::unavailable("browser has been shut down"))?;
        let network = Arc::new(NetworkActivity::default());
        let tracker = Arc::clone(&network);
        let tab = task::spawn_blocking(move || {
            let tab = browser
                .new_tab()
                .map_err(|err| EngineError::unavailable(err.to_string()))?;
            tab.call_method(Network::Enable {
                max_total_buffer_size: None,
                max_resource_buffer_size: None,
                max_post_data_size: None,
                report_direct_socket_traffic: None,
                enable_durable_messages: None,
            })
            .map_err(|err| EngineError::operation(format!("network tracking: {err}")))?;
            tab.add_event_listener(Arc::new(move |event: &Event| tracker.observe(event)))
                .map_err(|err| EngineError::operation(format!("network tracking: {err}")))?;
            Ok::<_, EngineError>(tab)
        })
        .await
        .map_err(|err| EngineError::operation(format!("open task failed: {err}")))??;

        Ok(Arc::new(ChromePage { tab, network }))
    }

    async fn shutdown(&self) {
        let browser = self
            .browser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(browser) = browser {
            // Drop kills the child process and waits for it.
            if let Err(err) = task::spawn_blocking(move || drop(browser)).await {
                warn!(
                    target = "pressroom::engine",
                    op = "shutdown",
                    error = %err,
                    "chromium shutdown task failed"
                );
            }
        }
    }
}

/// Requests seen on one tab that have not finished or failed yet.
#[derive(Debug)]
struct NetworkActivity {
    state: Mutex<NetworkState>,
}

#[derive(Debug)]
struct NetworkState {
    in_flight: HashSet<String>,
    last_change: Instant,
}

impl Default for NetworkActivity {
    fn default() -> Self {
        Self {
            state: Mutex::new(NetworkState {
                in_flight: HashSet::new(),
                last_change: Instant::now(),
            }),
        }
    }
}

impl NetworkActivity {
    fn observe(&self, event: &Event) {
        match event {
            Event::NetworkRequestWillBeSent(ev) => self.started(&ev.params.request_id),
            Event::NetworkLoadingFinished(ev) => self.finished(&ev.params.request_id),
            Event::NetworkLoadingFailed(ev) => self.finished(&ev.params.request_id),
            _ => {}
        }
    }

    fn started(&self, request_id: &str) {
        let mut state = self.lock();
        state.in_flight.insert(request_id.to_string());
        state.last_change = Instant::now();
    }

    fn finished(&self, request_id: &str) {
        let mut state = self.lock();
        if state.in_flight.remove(request_id) {
            state.last_change = Instant::now();
        }
    }

    /// How long the tab has had nothing in flight, or `None` while busy.
    fn idle_for(&self) -> Option<Duration> {
        let state = self.lock();
        state
            .in_flight
            .is_empty()
            .then(|| state.last_change.elapsed())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ChromePage {
    tab: Arc<Tab>,
    network: Arc<NetworkActivity>,
}

#[async_trait]
impl EnginePage for ChromePage {
    async fn load_html(&self, html: &str) -> Result<(), EngineError> {
        let url = data_url(html);
        let tab = Arc::clone(&self.tab);
        task::spawn_blocking(move || {
            tab.navigate_to(&url)
                .and_then(|tab| tab.wait_until_navigated())
                .map(|_| ())
        })
        .await
        .map_err(|err| EngineError::operation(format!("load task failed: {err}")))?
        .map_err(|err| EngineError::operation(err.to_string()))
    }

    async fn wait_for_network_idle(&self, quiet: Duration) -> Result<(), EngineError> {
        loop {
            match self.network.idle_for() {
                Some(idle) if idle >= quiet => return Ok(()),
                Some(idle) => tokio::time::sleep(quiet - idle).await,
                None => tokio::time::sleep(NETWORK_POLL).await,
            }
        }
    }

    async fn print_pdf(&self, options: &PdfOptions) -> Result<Vec<u8>, EngineError> {
        let options = print_options(options);
        let tab = Arc::clone(&self.tab);
        task::spawn_blocking(move || tab.print_to_pdf(Some(options)))
            .await
            .map_err(|err| EngineError::operation(format!("print task failed: {err}")))?
            .map_err(|err| EngineError::operation(err.to_string()))
    }

    async fn close(&self) {
        let tab = Arc::clone(&self.tab);
        match task::spawn_blocking(move || tab.close(false)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => debug!(
                target = "pressroom::engine",
                op = "close_page",
                error = %err,
                "page close reported an error"
            ),
            Err(err) => debug!(
                target = "pressroom::engine",
                op = "close_page",
                error = %err,
                "page close task failed"
            ),
        }
    }
}

fn data_url(html: &str) -> String {
    format!("data:text/html;charset=utf-8;base64,{}", STANDARD.encode(html))
}

fn print_options(options: &PdfOptions) -> PrintToPdfOptions {
    PrintToPdfOptions {
        print_background: Some(options.print_background),
        paper_width: Some(options.paper_width),
        paper_height: Some(options.paper_height),
        margin_top: Some(options.margin),
        margin_bottom: Some(options.margin),
        margin_left: Some(options.margin),
        margin_right: Some(options.margin),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_round_trips_non_ascii_markup() {
        let url = data_url("<p>Grüße</p>");
        let encoded = url
            .strip_prefix("data:text/html;charset=utf-8;base64,")
            .expect("prefix");
        let decoded = STANDARD.decode(encoded).expect("base64");
        assert_eq!(decoded, "<p>Grüße</p>".as_bytes());
    }

    #[test]
    fn network_activity_tracks_in_flight_requests() {
        let activity = NetworkActivity::default();
        assert!(activity.idle_for().is_some());

        activity.started("1");
        activity.started("2");
        assert_eq!(activity.idle_for(), None);

        activity.finished("1");
        assert_eq!(activity.idle_for(), None);
        activity.finished("unknown");
        assert_eq!(activity.idle_for(), None);

        activity.finished("2");
        let idle = activity.idle_for().expect("idle after last request");
        assert!(idle < Duration::from_secs(1));
    }

    #[test]
    fn print_options_apply_uniform_margins() {
        let options = print_options(&PdfOptions::default());
        assert_eq!(options.print_background, Some(true));
        assert_eq!(options.margin_top, options.margin_left);
        assert_eq!(options.paper_width, Some(8.27));
    }
}
