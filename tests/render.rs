mod support;

use std::time::Duration;

use tokio::time::Instant;

use pressroom::application::deadline::Deadline;
use pressroom::application::engine::{Backpressure, EnginePool, PdfOptions};
use pressroom::application::error::PipelineError;
use pressroom::application::render::{RenderConfig, RenderExecutor};

use support::{FAKE_PDF, FakeControl, LoadBehavior, fake_pool, pool_config};

const HTML: &str = "<html><body><p>Quarterly statement</p></body></html>";

fn executor(load_ms: u64, settle_ms: u64, context_ms: u64) -> RenderExecutor {
    RenderExecutor::new(RenderConfig {
        load_timeout: Duration::from_millis(load_ms),
        settle: Duration::from_millis(settle_ms),
        context_timeout: Duration::from_millis(context_ms),
        pdf: PdfOptions::default(),
    })
}

fn pool(control: &std::sync::Arc<FakeControl>) -> EnginePool {
    fake_pool(pool_config(1, 1, Backpressure::Block), control)
}

async fn render_once(
    pool: &EnginePool,
    executor: &RenderExecutor,
) -> (Result<Vec<u8>, PipelineError>, Duration) {
    let deadline = Deadline::after(Duration::from_secs(60));
    let context = pool.acquire(&deadline).await.expect("context");
    let started = Instant::now();
    let result = executor.render(context, HTML, &deadline).await;
    (result, started.elapsed())
}

#[tokio::test(start_paused = true)]
async fn quiet_page_prints_once_the_settle_window_passes() {
    let control = FakeControl::new();
    control.set_load(LoadBehavior::Delay(Duration::from_millis(200)));
    let pool = pool(&control);

    let (result, elapsed) = render_once(&pool, &executor(5_000, 300, 10_000)).await;

    assert_eq!(result.expect("pdf"), FAKE_PDF);
    assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
    assert_eq!(control.idle_waits(), 1);
    assert_eq!(control.pages_open(), 0);
}

#[tokio::test(start_paused = true)]
async fn settle_waits_out_late_network_activity() {
    let control = FakeControl::new();
    control.set_network_busy(Duration::from_millis(700));
    let pool = pool(&control);

    let (result, elapsed) = render_once(&pool, &executor(5_000, 300, 10_000)).await;

    assert!(result.is_ok());
    assert!(elapsed >= Duration::from_millis(1_000), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn load_timeout_caps_the_settle_wait() {
    let control = FakeControl::new();
    let pool = pool(&control);

    let (result, elapsed) = render_once(&pool, &executor(50, 800, 10_000)).await;

    assert_eq!(result.expect("pdf"), FAKE_PDF);
    assert!(elapsed < Duration::from_millis(100), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn busy_page_is_printed_at_the_load_cap() {
    let control = FakeControl::new();
    control.set_network_busy(Duration::from_secs(3_600));
    let pool = pool(&control);

    let (result, elapsed) = render_once(&pool, &executor(400, 100, 10_000)).await;

    assert!(result.is_ok());
    assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    assert_eq!(control.pages_open(), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_settle_prints_right_after_load() {
    let control = FakeControl::new();
    control.set_network_busy(Duration::from_secs(3_600));
    let pool = pool(&control);

    let (result, elapsed) = render_once(&pool, &executor(5_000, 0, 10_000)).await;

    assert!(result.is_ok());
    assert!(elapsed < Duration::from_millis(50), "{elapsed:?}");
    assert_eq!(control.idle_waits(), 0);
}

#[tokio::test(start_paused = true)]
async fn load_outlasting_the_context_budget_is_a_render_timeout() {
    let control = FakeControl::new();
    control.set_load(LoadBehavior::Hang);
    let pool = pool(&control);

    let (result, _) = render_once(&pool, &executor(10_000, 0, 250)).await;

    assert!(matches!(
        result,
        Err(PipelineError::RenderTimeout { budget_ms: 250 })
    ));
    assert_eq!(control.pages_open(), 0);
    assert_eq!(pool.stats().open_contexts, 0);
}
