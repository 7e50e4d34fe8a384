mod support;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use pressroom::application::engine::Backpressure;
use pressroom::infra::http::{ApiState, HttpState, RouterState, build_router};
use pressroom_api_types::{ApiErrorBody, HealthResponse, JobStatus, RenderCompletedResponse};

use support::{FAKE_PDF, Harness, HarnessOptions, PrintBehavior, StoreBehavior, pool_config};

const SECRET: &str = "s3cret-key";

fn router(harness: &Harness) -> Router {
    build_router(RouterState {
        http: HttpState {
            service: harness.service.clone(),
            artifacts: Arc::clone(&harness.artifacts),
        },
        api: ApiState {
            service: harness.service.clone(),
            api_secret: Arc::from(SECRET),
            max_html_bytes: harness.service.config().max_html_bytes,
        },
    })
}

fn submit(body: &Value, auth: Option<(&str, &str)>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/v1/render")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some((name, value)) = auth {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn bearer() -> Option<(&'static str, &'static str)> {
    Some(("authorization", "Bearer s3cret-key"))
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec()
}

async fn error_body(response: axum::response::Response) -> ApiErrorBody {
    serde_json::from_slice(&body_bytes(response).await).expect("error body")
}

fn valid_body() -> Value {
    json!({
        "htmlContent": "<html><body><h1>Packing slip</h1></body></html>",
        "recordId": "recQ7",
        "label": "North Warehouse"
    })
}

#[tokio::test]
async fn render_requires_an_api_key() {
    let harness = Harness::new(HarnessOptions::default());

    let response = router(&harness)
        .oneshot(submit(&valid_body(), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = error_body(response).await;
    assert_eq!(body.error.code, "unauthorized");

    let response = router(&harness)
        .oneshot(submit(
            &valid_body(),
            Some(("authorization", "Bearer wrong-key")),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert_eq!(harness.control.launches(), 0);
}

#[tokio::test]
async fn render_accepts_bearer_or_x_api_key() {
    let harness = Harness::new(HarnessOptions::default());

    let response = router(&harness)
        .oneshot(submit(&valid_body(), Some(("x-api-key", SECRET))))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = router(&harness)
        .oneshot(submit(&valid_body(), bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(harness.store.attached().len(), 2);
}

#[tokio::test]
async fn completed_render_is_reported_and_served() {
    let harness = Harness::new(HarnessOptions::default());
    let app = router(&harness);

    let response = app
        .clone()
        .oneshot(submit(&valid_body(), bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let completed: RenderCompletedResponse =
        serde_json::from_slice(&body_bytes(response).await).expect("completed body");

    assert_eq!(completed.status, JobStatus::Completed);
    assert!(completed.file_name.starts_with("recQ7-north-warehouse-"));
    assert_eq!(
        completed.url,
        format!("http://pdf.test/pdfs/{}", completed.file_name)
    );
    assert_eq!(completed.size_bytes, FAKE_PDF.len() as u64);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/pdfs/{}", completed.file_name))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).expect("type"),
        "application/pdf"
    );
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).expect("cache"),
        "no-store"
    );
    assert_eq!(body_bytes(response).await, FAKE_PDF);
}

#[tokio::test]
async fn unknown_or_malformed_artifact_names_are_not_found() {
    let harness = Harness::new(HarnessOptions::default());

    for path in ["/pdfs/recQ7-missing.pdf", "/pdfs/..%2Fsecret.pdf", "/pdfs/notes.txt"] {
        let response = router(&harness)
            .oneshot(Request::builder().uri(path).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
    }
}

#[tokio::test]
async fn invalid_input_is_a_bad_request() {
    let harness = Harness::new(HarnessOptions::default());

    let response = router(&harness)
        .oneshot(submit(
            &json!({ "htmlContent": "", "recordId": "recQ7" }),
            bearer(),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = error_body(response).await;
    assert_eq!(body.error.code, "invalid_input");
    assert!(body.error.hint.expect("hint").contains("htmlContent"));

    assert_eq!(harness.control.launches(), 0);
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let harness = Harness::new(HarnessOptions::default());

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/render")
        .header(header::CONTENT_TYPE, "application/json")
        .header("authorization", "Bearer s3cret-key")
        .body(Body::from("{\"htmlContent\": "))
        .expect("request");
    let response = router(&harness).oneshot(request).await.expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_body(response).await.error.code, "bad_request");
}

#[tokio::test]
async fn upload_failure_is_a_server_error_and_leaves_no_file() {
    let harness = Harness::new(HarnessOptions {
        store: StoreBehavior::Reject(500),
        ..HarnessOptions::default()
    });

    let response = router(&harness)
        .oneshot(submit(&valid_body(), bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_body(response).await.error.code, "upload_failure");
    assert!(harness.artifact_files().is_empty());
}

#[tokio::test]
async fn exhausted_pool_asks_clients_to_retry() {
    let harness = Harness::new(HarnessOptions {
        pool: pool_config(1, 1, Backpressure::FailFast),
        ..HarnessOptions::default()
    });
    harness
        .control
        .set_print(PrintBehavior::Delay(Duration::from_millis(400)));
    let app = router(&harness);

    let busy = tokio::spawn(app.clone().oneshot(submit(&valid_body(), bearer())));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = app
        .oneshot(submit(&valid_body(), bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        response.headers().get(header::RETRY_AFTER).expect("retry-after"),
        "5"
    );
    assert_eq!(error_body(response).await.error.code, "pool_exhausted");

    let first = busy.await.expect("join").expect("response");
    assert_eq!(first.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_reports_pool_occupancy() {
    let harness = Harness::new(HarnessOptions {
        pool: pool_config(2, 3, Backpressure::Block),
        ..HarnessOptions::default()
    });

    let response = router(&harness)
        .oneshot(
            Request::builder()
                .uri("/_health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let health: HealthResponse =
        serde_json::from_slice(&body_bytes(response).await).expect("health body");
    assert_eq!(health.status, "ok");
    assert_eq!(health.pool.capacity, 6);
    assert_eq!(health.pool.instances, 0);

    harness.service.shutdown(Duration::from_millis(100)).await;
    let response = router(&harness)
        .oneshot(
            Request::builder()
                .uri("/_health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
