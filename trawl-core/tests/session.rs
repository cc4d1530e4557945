//! Session status classification against a loopback provider.

use std::{net::SocketAddr, time::Duration};

use axum::{
    Router,
    http::{HeaderMap, StatusCode, header},
    routing::get,
};
use trawl_core::{
    cancel::{CancelHandle, CancelReason},
    config::Config,
    ratelimit::default_rate_limits,
    session::{Session, SessionError},
    task::RequestOpts,
};

async fn spawn_mock_provider() -> SocketAddr {
    let app = Router::new()
        .route("/ok", get(|| async { "[\"a.example.com\"]" }))
        .route("/auth", get(|| async { StatusCode::UNAUTHORIZED }))
        .route("/forbidden", get(|| async { StatusCode::FORBIDDEN }))
        .route(
            "/limited",
            get(|| async {
                let mut headers = HeaderMap::new();
                headers.insert(header::RETRY_AFTER, "300".parse().unwrap());
                (StatusCode::TOO_MANY_REQUESTS, headers, "slow down")
            }),
        )
        .route(
            "/limited-short",
            get(|| async {
                let mut headers = HeaderMap::new();
                headers.insert(header::RETRY_AFTER, "1".parse().unwrap());
                (StatusCode::TOO_MANY_REQUESTS, headers, "slow down")
            }),
        )
        .route(
            "/broken",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "oops") }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock provider");
    });
    addr
}

fn test_session() -> Session {
    let config = Config {
        rate_limit: 600,
        timeout: Duration::from_secs(5),
        ..Default::default()
    };
    Session::new(&config, default_rate_limits()).expect("session builds")
}

fn opts_for(addr: SocketAddr, path: &str) -> RequestOpts {
    RequestOpts {
        url: format!("http://{addr}{path}"),
        source: "mocksource",
        ..Default::default()
    }
}

#[tokio::test]
async fn success_returns_the_response() {
    let addr = spawn_mock_provider().await;
    let session = test_session();
    let global = CancelHandle::new();

    let opts = opts_for(addr, "/ok");
    let response = session.send(&global, &opts).await.expect("200 is ok");
    let body = response.text().await.expect("body reads");
    assert!(body.contains("a.example.com"));
    assert!(!opts.cancel.is_cancelled());
}

#[tokio::test]
async fn unauthorized_cancels_the_source() {
    let addr = spawn_mock_provider().await;
    let session = test_session();
    let global = CancelHandle::new();

    let opts = opts_for(addr, "/auth");
    let err = session.send(&global, &opts).await.expect_err("401 fails");
    assert!(matches!(err, SessionError::AuthFailed { .. }));
    assert_eq!(opts.cancel.reason(), Some(CancelReason::AuthFailed));

    // The next request through the same cancel handle short-circuits.
    let err = session
        .send(&global, &opts)
        .await
        .expect_err("cancelled source fails fast");
    assert!(matches!(err, SessionError::Cancelled { .. }));
}

#[tokio::test]
async fn forbidden_cancels_the_source() {
    let addr = spawn_mock_provider().await;
    let session = test_session();
    let global = CancelHandle::new();

    let opts = opts_for(addr, "/forbidden");
    let err = session.send(&global, &opts).await.expect_err("403 fails");
    assert!(matches!(err, SessionError::AuthFailed { .. }));
    assert!(opts.cancel.is_cancelled());
}

#[tokio::test]
async fn long_retry_after_cancels_the_source() {
    let addr = spawn_mock_provider().await;
    let session = test_session();
    let global = CancelHandle::new();

    let opts = opts_for(addr, "/limited");
    let err = session.send(&global, &opts).await.expect_err("429 fails");
    assert!(matches!(err, SessionError::RateLimited { .. }));
    // 300s is far beyond the useful-backoff threshold.
    assert_eq!(opts.cancel.reason(), Some(CancelReason::RateLimited));
}

#[tokio::test]
async fn short_retry_after_sleeps_and_resets_without_cancelling() {
    let addr = spawn_mock_provider().await;
    let session = test_session();
    let global = CancelHandle::new();

    let opts = opts_for(addr, "/limited-short");
    let before = std::time::Instant::now();
    let err = session.send(&global, &opts).await.expect_err("429 fails");
    assert!(matches!(err, SessionError::RateLimited { .. }));
    // ~1s sleep-and-reset was absorbed; the source stays alive.
    assert!(before.elapsed() >= Duration::from_millis(900));
    assert!(!opts.cancel.is_cancelled());
}

#[tokio::test]
async fn other_status_codes_keep_the_response_for_the_handler() {
    let addr = spawn_mock_provider().await;
    let session = test_session();
    let global = CancelHandle::new();

    let opts = opts_for(addr, "/broken");
    let err = session.send(&global, &opts).await.expect_err("500 fails");
    let message = err.to_string();
    assert!(message.contains("500"), "unexpected message: {message}");
    assert!(!opts.cancel.is_cancelled());

    let response = err.into_response().expect("response travels with error");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.text().await.expect("body reads"), "oops");
}

#[tokio::test]
async fn global_cancel_fails_fast() {
    let addr = spawn_mock_provider().await;
    let session = test_session();
    let global = CancelHandle::new();
    global.cancel(CancelReason::Interrupted);

    let opts = opts_for(addr, "/ok");
    let err = session
        .send(&global, &opts)
        .await
        .expect_err("cancelled run fails fast");
    assert!(matches!(err, SessionError::Cancelled { .. }));
}
