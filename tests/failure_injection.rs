//! Failure injection tests for the reverse proxy.

use serde_json::Value;
use std::sync::atomic::Ordering;
use std::time::Duration;

mod common;

#[tokio::test]
async fn connect_failure_is_retried_on_another_target() {
    let dead = common::closed_port().await;
    let (live, backend) = common::start_echo_backend("live").await;

    let mut config = common::test_config();
    config.listener.workers = 1;
    config.backends.push(common::backend("dead", "web", dead, None));
    config.backends.push(common::backend("live", "web", live, None));
    config.routes.push(common::route("web", "/", "web", false));
    config.proxy.max_connection_retries = 1;
    let proxy = common::start_proxy(config).await;

    let client = common::client();
    for _ in 0..4 {
        let res = client.get(proxy.url("/")).send().await.expect("Proxy unreachable");
        assert_eq!(res.status(), 200, "Should succeed on the live target");
        let echo: Value = res.json().await.unwrap();
        assert_eq!(echo["backend"], "live");
    }
    assert_eq!(backend.hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn no_reachable_target_is_service_unavailable() {
    let dead = common::closed_port().await;

    let mut config = common::test_config();
    config.backends.push(common::backend("dead", "web", dead, None));
    config.routes.push(common::route("web", "/", "web", false));
    config.proxy.max_connection_retries = 2;
    let proxy = common::start_proxy(config).await;

    let res = common::client().get(proxy.url("/")).send().await.unwrap();
    assert_eq!(res.status(), 503);
}

#[tokio::test]
async fn group_without_targets_is_service_unavailable() {
    let mut config = common::test_config();
    config.routes.push(common::route("web", "/", "web", false));
    let proxy = common::start_proxy(config).await;

    let res = common::client().get(proxy.url("/")).send().await.unwrap();
    assert_eq!(res.status(), 503);
}

#[tokio::test]
async fn slow_backend_hits_request_timeout() {
    let (slow, _) = common::start_slow_backend("slow", Duration::from_secs(3)).await;

    let mut config = common::test_config();
    config.backends.push(common::backend("slow", "web", slow, None));
    config.routes.push(common::route("web", "/", "web", false));
    config.proxy.request_timeout_ms = Some(200);
    let proxy = common::start_proxy(config).await;

    let started = std::time::Instant::now();
    let res = common::client().get(proxy.url("/")).send().await.unwrap();
    assert_eq!(res.status(), 503);
    assert!(started.elapsed() < Duration::from_secs(2), "Timeout should cut the exchange short");
}

#[tokio::test]
async fn saturated_pool_queues_then_serves() {
    let (slow, backend) = common::start_slow_backend("slow", Duration::from_millis(100)).await;

    let mut config = common::test_config();
    config.listener.workers = 1;
    config.backends.push(common::backend("slow", "web", slow, None));
    config.routes.push(common::route("web", "/", "web", false));
    config.pool.max_connections_per_thread = 1;
    config.pool.max_queue_size = 10;
    config.pool.max_queue_wait_ms = Some(5_000);
    let proxy = common::start_proxy(config).await;

    let client = common::client();
    let requests = (0..4).map(|_| {
        let client = client.clone();
        let url = proxy.url("/");
        tokio::spawn(async move { client.get(url).send().await.map(|res| res.status().as_u16()) })
    });
    for task in requests.collect::<Vec<_>>() {
        assert_eq!(task.await.unwrap().unwrap(), 200);
    }
    assert_eq!(backend.hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn full_queue_is_rejected() {
    let (slow, _) = common::start_slow_backend("slow", Duration::from_millis(500)).await;

    let mut config = common::test_config();
    config.listener.workers = 1;
    config.backends.push(common::backend("slow", "web", slow, None));
    config.routes.push(common::route("web", "/", "web", false));
    config.pool.max_connections_per_thread = 1;
    config.pool.max_queue_size = 0;
    config.proxy.max_connection_retries = 0;
    let proxy = common::start_proxy(config).await;

    let client = common::client();
    let first = {
        let client = client.clone();
        let url = proxy.url("/");
        tokio::spawn(async move { client.get(url).send().await.map(|res| res.status().as_u16()) })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = client.get(proxy.url("/")).send().await.unwrap();
    assert_eq!(second.status(), 503);
    assert_eq!(first.await.unwrap().unwrap(), 200);
}
