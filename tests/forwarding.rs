//! End-to-end forwarding through a running proxy.

use serde_json::Value;
use std::collections::HashSet;

mod common;

#[tokio::test]
async fn request_reaches_backend_with_forwarding_headers() {
    let (backend_addr, _) = common::start_echo_backend("b1").await;

    let mut config = common::test_config();
    config.backends.push(common::backend("b1", "api", backend_addr, None));
    config.routes.push(common::route("api", "/api", "api", true));
    config
        .proxy
        .request_headers
        .insert("x-proxy-request".into(), "%{request_id}".into());
    let proxy = common::start_proxy(config).await;

    let res = common::client()
        .get(proxy.url("/api/items?page=2"))
        .header("x-forwarded-for", "203.0.113.9")
        .send()
        .await
        .expect("Proxy unreachable");
    assert_eq!(res.status(), 200);
    let request_id = res.headers()["x-request-id"].to_str().unwrap().to_string();

    let echo: Value = res.json().await.unwrap();
    assert_eq!(echo["backend"], "b1");
    assert_eq!(echo["uri"], "/items?page=2");

    let headers = &echo["headers"];
    assert_eq!(headers["x-forwarded-for"], "127.0.0.1");
    assert_eq!(headers["x-forwarded-proto"], "http");
    assert_eq!(headers["x-forwarded-host"], "127.0.0.1");
    assert_eq!(headers["x-forwarded-port"], proxy.addr.port().to_string());
    assert_eq!(headers["host"], proxy.addr.to_string());
    assert_eq!(headers["x-request-id"], request_id);
    assert_eq!(headers["x-proxy-request"], request_id);
}

#[tokio::test]
async fn host_header_is_rewritten_when_configured() {
    let (backend_addr, _) = common::start_echo_backend("b1").await;

    let mut config = common::test_config();
    config.backends.push(common::backend("b1", "web", backend_addr, None));
    config.routes.push(common::route("web", "/", "web", false));
    config.proxy.rewrite_host_header = true;
    let proxy = common::start_proxy(config).await;

    let echo: Value = common::client()
        .get(proxy.url("/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(echo["headers"]["host"], backend_addr.to_string());
}

#[tokio::test]
async fn round_robin_uses_every_target() {
    let (a, _) = common::start_echo_backend("a").await;
    let (b, _) = common::start_echo_backend("b").await;

    let mut config = common::test_config();
    config.listener.workers = 1;
    config.backends.push(common::backend("a", "web", a, None));
    config.backends.push(common::backend("b", "web", b, None));
    config.routes.push(common::route("web", "/", "web", false));
    let proxy = common::start_proxy(config).await;

    let client = common::client();
    let mut seen = HashSet::new();
    for _ in 0..4 {
        let echo: Value = client.get(proxy.url("/")).send().await.unwrap().json().await.unwrap();
        seen.insert(echo["backend"].as_str().unwrap().to_string());
    }
    assert_eq!(seen.len(), 2, "both targets should receive traffic: {seen:?}");
}

#[tokio::test]
async fn session_cookie_pins_requests_to_its_route() {
    let (a, _) = common::start_echo_backend("a").await;
    let (b, _) = common::start_echo_backend("b").await;

    let mut config = common::test_config();
    config.backends.push(common::backend("a", "web", a, Some("node1")));
    config.backends.push(common::backend("b", "web", b, Some("node2")));
    config.routes.push(common::route("web", "/", "web", false));
    let proxy = common::start_proxy(config).await;

    let client = common::client();
    for _ in 0..4 {
        let echo: Value = client
            .get(proxy.url("/cart"))
            .header("cookie", "JSESSIONID=abc123.node2")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(echo["backend"], "b");
    }

    let echo: Value = client
        .get(proxy.url("/cart;jsessionid=abc123.node1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(echo["backend"], "a");
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let (backend_addr, _) = common::start_echo_backend("b1").await;

    let mut config = common::test_config();
    config.backends.push(common::backend("b1", "api", backend_addr, None));
    config.routes.push(common::route("api", "/api", "api", false));
    let proxy = common::start_proxy(config).await;

    let res = common::client().get(proxy.url("/other")).send().await.unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn reloaded_configuration_takes_effect() {
    let (a, _) = common::start_echo_backend("a").await;
    let (b, _) = common::start_echo_backend("b").await;

    let mut config = common::test_config();
    config.backends.push(common::backend("a", "web", a, None));
    config.routes.push(common::route("web", "/", "web", false));
    let proxy = common::start_proxy(config.clone()).await;

    let client = common::client();
    let echo: Value = client.get(proxy.url("/")).send().await.unwrap().json().await.unwrap();
    assert_eq!(echo["backend"], "a");

    config.backends = vec![common::backend("b", "web", b, None)];
    proxy.config_updates.send(config).unwrap();

    let mut switched = false;
    for _ in 0..50 {
        let echo: Value = client.get(proxy.url("/")).send().await.unwrap().json().await.unwrap();
        if echo["backend"] == "b" {
            switched = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(switched, "reload should route traffic to the new target");
}
