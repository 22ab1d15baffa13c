//! Load testing for the reverse proxy.

use std::time::{Duration, Instant};

mod common;

#[tokio::test]
async fn test_load_performance() {
    let (a, _) = common::start_echo_backend("a").await;
    let (b, _) = common::start_echo_backend("b").await;

    let mut config = common::test_config();
    config.backends.push(common::backend("a", "web", a, None));
    config.backends.push(common::backend("b", "web", b, None));
    config.routes.push(common::route("web", "/", "web", false));
    config.pool.max_connections_per_thread = 8;
    config.pool.max_queue_size = 1_000;
    config.pool.max_queue_wait_ms = Some(10_000);
    let proxy = common::start_proxy(config).await;

    let concurrency = 20;
    let requests_per_task = 50;
    let total_requests = concurrency * requests_per_task;

    // Keep-alive client: exercises downstream connection reuse too.
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let start = Instant::now();

    let mut tasks = Vec::new();
    for _ in 0..concurrency {
        let client = client.clone();
        let url = proxy.url("/");
        tasks.push(tokio::spawn(async move {
            let mut latencies = Vec::new();
            for _ in 0..requests_per_task {
                let req_start = Instant::now();
                if let Ok(res) = client.get(&url).send().await {
                    if res.status().is_success() && res.bytes().await.is_ok() {
                        latencies.push(req_start.elapsed());
                    }
                }
            }
            latencies
        }));
    }

    let mut all_latencies: Vec<Duration> = Vec::new();
    for task in tasks {
        all_latencies.extend(task.await.unwrap());
    }

    let duration = start.elapsed();
    let rps = total_requests as f64 / duration.as_secs_f64();
    assert_eq!(all_latencies.len(), total_requests, "Every request should succeed");

    all_latencies.sort();
    let p50 = all_latencies[all_latencies.len() / 2];
    let p95 = all_latencies[(all_latencies.len() as f64 * 0.95) as usize];
    let p99 = all_latencies[(all_latencies.len() as f64 * 0.99) as usize];

    println!("\n--- Load Test Results ---");
    println!("Total Requests: {}", total_requests);
    println!("Concurrency:    {}", concurrency);
    println!("Total Duration: {:?}", duration);
    println!("Requests/sec:   {:.2}", rps);
    println!("P50 Latency:    {:?}", p50);
    println!("P95 Latency:    {:?}", p95);
    println!("P99 Latency:    {:?}", p99);
    println!("-------------------------\n");
}
