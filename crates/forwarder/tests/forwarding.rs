//! End-to-end forwarding over loopback sockets: a fake dump1090 feed on one
//! side, listening endpoints on the other.

use marlink_forwarder::{DefaultSourceFactory, EngineState, ForwardingEngine};
use marlink_metadata::{
    BackoffConfig, EndpointRegistry, InstanceConfig, NewEndpoint, RetryConfig, SourceConfig,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

fn adsb_config(feed_port: u16) -> InstanceConfig {
    let mut config = InstanceConfig::adsb_defaults();
    config.source = SourceConfig::tcp("127.0.0.1", feed_port);
    config.reload_interval_secs = 0;
    config.retry = RetryConfig {
        attempts: 3,
        delay_ms: 500,
        connect_timeout_ms: 500,
    };
    config.backoff = BackoffConfig {
        source_retry_ms: 100,
        session_retry_ms: 100,
        restart_delay_ms: 10,
        stop_grace_ms: 5_000,
    };
    config
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Accept per-record connections until `count` lines have arrived
async fn collect(listener: TcpListener, count: usize) -> Vec<String> {
    let mut lines = Vec::new();
    while lines.len() < count {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = String::new();
        socket.read_to_string(&mut buf).await.unwrap();
        lines.extend(buf.lines().map(str::to_string));
    }
    lines
}

#[tokio::test]
async fn dead_endpoint_does_not_hold_back_healthy_one() {
    let feed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let feed_port = feed.local_addr().unwrap().port();
    let healthy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let healthy_port = healthy.local_addr().unwrap().port();
    let dead_port = closed_port().await;

    let tmp = TempDir::new().unwrap();
    let registry = Arc::new(
        EndpointRegistry::open(tmp.path().join("adsb.yaml"), adsb_config(feed_port)).unwrap(),
    );
    registry
        .add(NewEndpoint::new("Dead", "127.0.0.1", dead_port))
        .unwrap();
    registry
        .add(NewEndpoint::new("Shore", "127.0.0.1", healthy_port))
        .unwrap();

    let records: Vec<String> = (0..10)
        .map(|n| format!("MSG,3,1,1,A92F{:02X},1,,,,,,,35000", n))
        .collect();
    let feed_records = records.clone();
    tokio::spawn(async move {
        let (mut socket, _) = feed.accept().await.unwrap();
        for record in feed_records {
            socket
                .write_all(format!("{}\r\n", record).as_bytes())
                .await
                .unwrap();
        }
        // Hold the session open
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let engine = ForwardingEngine::new(Arc::clone(&registry), Arc::new(DefaultSourceFactory));
    engine.start().await.unwrap();

    // The dead endpoint costs ~1s per record; ten records would take ~10s serially
    let started = Instant::now();
    let received = timeout(Duration::from_secs(4), collect(healthy, records.len()))
        .await
        .expect("healthy endpoint starved by dead one");
    assert_eq!(received, records);
    assert!(started.elapsed() < Duration::from_secs(4));

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let status = engine.status();
    let dead = &status.endpoint_status["ENDPOINT_1"];
    assert!(!dead.connected);
    assert!(dead.error.is_some());
    let shore = &status.endpoint_status["ENDPOINT_2"];
    assert!(shore.connected);
    assert!(shore.error.is_none());

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn stop_is_bounded_while_feed_is_silent() {
    let feed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let feed_port = feed.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (_socket, _) = feed.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let tmp = TempDir::new().unwrap();
    let registry = Arc::new(
        EndpointRegistry::open(tmp.path().join("adsb.yaml"), adsb_config(feed_port)).unwrap(),
    );
    let engine = ForwardingEngine::new(registry, Arc::new(DefaultSourceFactory));
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(engine
        .logs(50)
        .iter()
        .any(|e| e.message == format!("Connected to 127.0.0.1:{}", feed_port)));

    let started = Instant::now();
    engine.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(!engine.status().running);
}

#[tokio::test]
async fn unavailable_feed_is_retried_not_fatal() {
    let feed_port = closed_port().await;
    let tmp = TempDir::new().unwrap();
    let registry = Arc::new(
        EndpointRegistry::open(tmp.path().join("adsb.yaml"), adsb_config(feed_port)).unwrap(),
    );
    let engine = ForwardingEngine::new(registry, Arc::new(DefaultSourceFactory));
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;

    assert!(engine.is_running());
    let failures = engine
        .logs(200)
        .iter()
        .filter(|e| e.message.starts_with("Failed to connect to 127.0.0.1"))
        .count();
    assert!(failures >= 2);
    assert!(engine
        .logs(200)
        .iter()
        .any(|e| e.message.contains("(retry in 100ms)")));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn missing_serial_device_keeps_engine_running() {
    let tmp = TempDir::new().unwrap();
    let mut config = InstanceConfig::ais_defaults();
    config.source = SourceConfig::serial("/dev/marlink-does-not-exist", 38400);
    config.backoff.source_retry_ms = 100;
    let registry = Arc::new(EndpointRegistry::open(tmp.path().join("ais.yaml"), config).unwrap());

    let engine = ForwardingEngine::new(registry, Arc::new(DefaultSourceFactory));
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(engine.is_running());
    assert!(engine
        .logs(50)
        .iter()
        .any(|e| e.message.starts_with("Failed to connect to /dev/marlink-does-not-exist @ 38400 baud")));
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn registry_edits_reach_engine_on_restart() {
    let feed_port = closed_port().await;
    let tmp = TempDir::new().unwrap();
    let registry = Arc::new(
        EndpointRegistry::open(tmp.path().join("adsb.yaml"), adsb_config(feed_port)).unwrap(),
    );
    let engine = ForwardingEngine::new(Arc::clone(&registry), Arc::new(DefaultSourceFactory));
    engine.start().await.unwrap();
    assert!(engine.status().endpoint_status.is_empty());

    let added = registry
        .add(NewEndpoint::new("Shore", "10.0.0.5", 10110))
        .unwrap();
    engine.restart().await.unwrap();

    let status = engine.status();
    assert_eq!(status.endpoints.len(), 1);
    assert_eq!(status.endpoints[0], added);
    assert!(status.endpoint_status.contains_key(&added.id));

    let backups = std::fs::read_dir(registry.backup_dir()).unwrap().count();
    assert_eq!(backups, 1);
    engine.stop().await.unwrap();
}
