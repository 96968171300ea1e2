//! Integration tests for the network scanner

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use talm::discovery::{ResourceItem, ResourceKind, StaticNodeApi};
use talm::error::{Classify, ErrorKind};
use talm::scanner::{Prober, ScanError, Scanner, TcpProber};

/// Facts for a node at `ip` with MAC `mac`.
fn inventory(api: StaticNodeApi, ip: &str, mac: &str) -> StaticNodeApi {
    let gib = 1024u64 * 1024 * 1024;
    api.with_resource(ip, ResourceKind::Hostname, vec![ResourceItem::new("hostname", json!({"hostname": format!("talos-{}", ip.replace('.', "-"))}))])
        .with_resource(ip, ResourceKind::Disks, vec![ResourceItem::new("sda", json!({"dev_path": "/dev/sda", "size": 32 * gib}))])
        .with_resource(ip, ResourceKind::Links, vec![ResourceItem::new("eth0", json!({"hardwareAddr": mac}))])
        .with_resource(ip, ResourceKind::Addresses, vec![ResourceItem::new("eth0/a", json!({"address": format!("{ip}/24"), "linkName": "eth0"}))])
        .with_resource(ip, ResourceKind::Routes, vec![])
}

/// Answers at once for `fast`, and only after `slow` for everyone else.
struct Staggered {
    fast: IpAddr,
    slow: Duration,
}

#[async_trait]
impl Prober for Staggered {
    async fn probe(&self, ip: IpAddr, _deadline: Duration) -> bool {
        if ip == self.fast {
            return true;
        }
        tokio::time::sleep(self.slow).await;
        true
    }
}

#[tokio::test]
async fn test_tcp_probe_finds_listening_host() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((_socket, _)) = listener.accept().await {}
    });

    let api = inventory(StaticNodeApi::new(), "127.0.0.1", "52:54:00:00:00:01");
    let scanner = Scanner::new(Arc::new(api)).with_prober(Arc::new(TcpProber::new().with_port(port)));
    let nodes = scanner.scan("127.0.0.1/32", None).await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].hostname, "talos-127-0-0-1");
    assert_eq!(nodes[0].mac.as_deref(), Some("52:54:00:00:00:01"));
    assert_eq!(nodes[0].facts.disks[0].dev_path, "/dev/sda");
}

#[tokio::test]
async fn test_cancel_returns_within_probe_deadline() {
    let deadline = Duration::from_secs(2);
    let mut api = StaticNodeApi::new();
    for host in 1..=14 {
        let ip = format!("10.0.0.{host}");
        api = inventory(api, &ip, &format!("52:54:00:00:00:{host:02x}"));
    }
    let cancel = CancellationToken::new();
    let scanner = Scanner::new(Arc::new(api))
        .with_prober(Arc::new(Staggered {
            fast: "10.0.0.1".parse().unwrap(),
            slow: Duration::from_secs(60),
        }))
        .with_probe_deadline(deadline)
        .with_target_count(0)
        .with_cancel(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = scanner.scan("10.0.0.0/28", None).await.unwrap_err();
    assert!(started.elapsed() < deadline, "took {:?}", started.elapsed());
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    let partial: Vec<String> = err.partial().iter().map(|n| n.ip.to_string()).collect();
    assert_eq!(partial, vec!["10.0.0.1"]);
    assert!(matches!(err, ScanError::Cancelled { .. }));
}

#[tokio::test]
async fn test_progress_and_dedup_by_mac() {
    let api = inventory(StaticNodeApi::new(), "10.0.0.1", "52:54:00:00:00:01");
    let api = inventory(api, "10.0.0.2", "52:54:00:00:00:01");
    let scanner = Scanner::new(Arc::new(api))
        .with_prober(Arc::new(Staggered {
            fast: "10.0.0.1".parse().unwrap(),
            slow: Duration::ZERO,
        }))
        .with_target_count(0);

    let (tx, mut rx) = tokio::sync::mpsc::channel(128);
    let nodes = scanner.scan("10.0.0.0/29", Some(&tx)).await.unwrap();
    drop(tx);
    assert_eq!(nodes.len(), 1);

    let mut seen = Vec::new();
    while let Some(percent) = rx.recv().await {
        seen.push(percent);
    }
    assert_eq!(seen.first(), Some(&0));
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_range_limits() {
    let scanner = Scanner::new(Arc::new(StaticNodeApi::new()));
    let err = scanner.scan("10.0.0.0/8", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(matches!(err, ScanError::RangeTooLarge { min: 16, .. }));

    let err = scanner.scan("not-a-cidr", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}
