use crate::ports::parse_port_value;
use crate::types::{PingReport, PortCheckResult, ProbeResult};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::debug;

pub const DEFAULT_PING_PORT: u16 = 443;
pub const DEFAULT_PING_COUNT: u32 = 4;
pub const MAX_PING_COUNT: u32 = 20;
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_PORT_CHECK_TIMEOUT: Duration = Duration::from_millis(1500);

/// Open one TCP connection to `host:port` and report how long the handshake took.
///
/// Name resolution happens inside the timed attempt, so a slow resolver counts
/// against `timeout`. The stream is dropped as soon as the connect completes.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> ProbeResult {
    let start = Instant::now();
    match time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            let latency_ms = start.elapsed().as_millis() as u64;
            drop(stream);
            ProbeResult::connected(latency_ms)
        }
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "connect failed");
            ProbeResult::failed(e.to_string())
        }
        Err(_) => ProbeResult::failed("timeout"),
    }
}

/// Take `count` sequential latency samples. Sample `i` lands at index `i`;
/// failed attempts are `None`.
pub async fn ping(host: &str, port: u16, count: u32, timeout: Duration) -> PingReport {
    let count = count.clamp(1, MAX_PING_COUNT);
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        values.push(probe(host, port, timeout).await.latency_ms);
    }
    PingReport {
        host: host.to_string(),
        port,
        values,
        note: format!(
            "TCP connect latency in ms to port {port} (ICMP is not used); null means no connection within {} ms",
            timeout.as_millis()
        ),
    }
}

/// Probe every requested port concurrently, bounded by `concurrency`.
///
/// Entries that are not integers in 1..=65535 are marked `invalid` without
/// touching the network. Results come back in request order.
pub async fn check_ports(
    host: &str,
    ports: &[Value],
    timeout: Duration,
    concurrency: usize,
) -> Vec<PortCheckResult> {
    let mut slots: Vec<Option<PortCheckResult>> = vec![None; ports.len()];
    let sem = Arc::new(Semaphore::new(concurrency.clamp(1, 5_000)));
    let mut set = JoinSet::new();

    for (idx, raw) in ports.iter().enumerate() {
        let Some(port) = parse_port_value(raw) else {
            slots[idx] = Some(PortCheckResult {
                port: raw.clone(),
                open: false,
                reason: Some("invalid".into()),
            });
            continue;
        };

        let sem = sem.clone();
        let host = host.to_string();
        set.spawn(async move {
            // The semaphore is never closed, so acquire only fails if that changes.
            let _permit = sem.acquire_owned().await.ok();
            (idx, probe(&host, port, timeout).await)
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, res)) => {
                slots[idx] = Some(PortCheckResult {
                    port: ports[idx].clone(),
                    open: res.ok,
                    reason: res.error,
                });
            }
            Err(e) => debug!(error = %e, "port probe task failed"),
        }
    }

    slots
        .into_iter()
        .zip(ports)
        .map(|(slot, raw)| {
            slot.unwrap_or_else(|| PortCheckResult {
                port: raw.clone(),
                open: false,
                reason: Some("probe task failed".into()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::{TcpListener, TcpSocket};

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    /// A listener that never accepts, with its backlog filled so further
    /// handshakes stall instead of completing or being refused.
    async fn stalled_port() -> (TcpListener, Vec<TcpStream>, u16) {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut held = Vec::new();
        for _ in 0..64 {
            match time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => held.push(stream),
                _ => return (listener, held, addr.port()),
            }
        }
        panic!("backlog of {addr} never filled");
    }

    #[tokio::test]
    async fn probe_open_port_reports_latency() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let res = probe("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(res.ok);
        assert!(res.latency_ms.is_some());
        assert!(res.error.is_none());
    }

    #[tokio::test]
    async fn probe_closed_port_reports_error() {
        let port = closed_port().await;
        let res = probe("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(!res.ok);
        assert!(res.latency_ms.is_none());
        assert!(res.error.is_some());
    }

    #[tokio::test]
    async fn stalled_handshake_reports_timeout() {
        let (_listener, _held, port) = stalled_port().await;
        let res = probe("127.0.0.1", port, Duration::from_millis(100)).await;
        assert!(!res.ok);
        assert!(res.latency_ms.is_none());
        assert_eq!(res.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn check_ports_reports_timeout_reason() {
        let (_listener, _held, port) = stalled_port().await;
        let ports = vec![json!(port), json!(0)];
        let results = check_ports("127.0.0.1", &ports, Duration::from_millis(100), 4).await;
        assert_eq!(results[0].port, json!(port));
        assert!(!results[0].open);
        assert_eq!(results[0].reason.as_deref(), Some("timeout"));
        assert_eq!(results[1].reason.as_deref(), Some("invalid"));
    }

    #[tokio::test]
    async fn check_ports_accepts_whole_float_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let ports = vec![json!(open as f64)];
        let results = check_ports("127.0.0.1", &ports, Duration::from_secs(1), 4).await;
        assert!(results[0].open);
        assert_eq!(results[0].port, json!(open as f64));
    }

    #[tokio::test]
    async fn probe_unresolvable_host_reports_error() {
        let res = probe("host.invalid", 80, Duration::from_secs(5)).await;
        assert!(!res.ok);
        assert!(res.error.is_some());
    }

    #[tokio::test]
    async fn ping_clamps_count_and_keeps_order() {
        let port = closed_port().await;
        let report = ping("127.0.0.1", port, 0, Duration::from_millis(500)).await;
        assert_eq!(report.values, vec![None]);

        let report = ping("127.0.0.1", port, 100, Duration::from_millis(500)).await;
        assert_eq!(report.values.len(), MAX_PING_COUNT as usize);
        assert_eq!(report.port, port);
    }

    #[tokio::test]
    async fn check_ports_preserves_request_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = closed_port().await;

        let ports = vec![json!(closed), json!(99999), json!(open), json!("abc")];
        let results = check_ports("127.0.0.1", &ports, Duration::from_secs(1), 8).await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].port, json!(closed));
        assert!(!results[0].open);
        assert_eq!(results[1].reason.as_deref(), Some("invalid"));
        assert_eq!(results[2].port, json!(open));
        assert!(results[2].open);
        assert!(results[2].reason.is_none());
        assert_eq!(results[3].port, json!("abc"));
        assert_eq!(results[3].reason.as_deref(), Some("invalid"));
    }
}
