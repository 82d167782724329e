//! Per-request telemetry
//!
//! The router fills in a [`RequestRecord`] for every proxied request and hands it to a
//! [`TelemetrySink`] once the backend has answered. Sinks must return immediately.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Records buffered before the UDP sink starts dropping
const UDP_QUEUE_CAPACITY: usize = 1024;

/// One proxied request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub remote_addr: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    /// Authority of the backend the request was sent to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl RequestRecord {
    /// Start a record for a request that was just received
    pub fn begin(remote_addr: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            start: Utc::now(),
            end: None,
            duration_ms: None,
            remote_addr: remote_addr.into(),
            method: method.into(),
            app: None,
            target: None,
            status: None,
            started: Some(Instant::now()),
        }
    }

    /// Stamp the end time and the response status
    pub fn finish(&mut self, status: u16) {
        self.end = Some(Utc::now());
        self.duration_ms = self.started.map(|s| s.elapsed().as_millis() as u64);
        self.status = Some(status);
    }
}

/// Receiver of completed request records
pub trait TelemetrySink: Send + Sync {
    /// Accept a completed record. Must not block.
    fn accept(&self, record: RequestRecord);
}

/// Sends each record as one JSON datagram to a fixed UDP target
pub struct UdpTelemetry {
    tx: mpsc::Sender<RequestRecord>,
    target: SocketAddr,
}

impl UdpTelemetry {
    /// Bind an ephemeral socket and start the sender task
    pub async fn connect(target: SocketAddr) -> std::io::Result<Self> {
        let bind_addr: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(target).await?;

        let (tx, mut rx) = mpsc::channel::<RequestRecord>(UDP_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let payload = match serde_json::to_vec(&record) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode telemetry record");
                        continue;
                    }
                };
                if let Err(e) = socket.send(&payload).await {
                    debug!(error = %e, "Failed to send telemetry datagram");
                }
            }
        });

        info!(%target, "UDP telemetry enabled");
        Ok(Self { tx, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl TelemetrySink for UdpTelemetry {
    fn accept(&self, record: RequestRecord) {
        if let Err(e) = self.tx.try_send(record) {
            debug!(error = %e, "Telemetry record dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_record_lifecycle() {
        let mut record = RequestRecord::begin("10.0.0.9:5123", "GET");
        assert!(record.end.is_none());
        assert!(record.status.is_none());

        record.app = Some("shop".into());
        record.finish(200);

        assert_eq!(record.status, Some(200));
        assert!(record.end.unwrap() >= record.start);
        assert!(record.duration_ms.is_some());
    }

    #[test]
    fn test_record_json() {
        let mut record = RequestRecord::begin("1.2.3.4:1", "DELETE");
        record.target = Some("runner:8080".into());
        record.finish(204);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["remoteAddr"], "1.2.3.4:1");
        assert_eq!(json["method"], "DELETE");
        assert_eq!(json["target"], "runner:8080");
        assert_eq!(json["status"], 204);
        assert!(json.get("app").is_none());
        assert!(json.get("started").is_none());
    }

    #[tokio::test]
    async fn test_udp_sink_delivers_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sink = UdpTelemetry::connect(receiver.local_addr().unwrap())
            .await
            .unwrap();

        let mut record = RequestRecord::begin("127.0.0.1:4000", "GET");
        record.app = Some("shop".into());
        record.finish(200);
        sink.accept(record);

        let mut buf = [0u8; 2048];
        let n = tokio::time::timeout(Duration::from_secs(5), receiver.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(json["app"], "shop");
        assert_eq!(json["status"], 200);
    }
}
