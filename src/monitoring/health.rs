//! Health check HTTP endpoint.
//!
//! A tiny HTTP server on the configured address that returns scanner status,
//! the feed position and the latest downloader and parser statistics as JSON.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::feed::stats::DownloaderStats;
use crate::scanner::dispatcher::ParseStats;

/// Shared health state updated by the scanner actors.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<RwLock<HealthData>>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthData {
    status: String,
    league: String,
    started_at: DateTime<Utc>,
    uptime_seconds: i64,
    payloads: u64,
    last_change_id: Option<String>,
    last_payload_at: Option<DateTime<Utc>>,
    active_filters: usize,
    downloader: Option<DownloaderStats>,
    parser: Option<ParseStats>,
}

impl HealthState {
    pub fn new(league: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HealthData {
                status: "starting".to_string(),
                league: league.into(),
                started_at: Utc::now(),
                uptime_seconds: 0,
                payloads: 0,
                last_change_id: None,
                last_payload_at: None,
                active_filters: 0,
                downloader: None,
                parser: None,
            })),
        }
    }

    pub async fn set_status(&self, status: &str) {
        self.inner.write().await.status = status.to_string();
    }

    pub async fn record_parse(&self, stats: &ParseStats) {
        let mut data = self.inner.write().await;
        data.payloads += 1;
        data.last_change_id = Some(stats.change_id.clone());
        data.last_payload_at = Some(Utc::now());
        data.parser = Some(stats.clone());
        data.status = "scanning".to_string();
    }

    pub async fn record_downloader(&self, stats: DownloaderStats) {
        self.inner.write().await.downloader = Some(stats);
    }

    pub async fn record_filters(&self, active: usize) {
        self.inner.write().await.active_filters = active;
    }

    /// Periodic one-line status at INFO.
    pub async fn log_status(&self) {
        let data = self.inner.read().await;
        let downloader = data.downloader.as_ref();
        info!(
            status = %data.status,
            payloads = data.payloads,
            change_id = data.last_change_id.as_deref().unwrap_or(""),
            active_filters = data.active_filters,
            ids_per_second = downloader.and_then(|d| d.ids_per_second).unwrap_or(0.0),
            in_flight = downloader.map_or(0, |d| d.in_flight),
            skip_ahead = downloader.is_some_and(|d| d.skip_ahead),
            "Scan status"
        );
    }

    async fn to_json(&self) -> String {
        let mut data = self.inner.write().await;
        data.uptime_seconds = (Utc::now() - data.started_at).num_seconds();
        serde_json::to_string(&*data).unwrap_or_else(|_| {
            r#"{"status":"error","message":"serialization failed"}"#.to_string()
        })
    }
}

/// Spawn the health check HTTP server. Returns a handle that can be aborted.
pub fn spawn_health_server(addr: String, state: HealthState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => {
                info!(addr = %addr, "Health check server listening");
                l
            }
            Err(e) => {
                warn!(error = %e, addr = %addr, "Failed to bind health check server, continuing without it");
                return;
            }
        };

        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept health check connection");
                    continue;
                }
            };

            let state = state.clone();
            tokio::spawn(async move {
                // the request itself is not inspected
                let mut buf = [0u8; 1024];
                let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;

                let body = state.to_json().await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\n\
                     Content-Type: application/json\r\n\
                     Content-Length: {}\r\n\
                     Connection: close\r\n\
                     \r\n\
                     {}",
                    body.len(),
                    body
                );

                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_stats() -> ParseStats {
        ParseStats {
            change_id: "1-2-3-4-5".to_string(),
            tabs: 10,
            league_tabs: 4,
            items: 120,
            matches: 2,
            accepted: 1,
            parse_ms: 15.0,
            items_per_second: 8000.0,
        }
    }

    #[tokio::test]
    async fn test_health_state_update() {
        let state = HealthState::new("Standard");
        state.record_parse(&parse_stats()).await;
        state.record_filters(7).await;

        let data = state.inner.read().await;
        assert_eq!(data.payloads, 1);
        assert_eq!(data.last_change_id.as_deref(), Some("1-2-3-4-5"));
        assert_eq!(data.active_filters, 7);
        assert_eq!(data.status, "scanning");
    }

    #[tokio::test]
    async fn test_health_server_responds() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let state = HealthState::new("Standard");
        state.record_parse(&parse_stats()).await;
        let handle = spawn_health_server(addr.clone(), state);

        // give the server time to bind
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let mut stream = tokio::net::TcpStream::connect(&addr)
            .await
            .expect("should connect to health server");

        let request = "GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n";
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let n = tokio::io::AsyncReadExt::read(&mut stream, &mut buf)
            .await
            .unwrap();
        let response = String::from_utf8_lossy(&buf[..n]);

        assert!(response.contains("200 OK"));
        assert!(response.contains("\"status\":\"scanning\""));
        assert!(response.contains("\"last_change_id\":\"1-2-3-4-5\""));

        handle.abort();
    }
}
