// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP health polling.
//!
//! Agents are checked with Basic auth, the router with a bearer token. A
//! check never hangs: each request has its own timeout and the loop has an
//! overall deadline, after which the last observed failure is reported.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

/// Upper bound for a single request inside a polling loop.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Credentials presented to a health endpoint.
#[derive(Clone, Default)]
pub enum HealthAuth {
    #[default]
    None,
    Basic { username: String, password: String },
    Bearer(String),
}

impl fmt::Debug for HealthAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Basic { username, .. } => write!(f, "Basic({}:***)", username),
            Self::Bearer(_) => write!(f, "Bearer(***)"),
        }
    }
}

/// Outcome of a health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    /// `"ok"` on success, otherwise the last observed status or error.
    pub message: String,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl HealthReport {
    fn new(healthy: bool, message: impl Into<String>, attempts: u32, started: Instant) -> Self {
        Self {
            healthy,
            message: message.into(),
            attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// One request against `url`. `Ok` only for a 2xx response.
pub async fn probe(
    client: &reqwest::Client,
    url: &str,
    auth: &HealthAuth,
    timeout: Duration,
) -> Result<(), String> {
    let mut request = client.get(url).timeout(timeout);
    request = match auth {
        HealthAuth::None => request,
        HealthAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
        HealthAuth::Bearer(token) => request.bearer_auth(token),
    };

    match request.send().await {
        Ok(response) if response.status().is_success() => Ok(()),
        Ok(response) => Err(format!("HTTP {}", response.status())),
        Err(e) if e.is_timeout() => Err("request timed out".to_string()),
        Err(e) if e.is_connect() => Err("connection refused".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// Single probe wrapped as a report.
pub async fn check_once(client: &reqwest::Client, url: &str, auth: &HealthAuth) -> HealthReport {
    let started = Instant::now();
    match probe(client, url, auth, REQUEST_TIMEOUT).await {
        Ok(()) => HealthReport::new(true, "ok", 1, started),
        Err(message) => HealthReport::new(false, message, 1, started),
    }
}

/// Poll `url` every `interval` until it answers 2xx or `timeout` elapses.
pub async fn wait_healthy(
    client: &reqwest::Client,
    url: &str,
    auth: &HealthAuth,
    timeout: Duration,
    interval: Duration,
) -> HealthReport {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempts = 0u32;
    let mut last = "no attempt made".to_string();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        attempts += 1;
        match probe(client, url, auth, remaining.min(REQUEST_TIMEOUT)).await {
            Ok(()) => {
                debug!("{} healthy after {} attempt(s)", url, attempts);
                return HealthReport::new(true, "ok", attempts, started);
            }
            Err(message) => {
                debug!("{} not healthy yet: {}", url, message);
                last = message;
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(interval.min(remaining)).await;
    }

    HealthReport::new(
        false,
        format!("timed out after {} attempt(s): {}", attempts, last),
        attempts,
        started,
    )
}

#[cfg(test)]
pub(crate) mod test_server {
    //! Minimal HTTP responder for health tests.

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `status` to every request after the first `fail_first` requests,
    /// which get a 503. Returns the bound port and the captured request heads.
    pub async fn serve(status: u16, fail_first: u32) -> (u16, Arc<tokio::sync::Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicU32::new(0));

        let captured = Arc::clone(&seen);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let captured = Arc::clone(&captured);
                let n = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let read = socket.read(&mut buf).await.unwrap_or(0);
                    captured
                        .lock()
                        .await
                        .push(String::from_utf8_lossy(&buf[..read]).to_string());
                    let code = if n < fail_first { 503 } else { status };
                    let response = format!(
                        "HTTP/1.1 {} X\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                        code
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (port, seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthy_endpoint() {
        let (port, seen) = test_server::serve(200, 0).await;
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/global/health", port);
        let auth = HealthAuth::Basic {
            username: "opencode".to_string(),
            password: "secret".to_string(),
        };

        let report = wait_healthy(
            &client,
            &url,
            &auth,
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .await;
        assert!(report.healthy);
        assert_eq!(report.attempts, 1);

        let requests = seen.lock().await;
        let head = requests[0].to_lowercase();
        assert!(head.starts_with("get /global/health"));
        assert!(head.contains("authorization: basic"));
    }

    #[tokio::test]
    async fn test_recovers_after_failures() {
        let (port, _) = test_server::serve(200, 2).await;
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/health", port);

        let report = wait_healthy(
            &client,
            &url,
            &HealthAuth::Bearer("token".to_string()),
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await;
        assert!(report.healthy);
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn test_timeout_reports_last_status() {
        let (port, _) = test_server::serve(500, 0).await;
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/health", port);

        let report = wait_healthy(
            &client,
            &url,
            &HealthAuth::None,
            Duration::from_millis(300),
            Duration::from_millis(50),
        )
        .await;
        assert!(!report.healthy);
        assert!(report.attempts >= 1);
        assert!(report.message.contains("500"), "message: {}", report.message);
    }

    #[tokio::test]
    async fn test_nothing_listening() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = reqwest::Client::new();
        let report = check_once(&client, &format!("http://127.0.0.1:{}/", port), &HealthAuth::None).await;
        assert!(!report.healthy);
        assert_eq!(report.attempts, 1);
    }

    #[test]
    fn test_auth_debug_redacts() {
        let auth = HealthAuth::Basic {
            username: "opencode".to_string(),
            password: "hunter2".to_string(),
        };
        let printed = format!("{:?}", auth);
        assert!(!printed.contains("hunter2"));
        assert!(format!("{:?}", HealthAuth::Bearer("tok".into())).contains("***"));
    }
}
