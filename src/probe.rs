//! Network and protocol readiness probes.
//!
//! Probes never return errors: refused connections, resets, timeouts and bad
//! responses all read as "not ready yet".

use std::future::Future;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

/// Connect timeout for a single TCP probe.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(300);
/// Per-request budget for a single HTTP probe.
pub const HTTP_PROBE_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Content types a health endpoint may answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Json,
}

impl ContentKind {
    pub fn matches(self, content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match self {
            Self::Html => essence == "text/html",
            Self::Json => essence == "application/json" || essence.ends_with("+json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessCheck {
    /// Ready once a TCP connect succeeds.
    Port { host: String, port: u16 },
    /// Ready once a GET answers 200 with an accepted content type.
    Http {
        url: String,
        timeout: Duration,
        accepted: Vec<ContentKind>,
    },
}

impl ReadinessCheck {
    pub fn port(host: impl Into<String>, port: u16) -> Self {
        Self::Port {
            host: host.into(),
            port,
        }
    }

    pub fn http(url: impl Into<String>, accepted: &[ContentKind]) -> Self {
        Self::Http {
            url: url.into(),
            timeout: HTTP_PROBE_TIMEOUT,
            accepted: accepted.to_vec(),
        }
    }

    pub async fn probe(&self, client: &reqwest::Client) -> bool {
        match self {
            Self::Port { host, port } => check_port(host, *port).await,
            Self::Http {
                url,
                timeout,
                accepted,
            } => check_http(client, url, *timeout, accepted).await,
        }
    }

    pub fn target(&self) -> String {
        match self {
            Self::Port { host, port } => format!("tcp://{host}:{port}"),
            Self::Http { url, .. } => url.clone(),
        }
    }
}

/// Client used for all HTTP probes. Probes only target loopback services, so
/// proxy settings from the environment are ignored.
pub fn probe_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .unwrap_or_default()
}

/// True when something accepts TCP connections on `host:port`.
pub async fn check_port(host: &str, port: u16) -> bool {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        Ok(Err(err)) => {
            log::trace!(target: "shell", "tcp probe {host}:{port}: {err}");
            false
        }
        Err(_) => false,
    }
}

/// True only for status 200 with a content type in `accepted`.
pub async fn check_http(
    client: &reqwest::Client,
    url: &str,
    request_timeout: Duration,
    accepted: &[ContentKind],
) -> bool {
    let response = match client.get(url).timeout(request_timeout).send().await {
        Ok(response) => response,
        Err(err) => {
            log::trace!(target: "shell", "http probe {url}: {err}");
            return false;
        }
    };
    if response.status() != StatusCode::OK {
        log::trace!(target: "shell", "http probe {url}: status {}", response.status());
        return false;
    }
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    accepted.iter().any(|kind| kind.matches(content_type))
}

/// Polls `check` every `interval` until it succeeds or `total` elapses.
///
/// At least one check always runs. Each check is cut off at the deadline
/// (or after one interval, whichever is later), so the call returns within
/// `total + interval`.
pub async fn wait_until_ready<F, Fut>(mut check: F, total: Duration, interval: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + total;
    loop {
        let budget = deadline.saturating_duration_since(Instant::now()).max(interval);
        if timeout(budget, check()).await.unwrap_or(false) {
            return true;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        sleep(interval.min(remaining)).await;
    }
}

/// [`wait_until_ready`] over a [`ReadinessCheck`].
pub async fn wait_for(
    client: &reqwest::Client,
    check: &ReadinessCheck,
    total: Duration,
    interval: Duration,
) -> bool {
    wait_until_ready(|| check.probe(client), total, interval).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn content_kind_matches_essence_only() {
        assert!(ContentKind::Html.matches("text/html; charset=utf-8"));
        assert!(ContentKind::Json.matches("Application/JSON"));
        assert!(ContentKind::Json.matches("application/problem+json"));
        assert!(!ContentKind::Json.matches("text/plain"));
        assert!(!ContentKind::Html.matches(""));
    }

    #[tokio::test(start_paused = true)]
    async fn always_false_returns_false_at_timeout() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let start = Instant::now();
        let ready = wait_until_ready(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { false }
            },
            Duration::from_millis(20_000),
            Duration::from_millis(500),
        )
        .await;

        assert!(!ready);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20_000));
        assert!(elapsed <= Duration::from_millis(20_500));
        assert_eq!(calls.load(Ordering::SeqCst), 41);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_first_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let start = Instant::now();
        let ready = wait_until_ready(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { n >= 3 }
            },
            Duration::from_secs(20),
            Duration::from_millis(500),
        )
        .await;

        assert!(ready);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_still_checks_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let ready = wait_until_ready(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { false }
            },
            Duration::ZERO,
            Duration::from_millis(100),
        )
        .await;
        assert!(!ready);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_check_is_cut_off() {
        let start = Instant::now();
        let ready = wait_until_ready(
            || std::future::pending::<bool>(),
            Duration::from_secs(2),
            Duration::from_millis(500),
        )
        .await;
        assert!(!ready);
        assert!(start.elapsed() <= Duration::from_millis(2_500));
    }

    #[tokio::test]
    async fn closed_port_is_not_ready() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!check_port("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn bound_port_is_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(check_port("127.0.0.1", port).await);
    }
}
