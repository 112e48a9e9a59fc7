use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// First report fires within this many seconds of daemon start.
const INITIAL_DELAY_S: u64 = 2;

/// Butler → switchboard liveness reporter.
///
/// Every butler except the switchboard itself runs one of these. Connection
/// errors and non-200 answers are WARN-level only; the loop survives them
/// and is cancelled cleanly on shutdown.
pub struct LivenessReporter {
    butler_name: String,
    url: String,
    interval: Duration,
    client: reqwest::Client,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LivenessReporter {
    /// `interval_seconds` must be positive (enforced by config validation);
    /// a zero slips through only in hand-built tests and is bumped to 1.
    pub fn new(butler_name: &str, switchboard_url: &str, interval_seconds: u64) -> Self {
        Self {
            butler_name: butler_name.to_string(),
            url: format!(
                "{}/api/switchboard/heartbeat",
                switchboard_url.trim_end_matches('/')
            ),
            interval: Duration::from_secs(interval_seconds.max(1)),
            client: reqwest::Client::new(),
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn start(&mut self) {
        let (butler_name, url) = (self.butler_name.clone(), self.url.clone());
        let (client, interval) = (self.client.clone(), self.interval);
        let cancel = self.cancel.clone();

        self.handle = Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(INITIAL_DELAY_S)) => {}
                _ = cancel.cancelled() => return,
            }
            loop {
                match client
                    .post(&url)
                    .json(&serde_json::json!({ "butler_name": butler_name }))
                    .send()
                    .await
                {
                    Ok(response) if response.status().is_success() => {
                        debug!(butler = %butler_name, "liveness heartbeat acknowledged");
                    }
                    Ok(response) => {
                        warn!(butler = %butler_name, status = %response.status(),
                              "liveness heartbeat rejected");
                    }
                    Err(e) => {
                        warn!(butler = %butler_name, error = %e, "liveness heartbeat failed");
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => {
                        info!(butler = %butler_name, "liveness reporter stopped");
                        return;
                    }
                }
            }
        }));
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn spawn_switchboard_stub(hits: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/api/switchboard/heartbeat",
            post(move |Json(body): Json<serde_json::Value>| {
                let hits = hits.clone();
                async move {
                    assert_eq!(body["butler_name"], "health");
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({"status": "ok", "eligibility_state": "eligible"}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn first_heartbeat_fires_within_five_seconds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_switchboard_stub(hits.clone()).await;

        let mut reporter = LivenessReporter::new("health", &url, 120);
        reporter.start();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        reporter.stop().await;
    }

    #[tokio::test]
    async fn unreachable_switchboard_does_not_kill_the_loop() {
        // Nothing listens on this port.
        let mut reporter = LivenessReporter::new("health", "http://127.0.0.1:9", 1);
        reporter.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // stop() still finds a live task: the loop survived the error.
        reporter.stop().await;
    }
}
