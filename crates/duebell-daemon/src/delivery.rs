use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use duebell_core::config::DeliveryConfig;
use duebell_core::Task;
use duebell_scheduler::{DeliveryError, Notifier};

/// Writes one structured log event per due task. Used when no webhook is set.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send_due(&self, tasks: &[Task]) -> Result<(), DeliveryError> {
        for task in tasks {
            info!(
                task_id = task.id,
                name = %task.name,
                due_at = %task.due_at.to_rfc3339(),
                recipients = ?task.recipients(),
                "task due"
            );
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct DuePayload<'a> {
    event: &'static str,
    delivery_id: Uuid,
    tasks: &'a [Task],
}

/// POSTs due notifications as JSON to a fixed URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("duebell/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send_due(&self, tasks: &[Task]) -> Result<(), DeliveryError> {
        let payload = DuePayload {
            event: "task.due",
            delivery_id: Uuid::new_v4(),
            tasks,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
            });
        }
        debug!(delivery_id = %payload.delivery_id, status = status.as_u16(), "webhook accepted");
        Ok(())
    }
}

/// Webhook when a URL is configured, log-only otherwise.
pub fn build_notifier(config: &DeliveryConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    match config.webhook_url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => {
            let timeout = Duration::from_secs(config.webhook_timeout_secs);
            info!(%url, "due notifications go to webhook");
            Ok(Arc::new(WebhookNotifier::new(url, timeout)?))
        }
        None => {
            info!("no webhook configured; due notifications are logged only");
            Ok(Arc::new(LogNotifier))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn task() -> Task {
        Task::new(3, "file taxes", "ana", Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap())
            .with_assignees(vec!["bo".into()])
    }

    /// Accepts one connection, answers with `status`, and returns the request body.
    async fn one_shot_server(status: u16) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hooks/due", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let body = loop {
                let n = sock.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if buf.len() >= split + 4 + length {
                        break text[split + 4..].to_string();
                    }
                }
                if n == 0 {
                    break String::new();
                }
            };
            let reply = format!(
                "HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
            );
            sock.write_all(reply.as_bytes()).await.unwrap();
            body
        });
        (url, server)
    }

    #[tokio::test]
    async fn log_notifier_accepts_everything() {
        assert!(LogNotifier.send_due(&[task()]).await.is_ok());
        assert!(LogNotifier.send_due(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn webhook_posts_due_payload() {
        let (url, server) = one_shot_server(200).await;
        let notifier = WebhookNotifier::new(url, Duration::from_secs(5)).unwrap();
        notifier.send_due(&[task()]).await.unwrap();

        let body: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body["event"], "task.due");
        assert!(body["delivery_id"].as_str().is_some());
        assert_eq!(body["tasks"][0]["id"], 3);
        assert_eq!(body["tasks"][0]["assignees"][0], "bo");
    }

    #[tokio::test]
    async fn webhook_error_status_is_rejected() {
        let (url, server) = one_shot_server(503).await;
        let notifier = WebhookNotifier::new(url, Duration::from_secs(5)).unwrap();
        let err = notifier.send_due(&[task()]).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { status: 503 }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_webhook_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);
        let notifier = WebhookNotifier::new(url, Duration::from_secs(5)).unwrap();
        let err = notifier.send_due(&[task()]).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transport(_)));
    }

    #[test]
    fn builds_notifier_from_config() {
        let log = build_notifier(&DeliveryConfig::default()).unwrap();
        assert_eq!(log.name(), "log");

        let blank = DeliveryConfig {
            webhook_url: Some(String::new()),
            ..DeliveryConfig::default()
        };
        assert_eq!(build_notifier(&blank).unwrap().name(), "log");

        let hook = DeliveryConfig {
            webhook_url: Some("http://127.0.0.1:9/due".into()),
            ..DeliveryConfig::default()
        };
        assert_eq!(build_notifier(&hook).unwrap().name(), "webhook");
    }
}
