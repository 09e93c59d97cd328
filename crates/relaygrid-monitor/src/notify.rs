//! Operator notifications.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relaygrid_balancer::SyncReport;
use serde::Serialize;
use tracing::{error, info, warn};

/// Something an operator should know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetEvent {
    /// The main server's live config differed from the render.
    LocalDrift { expected: String, actual: Option<String> },
    Drift {
        node: String,
        expected: String,
        actual: Option<String>,
    },
    Resynced { node: String },
    RolledBack { node: String, reason: String },
    Unreachable { node: String, reason: String },
    ControlPlaneUnreachable { reason: String },
    Unhealthy { node: String, status: String },
    Restarted { node: String },
    Recovered { node: String },
    /// Self-healing gave up or a rollback failed.
    ManualAttention { node: String, reason: String },
}

impl FleetEvent {
    pub fn node(&self) -> Option<&str> {
        match self {
            FleetEvent::LocalDrift { .. } | FleetEvent::ControlPlaneUnreachable { .. } => None,
            FleetEvent::Drift { node, .. }
            | FleetEvent::Resynced { node }
            | FleetEvent::RolledBack { node, .. }
            | FleetEvent::Unreachable { node, .. }
            | FleetEvent::Unhealthy { node, .. }
            | FleetEvent::Restarted { node }
            | FleetEvent::Recovered { node }
            | FleetEvent::ManualAttention { node, .. } => Some(node),
        }
    }
}

impl std::fmt::Display for FleetEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FleetEvent::LocalDrift { .. } => write!(f, "main server config drifted"),
            FleetEvent::Drift { node, .. } => write!(f, "{node}: config drifted"),
            FleetEvent::Resynced { node } => write!(f, "{node}: config resynced"),
            FleetEvent::RolledBack { node, reason } => write!(f, "{node}: update rolled back ({reason})"),
            FleetEvent::Unreachable { node, reason } => write!(f, "{node}: unreachable ({reason})"),
            FleetEvent::ControlPlaneUnreachable { reason } => {
                write!(f, "control plane unreachable ({reason})")
            }
            FleetEvent::Unhealthy { node, status } => write!(f, "{node}: unhealthy (status {status})"),
            FleetEvent::Restarted { node } => write!(f, "{node}: service restarted"),
            FleetEvent::Recovered { node } => write!(f, "{node}: healthy again"),
            FleetEvent::ManualAttention { node, reason } => {
                write!(f, "{node}: manual attention required ({reason})")
            }
        }
    }
}

/// Sink for fleet events. Delivery failures are the notifier's problem;
/// they never fail the monitor cycle.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &FleetEvent);
}

/// Send one event per node of a sync pass that did not simply apply.
/// Applied nodes are reported as `Resynced`.
pub async fn report_sync(notifier: &dyn Notifier, report: &SyncReport) {
    for node in &report.applied {
        notifier
            .notify(&FleetEvent::Resynced { node: node.clone() })
            .await;
    }
    for f in &report.rolled_back {
        notifier
            .notify(&FleetEvent::RolledBack {
                node: f.node.clone(),
                reason: f.reason.clone(),
            })
            .await;
    }
    for f in &report.unreachable {
        notifier
            .notify(&FleetEvent::Unreachable {
                node: f.node.clone(),
                reason: f.reason.clone(),
            })
            .await;
    }
    for f in report.failed.iter().chain(&report.unknown) {
        notifier
            .notify(&FleetEvent::ManualAttention {
                node: f.node.clone(),
                reason: f.reason.clone(),
            })
            .await;
    }
}

/// Writes events to the log at a level matching their severity.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &FleetEvent) {
        match event {
            FleetEvent::ManualAttention { .. } => {
                error!(node = event.node().unwrap_or("-"), "{event}");
            }
            FleetEvent::Resynced { .. } | FleetEvent::Restarted { .. } | FleetEvent::Recovered { .. } => {
                info!(node = event.node().unwrap_or("-"), "{event}");
            }
            _ => warn!(node = event.node().unwrap_or("-"), "{event}"),
        }
    }
}

/// POSTs each event as JSON to an HTTP endpoint.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    #[serde(flatten)]
    event: &'a FleetEvent,
    message: String,
    at: u64,
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &FleetEvent) {
        let payload = WebhookPayload {
            event,
            message: event.to_string(),
            at: relaygrid_core::epoch_secs(),
        };
        match self.http.post(&self.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(url = %self.url, status = %resp.status(), "webhook rejected event"),
            Err(e) => warn!(url = %self.url, error = %e, "webhook delivery failed"),
        }
    }
}

/// Delivers to every inner notifier in order.
#[derive(Clone, Default)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, event: &FleetEvent) {
        for sink in &self.sinks {
            sink.notify(event).await;
        }
    }
}

/// Keeps every event in memory.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: std::sync::Mutex<Vec<FleetEvent>>,
}

#[cfg(any(test, feature = "test-util"))]
impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FleetEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &FleetEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(FleetEvent::RolledBack {
            node: "b".to_string(),
            reason: "validate".to_string(),
        })
        .unwrap();
        assert_eq!(json["event"], "rolled_back");
        assert_eq!(json["node"], "b");
    }

    #[tokio::test]
    async fn fanout_reaches_every_sink() {
        let a = Arc::new(RecordingNotifier::new());
        let b = Arc::new(RecordingNotifier::new());
        let fanout = FanoutNotifier::new().with(a.clone()).with(b.clone());

        fanout
            .notify(&FleetEvent::Recovered {
                node: "a".to_string(),
            })
            .await;
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
    }

    #[tokio::test]
    async fn webhook_posts_event_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({
                "event": "manual_attention",
                "node": "c",
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let webhook = WebhookNotifier::new(format!("{}/hook", server.uri())).unwrap();
        webhook
            .notify(&FleetEvent::ManualAttention {
                node: "c".to_string(),
                reason: "still unhealthy".to_string(),
            })
            .await;
    }

    #[tokio::test]
    async fn webhook_failure_does_not_panic() {
        let webhook = WebhookNotifier::new("http://127.0.0.1:9/hook").unwrap();
        webhook
            .notify(&FleetEvent::Restarted {
                node: "a".to_string(),
            })
            .await;
    }
}
