//! Optional terminal-status webhook.
use std::time;

use serde::Serialize;
use tracing::{debug, warn};

use crate::invocation::InvocationStatus;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusNotification<'a> {
    correlation_id: &'a str,
    run_id: &'a str,
    status: InvocationStatus,
}

/// Fire-and-forget POST of a run's terminal status to a configured URL.
/// Delivery failures are logged and swallowed: notification is best effort
/// and never affects dispatch outcomes.
pub struct StatusNotifier {
    client: reqwest::Client,
    url: String,
}

impl StatusNotifier {
    pub fn new(url: String, request_timeout: time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for status notifications");

        Self { client, url }
    }

    pub async fn notify(&self, correlation_id: &str, run_id: &str, status: InvocationStatus) {
        let notification = StatusNotification {
            correlation_id,
            run_id,
            status,
        };

        match self.client.post(&self.url).json(&notification).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(correlation_id, run_id, "delivered status notification");
            }
            Ok(response) => {
                warn!(
                    correlation_id,
                    run_id,
                    status = %response.status(),
                    "status notification was not accepted"
                );
            }
            Err(error) => {
                warn!(correlation_id, run_id, "failed to deliver status notification: {error}");
            }
        }
    }
}
