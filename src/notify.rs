use crate::error::Error;
use chrono::{Local, NaiveDateTime};
use log::{error, info};
use reqwest::{Client, Url};
use serde::Serialize;

const PROCESS_NAME: &str = "Local Task Monitor";

#[derive(Serialize, Debug, PartialEq)]
struct FailureMessage {
    date: String,
    message: String,
    process_name: &'static str,
}

fn failure_message(task: &str, reason: &str, at: NaiveDateTime) -> FailureMessage {
    FailureMessage {
        date: at.format("%Y-%m-%d %H:%M").to_string(),
        message: format!(
            "Task '{}' failed. Please review the scheduled task. {}",
            task, reason
        ),
        process_name: PROCESS_NAME,
    }
}

/// Posts a single JSON message to a chat webhook when a job fails.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        WebhookNotifier {
            client: Client::new(),
            url: url.to_string(),
        }
    }

    /// Sends the failure once. The caller decides what to do when this fails; nothing is retried.
    pub async fn notify_failure(&self, task: &str, err: &Error) -> Result<(), Error> {
        let url = Url::parse(&self.url)?;
        let payload = failure_message(task, &err.to_string(), Local::now().naive_local());

        let resp = self.client.post(url).json(&payload).send().await?;
        info!("failure notification answered with {}", resp.status());
        resp.error_for_status()?;
        Ok(())
    }
}

/// Notifies if a webhook is configured, logging instead of failing when delivery breaks.
pub async fn report_failure(notifier: Option<&WebhookNotifier>, task: &str, err: &Error) {
    if let Some(notifier) = notifier {
        if let Err(notify_err) = notifier.notify_failure(task, err).await {
            error!("failed to send failure notification: {}", notify_err);
        }
    }
}
