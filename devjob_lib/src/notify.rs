use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Fires completion callbacks. Delivery is best effort: one attempt, errors
/// are logged and dropped.
#[derive(Clone, Debug)]
pub struct Notifier {
    client: reqwest::Client,
    timeout: Duration,
}

impl Notifier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// `GET <url>?job_id=..&exit_code=..` on a detached task
    pub fn notify(&self, url: &str, job_id: &str, exit_code: i32) -> JoinHandle<()> {
        let request = self
            .client
            .get(url)
            .query(&[("job_id", job_id), ("exit_code", exit_code.to_string().as_str())])
            .timeout(self.timeout);
        let url = url.to_string();
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!("delivered completion callback to {}", url)
                }
                Ok(response) => warn!(
                    "completion callback {} answered {}, ignoring",
                    url,
                    response.status()
                ),
                Err(err) => warn!("completion callback {} failed, ignoring: {}", url, err),
            }
        })
    }
}
