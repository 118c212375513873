use std::time;

use alert_common::event::Event;
use alert_common::sink::{AlertSink, SinkError};
use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;
use url::Url;

/// POSTs every event as JSON to a fixed URL.
pub struct WebhookSink {
    client: reqwest::Client,
    url: Url,
}

impl WebhookSink {
    pub fn new(url: Url, request_timeout: time::Duration) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("alert-worker/1.0")
            .timeout(request_timeout)
            .build()?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn accept(&self, event: &Event) -> Result<(), SinkError> {
        let body = serde_json::to_vec(event).map_err(|e| SinkError::Rejected(e.to_string()))?;

        let response = self
            .client
            .post(self.url.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if is_retryable_status(status) {
            Err(SinkError::Unavailable(status.to_string()))
        } else {
            Err(SinkError::Rejected(status.to_string()))
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
