//! OneBot-style HTTP backend client

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::domain::traits::{ApiClient, ApiResponse};
use crate::infrastructure::config::Config;

/// Retcode used for transport-level failures
pub const RETCODE_TRANSPORT: i64 = -1;

#[derive(Debug, Clone)]
pub struct HttpClientSettings {
    pub api_base: String,
    pub token: Option<String>,
    pub timeout_normal: Duration,
    pub timeout_long: Duration,
    pub max_retries: u32,
    pub long_actions: HashSet<String>,
    /// First retry delay; doubles per attempt
    pub retry_base: Duration,
}

impl HttpClientSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            api_base: config.backend.api_base_url.clone(),
            token: config.backend.token.clone(),
            timeout_normal: Duration::from_secs(config.api.timeout_normal),
            timeout_long: Duration::from_secs(config.api.timeout_long),
            max_retries: config.api.max_retries.max(1),
            long_actions: config.api.long_actions.iter().map(|a| normalize_action(a).to_string()).collect(),
            retry_base: Duration::from_secs(1),
        }
    }

    pub fn timeout_for(&self, action: &str) -> Duration {
        if self.long_actions.contains(normalize_action(action)) {
            self.timeout_long
        } else {
            self.timeout_normal
        }
    }

    pub fn endpoint(&self, action: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), normalize_action(action))
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base * 2u32.saturating_pow(attempt)
    }
}

fn normalize_action(action: &str) -> &str {
    action.trim_start_matches('/')
}

/// Posts `{api_base}/{action}` with a JSON body and bearer token.
///
/// Every outcome is folded into an [`ApiResponse`]: auth rejections
/// come back immediately, everything else is retried with a doubling
/// delay until `max_retries` attempts are used.
pub struct HttpApiClient {
    client: Client,
    settings: HttpClientSettings,
}

enum Attempt {
    Done(ApiResponse),
    Retry(ApiResponse),
}

impl HttpApiClient {
    pub fn new(settings: HttpClientSettings) -> Self {
        Self {
            client: Client::new(),
            settings,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(HttpClientSettings::from_config(config))
    }

    pub fn settings(&self) -> &HttpClientSettings {
        &self.settings
    }

    async fn attempt(&self, action: &str, params: &Value) -> Attempt {
        let url = self.settings.endpoint(action);
        let mut request = self
            .client
            .post(&url)
            .timeout(self.settings.timeout_for(action))
            .json(params);
        if let Some(token) = &self.settings.token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Attempt::Retry(ApiResponse::failed(RETCODE_TRANSPORT, e.to_string())),
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            error!(url = %url, status = status.as_u16(), "backend rejected the API token");
            return Attempt::Done(ApiResponse::failed(status.as_u16() as i64, "token rejected"));
        }

        match response.json::<ApiResponse>().await {
            Ok(envelope) if envelope.is_ok() => Attempt::Done(envelope),
            Ok(envelope) => Attempt::Retry(envelope),
            Err(e) => Attempt::Retry(ApiResponse::failed(RETCODE_TRANSPORT, e.to_string())),
        }
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn call(&self, action: &str, params: Value) -> ApiResponse {
        let attempts = self.settings.max_retries.max(1);
        let mut last = ApiResponse::failed(RETCODE_TRANSPORT, "max retries exceeded");

        for attempt in 0..attempts {
            match self.attempt(action, &params).await {
                Attempt::Done(response) => return response,
                Attempt::Retry(response) => {
                    if attempt + 1 == attempts {
                        error!(action, retcode = response.retcode, msg = %response.msg, "API call failed");
                        return response;
                    }
                    let delay = self.settings.retry_delay(attempt);
                    warn!(
                        action,
                        attempt = attempt + 1,
                        of = attempts,
                        retcode = response.retcode,
                        msg = %response.msg,
                        "API call failed, retrying"
                    );
                    debug!(action, delay_ms = delay.as_millis() as u64, "waiting before retry");
                    last = response;
                    tokio::time::sleep(delay).await;
                }
            }
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn settings(base: String) -> HttpClientSettings {
        let mut config = Config::default();
        config.backend.api_base_url = base;
        config.backend.token = Some("Str0ng-Token-Value!".to_string());
        config.api.max_retries = 3;
        let mut settings = HttpClientSettings::from_config(&config);
        settings.retry_base = Duration::from_millis(10);
        settings
    }

    /// Answers every connection with the next canned response, repeating the last one
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let (code, body) = responses[n.min(responses.len() - 1)];
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    code,
                    body.len(),
                    body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}", addr), hits)
    }

    #[test]
    fn long_actions_get_long_timeout() {
        let settings = settings("http://backend/".to_string());
        assert_eq!(settings.timeout_for("upload_group_file"), Duration::from_secs(60));
        assert_eq!(settings.timeout_for("/upload_group_file"), Duration::from_secs(60));
        assert_eq!(settings.timeout_for("send_group_msg"), Duration::from_secs(10));
        assert_eq!(settings.endpoint("/send_group_msg"), "http://backend/send_group_msg");
    }

    #[test]
    fn retry_delay_doubles() {
        let mut settings = settings("http://backend".to_string());
        settings.retry_base = Duration::from_secs(1);
        assert_eq!(settings.retry_delay(0), Duration::from_secs(1));
        assert_eq!(settings.retry_delay(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn ok_envelope_is_returned() {
        let (base, hits) = serve(vec![(200, r#"{"status":"ok","retcode":0,"data":{"message_id":5}}"#)]).await;
        let client = HttpApiClient::new(settings(base));

        let response = client.call("send_group_msg", serde_json::json!({"group_id": 1})).await;
        assert!(response.is_ok());
        assert_eq!(response.data["message_id"], 5);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let (base, hits) = serve(vec![(401, "{}")]).await;
        let client = HttpApiClient::new(settings(base));

        let response = client.call("send_group_msg", serde_json::json!({})).await;
        assert!(!response.is_ok());
        assert_eq!(response.retcode, 401);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_envelope_is_retried_until_success() {
        let (base, hits) = serve(vec![
            (200, r#"{"status":"failed","retcode":100,"msg":"busy"}"#),
            (200, r#"{"status":"ok","retcode":0}"#),
        ])
        .await;
        let client = HttpApiClient::new(settings(base));

        let response = client.call("get_status", serde_json::json!({})).await;
        assert!(response.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let (base, hits) = serve(vec![(200, r#"{"status":"failed","retcode":100,"msg":"busy"}"#)]).await;
        let client = HttpApiClient::new(settings(base));

        let response = client.call("get_status", serde_json::json!({})).await;
        assert_eq!(response.retcode, 100);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
