use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AgentError, TransportError};
use crate::llm::retry::{RetryPolicy, retry_delay};
use crate::llm::sse::pump_events;
use crate::llm::{
    Content, EventReceiver, GenerateRequest, GenerateResponse, GenerationConfig,
    GenerativeBackend, GoogleSearch, InnerRequest, Tool,
};

const DEFAULT_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";
const DEFAULT_API_VERSION: &str = "v1internal";
const ACCESS_TOKEN_ENV: &str = "GEMINI_ACCESS_TOKEN";

/// Runtime configuration for [`CodeAssistClient`].
#[derive(Debug, Clone)]
pub struct CodeAssistConfig {
    /// OAuth access token sent as a bearer credential. Acquiring and refreshing
    /// it is the caller's job.
    pub access_token: Option<String>,
    /// Base URL override for proxies or test servers.
    pub base_url: Option<String>,
    /// API version path segment.
    pub api_version: String,
    /// Rate-limit retry behaviour shared by buffered and streamed calls.
    pub retry: RetryPolicy,
    /// Capacity of the handoff channel between the stream worker and its reader.
    pub stream_channel_capacity: usize,
}

impl Default for CodeAssistConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            base_url: None,
            api_version: DEFAULT_API_VERSION.to_string(),
            retry: RetryPolicy::default(),
            stream_channel_capacity: 1,
        }
    }
}

impl CodeAssistConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            ..Self::default()
        }
    }
}

/// Code Assist generation client implementing [`GenerativeBackend`].
#[derive(Debug, Clone)]
pub struct CodeAssistClient {
    client: Client,
    config: CodeAssistConfig,
}

impl CodeAssistClient {
    pub fn new(config: CodeAssistConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .build()
            .map_err(|err| TransportError::Request(err.to_string()))?;

        Ok(Self { client, config })
    }

    /// Creates a client using `GEMINI_ACCESS_TOKEN` from the environment.
    pub fn from_env() -> Result<Self, TransportError> {
        let token = std::env::var(ACCESS_TOKEN_ENV)
            .map_err(|_| TransportError::Request(format!("{ACCESS_TOKEN_ENV} is not set")))?;

        Self::new(CodeAssistConfig::new(token))
    }

    pub fn config(&self) -> &CodeAssistConfig {
        &self.config
    }

    fn endpoint(&self, method: &str) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/{}:{method}", self.config.api_version)
    }

    fn headers(&self, event_stream: bool) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if event_stream {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        if let Some(token) = &self.config.access_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                TransportError::Request("access token is not a valid header value".to_string())
            })?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Sends `body` until a 200 arrives, retrying only on 429.
    ///
    /// Every attempt replays the same bytes with a clone of the same headers.
    async fn send_with_retry(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: HeaderMap,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, TransportError> {
        let policy = &self.config.retry;
        let mut last_message = String::new();

        for attempt in 0..=policy.max_retries {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            debug!(url, attempt, "sending request");
            let send = self
                .client
                .post(url)
                .headers(headers.clone())
                .body(body.clone())
                .send();

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                response = send => response.map_err(|err| TransportError::Request(err.to_string()))?,
            };

            let status = response.status();
            if status == StatusCode::OK {
                return Ok(response);
            }

            let response_headers = response.headers().clone();
            let response_body = response.bytes().await.unwrap_or_default();
            let message = String::from_utf8_lossy(&response_body).into_owned();

            if status != StatusCode::TOO_MANY_REQUESTS {
                return Err(TransportError::Api {
                    status: status.as_u16(),
                    body: message,
                });
            }

            last_message = message;
            if attempt == policy.max_retries {
                break;
            }

            let delay = retry_delay(&response_body, &response_headers, attempt, policy);
            warn!(
                attempt = attempt + 1,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "rate limited, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Err(TransportError::RateLimitExhausted {
            retries: policy.max_retries,
            last_message,
        })
    }

    /// Looks up the caller's Code Assist status, including the project to bill.
    pub async fn load_code_assist(
        &self,
        cancel: &CancellationToken,
    ) -> Result<LoadCodeAssistResponse, TransportError> {
        let request = LoadCodeAssistRequest {
            cloudaicompanion_project: None,
            metadata: ClientMetadata {
                ide_type: "GEMINI_CLI".to_string(),
                platform: "PLATFORM_UNSPECIFIED".to_string(),
                plugin_type: "GEMINI".to_string(),
            },
        };

        let send = self
            .client
            .post(self.endpoint("loadCodeAssist"))
            .headers(self.headers(false)?)
            .json(&request)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            response = send => response.map_err(|err| TransportError::Request(err.to_string()))?,
        };

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;
        if status != StatusCode::OK {
            return Err(TransportError::Api {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        serde_json::from_slice(&body).map_err(|err| TransportError::Decode(err.to_string()))
    }

    /// Discovers the project to bill, failing with the ineligibility reasons
    /// when the account has none.
    pub async fn resolve_project(&self, cancel: &CancellationToken) -> Result<String, AgentError> {
        self.load_code_assist(cancel).await?.into_project()
    }

    /// Asks the model a single question with search grounding enabled.
    pub async fn web_search(
        &self,
        project: Option<&str>,
        model: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<GroundedAnswer, TransportError> {
        let request = GenerateRequest {
            model: model.to_string(),
            project: project.map(ToString::to_string),
            user_prompt_id: None,
            request: InnerRequest {
                contents: vec![Content::user_text(query)],
                system_instruction: None,
                generation_config: GenerationConfig {
                    temperature: None,
                    top_p: None,
                    top_k: None,
                    max_output_tokens: None,
                },
                tools: vec![Tool {
                    function_declarations: Vec::new(),
                    google_search: Some(GoogleSearch {}),
                }],
            },
        };

        let response = self.generate(&request, cancel).await?;
        Ok(GroundedAnswer::from_response(&response))
    }
}

fn encode_request(request: &GenerateRequest) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(request)
        .map_err(|err| TransportError::Request(format!("failed to marshal request: {err}")))
}

#[async_trait]
impl GenerativeBackend for CodeAssistClient {
    async fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, TransportError> {
        let body = encode_request(request)?;
        let response = self
            .send_with_retry(
                &self.endpoint("generateContent"),
                body,
                self.headers(false)?,
                cancel,
            )
            .await?;

        let bytes = response
            .bytes()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;

        serde_json::from_slice(&bytes).map_err(|err| TransportError::Decode(err.to_string()))
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<EventReceiver, TransportError> {
        let body = encode_request(request)?;
        let response = self
            .send_with_retry(
                &self.endpoint("streamGenerateContent?alt=sse"),
                body,
                self.headers(true)?,
                cancel,
            )
            .await?;

        let (tx, rx) = mpsc::channel(self.config.stream_channel_capacity.max(1));
        tokio::spawn(pump_events(
            response.bytes_stream(),
            request.model.clone(),
            tx,
            cancel.child_token(),
        ));

        Ok(rx)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadCodeAssistRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    cloudaicompanion_project: Option<String>,
    metadata: ClientMetadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientMetadata {
    ide_type: String,
    platform: String,
    plugin_type: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadCodeAssistResponse {
    #[serde(default)]
    pub current_tier: Option<UserTier>,
    #[serde(default)]
    pub allowed_tiers: Vec<UserTier>,
    #[serde(default)]
    pub ineligible_tiers: Vec<IneligibleTier>,
    #[serde(default)]
    pub cloudaicompanion_project: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserTier {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IneligibleTier {
    #[serde(default)]
    pub reason_code: String,
    #[serde(default)]
    pub reason_message: String,
    #[serde(default)]
    pub tier_id: String,
    #[serde(default)]
    pub tier_name: String,
    #[serde(default)]
    pub validation_url: Option<String>,
}

impl LoadCodeAssistResponse {
    /// The project to send with generation requests.
    pub fn into_project(self) -> Result<String, AgentError> {
        if let Some(project) = self.cloudaicompanion_project.filter(|p| !p.is_empty()) {
            return Ok(project);
        }

        let reasons = self
            .ineligible_tiers
            .iter()
            .map(|tier| tier.reason_message.as_str())
            .filter(|reason| !reason.is_empty())
            .collect::<Vec<_>>();

        if reasons.is_empty() {
            Err(AgentError::Config(
                "unable to use Gemini: no project ID available".to_string(),
            ))
        } else {
            Err(AgentError::Config(format!(
                "unable to use Gemini: {}",
                reasons.join(", ")
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSource {
    pub title: String,
    pub uri: String,
}

/// Text and cited sources from a search-grounded response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroundedAnswer {
    pub text: String,
    pub sources: Vec<WebSource>,
}

impl GroundedAnswer {
    pub fn from_response(response: &GenerateResponse) -> Self {
        let Some(candidate) = response.response.candidates.first() else {
            return Self::default();
        };

        let sources = candidate
            .grounding_metadata
            .iter()
            .flat_map(|metadata| metadata.grounding_chunks.iter())
            .filter_map(|chunk| chunk.web.as_ref())
            .map(|web| WebSource {
                title: web.title.clone(),
                uri: web.uri.clone(),
            })
            .collect();

        Self {
            text: response.text(),
            sources,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::llm::StreamEvent;

    fn client_for(server: &MockServer) -> CodeAssistClient {
        let mut config = CodeAssistConfig::new("test-token");
        config.base_url = Some(server.uri());
        config.retry = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        CodeAssistClient::new(config).expect("client builds")
    }

    fn request() -> GenerateRequest {
        GenerateRequest {
            model: "gemini-2.5-flash".to_string(),
            project: Some("proj-1".to_string()),
            user_prompt_id: Some("prompt-1".to_string()),
            request: InnerRequest {
                contents: vec![Content::user_text("list files")],
                system_instruction: None,
                generation_config: GenerationConfig::default(),
                tools: Vec::new(),
            },
        }
    }

    fn text_response(text: &str) -> serde_json::Value {
        json!({
            "response": {
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": text}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5}
            }
        })
    }

    fn quota_error() -> serde_json::Value {
        json!({
            "error": {
                "code": 429,
                "message": "quota exceeded",
                "details": [{"retryDelay": "0.002s"}]
            }
        })
    }

    #[tokio::test]
    async fn generate_retries_rate_limits_with_identical_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .respond_with(ResponseTemplate::new(429).set_body_json(quota_error()))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_response("Found 2 files.")))
            .mount(&server)
            .await;

        let response = client_for(&server)
            .generate(&request(), &CancellationToken::new())
            .await
            .expect("generate succeeds after retries");
        assert_eq!(response.text(), "Found 2 files.");

        let received = server.received_requests().await.expect("recording enabled");
        assert_eq!(received.len(), 3);
        let expected_body = serde_json::to_vec(&request()).expect("serializes");
        for attempt in &received {
            assert_eq!(attempt.body, expected_body);
            assert_eq!(
                attempt
                    .headers
                    .get("authorization")
                    .and_then(|value| value.to_str().ok()),
                Some("Bearer test-token")
            );
            assert_eq!(
                attempt
                    .headers
                    .get("content-type")
                    .and_then(|value| value.to_str().ok()),
                Some("application/json")
            );
        }
    }

    #[tokio::test]
    async fn rate_limit_exhaustion_surfaces_last_message_after_five_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .respond_with(ResponseTemplate::new(429).set_body_json(quota_error()))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .generate(&request(), &CancellationToken::new())
            .await
            .expect_err("must exhaust retries");

        match err {
            TransportError::RateLimitExhausted {
                retries,
                last_message,
            } => {
                assert_eq!(retries, 5);
                assert!(last_message.contains("quota exceeded"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let received = server.received_requests().await.expect("recording enabled");
        assert_eq!(received.len(), 6);
    }

    #[tokio::test]
    async fn non_rate_limit_errors_are_fatal_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad thought signature"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .generate(&request(), &CancellationToken::new())
            .await
            .expect_err("must fail");

        match err {
            TransportError::Api { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad thought signature");
            }
            other => panic!("unexpected error: {other}"),
        }
        let received = server.received_requests().await.expect("recording enabled");
        assert_eq!(received.len(), 1);
    }

    #[tokio::test]
    async fn malformed_buffered_body_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"response\": ["))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .generate(&request(), &CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(matches!(err, TransportError::Decode(_)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry_wait() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = client_for(&server)
            .generate(&request(), &cancel)
            .await
            .expect_err("must be cancelled");

        assert!(matches!(err, TransportError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stream_decodes_event_stream_after_rate_limit() {
        let server = MockServer::start().await;
        let body = format!(
            "data: {}\n\ndata: {}\n\ndata: [DONE]\n",
            json!({"response": {"candidates": [{"content": {"role": "model", "parts": [{"text": "Found "}]}}]}}),
            json!({"response": {
                "candidates": [{"content": {"role": "model", "parts": [{"text": "2 files."}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5}
            }})
        );
        Mock::given(method("POST"))
            .and(path("/v1internal:streamGenerateContent"))
            .respond_with(ResponseTemplate::new(429).set_body_json(quota_error()))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1internal:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .and(header("accept", "text/event-stream"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let mut events = client_for(&server)
            .generate_stream(&request(), &CancellationToken::new())
            .await
            .expect("stream opens");

        let mut collected = Vec::new();
        while let Some(event) = events.recv().await {
            collected.push(event);
        }

        assert_eq!(collected.len(), 4);
        assert_eq!(
            collected[0],
            StreamEvent::Start {
                model: "gemini-2.5-flash".to_string()
            }
        );
        assert!(matches!(&collected[1], StreamEvent::Content { text, .. } if text == "Found "));
        assert!(matches!(&collected[2], StreamEvent::Content { text, .. } if text == "2 files."));
        assert!(matches!(
            &collected[3],
            StreamEvent::Done { usage: Some(usage), finish_reason: Some(reason) }
                if usage.total_token_count == 5 && reason == "STOP"
        ));
    }

    #[tokio::test]
    async fn load_code_assist_returns_project_or_reasons() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:loadCodeAssist"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "currentTier": {"id": "free-tier", "name": "Gemini Code Assist for individuals"},
                "cloudaicompanionProject": "proj-42"
            })))
            .mount(&server)
            .await;

        let status = client_for(&server)
            .load_code_assist(&CancellationToken::new())
            .await
            .expect("load succeeds");
        assert_eq!(status.current_tier.as_ref().map(|t| t.id.as_str()), Some("free-tier"));
        assert_eq!(status.into_project().expect("project"), "proj-42");

        let received = server.received_requests().await.expect("recording enabled");
        let sent: serde_json::Value =
            serde_json::from_slice(&received[0].body).expect("json body");
        assert_eq!(sent["metadata"]["ideType"], "GEMINI_CLI");
        assert_eq!(sent["metadata"]["pluginType"], "GEMINI");

        let ineligible: LoadCodeAssistResponse = serde_json::from_value(json!({
            "ineligibleTiers": [
                {"reasonCode": "RESTRICTED_AGE", "reasonMessage": "account not eligible", "tierId": "free-tier", "tierName": "free"}
            ]
        }))
        .expect("deserializes");
        let err = ineligible.into_project().expect_err("no project");
        assert!(err.to_string().contains("account not eligible"));
    }

    #[tokio::test]
    async fn web_search_requests_grounding_and_collects_sources() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": {
                    "candidates": [{
                        "content": {"role": "model", "parts": [{"text": "Rust 1.85 shipped edition 2024."}]},
                        "groundingMetadata": {"groundingChunks": [
                            {"web": {"uri": "https://blog.rust-lang.org", "title": "Rust Blog"}},
                            {}
                        ]}
                    }]
                }
            })))
            .mount(&server)
            .await;

        let answer = client_for(&server)
            .web_search(
                Some("proj-1"),
                "gemini-2.5-flash",
                "latest rust edition",
                &CancellationToken::new(),
            )
            .await
            .expect("search succeeds");

        assert_eq!(answer.text, "Rust 1.85 shipped edition 2024.");
        assert_eq!(
            answer.sources,
            vec![WebSource {
                title: "Rust Blog".to_string(),
                uri: "https://blog.rust-lang.org".to_string(),
            }]
        );

        let received = server.received_requests().await.expect("recording enabled");
        let sent: serde_json::Value =
            serde_json::from_slice(&received[0].body).expect("json body");
        assert_eq!(sent["request"]["tools"][0]["googleSearch"], json!({}));
        assert!(sent["request"].get("generationConfig").is_some());
    }
}
