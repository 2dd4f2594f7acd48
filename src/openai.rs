//! OpenAI-compatible image generation client
//!
//! POSTs the cell payload to `{endpoint}/images/generations` and maps the
//! response status onto the generation error classes.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::asset::Asset;
use crate::config::{ConfigError, GeneratorConfig};
use crate::generation::{GenerationClient, GenerationError, GenerationRequest, RequestBuilder};
use crate::resolver::CellContext;

pub struct OpenAiImageClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    quality: String,
    cost_per_call: f64,
}

impl OpenAiImageClient {
    pub fn new(config: &GeneratorConfig, api_key: String) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            quality: config.quality.clone(),
            cost_per_call: config.cost_per_call(),
        })
    }

    /// Build from config, reading the API key from the configured source.
    pub fn from_config(config: &GeneratorConfig) -> Result<Self, ConfigError> {
        Self::new(config, config.resolve_api_key()?)
    }

    /// Merge service settings into the cell payload. Payload fields win.
    fn body(&self, payload: &Value) -> Value {
        let mut body = json!({
            "model": self.model,
            "quality": self.quality,
            "n": 1,
            "response_format": "b64_json",
        });
        if let (Some(body), Some(fields)) = (body.as_object_mut(), payload.as_object()) {
            for (k, v) in fields {
                body.insert(k.clone(), v.clone());
            }
        }
        body
    }

    async fn decode(&self, data: &Value) -> Result<Asset, GenerationError> {
        let first = data
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|d| d.first())
            .ok_or_else(|| GenerationError::InvalidResponse("No data in response".to_string()))?;

        if let Some(encoded) = first.get("b64_json").and_then(|v| v.as_str()) {
            let bytes = STANDARD
                .decode(encoded)
                .map_err(|e| GenerationError::InvalidResponse(format!("bad base64: {e}")))?;
            return Ok(Asset::png(bytes));
        }

        // Some deployments ignore response_format and return a URL.
        if let Some(url) = first.get("url").and_then(|v| v.as_str()) {
            debug!(url, "downloading generated image");
            let response = self
                .http
                .get(url)
                .send()
                .await
                .map_err(network_error)?;
            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(classify_status(status, &text));
            }
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("image/png")
                .to_string();
            let bytes = response.bytes().await.map_err(network_error)?;
            return Ok(Asset::new(bytes.to_vec(), content_type));
        }

        Err(GenerationError::InvalidResponse(
            "Response carries neither b64_json nor url".to_string(),
        ))
    }
}

#[async_trait]
impl GenerationClient for OpenAiImageClient {
    fn name(&self) -> &str {
        "openai"
    }

    fn cost_per_call(&self) -> f64 {
        self.cost_per_call
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Asset, GenerationError> {
        let url = format!("{}/images/generations", self.endpoint);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.body(&request.payload))
            .send()
            .await
            .map_err(network_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;
        self.decode(&data).await
    }
}

fn network_error(e: reqwest::Error) -> GenerationError {
    if e.is_timeout() {
        GenerationError::Timeout
    } else {
        GenerationError::Network(e.to_string())
    }
}

/// Map a non-success status to an error class.
pub fn classify_status(status: StatusCode, body: &str) -> GenerationError {
    match status.as_u16() {
        429 => GenerationError::UpstreamRateLimited,
        408 => GenerationError::Timeout,
        401 | 403 => GenerationError::Unauthorized(body.to_string()),
        400 if body.contains("content_policy") => GenerationError::ContentPolicy(body.to_string()),
        s if status.is_server_error() => GenerationError::Server {
            status: s,
            message: body.to_string(),
        },
        _ => GenerationError::MalformedRequest(format!("{status}: {body}")),
    }
}

/// Minimal payload: a plain product description plus the target size.
/// Brand prompt design lives with the caller.
#[derive(Debug, Clone, Default)]
pub struct ImagePromptBuilder {
    /// Fixed size for every ratio
    pub size: Option<String>,
}

impl ImagePromptBuilder {
    pub fn new(size: Option<String>) -> Self {
        Self { size }
    }
}

impl RequestBuilder for ImagePromptBuilder {
    fn build(&self, ctx: &CellContext<'_>) -> Value {
        let mut prompt = format!(
            "Product photograph of {} ({}). Campaign message: \"{}\".",
            ctx.product.name, ctx.product.category, ctx.campaign.campaign_message
        );
        for (name, value) in &ctx.product.creative {
            match value {
                Value::String(s) => prompt.push_str(&format!(" {name}: {s}.")),
                other => prompt.push_str(&format!(" {name}: {other}.")),
            }
        }
        if let Some(locale) = ctx.key_locale {
            prompt.push_str(&format!(" Audience locale: {locale}."));
        }

        let size = self.size.clone().unwrap_or_else(|| {
            let [w, h] = ctx.cell.aspect_ratio.generation_size();
            format!("{w}x{h}")
        });
        json!({ "prompt": prompt, "size": size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetKey;
    use crate::campaign::{AspectRatio, CampaignSpec, MatrixCell};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(endpoint: &str) -> OpenAiImageClient {
        let config = GeneratorConfig {
            endpoint: endpoint.to_string(),
            ..Default::default()
        };
        OpenAiImageClient::new(&config, "test-key".to_string()).unwrap()
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            key: AssetKey::parse("ef".repeat(32)).unwrap(),
            cell: MatrixCell::new("p1", AspectRatio::Square, "en"),
            payload: json!({"prompt": "a bottle", "size": "1024x1024"}),
        }
    }

    #[tokio::test]
    async fn test_decodes_b64_image() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/generations"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"b64_json": STANDARD.encode(b"png-bytes")}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let asset = client(&server.uri()).generate(&request()).await.unwrap();
        assert_eq!(asset.bytes(), b"png-bytes");
        assert_eq!(asset.content_type(), "image/png");
    }

    #[tokio::test]
    async fn test_downloads_url_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"url": format!("{}/files/img.png", server.uri())}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/img.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(b"downloaded".to_vec()),
            )
            .mount(&server)
            .await;

        let asset = client(&server.uri()).generate(&request()).await.unwrap();
        assert_eq!(asset.bytes(), b"downloaded");
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = client(&server.uri()).generate(&request()).await.unwrap_err();
        assert_eq!(err, GenerationError::UpstreamRateLimited);
        assert!(err.is_transient());
    }

    #[test]
    fn test_classify_status_table() {
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            GenerationError::Server { status: 503, .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, r#"{"error":{"code":"content_policy_violation"}}"#),
            GenerationError::ContentPolicy(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad size"),
            GenerationError::MalformedRequest(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            GenerationError::Unauthorized(_)
        ));
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_transient());
    }

    #[test]
    fn test_body_merges_payload() {
        let body = client("http://localhost").body(&json!({"prompt": "x", "quality": "standard"}));
        assert_eq!(body["model"], "dall-e-3");
        assert_eq!(body["quality"], "standard");
        assert_eq!(body["prompt"], "x");
        assert_eq!(body["n"], 1);
    }

    #[test]
    fn test_prompt_builder_uses_native_size() {
        let campaign = CampaignSpec::from_json_str(
            r#"{"campaign_id": "c1", "campaign_message": "Stay fresh",
                "products": [{"id": "p1", "name": "Tonic", "category": "drinks", "mood": "calm"}]}"#,
        )
        .unwrap();
        let product = campaign.product("p1").unwrap();
        let cell = MatrixCell::new("p1", AspectRatio::Vertical, "en");
        let ctx = CellContext {
            campaign: &campaign,
            product,
            cell: &cell,
            key_locale: None,
        };
        let payload = ImagePromptBuilder::default().build(&ctx);
        assert_eq!(payload["size"], "1024x1792");
        let prompt = payload["prompt"].as_str().unwrap();
        assert!(prompt.contains("Tonic"));
        assert!(prompt.contains("mood: calm"));
        assert!(!prompt.contains("locale"));
    }
}
