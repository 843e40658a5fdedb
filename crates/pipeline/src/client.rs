//! Client for the Gemini image generation REST API.

use async_trait::async_trait;
use base64::Engine;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Default image generation model.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-image-preview";

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// One-shot image generation: a text prompt, an input image, and an
/// optional reference image in; a single image out.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generator name, for logs.
    fn name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        input: &DynamicImage,
        reference: Option<&DynamicImage>,
    ) -> Result<DynamicImage, PipelineError>;
}

/// Gemini-backed generator.
pub struct GeminiClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// With a different model id.
    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    /// With a different API root (proxies, test servers).
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn encode_png(image: &DynamicImage) -> Result<Part, PipelineError> {
        let mut bytes = Vec::new();
        image.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )?;
        let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
        Ok(Part::image(data))
    }
}

#[async_trait]
impl ImageGenerator for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(
        &self,
        prompt: &str,
        input: &DynamicImage,
        reference: Option<&DynamicImage>,
    ) -> Result<DynamicImage, PipelineError> {
        let mut parts = vec![Part::text(prompt)];
        parts.push(Self::encode_png(input)?);
        if let Some(reference) = reference {
            parts.push(Self::encode_png(reference)?);
        }

        let request = GenerateContentRequest {
            contents: vec![Content { parts }],
        };

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::Api(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Api(format!("{status} - {body}")));
        }

        let result: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Api(e.to_string()))?;

        decode_first_image(result)
    }
}

/// Pull the first inline image out of a response, or fail with whatever
/// text the model produced instead.
fn decode_first_image(response: GenerateContentResponse) -> Result<DynamicImage, PipelineError> {
    let parts = response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| content.parts)
        .unwrap_or_default();

    let mut texts = Vec::new();
    for part in parts {
        if let Some(inline) = part.inline_data {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(inline.data.as_bytes())
                .map_err(|e| PipelineError::Api(format!("invalid image payload: {e}")))?;
            return Ok(image::load_from_memory(&bytes)?);
        }
        if let Some(text) = part.text {
            texts.push(text);
        }
    }

    let text = if texts.is_empty() {
        "(no text in response)".to_string()
    } else {
        texts.join(" ")
    };
    Err(PipelineError::NoImageReturned { text })
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            inline_data: None,
        }
    }

    fn image(data: String) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: "image/png".to_string(),
                data,
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}
