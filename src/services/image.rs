use base64::Engine;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{ImageRequest, ImageService, ServiceError};
use crate::error::{PipelineError, Result};

pub const DEFAULT_HF_API_URL: &str = "https://api-inference.huggingface.co/models";
pub const DEFAULT_HF_MODEL: &str = "stabilityai/stable-diffusion-xl-base-1.0";
pub const DEFAULT_OPENAI_IMAGE_URL: &str = "https://api.openai.com/v1/images/generations";
pub const DEFAULT_OPENAI_IMAGE_MODEL: &str = "dall-e-3";

fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PipelineError::Config(format!("创建 HTTP 客户端失败: {}", e)))
}

/// Hugging Face Inference API，响应体直接是图片字节
#[derive(Debug, Clone)]
pub struct HuggingFaceClient {
    client: Client,
    api_token: String,
    base_url: String,
    model: String,
}

impl HuggingFaceClient {
    pub fn new(
        api_token: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: build_http_client(timeout)?,
            api_token: api_token.into(),
            base_url: base_url.into(),
            model: model.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.model)
    }
}

impl ImageService for HuggingFaceClient {
    async fn generate(&self, request: &ImageRequest) -> std::result::Result<Vec<u8>, ServiceError> {
        let body = json!({
            "inputs": request.prompt,
            "parameters": {
                "width": request.width,
                "height": request.height
            },
            "options": { "wait_for_model": true }
        });

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_token)
            .header("Accept", "image/png")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status.as_u16(), error_text));
        }

        // 模型加载中等情况会以 JSON 返回错误
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));
        if is_json {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::Malformed(format!("期望图片，收到 JSON: {}", error_text)));
        }

        let bytes = response.bytes().await?;
        debug!("🖼️  [图像生成] 片段 {} 收到 {} 字节", request.index, bytes.len());
        Ok(bytes.to_vec())
    }
}

/// OpenAI 兼容的 images/generations 接口，图片以 base64 返回
#[derive(Debug, Clone)]
pub struct OpenAiImageClient {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
}

impl OpenAiImageClient {
    pub fn new(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: build_http_client(timeout)?,
            api_key: api_key.into(),
            endpoint: endpoint.into(),
            model: model.into(),
        })
    }
}

impl ImageService for OpenAiImageClient {
    async fn generate(&self, request: &ImageRequest) -> std::result::Result<Vec<u8>, ServiceError> {
        let body = json!({
            "model": self.model,
            "prompt": request.prompt,
            "n": 1,
            "size": format!("{}x{}", request.width, request.height),
            "response_format": "b64_json"
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status.as_u16(), error_text));
        }

        let response_json: serde_json::Value = response.json().await?;
        decode_b64_image(&response_json)
    }
}

/// 解析 `data[0].b64_json`
pub fn decode_b64_image(response: &serde_json::Value) -> std::result::Result<Vec<u8>, ServiceError> {
    let encoded = response["data"][0]["b64_json"]
        .as_str()
        .ok_or_else(|| ServiceError::Malformed("响应中没有 data[0].b64_json".to_string()))?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| ServiceError::Malformed(format!("base64 解码失败: {}", e)))
}

/// 运行时按配置选择的图像后端
#[derive(Debug, Clone)]
pub enum ImageClient {
    HuggingFace(HuggingFaceClient),
    OpenAi(OpenAiImageClient),
}

impl ImageService for ImageClient {
    async fn generate(&self, request: &ImageRequest) -> std::result::Result<Vec<u8>, ServiceError> {
        match self {
            ImageClient::HuggingFace(client) => client.generate(request).await,
            ImageClient::OpenAi(client) => client.generate(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_b64_image() {
        let response = json!({ "data": [{ "b64_json": "iVBORw0KGgo=" }] });
        let bytes = decode_b64_image(&response).unwrap();
        assert_eq!(&bytes[..4], &[0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn test_decode_b64_image_errors() {
        assert!(matches!(decode_b64_image(&json!({ "data": [] })), Err(ServiceError::Malformed(_))));
        let bad = json!({ "data": [{ "b64_json": "@@@" }] });
        assert!(matches!(decode_b64_image(&bad), Err(ServiceError::Malformed(_))));
    }

    #[test]
    fn test_hugging_face_endpoint() {
        let client = HuggingFaceClient::new(
            "token",
            "https://example.test/models/",
            "org/model",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.endpoint(), "https://example.test/models/org/model");
    }
}
