use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{ServiceError, TextRequest, TextService};
use crate::error::{PipelineError, Result};

pub const DEFAULT_TEXT_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_TEXT_MODEL: &str = "google/gemini-2.0-flash-exp:free";

const SYSTEM_PROMPT: &str = "You are a music video director writing prompts for a text-to-image model. \
     Each prompt describes one still frame of the video.";

/// OpenAI 兼容的 chat completions 客户端（默认 OpenRouter）
#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
}

impl OpenRouterClient {
    pub fn new(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: endpoint.into(),
            model: model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl TextService for OpenRouterClient {
    async fn complete(&self, request: &TextRequest) -> std::result::Result<String, ServiceError> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": request.to_message() }
            ],
            "temperature": 0.7,
            "max_tokens": 300
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("X-Title", "vibe-frame")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status.as_u16(), error_text));
        }

        let response_json: serde_json::Value = response.json().await?;
        let content = extract_content(&response_json)?;
        debug!("📝 [提示词增强] 片段 {} 返回: {}", request.index, content);
        Ok(content)
    }
}

/// 从 chat completions 响应中取出生成的文本
///
/// 有些服务在 HTTP 200 里返回 `error` 对象，按错误处理。
pub fn extract_content(response: &serde_json::Value) -> std::result::Result<String, ServiceError> {
    if let Some(error) = response.get("error") {
        let message = error["message"].as_str().unwrap_or("unknown error").to_string();
        return match error["code"].as_u64() {
            Some(code) => Err(ServiceError::from_status(code as u16, message)),
            None => Err(ServiceError::Malformed(message)),
        };
    }

    let content = response["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| ServiceError::Malformed("响应中没有 choices[0].message.content".to_string()))?;

    let cleaned = clean_prompt(content);
    if cleaned.is_empty() {
        return Err(ServiceError::Malformed("文本服务返回了空内容".to_string()));
    }
    Ok(cleaned)
}

/// 去掉模型常见的包裹：代码块标记、引号、"Prompt:" 前缀
pub fn clean_prompt(text: &str) -> String {
    let text = text
        .trim()
        .trim_start_matches("```text")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let text = text
        .strip_prefix("Prompt:")
        .or_else(|| text.strip_prefix("prompt:"))
        .unwrap_or(text)
        .trim();
    text.trim_matches(|c| c == '"' || c == '\'' || c == '“' || c == '”')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_content() {
        let response = json!({
            "choices": [{ "message": { "role": "assistant", "content": "  \"A neon-lit alley in the rain\"  " } }]
        });
        assert_eq!(extract_content(&response).unwrap(), "A neon-lit alley in the rain");
    }

    #[test]
    fn test_extract_content_rejects_empty_and_missing() {
        let empty = json!({ "choices": [{ "message": { "content": "  ``` ```  " } }] });
        assert!(matches!(extract_content(&empty), Err(ServiceError::Malformed(_))));

        let missing = json!({ "choices": [] });
        assert!(matches!(extract_content(&missing), Err(ServiceError::Malformed(_))));
    }

    #[test]
    fn test_extract_content_maps_embedded_error() {
        let response = json!({ "error": { "code": 429, "message": "Rate limit exceeded" } });
        assert!(matches!(extract_content(&response), Err(ServiceError::Quota(_))));
    }

    #[test]
    fn test_clean_prompt_strips_prefix() {
        assert_eq!(clean_prompt("Prompt: a red balloon"), "a red balloon");
        assert_eq!(clean_prompt("```text\nfoggy forest\n```"), "foggy forest");
    }
}
