//! 外部生成服务（文本增强、图像生成）的请求/响应契约

pub mod image;
pub mod retry;
pub mod text;

use std::future::Future;
use thiserror::Error;

pub use image::{HuggingFaceClient, ImageClient, OpenAiImageClient};
pub use retry::{with_retry, RetryPolicy};
pub use text::OpenRouterClient;

/// 单次服务调用的失败原因
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("鉴权失败: {0}")]
    Auth(String),

    #[error("配额或限流: {0}")]
    Quota(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("请求超时（{0} 秒）")]
    Timeout(u64),

    #[error("服务返回错误状态 {status}: {body}")]
    Status { status: u16, body: String },

    #[error("响应格式错误: {0}")]
    Malformed(String),
}

impl ServiceError {
    /// 鉴权失败和非限流的 4xx 错误重试也不会成功
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Auth(_) => false,
            ServiceError::Status { status, .. } => *status >= 500,
            _ => true,
        }
    }

    /// 按 HTTP 状态码分类
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => ServiceError::Auth(body),
            402 | 429 => ServiceError::Quota(body),
            _ => ServiceError::Status { status, body },
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ServiceError::Timeout(0)
        } else if e.is_decode() {
            ServiceError::Malformed(e.to_string())
        } else {
            ServiceError::Network(e.to_string())
        }
    }
}

/// 一次提示词增强请求
#[derive(Debug, Clone, PartialEq)]
pub struct TextRequest {
    /// 片段序号（从 0 开始）
    pub index: usize,
    /// 片段总数
    pub total: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub base_prompt: String,
    /// 前一个片段的提示词，用于叙事连贯
    pub previous_prompt: Option<String>,
    /// 后一个片段的提示词
    pub next_prompt: Option<String>,
}

impl TextRequest {
    /// 发给文本模型的用户消息
    pub fn to_message(&self) -> String {
        let mut message = format!(
            "Music video shot {} of {} ({:.1}s - {:.1}s).\nDraft description: {}\n",
            self.index + 1,
            self.total,
            self.start_time,
            self.end_time,
            self.base_prompt
        );
        if let Some(previous) = &self.previous_prompt {
            message.push_str(&format!("Previous shot: {}\n", previous));
        }
        if let Some(next) = &self.next_prompt {
            message.push_str(&format!("Next shot: {}\n", next));
        }
        message.push_str(
            "Rewrite the draft into one vivid, concrete image-generation prompt \
             (subject, setting, lighting, color palette, camera framing). \
             Keep it consistent with the neighbouring shots. \
             Reply with the prompt only, no quotes or commentary.",
        );
        message
    }
}

/// 一次图像生成请求
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub index: usize,
    pub prompt: String,
    pub width: u32,
    pub height: u32,
}

/// 文本生成服务
pub trait TextService: Send + Sync + 'static {
    fn complete(
        &self,
        request: &TextRequest,
    ) -> impl Future<Output = Result<String, ServiceError>> + Send;
}

/// 图像生成服务，返回原始图片字节
pub trait ImageService: Send + Sync + 'static {
    fn generate(
        &self,
        request: &ImageRequest,
    ) -> impl Future<Output = Result<Vec<u8>, ServiceError>> + Send;
}
