use std::path::PathBuf;
use thiserror::Error;

/// 流水线各阶段的错误类型
#[derive(Error, Debug)]
pub enum PipelineError {
    /// 参数或凭证配置错误（例如 min_interval <= 0、缺少 API Key）
    #[error("配置错误: {0}")]
    Config(String),

    #[error("音频解码失败: {path}: {message}")]
    AudioDecode { path: PathBuf, message: String },

    /// 文本服务调用失败（鉴权、配额、网络、响应格式）
    #[error("提示词增强失败 (片段 {index}): {message}")]
    Enhancement { index: usize, message: String },

    /// 图像服务调用失败
    #[error("图像生成失败 (片段 {index}): {message}")]
    Synthesis { index: usize, message: String },

    #[error("分镜不完整，以下片段缺少图片: {missing:?}")]
    IncompleteStoryboard { missing: Vec<usize> },

    #[error("分镜无效: {0}")]
    InvalidStoryboard(String),

    #[error("视频编码失败: {message}")]
    Encoding {
        message: String,
        stderr: Option<String>,
    },

    #[error("IO 错误: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn audio(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::AudioDecode {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
            stderr: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
