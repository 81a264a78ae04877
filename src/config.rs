use anyhow::Result;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::services::image::{
    DEFAULT_HF_API_URL, DEFAULT_HF_MODEL, DEFAULT_OPENAI_IMAGE_MODEL, DEFAULT_OPENAI_IMAGE_URL,
};
use crate::services::text::{DEFAULT_TEXT_API_URL, DEFAULT_TEXT_MODEL};
use crate::services::RetryPolicy;

const CONFIG_FILE_NAME: &str = "vibe-frame.ini";
const HIDDEN_CONFIG_FILE_NAME: &str = ".vibe-frame.ini";

/// 图像生成后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageBackend {
    HuggingFace,
    OpenAi,
}

impl FromStr for ImageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "huggingface" | "hf" => Ok(ImageBackend::HuggingFace),
            "openai" => Ok(ImageBackend::OpenAi),
            other => Err(anyhow::anyhow!("未知的图像后端: {}（可选 huggingface, openai）", other)),
        }
    }
}

impl fmt::Display for ImageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageBackend::HuggingFace => f.write_str("huggingface"),
            ImageBackend::OpenAi => f.write_str("openai"),
        }
    }
}

/// 流水线配置
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// 相邻切点的最小间隔（秒）
    pub min_interval: f64,
    /// 起音检测阈值（0.0-1.0）
    pub onset_threshold: f64,
    /// 追加到默认提示词后的风格描述
    pub prompt_style: Option<String>,
    pub text_api_url: String,
    pub text_model: String,
    pub image_backend: ImageBackend,
    /// 未设置时使用后端的默认地址
    pub image_api_url: Option<String>,
    /// 未设置时使用后端的默认模型
    pub image_model: Option<String>,
    pub image_width: u32,
    pub image_height: u32,
    /// 每个阶段内并发请求数上限
    pub max_concurrency: usize,
    /// 单个片段最多尝试次数
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub video_fps: u32,
    pub video_width: u32,
    pub video_height: u32,
    /// Webhook URL（每个阶段完成后回调）
    pub webhook_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_interval: 5.0,
            onset_threshold: 0.1,
            prompt_style: None,
            text_api_url: DEFAULT_TEXT_API_URL.to_string(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            image_backend: ImageBackend::HuggingFace,
            image_api_url: None,
            image_model: None,
            image_width: 1024,
            image_height: 576,
            max_concurrency: 4,
            max_attempts: 3,
            retry_base_delay_ms: 2000,
            request_timeout_secs: 120,
            video_fps: 30,
            video_width: 1280,
            video_height: 720,
            webhook_url: None,
        }
    }
}

impl PipelineConfig {
    /// 从环境变量和配置文件加载配置
    pub fn from_env_and_file(config_file: Option<&Path>) -> Result<Self> {
        ConfigLoader::load_config(config_file, &ConfigLayer::default())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            timeout: self.request_timeout(),
            ..RetryPolicy::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn image_api_url(&self) -> &str {
        match (&self.image_api_url, self.image_backend) {
            (Some(url), _) => url,
            (None, ImageBackend::HuggingFace) => DEFAULT_HF_API_URL,
            (None, ImageBackend::OpenAi) => DEFAULT_OPENAI_IMAGE_URL,
        }
    }

    pub fn image_model(&self) -> &str {
        match (&self.image_model, self.image_backend) {
            (Some(model), _) => model,
            (None, ImageBackend::HuggingFace) => DEFAULT_HF_MODEL,
            (None, ImageBackend::OpenAi) => DEFAULT_OPENAI_IMAGE_MODEL,
        }
    }
}

/// 一个配置来源（命令行、环境变量或配置文件）中出现的值
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigLayer {
    pub min_interval: Option<f64>,
    pub onset_threshold: Option<f64>,
    pub prompt_style: Option<String>,
    pub text_api_url: Option<String>,
    pub text_model: Option<String>,
    pub image_backend: Option<ImageBackend>,
    pub image_api_url: Option<String>,
    pub image_model: Option<String>,
    pub image_width: Option<u32>,
    pub image_height: Option<u32>,
    pub max_concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub video_fps: Option<u32>,
    pub video_width: Option<u32>,
    pub video_height: Option<u32>,
    pub webhook_url: Option<String>,
}

impl ConfigLayer {
    /// 逐字段合并，`self` 优先
    pub fn or(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            min_interval: self.min_interval.or(lower.min_interval),
            onset_threshold: self.onset_threshold.or(lower.onset_threshold),
            prompt_style: self.prompt_style.or(lower.prompt_style),
            text_api_url: self.text_api_url.or(lower.text_api_url),
            text_model: self.text_model.or(lower.text_model),
            image_backend: self.image_backend.or(lower.image_backend),
            image_api_url: self.image_api_url.or(lower.image_api_url),
            image_model: self.image_model.or(lower.image_model),
            image_width: self.image_width.or(lower.image_width),
            image_height: self.image_height.or(lower.image_height),
            max_concurrency: self.max_concurrency.or(lower.max_concurrency),
            max_attempts: self.max_attempts.or(lower.max_attempts),
            retry_base_delay_ms: self.retry_base_delay_ms.or(lower.retry_base_delay_ms),
            request_timeout_secs: self.request_timeout_secs.or(lower.request_timeout_secs),
            video_fps: self.video_fps.or(lower.video_fps),
            video_width: self.video_width.or(lower.video_width),
            video_height: self.video_height.or(lower.video_height),
            webhook_url: self.webhook_url.or(lower.webhook_url),
        }
    }

    /// 缺失的字段使用默认值
    pub fn finish(self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        PipelineConfig {
            min_interval: self.min_interval.unwrap_or(defaults.min_interval),
            onset_threshold: self.onset_threshold.unwrap_or(defaults.onset_threshold),
            prompt_style: self.prompt_style.or(defaults.prompt_style),
            text_api_url: self.text_api_url.unwrap_or(defaults.text_api_url),
            text_model: self.text_model.unwrap_or(defaults.text_model),
            image_backend: self.image_backend.unwrap_or(defaults.image_backend),
            image_api_url: self.image_api_url.or(defaults.image_api_url),
            image_model: self.image_model.or(defaults.image_model),
            image_width: self.image_width.unwrap_or(defaults.image_width),
            image_height: self.image_height.unwrap_or(defaults.image_height),
            max_concurrency: self.max_concurrency.unwrap_or(defaults.max_concurrency).max(1),
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            retry_base_delay_ms: self.retry_base_delay_ms.unwrap_or(defaults.retry_base_delay_ms),
            request_timeout_secs: self.request_timeout_secs.unwrap_or(defaults.request_timeout_secs),
            video_fps: self.video_fps.unwrap_or(defaults.video_fps).max(1),
            video_width: self.video_width.unwrap_or(defaults.video_width),
            video_height: self.video_height.unwrap_or(defaults.video_height),
            webhook_url: self.webhook_url.or(defaults.webhook_url),
        }
    }
}

/// 外部服务凭证
///
/// 优先级：显式传入 > 环境变量 > 配置文件 > 无
#[derive(Clone, Default, PartialEq)]
pub struct Credentials {
    pub text_api_key: Option<String>,
    pub image_api_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |k: &Option<String>| if k.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("Credentials")
            .field("text_api_key", &redact(&self.text_api_key))
            .field("image_api_key", &redact(&self.image_api_key))
            .finish()
    }
}

impl Credentials {
    pub fn new(text_api_key: Option<String>, image_api_key: Option<String>) -> Self {
        Self {
            text_api_key: non_empty(text_api_key),
            image_api_key: non_empty(image_api_key),
        }
    }

    /// 按优先级解析凭证，环境变量从进程环境读取
    pub fn resolve(explicit: Credentials, backend: ImageBackend, file: &Credentials) -> Self {
        Self::resolve_with(explicit, backend, file, |key| env::var(key).ok())
    }

    pub fn resolve_with(
        explicit: Credentials,
        backend: ImageBackend,
        file: &Credentials,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let image_env = match backend {
            ImageBackend::HuggingFace => "HUGGINGFACE_API_TOKEN",
            ImageBackend::OpenAi => "OPENAI_API_KEY",
        };
        Self {
            text_api_key: non_empty(explicit.text_api_key)
                .or_else(|| non_empty(lookup("OPENROUTER_API_KEY")))
                .or_else(|| non_empty(file.text_api_key.clone())),
            image_api_key: non_empty(explicit.image_api_key)
                .or_else(|| non_empty(lookup(image_env)))
                .or_else(|| non_empty(file.image_api_key.clone())),
        }
    }

    pub fn require_text(&self) -> crate::error::Result<&str> {
        self.text_api_key.as_deref().ok_or_else(|| {
            crate::error::PipelineError::Config(
                "缺少文本服务 API Key（--text-api-key 或 OPENROUTER_API_KEY）".to_string(),
            )
        })
    }

    pub fn require_image(&self) -> crate::error::Result<&str> {
        self.image_api_key.as_deref().ok_or_else(|| {
            crate::error::PipelineError::Config(
                "缺少图像服务 API Key（--image-api-key 或 HUGGINGFACE_API_TOKEN / OPENAI_API_KEY）"
                    .to_string(),
            )
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// 扩展配置（包含工作目录、日志级别、配置文件中的凭证）
#[derive(Debug, Clone)]
pub struct ExtendedConfig {
    pub pipeline: PipelineConfig,
    /// 工作目录（分镜、图片、视频都写在这里）
    pub work_dir: PathBuf,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
    pub file_credentials: Credentials,
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(config_file: Option<&Path>, cli: &ConfigLayer) -> Result<PipelineConfig> {
        let file_layer = Self::load_file_ini(config_file)?
            .map(|ini| Self::layer_from_ini(&ini))
            .transpose()?
            .unwrap_or_default();
        let env_layer = Self::load_from_env(|key| env::var(key).ok())?;

        Ok(cli.clone().or(env_layer).or(file_layer).finish())
    }

    /// 读取配置文件：显式指定的文件必须存在，否则按默认位置查找
    fn load_file_ini(config_file: Option<&Path>) -> Result<Option<configparser::ini::Ini>> {
        match config_file {
            Some(path) => Self::read_ini(path).map(Some),
            None => Ok(Self::default_config_location()
                .and_then(|path| Self::read_ini(&path).ok())),
        }
    }

    fn read_ini(config_path: &Path) -> Result<configparser::ini::Ini> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }
        let mut ini = configparser::ini::Ini::new();
        ini.load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;
        Ok(ini)
    }

    /// 按顺序查找默认配置文件
    fn default_config_location() -> Option<PathBuf> {
        // 1. 当前目录的 vibe-frame.ini
        // 2. 当前目录的 .vibe-frame.ini
        // 3. 用户主目录的 .vibe-frame.ini
        // 4. /etc/vibe-frame.ini
        let mut candidates = vec![
            PathBuf::from(CONFIG_FILE_NAME),
            PathBuf::from(HIDDEN_CONFIG_FILE_NAME),
        ];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(HIDDEN_CONFIG_FILE_NAME));
        }
        candidates.push(PathBuf::from("/etc").join(CONFIG_FILE_NAME));
        candidates.into_iter().find(|p| p.exists())
    }

    /// 从环境变量加载配置（只包含环境变量里出现的字段）
    pub fn load_from_env(lookup: impl Fn(&str) -> Option<String>) -> Result<ConfigLayer> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Ok(ConfigLayer {
            min_interval: parse_opt(get("VIBE_FRAME_MIN_INTERVAL"), "VIBE_FRAME_MIN_INTERVAL")?,
            onset_threshold: parse_opt(get("VIBE_FRAME_ONSET_THRESHOLD"), "VIBE_FRAME_ONSET_THRESHOLD")?,
            prompt_style: get("VIBE_FRAME_PROMPT_STYLE"),
            text_api_url: get("VIBE_FRAME_TEXT_API_URL"),
            text_model: get("VIBE_FRAME_TEXT_MODEL"),
            image_backend: parse_opt(get("VIBE_FRAME_IMAGE_BACKEND"), "VIBE_FRAME_IMAGE_BACKEND")?,
            image_api_url: get("VIBE_FRAME_IMAGE_API_URL"),
            image_model: get("VIBE_FRAME_IMAGE_MODEL"),
            image_width: parse_opt(get("VIBE_FRAME_IMAGE_WIDTH"), "VIBE_FRAME_IMAGE_WIDTH")?,
            image_height: parse_opt(get("VIBE_FRAME_IMAGE_HEIGHT"), "VIBE_FRAME_IMAGE_HEIGHT")?,
            max_concurrency: parse_opt(get("VIBE_FRAME_MAX_CONCURRENCY"), "VIBE_FRAME_MAX_CONCURRENCY")?,
            max_attempts: parse_opt(get("VIBE_FRAME_MAX_ATTEMPTS"), "VIBE_FRAME_MAX_ATTEMPTS")?,
            retry_base_delay_ms: parse_opt(get("VIBE_FRAME_RETRY_DELAY_MS"), "VIBE_FRAME_RETRY_DELAY_MS")?,
            request_timeout_secs: parse_opt(get("VIBE_FRAME_REQUEST_TIMEOUT"), "VIBE_FRAME_REQUEST_TIMEOUT")?,
            video_fps: parse_opt(get("VIBE_FRAME_FPS"), "VIBE_FRAME_FPS")?,
            video_width: parse_opt(get("VIBE_FRAME_VIDEO_WIDTH"), "VIBE_FRAME_VIDEO_WIDTH")?,
            video_height: parse_opt(get("VIBE_FRAME_VIDEO_HEIGHT"), "VIBE_FRAME_VIDEO_HEIGHT")?,
            webhook_url: get("VIBE_FRAME_WEBHOOK_URL"),
        })
    }

    /// 从 INI 内容解析配置层
    pub fn layer_from_ini(ini: &configparser::ini::Ini) -> Result<ConfigLayer> {
        // 先查指定节，没有再查 [default] 节
        let get = |section: &str, key: &str| {
            ini.get(section, key)
                .or_else(|| ini.get("default", key))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(ConfigLayer {
            min_interval: parse_opt(get("storyboard", "min_interval"), "min_interval")?,
            onset_threshold: parse_opt(get("storyboard", "onset_threshold"), "onset_threshold")?,
            prompt_style: get("storyboard", "prompt_style"),
            text_api_url: get("text", "api_url"),
            text_model: get("text", "model"),
            image_backend: parse_opt(get("image", "backend"), "backend")?,
            image_api_url: get("image", "api_url"),
            image_model: get("image", "model"),
            image_width: parse_opt(get("image", "width"), "image width")?,
            image_height: parse_opt(get("image", "height"), "image height")?,
            max_concurrency: parse_opt(get("pipeline", "max_concurrency"), "max_concurrency")?,
            max_attempts: parse_opt(get("pipeline", "max_attempts"), "max_attempts")?,
            retry_base_delay_ms: parse_opt(get("pipeline", "retry_base_delay_ms"), "retry_base_delay_ms")?,
            request_timeout_secs: parse_opt(get("pipeline", "request_timeout_secs"), "request_timeout_secs")?,
            video_fps: parse_opt(get("video", "fps"), "fps")?,
            video_width: parse_opt(get("video", "width"), "video width")?,
            video_height: parse_opt(get("video", "height"), "video height")?,
            webhook_url: get("pipeline", "webhook_url"),
        })
    }

    /// 加载扩展配置（包含工作目录、日志级别、凭证等）
    pub fn load_extended_config(config_file: Option<&Path>, cli: &ConfigLayer) -> Result<ExtendedConfig> {
        let pipeline = Self::load_config(config_file, cli)?;
        let ini = Self::load_file_ini(config_file)?;
        let file_get = |section: &str, key: &str| {
            ini.as_ref()
                .and_then(|ini| ini.get(section, key).or_else(|| ini.get("default", key)))
                .filter(|v| !v.trim().is_empty())
        };

        let work_dir = env::var("VIBE_FRAME_WORK_DIR")
            .ok()
            .or_else(|| file_get("pipeline", "work_dir"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./vibe_frame_output"));

        let log_level = env::var("LOG_LEVEL")
            .ok()
            .or_else(|| file_get("logging", "level"))
            .unwrap_or_else(|| "info".to_string());

        let file_credentials = Credentials::new(file_get("text", "api_key"), file_get("image", "api_key"));

        Ok(ExtendedConfig {
            pipeline,
            work_dir,
            log_level,
            file_credentials,
        })
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = PipelineConfig::default();
        let mut ini = configparser::ini::Ini::new();
        ini.set("storyboard", "min_interval", Some(defaults.min_interval.to_string()));
        ini.set("storyboard", "onset_threshold", Some(defaults.onset_threshold.to_string()));
        ini.set("storyboard", "prompt_style", Some(String::new()));
        ini.set("text", "api_url", Some(defaults.text_api_url.clone()));
        ini.set("text", "model", Some(defaults.text_model.clone()));
        ini.set("text", "api_key", Some(String::new()));
        ini.set("image", "backend", Some(defaults.image_backend.to_string()));
        ini.set("image", "model", Some(defaults.image_model().to_string()));
        ini.set("image", "width", Some(defaults.image_width.to_string()));
        ini.set("image", "height", Some(defaults.image_height.to_string()));
        ini.set("image", "api_key", Some(String::new()));
        ini.set("pipeline", "max_concurrency", Some(defaults.max_concurrency.to_string()));
        ini.set("pipeline", "max_attempts", Some(defaults.max_attempts.to_string()));
        ini.set("pipeline", "retry_base_delay_ms", Some(defaults.retry_base_delay_ms.to_string()));
        ini.set("pipeline", "request_timeout_secs", Some(defaults.request_timeout_secs.to_string()));
        ini.set("pipeline", "webhook_url", Some(String::new()));
        ini.set("pipeline", "work_dir", Some("./vibe_frame_output".to_string()));
        ini.set("video", "fps", Some(defaults.video_fps.to_string()));
        ini.set("video", "width", Some(defaults.video_width.to_string()));
        ini.set("video", "height", Some(defaults.video_height.to_string()));
        ini.set("logging", "level", Some("info".to_string()));

        ini.write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}

fn parse_opt<T: FromStr>(value: Option<String>, name: &str) -> Result<Option<T>> {
    value
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| anyhow::anyhow!("配置项 {} 的值无效: {}", name, v))
        })
        .transpose()
}
