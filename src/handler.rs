use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::config::{Credentials, PipelineConfig};
use crate::error::PipelineError;
use crate::processor::Pipeline;
use crate::report::StageReport;
use crate::storyboard::Storyboard;

/// HTTP 服务共享状态
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: PipelineConfig,
    file_credentials: Credentials,
    work_dir: PathBuf,
    /// 分镜只有一个写者：分析、人工编辑、生成互斥
    writer: Mutex<()>,
}

impl AppState {
    pub fn new(config: PipelineConfig, file_credentials: Credentials, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                file_credentials,
                work_dir: work_dir.into(),
                writer: Mutex::new(()),
            }),
        }
    }

    fn pipeline(&self, explicit: Credentials) -> Pipeline {
        let credentials = Credentials::resolve(
            explicit,
            self.inner.config.image_backend,
            &self.inner.file_credentials,
        );
        Pipeline::new(self.inner.config.clone(), credentials, &self.inner.work_dir)
    }
}

/// 构建路由
pub fn router(state: AppState) -> Router {
    let files = ServeDir::new(&state.inner.work_dir);
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/analyze", post(handle_analyze))
        .route("/storyboard", get(handle_get_storyboard).put(handle_put_storyboard))
        .route("/generate", post(handle_generate))
        // 工作目录下的图片和最终视频
        .nest_service("/files", files)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

/// 接口响应
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    /// 状态字符串
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storyboard: Option<Storyboard>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_path: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reports: Vec<StageReport>,
}

impl ApiResponse {
    fn new(success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            message: message.into(),
            run_id: None,
            storyboard: None,
            video_path: None,
            reports: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    /// 服务端可访问的音频文件路径
    pub audio_path: String,
    pub min_interval: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateRequest {
    /// 优先于环境变量和配置文件中的密钥
    pub text_api_key: Option<String>,
    pub image_api_key: Option<String>,
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

fn error_status(e: &PipelineError) -> StatusCode {
    match e {
        PipelineError::Config(_) | PipelineError::AudioDecode { .. } => StatusCode::BAD_REQUEST,
        PipelineError::InvalidStoryboard(_) | PipelineError::Json(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::IncompleteStoryboard { .. } => StatusCode::CONFLICT,
        PipelineError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// 分析音频，生成初始分镜
pub async fn handle_analyze(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<ResponseJson<ApiResponse>, (StatusCode, String)> {
    info!("🎵 [HTTP] 分析请求: {}", request.audio_path);
    let _guard = state.inner.writer.lock().await;

    let pipeline = state.pipeline(Credentials::default());
    let storyboard = pipeline
        .analyze(&PathBuf::from(&request.audio_path), request.min_interval)
        .await
        .map_err(|e| {
            error!("分析失败: {}", e);
            (error_status(&e), format!("failed: {}", e))
        })?;

    Ok(ResponseJson(ApiResponse {
        run_id: Some(pipeline.run_id().to_string()),
        storyboard: Some(storyboard),
        ..ApiResponse::new(true, "success")
    }))
}

/// 读取当前分镜
pub async fn handle_get_storyboard(
    State(state): State<AppState>,
) -> Result<ResponseJson<Storyboard>, (StatusCode, String)> {
    let path = state.pipeline(Credentials::default()).storyboard_path();
    Storyboard::load(&path)
        .map(ResponseJson)
        .map_err(|e| (error_status(&e), e.to_string()))
}

/// 人工编辑后的分镜：校验通过才写回
pub async fn handle_put_storyboard(
    State(state): State<AppState>,
    body: String,
) -> Result<ResponseJson<ApiResponse>, (StatusCode, String)> {
    let storyboard = Storyboard::from_json(&body).map_err(|e| (error_status(&e), e.to_string()))?;

    let _guard = state.inner.writer.lock().await;
    let path = state.pipeline(Credentials::default()).storyboard_path();
    storyboard.save(&path).map_err(|e| {
        error!("保存分镜失败: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    info!("📋 [HTTP] 分镜已更新: {} 个片段", storyboard.segments.len());

    Ok(ResponseJson(ApiResponse {
        storyboard: Some(storyboard),
        ..ApiResponse::new(true, "success")
    }))
}

/// 增强提示词、生成图片、合成视频
pub async fn handle_generate(
    State(state): State<AppState>,
    request: Option<Json<GenerateRequest>>,
) -> Result<ResponseJson<ApiResponse>, (StatusCode, String)> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let _guard = state.inner.writer.lock().await;

    let pipeline = state.pipeline(Credentials::new(request.text_api_key, request.image_api_key));
    if !pipeline.storyboard_path().is_file() {
        return Err((StatusCode::NOT_FOUND, "分镜不存在，请先调用 /analyze".to_string()));
    }

    let output = pipeline.generate().await;
    Ok(ResponseJson(ApiResponse {
        success: !output.failed(),
        message: output.summary(),
        run_id: Some(output.run_id.clone()),
        storyboard: Storyboard::load(pipeline.storyboard_path()).ok(),
        video_path: output.video_path.as_ref().map(|p| p.to_string_lossy().to_string()),
        reports: output.reports,
    }))
}
