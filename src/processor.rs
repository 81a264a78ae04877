use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::assembler::VideoAssembler;
use crate::config::{Credentials, ImageBackend, PipelineConfig};
use crate::enhancer::PromptEnhancer;
use crate::error::{PipelineError, Result};
use crate::planner::SegmentPlanner;
use crate::report::{Stage, StageReport};
use crate::services::{HuggingFaceClient, ImageClient, OpenAiImageClient, OpenRouterClient};
use crate::storyboard::Storyboard;
use crate::synthesizer::FrameSynthesizer;

pub const STORYBOARD_FILE: &str = "storyboard.json";
pub const IMAGES_DIR: &str = "frames";
pub const VIDEO_FILE: &str = "final_video.mp4";

/// 一次生成的结果
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub run_id: String,
    /// 最终视频；合成未完成时为 None
    pub video_path: Option<PathBuf>,
    pub reports: Vec<StageReport>,
}

impl RunOutput {
    /// 是否有阶段失败
    pub fn failed(&self) -> bool {
        self.reports.iter().any(|r| r.status.is_failed())
    }

    /// 每个阶段一行的状态摘要
    pub fn summary(&self) -> String {
        self.reports
            .iter()
            .map(|r| format!("{}: {}", r.stage, r.message()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 流水线：在一个工作目录下依次执行各阶段
///
/// 工作目录布局：`storyboard.json`、`frames/segment_NNNN.png`、`final_video.mp4`。
pub struct Pipeline {
    config: PipelineConfig,
    credentials: Credentials,
    work_dir: PathBuf,
    run_id: Uuid,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, credentials: Credentials, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            credentials,
            work_dir: work_dir.into(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn storyboard_path(&self) -> PathBuf {
        self.work_dir.join(STORYBOARD_FILE)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.work_dir.join(IMAGES_DIR)
    }

    pub fn video_path(&self) -> PathBuf {
        self.work_dir.join(VIDEO_FILE)
    }

    /// 分析音频并生成初始分镜
    pub async fn analyze(&self, audio_path: &Path, min_interval: Option<f64>) -> Result<Storyboard> {
        let start = Instant::now();
        let min_interval = min_interval.unwrap_or(self.config.min_interval);
        let planner = SegmentPlanner::new(&self.config);
        let audio_path_owned = audio_path.to_path_buf();
        let destination = self.storyboard_path();

        // 解码和起音检测是 CPU 密集型操作
        let result = tokio::task::spawn_blocking(move || planner.plan(&audio_path_owned, &destination, min_interval))
            .await
            .map_err(|e| PipelineError::audio(audio_path, format!("分析任务异常退出: {}", e)))
            .and_then(|r| r)
            .and_then(|storyboard| {
                self.discard_frames()?;
                Ok(storyboard)
            });

        let report = match &result {
            Ok(_) => StageReport::success(Stage::Analyze),
            Err(e) => StageReport::failed(Stage::Analyze, e.to_string()),
        };
        self.notify(&report, None).await;
        info!(
            "⏱️  [流水线] 分析阶段: {}，耗时: {:.2}秒",
            report.message(),
            start.elapsed().as_secs_f64()
        );
        result
    }

    /// 增强提示词
    pub async fn enhance(&self) -> Result<StageReport> {
        let result: Result<StageReport> = async {
            let api_key = self.credentials.require_text()?;
            let client = OpenRouterClient::new(
                api_key,
                &self.config.text_api_url,
                &self.config.text_model,
                self.config.request_timeout(),
            )?;
            PromptEnhancer::new(client, &self.config)
                .enhance_prompts(&self.storyboard_path())
                .await
        }
        .await;
        self.finish_stage(Stage::Enhance, result).await
    }

    /// 生成每个片段的图片
    pub async fn synthesize(&self) -> Result<StageReport> {
        let result: Result<StageReport> = async {
            let client = build_image_client(&self.config, &self.credentials)?;
            FrameSynthesizer::new(client, &self.config)
                .generate_images(&self.storyboard_path(), &self.images_dir())
                .await
        }
        .await;
        self.finish_stage(Stage::Synthesize, result).await
    }

    /// 合成最终视频
    pub async fn assemble(&self) -> Result<PathBuf> {
        let assembler = VideoAssembler::new(&self.config);
        let storyboard_path = self.storyboard_path();
        let video_path = self.video_path();
        let result = tokio::task::spawn_blocking(move || assembler.create_video(&storyboard_path, &video_path))
            .await
            .map_err(|e| PipelineError::encoding(format!("合成任务异常退出: {}", e)))
            .and_then(|r| r);

        let report = match &result {
            Ok(_) => StageReport::success(Stage::Assemble),
            Err(e) => StageReport::failed(Stage::Assemble, e.to_string()),
        };
        self.notify(&report, result.as_ref().ok().map(PathBuf::as_path)).await;
        result
    }

    /// 增强 → 生成图片 → 合成视频
    ///
    /// 阶段致命错误会记录为失败并停止后续阶段；图片不全时合成阶段报告失败。
    pub async fn generate(&self) -> RunOutput {
        let start = Instant::now();
        let mut output = RunOutput {
            run_id: self.run_id.to_string(),
            video_path: None,
            reports: Vec::new(),
        };

        for stage in [Stage::Enhance, Stage::Synthesize] {
            let result = match stage {
                Stage::Enhance => self.enhance().await,
                _ => self.synthesize().await,
            };
            match result {
                Ok(report) => output.reports.push(report),
                Err(e) => {
                    output.reports.push(StageReport::failed(stage, e.to_string()));
                    return output;
                }
            }
        }

        match self.assemble().await {
            Ok(path) => {
                output.video_path = Some(path);
                output.reports.push(StageReport::success(Stage::Assemble));
            }
            Err(e) => output.reports.push(StageReport::failed(Stage::Assemble, e.to_string())),
        }

        info!(
            "✅ [流水线] 生成完成，耗时: {:.2}秒\n{}",
            start.elapsed().as_secs_f64(),
            output.summary()
        );
        output
    }

    /// 完整流程：分析 + 生成
    pub async fn run(&self, audio_path: &Path, min_interval: Option<f64>) -> RunOutput {
        if let Err(e) = self.analyze(audio_path, min_interval).await {
            return RunOutput {
                run_id: self.run_id.to_string(),
                video_path: None,
                reports: vec![StageReport::failed(Stage::Analyze, e.to_string())],
            };
        }
        let mut output = self.generate().await;
        output.reports.insert(0, StageReport::success(Stage::Analyze));
        output
    }

    /// 新分镜替换旧分镜后，上一次的图片和生成清单不再属于任何片段
    fn discard_frames(&self) -> Result<()> {
        let images_dir = self.images_dir();
        match std::fs::remove_dir_all(&images_dir) {
            Ok(()) => {
                info!("🧹 [流水线] 已清理旧图片目录: {}", images_dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::io(&images_dir, e)),
        }
    }

    async fn finish_stage(&self, stage: Stage, result: Result<StageReport>) -> Result<StageReport> {
        let report = match &result {
            Ok(report) => report.clone(),
            Err(e) => {
                error!("❌ [{}] 阶段失败: {}", stage, e);
                StageReport::failed(stage, e.to_string())
            }
        };
        self.notify(&report, None).await;
        result
    }

    async fn notify(&self, report: &StageReport, video: Option<&Path>) {
        let Some(webhook_url) = &self.config.webhook_url else {
            return;
        };
        info!("⏳ [{}] 正在调用 Webhook 回调...", report.stage);
        let payload = WebhookPayload {
            run_id: self.run_id.to_string(),
            stage: report.stage,
            status: report.message(),
            failures: &report.failures,
            storyboard_path: self.storyboard_path().to_string_lossy().to_string(),
            video_path: video.map(|p| p.to_string_lossy().to_string()),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        if let Err(e) = call_webhook(webhook_url, &payload).await {
            warn!("⚠️  [{}] Webhook 回调失败: {:#}", report.stage, e);
        } else {
            info!("✅ [{}] Webhook 回调成功", report.stage);
        }
    }
}

/// 根据配置构建图像服务客户端
pub fn build_image_client(config: &PipelineConfig, credentials: &Credentials) -> Result<ImageClient> {
    let api_key = credentials.require_image()?;
    let client = match config.image_backend {
        ImageBackend::HuggingFace => ImageClient::HuggingFace(HuggingFaceClient::new(
            api_key,
            config.image_api_url(),
            config.image_model(),
            config.request_timeout(),
        )?),
        ImageBackend::OpenAi => ImageClient::OpenAi(OpenAiImageClient::new(
            api_key,
            config.image_api_url(),
            config.image_model(),
            config.request_timeout(),
        )?),
    };
    Ok(client)
}

/// Webhook 回调数据结构
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    run_id: String,
    stage: Stage,
    /// 阶段状态字符串
    status: String,
    failures: &'a BTreeMap<usize, String>,
    storyboard_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_path: Option<String>,
    /// 回调时间戳
    timestamp: String,
}

/// 调用 webhook 回调，失败不影响阶段结果
async fn call_webhook(webhook_url: &str, payload: &WebhookPayload<'_>) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .post(webhook_url)
        .json(payload)
        .timeout(std::time::Duration::from_secs(30))
        .send()
        .await
        .context("Webhook 请求失败")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        warn!("Webhook 回调返回错误状态: {} - {}", status, error_text);
        return Err(anyhow::anyhow!("Webhook 返回错误状态: {}", status));
    }

    Ok(())
}
