use std::path::Path;
use std::time::Instant;
use tracing::info;

use crate::audio::{self, AudioHandle};
use crate::beat_detector::BeatDetector;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::storyboard::Storyboard;

/// 分段规划器：音频 → 切点 → 初始分镜
pub struct SegmentPlanner {
    onset_threshold: f64,
    hop_size: Option<usize>,
    prompt_style: Option<String>,
}

impl SegmentPlanner {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            onset_threshold: config.onset_threshold,
            hop_size: None,
            prompt_style: config.prompt_style.clone(),
        }
    }

    pub fn with_hop_size(mut self, hop_size: usize) -> Self {
        self.hop_size = Some(hop_size);
        self
    }

    pub fn load_audio(&self, path: &Path) -> Result<AudioHandle> {
        audio::load_audio(path)
    }

    /// 检测切点，结果以 0.0 开头、以音频时长结尾
    pub fn detect_cuts(&self, audio: &AudioHandle, min_interval: f64) -> Result<Vec<f64>> {
        let mut detector = BeatDetector::new(self.onset_threshold, min_interval);
        if let Some(hop_size) = self.hop_size {
            detector = detector.with_hop_size(hop_size);
        }
        detector.detect_cuts(audio)
    }

    /// 由切点生成分镜并写入 `destination`
    pub fn generate_storyboard(&self, source_audio: &Path, cuts: &[f64], destination: &Path) -> Result<Storyboard> {
        let storyboard = Storyboard::from_cuts(
            source_audio.to_string_lossy(),
            cuts,
            self.prompt_style.as_deref(),
        )?;
        storyboard.save(destination)?;
        info!(
            "📋 [分镜] 已生成 {} 个片段: {}",
            storyboard.segments.len(),
            destination.display()
        );
        Ok(storyboard)
    }

    /// 解码、检测切点、生成分镜
    pub fn plan(&self, audio_path: &Path, destination: &Path, min_interval: f64) -> Result<Storyboard> {
        let start = Instant::now();
        if !min_interval.is_finite() || min_interval <= 0.0 {
            return Err(PipelineError::Config(format!(
                "min_interval 必须为正数，实际: {}",
                min_interval
            )));
        }

        let audio = self.load_audio(audio_path)?;
        info!(
            "🎵 [音频分析] {}，时长: {:.2}秒",
            audio_path.display(),
            audio.duration()
        );

        let cuts = self.detect_cuts(&audio, min_interval)?;
        info!("🥁 [节拍检测] 保留切点 {} 个（最小间隔 {:.1}秒）", cuts.len().saturating_sub(2), min_interval);

        let storyboard = self.generate_storyboard(audio_path, &cuts, destination)?;
        info!("✅ [音频分析] 完成，耗时: {:.2}秒", start.elapsed().as_secs_f64());
        Ok(storyboard)
    }
}
