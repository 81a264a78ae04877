use tracing::debug;

use crate::audio::AudioHandle;
use crate::error::{PipelineError, Result};

/// 能量计算的窗口长度（采样数）
const FRAME_SIZE: usize = 1024;
/// 相邻分析帧之间的步长（采样数）
const DEFAULT_HOP_SIZE: usize = 512;
/// 自适应阈值的局部窗口半径（帧）
const MEAN_RADIUS: usize = 8;
/// 峰值判断的局部窗口半径（帧）
const PEAK_RADIUS: usize = 3;
/// 防止 log(0)
const ENERGY_FLOOR: f64 = 1e-10;

/// 节拍/起音检测器，用于在音乐中找到镜头切换点
pub struct BeatDetector {
    /// 起音强度阈值（归一化后高出局部均值的幅度，0.0-1.0）
    threshold: f64,
    /// 相邻切点的最小间隔（秒）
    min_interval: f64,
    hop_size: usize,
}

impl BeatDetector {
    pub fn new(threshold: f64, min_interval: f64) -> Self {
        Self {
            threshold,
            min_interval,
            hop_size: DEFAULT_HOP_SIZE,
        }
    }

    pub fn with_hop_size(mut self, hop_size: usize) -> Self {
        self.hop_size = hop_size.max(1);
        self
    }

    /// 计算起音包络（novelty curve）
    ///
    /// 对全频带信号和一阶差分（高通，突出鼓点、镲片等瞬态）分别计算
    /// 对数能量，取相邻帧之间的正向增量之和。返回值归一化到 0.0-1.0。
    pub fn onset_envelope(&self, samples: &[f32]) -> Vec<f64> {
        if samples.len() < FRAME_SIZE {
            return Vec::new();
        }

        let frame_count = (samples.len() - FRAME_SIZE) / self.hop_size + 1;
        let mut full_band = Vec::with_capacity(frame_count);
        let mut high_band = Vec::with_capacity(frame_count);

        for i in 0..frame_count {
            let frame = &samples[i * self.hop_size..i * self.hop_size + FRAME_SIZE];
            let mut energy = 0.0f64;
            let mut high_energy = 0.0f64;
            let mut prev = frame[0] as f64;
            for &s in frame {
                let s = s as f64;
                energy += s * s;
                let diff = s - prev;
                high_energy += diff * diff;
                prev = s;
            }
            full_band.push((energy / FRAME_SIZE as f64 + ENERGY_FLOOR).ln());
            high_band.push((high_energy / FRAME_SIZE as f64 + ENERGY_FLOOR).ln());
        }

        let mut envelope = vec![0.0; frame_count];
        for i in 1..frame_count {
            let flux = (full_band[i] - full_band[i - 1]).max(0.0)
                + (high_band[i] - high_band[i - 1]).max(0.0);
            envelope[i] = flux;
        }

        let max = envelope.iter().cloned().fold(0.0f64, f64::max);
        if max > 0.0 {
            for value in envelope.iter_mut() {
                *value /= max;
            }
        }
        envelope
    }

    /// 在包络上做峰值检测，返回起音时间戳（秒，升序）
    pub fn pick_peaks(&self, envelope: &[f64], sample_rate: u32) -> Vec<f64> {
        let mut onsets = Vec::new();
        if sample_rate == 0 {
            return onsets;
        }

        for i in 1..envelope.len() {
            let value = envelope[i];
            if value <= 0.0 {
                continue;
            }

            let lo = i.saturating_sub(MEAN_RADIUS);
            let hi = (i + MEAN_RADIUS + 1).min(envelope.len());
            let local_mean = envelope[lo..hi].iter().sum::<f64>() / (hi - lo) as f64;
            if value < local_mean + self.threshold {
                continue;
            }

            // 必须是局部最大值；平台取第一个
            let lo = i.saturating_sub(PEAK_RADIUS);
            let hi = (i + PEAK_RADIUS + 1).min(envelope.len());
            let is_peak = envelope[lo..i].iter().all(|&v| v < value)
                && envelope[i + 1..hi].iter().all(|&v| v <= value);
            if is_peak {
                onsets.push((i * self.hop_size) as f64 / sample_rate as f64);
            }
        }

        onsets
    }

    /// 检测原始起音点（未做最小间隔过滤）
    pub fn detect_onsets(&self, audio: &AudioHandle) -> Vec<f64> {
        let envelope = self.onset_envelope(&audio.samples);
        let onsets = self.pick_peaks(&envelope, audio.sample_rate);
        debug!(
            "🥁 [节拍检测] 分析帧数: {}，原始起音点: {} 个",
            envelope.len(),
            onsets.len()
        );
        onsets
    }

    /// 检测切点：起音检测 + 最小间隔过滤
    ///
    /// 返回值总是以 0.0 开头、以音频时长结尾。
    pub fn detect_cuts(&self, audio: &AudioHandle) -> Result<Vec<f64>> {
        validate_min_interval(self.min_interval)?;
        let onsets = self.detect_onsets(audio);
        retain_cuts(&onsets, self.min_interval, audio.duration())
    }
}

fn validate_min_interval(min_interval: f64) -> Result<()> {
    if !min_interval.is_finite() || min_interval <= 0.0 {
        return Err(PipelineError::Config(format!(
            "min_interval 必须为正数，实际: {}",
            min_interval
        )));
    }
    Ok(())
}

/// 按最小间隔从左到右贪心保留切点
///
/// 第一个落在 (0, duration) 内的起音点总是保留；之后的候选点只有距离
/// 上一个保留点不少于 `min_interval` 秒时才保留（恰好相等也保留）。
/// 0.0 和 `duration` 作为隐含边界加在首尾，不参与过滤。
pub fn retain_cuts(onsets: &[f64], min_interval: f64, duration: f64) -> Result<Vec<f64>> {
    validate_min_interval(min_interval)?;
    if !duration.is_finite() || duration <= 0.0 {
        return Err(PipelineError::InvalidStoryboard(format!(
            "音频时长必须为正数，实际: {}",
            duration
        )));
    }

    let mut candidates: Vec<f64> = onsets
        .iter()
        .copied()
        .filter(|t| t.is_finite() && *t > 0.0 && *t < duration)
        .collect();
    candidates.sort_by(|a, b| a.total_cmp(b));

    let mut cuts = vec![0.0];
    let mut last_kept: Option<f64> = None;
    for t in candidates {
        match last_kept {
            Some(last) if t - last < min_interval => continue,
            _ => {
                cuts.push(t);
                last_kept = Some(t);
            }
        }
    }
    cuts.push(duration);

    Ok(cuts)
}
