use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{PipelineError, Result};

/// 人工编辑分镜文件时允许的时间误差（秒）
const TIME_TOLERANCE: f64 = 1e-6;

/// 分镜中的单个片段（一个镜头）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// 片段开始时间（秒）
    pub start_time: f64,
    /// 片段结束时间（秒）
    pub end_time: f64,
    /// 默认提示词
    #[serde(default)]
    pub base_prompt: String,
    /// 文本服务增强后的提示词
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhanced_prompt: Option<String>,
    /// 生成的图片路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

impl Segment {
    pub fn new(start_time: f64, end_time: f64, base_prompt: impl Into<String>) -> Self {
        Self {
            start_time,
            end_time,
            base_prompt: base_prompt.into(),
            enhanced_prompt: None,
            image_path: None,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// 下游阶段实际使用的提示词：优先使用增强后的提示词
    pub fn effective_prompt(&self) -> &str {
        match self.enhanced_prompt.as_deref() {
            Some(prompt) if !prompt.trim().is_empty() => prompt,
            _ => &self.base_prompt,
        }
    }

    pub fn has_enhanced_prompt(&self) -> bool {
        self.enhanced_prompt
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty())
    }

    pub fn has_image(&self) -> bool {
        self.image_path
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty())
    }
}

/// 分镜：各阶段之间唯一的持久化产物
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Storyboard {
    /// 输入音频路径
    pub source_audio: String,
    /// 按时间排序、首尾相接的片段列表
    pub segments: Vec<Segment>,
}

impl Storyboard {
    /// 根据切点列表构建分镜
    ///
    /// `cuts` 必须包含 0.0 和音频时长两个边界，
    /// 相邻切点两两组成一个片段。
    pub fn from_cuts(
        source_audio: impl Into<String>,
        cuts: &[f64],
        prompt_style: Option<&str>,
    ) -> Result<Self> {
        let mut points: Vec<f64> = cuts.iter().copied().filter(|t| t.is_finite()).collect();
        points.sort_by(|a, b| a.total_cmp(b));
        points.dedup_by(|a, b| (*a - *b).abs() <= TIME_TOLERANCE);

        if points.len() < 2 {
            return Err(PipelineError::InvalidStoryboard(format!(
                "至少需要两个切点才能构成片段，实际: {:?}",
                cuts
            )));
        }

        let total = points.len() - 1;
        let segments = points
            .windows(2)
            .enumerate()
            .map(|(index, pair)| Segment::new(pair[0], pair[1], default_prompt(index, total, prompt_style)))
            .collect();

        let storyboard = Self {
            source_audio: source_audio.into(),
            segments,
        };
        storyboard.validate()?;
        Ok(storyboard)
    }

    /// 音频总时长，即最后一个片段的结束时间
    pub fn duration(&self) -> f64 {
        self.segments.last().map(|s| s.end_time).unwrap_or(0.0)
    }

    /// 检查片段是否从 0 开始、按时间排序、首尾相接且没有空片段
    pub fn validate(&self) -> Result<()> {
        let first = self
            .segments
            .first()
            .ok_or_else(|| PipelineError::InvalidStoryboard("分镜没有任何片段".to_string()))?;

        if first.start_time.abs() > TIME_TOLERANCE {
            return Err(PipelineError::InvalidStoryboard(format!(
                "第一个片段必须从 0 开始，实际: {}",
                first.start_time
            )));
        }

        for (index, segment) in self.segments.iter().enumerate() {
            if !segment.start_time.is_finite() || !segment.end_time.is_finite() {
                return Err(PipelineError::InvalidStoryboard(format!(
                    "片段 {} 的时间不是有效数字",
                    index
                )));
            }
            if segment.end_time - segment.start_time <= TIME_TOLERANCE {
                return Err(PipelineError::InvalidStoryboard(format!(
                    "片段 {} 的时长必须大于 0: [{}, {})",
                    index, segment.start_time, segment.end_time
                )));
            }
        }

        for (index, pair) in self.segments.windows(2).enumerate() {
            if (pair[0].end_time - pair[1].start_time).abs() > TIME_TOLERANCE {
                return Err(PipelineError::InvalidStoryboard(format!(
                    "片段 {} 与 {} 不连续（不允许重排或留空）: {} != {}",
                    index,
                    index + 1,
                    pair[0].end_time,
                    pair[1].start_time
                )));
            }
        }

        Ok(())
    }

    /// 缺少图片的片段序号
    pub fn missing_images(&self) -> Vec<usize> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.has_image())
            .map(|(i, _)| i)
            .collect()
    }

    /// 只有每个片段都有图片时，分镜才能用于合成视频
    pub fn is_ready_for_assembly(&self) -> bool {
        self.missing_images().is_empty()
    }

    /// 根据时间查找所在片段（区间左闭右开）
    pub fn segment_at(&self, time: f64) -> Option<usize> {
        self.segments
            .iter()
            .position(|s| time >= s.start_time && time < s.end_time)
    }

    /// 合并提示词增强结果（纯函数，不涉及 IO）
    ///
    /// 结果按片段序号索引，与完成顺序无关；越界的序号被忽略。
    pub fn with_enhancements(mut self, enhanced: &BTreeMap<usize, String>) -> Self {
        for (&index, prompt) in enhanced {
            if let Some(segment) = self.segments.get_mut(index) {
                segment.enhanced_prompt = Some(prompt.clone());
            }
        }
        self
    }

    /// 合并图片生成结果（纯函数，不涉及 IO）
    ///
    /// `None` 表示该片段的旧图片已失效，需要清除。
    pub fn with_images(mut self, images: &BTreeMap<usize, Option<String>>) -> Self {
        for (&index, path) in images {
            if let Some(segment) = self.segments.get_mut(index) {
                segment.image_path = path.clone();
            }
        }
        self
    }

    /// 从 JSON 文件加载分镜并校验
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let storyboard: Storyboard = serde_json::from_str(content)?;
        storyboard.validate()?;
        Ok(storyboard)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 整体写回分镜文件
    ///
    /// 先写临时文件再重命名，读者永远不会看到写了一半的分镜。
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_json()?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = std::path::PathBuf::from(tmp_name);

        std::fs::write(&tmp_path, json).map_err(|e| PipelineError::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, path).map_err(|e| PipelineError::io(path, e))?;
        Ok(())
    }
}

/// 片段的默认提示词
pub fn default_prompt(index: usize, total: usize, style: Option<&str>) -> String {
    let base = format!(
        "Scene {} of {}: cinematic visuals that match the mood of the music",
        index + 1,
        total
    );
    match style.map(str::trim).filter(|s| !s.is_empty()) {
        Some(style) => format!("{}, {}", base, style),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Storyboard {
        Storyboard::from_cuts("song.mp3", &[0.0, 1.0, 7.0, 10.0], None).unwrap()
    }

    #[test]
    fn test_from_cuts_tiles_duration() {
        let storyboard = sample();
        assert_eq!(storyboard.segments.len(), 3);
        assert_eq!(storyboard.segments[0].start_time, 0.0);
        assert_eq!(storyboard.duration(), 10.0);
        for pair in storyboard.segments.windows(2) {
            assert_eq!(pair[0].end_time, pair[1].start_time);
        }
        assert!(storyboard.segments.iter().all(|s| !s.base_prompt.is_empty()));
    }

    #[test]
    fn test_from_cuts_normalizes_unsorted_and_duplicate_cuts() {
        let storyboard = Storyboard::from_cuts("a.wav", &[7.0, 0.0, 10.0, 1.0, 1.0], Some("neon")).unwrap();
        let spans: Vec<(f64, f64)> = storyboard.segments.iter().map(|s| (s.start_time, s.end_time)).collect();
        assert_eq!(spans, vec![(0.0, 1.0), (1.0, 7.0), (7.0, 10.0)]);
        assert!(storyboard.segments[0].base_prompt.ends_with(", neon"));
    }

    #[test]
    fn test_from_cuts_requires_two_points() {
        assert!(Storyboard::from_cuts("a.wav", &[0.0], None).is_err());
    }

    #[test]
    fn test_validate_rejects_reordered_segments() {
        let mut storyboard = sample();
        storyboard.segments.swap(0, 1);
        assert!(matches!(storyboard.validate(), Err(PipelineError::InvalidStoryboard(_))));
    }

    #[test]
    fn test_validate_rejects_gap() {
        let mut storyboard = sample();
        storyboard.segments[1].start_time = 1.5;
        assert!(storyboard.validate().is_err());
    }

    #[test]
    fn test_effective_prompt_prefers_enhanced() {
        let mut segment = Segment::new(0.0, 1.0, "base");
        assert_eq!(segment.effective_prompt(), "base");
        segment.enhanced_prompt = Some("   ".to_string());
        assert_eq!(segment.effective_prompt(), "base");
        segment.enhanced_prompt = Some("a neon city at night".to_string());
        assert_eq!(segment.effective_prompt(), "a neon city at night");
    }

    #[test]
    fn test_json_round_trip() {
        let mut storyboard = sample();
        storyboard.segments[0].enhanced_prompt = Some("sunrise over the sea".to_string());
        storyboard.segments[2].image_path = Some("frames/segment_0002.png".to_string());

        let json = storyboard.to_json().unwrap();
        let reloaded = Storyboard::from_json(&json).unwrap();
        assert_eq!(reloaded, storyboard);
    }

    #[test]
    fn test_json_accepts_explicit_nulls() {
        let json = r#"{
            "source_audio": "song.mp3",
            "segments": [
                {"start_time": 0.0, "end_time": 4.0, "base_prompt": "a", "enhanced_prompt": null, "image_path": null},
                {"start_time": 4.0, "end_time": 6.0, "base_prompt": "b"}
            ]
        }"#;
        let storyboard = Storyboard::from_json(json).unwrap();
        assert_eq!(storyboard.missing_images(), vec![0, 1]);
        assert_eq!(storyboard.duration(), 6.0);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("storyboard.json");
        let storyboard = sample();
        storyboard.save(&path).unwrap();
        assert_eq!(Storyboard::load(&path).unwrap(), storyboard);
    }

    #[test]
    fn test_transitions_merge_by_index() {
        let mut enhanced = BTreeMap::new();
        enhanced.insert(2, "third".to_string());
        enhanced.insert(0, "first".to_string());
        enhanced.insert(9, "ignored".to_string());
        let storyboard = sample().with_enhancements(&enhanced);
        assert_eq!(storyboard.segments[0].enhanced_prompt.as_deref(), Some("first"));
        assert_eq!(storyboard.segments[1].enhanced_prompt, None);
        assert_eq!(storyboard.segments[2].enhanced_prompt.as_deref(), Some("third"));

        let mut images = BTreeMap::new();
        images.insert(1, Some("b.png".to_string()));
        let storyboard = storyboard.with_images(&images);
        assert_eq!(storyboard.missing_images(), vec![0, 2]);
        assert!(!storyboard.is_ready_for_assembly());
    }

    #[test]
    fn test_segment_at_uses_half_open_intervals() {
        let storyboard = sample();
        assert_eq!(storyboard.segment_at(0.0), Some(0));
        assert_eq!(storyboard.segment_at(1.0), Some(1));
        assert_eq!(storyboard.segment_at(6.99), Some(1));
        assert_eq!(storyboard.segment_at(7.0), Some(2));
        assert_eq!(storyboard.segment_at(10.0), None);
    }
}
