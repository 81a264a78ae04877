use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::report::{Stage, StageReport};
use crate::services::{with_retry, ImageRequest, ImageService, RetryPolicy, ServiceError};
use crate::storyboard::{Segment, Storyboard};

pub const MANIFEST_FILE: &str = "manifest.json";

/// 片段图片的固定文件名
pub fn image_file_name(index: usize) -> String {
    format!("segment_{:04}.png", index)
}

/// 清单中的一条记录：图片由哪首歌的哪个片段、哪个提示词生成
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub prompt: String,
    pub file: String,
    #[serde(default)]
    pub source_audio: String,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub end_time: f64,
}

impl ManifestEntry {
    pub fn new(source_audio: &str, segment: &Segment, prompt: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            file: file.into(),
            source_audio: source_audio.to_string(),
            start_time: segment.start_time,
            end_time: segment.end_time,
        }
    }
}

const TIME_TOLERANCE: f64 = 1e-6;

/// 图片目录下的生成清单，用于判断已有图片是否仍然有效
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(default)]
    pub images: BTreeMap<usize, ManifestEntry>,
}

impl ImageManifest {
    /// 清单不存在或损坏时视为空清单（所有图片重新生成）
    pub fn load(images_dir: &Path) -> Self {
        let path = images_dir.join(MANIFEST_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("⚠️  [图像生成] 清单文件无法解析，忽略: {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, images_dir: &Path) -> Result<()> {
        let path = images_dir.join(MANIFEST_FILE);
        let tmp_path = images_dir.join(format!("{}.tmp", MANIFEST_FILE));
        std::fs::write(&tmp_path, serde_json::to_string_pretty(self)?)
            .map_err(|e| PipelineError::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &path).map_err(|e| PipelineError::io(&path, e))?;
        Ok(())
    }

    /// 图片仍然属于这个片段：同一首歌、同一时间区间、同一提示词
    fn matches(&self, index: usize, file: &str, source_audio: &str, segment: &Segment) -> bool {
        self.images.get(&index).is_some_and(|entry| {
            entry.file == file
                && entry.prompt == segment.effective_prompt()
                && entry.source_audio == source_audio
                && (entry.start_time - segment.start_time).abs() < TIME_TOLERANCE
                && (entry.end_time - segment.end_time).abs() < TIME_TOLERANCE
        })
    }
}

/// 单个片段的处理计划
#[derive(Debug, Clone, PartialEq)]
pub enum FramePlan {
    /// 现有图片仍然有效，只需确保 `image_path` 指向它
    Keep(String),
    /// 需要请求图像服务
    Generate { prompt: String, target: PathBuf },
}

/// 帧合成器：为每个片段生成一张静态图片
pub struct FrameSynthesizer<S: ImageService> {
    service: Arc<S>,
    retry: RetryPolicy,
    max_concurrency: usize,
    width: u32,
    height: u32,
}

impl<S: ImageService> FrameSynthesizer<S> {
    pub fn new(service: S, config: &PipelineConfig) -> Self {
        Self {
            service: Arc::new(service),
            retry: config.retry_policy(),
            max_concurrency: config.max_concurrency.max(1),
            width: config.image_width,
            height: config.image_height,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 决定每个片段是沿用现有图片还是重新生成
    ///
    /// - 清单中记录的文件存在，且音频、时间区间和提示词都未变：沿用
    /// - `image_path` 指向清单之外、也不是 `segment_NNNN.png` 的现有文件（人工指定）：沿用
    /// - 其他情况：生成到 `images_dir/segment_NNNN.png`
    pub fn plan(storyboard: &Storyboard, images_dir: &Path, manifest: &ImageManifest) -> BTreeMap<usize, FramePlan> {
        storyboard
            .segments
            .iter()
            .enumerate()
            .map(|(index, segment)| {
                let prompt = segment.effective_prompt();
                let source = storyboard.source_audio.as_str();
                let target = images_dir.join(image_file_name(index));
                let target_str = target.to_string_lossy().to_string();

                if let Some(current) = segment.image_path.as_deref().filter(|_| segment.has_image()) {
                    let exists = Path::new(current).is_file();
                    // 自己生成的文件没有清单记录时无法确认来源，按过期处理
                    let manual = Path::new(current) != target
                        && manifest.images.get(&index).map_or(true, |e| e.file != current);
                    if exists && (manual || manifest.matches(index, current, source, segment)) {
                        return (index, FramePlan::Keep(current.to_string()));
                    }
                }

                if target.is_file() && manifest.matches(index, &target_str, source, segment) {
                    return (index, FramePlan::Keep(target_str));
                }

                (
                    index,
                    FramePlan::Generate {
                        prompt: prompt.to_string(),
                        target,
                    },
                )
            })
            .collect()
    }

    /// 为分镜中的每个片段生成图片，写入 `images_dir` 并更新分镜文件
    ///
    /// 每完成一张图片就写回分镜和清单，中途中断后可以继续。
    pub async fn generate_images(&self, storyboard_path: &Path, images_dir: &Path) -> Result<StageReport> {
        let start = Instant::now();
        let mut storyboard = Storyboard::load(storyboard_path)?;
        std::fs::create_dir_all(images_dir).map_err(|e| PipelineError::io(images_dir, e))?;
        let mut manifest = ImageManifest::load(images_dir);

        let plans = Self::plan(&storyboard, images_dir, &manifest);
        let mut kept = BTreeMap::new();
        let mut pending = Vec::new();
        for (index, plan) in plans {
            match plan {
                FramePlan::Keep(path) => {
                    kept.insert(index, Some(path));
                }
                FramePlan::Generate { prompt, target } => pending.push((index, prompt, target)),
            }
        }

        let skipped = kept.len();
        let requested = pending.len();
        let mut outstanding: BTreeSet<usize> = pending.iter().map(|(index, _, _)| *index).collect();
        info!(
            "🎨 [图像生成] 共 {} 个片段，待生成 {} 个，沿用 {} 个",
            storyboard.segments.len(),
            requested,
            skipped
        );

        storyboard = storyboard.with_images(&kept);
        storyboard.save(storyboard_path)?;

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();

        for (index, prompt, target) in pending {
            let service = Arc::clone(&self.service);
            let semaphore = Arc::clone(&semaphore);
            let policy = self.retry;
            let request = ImageRequest {
                index,
                prompt: prompt.clone(),
                width: self.width,
                height: self.height,
            };
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        let label = format!("图像生成 片段 {}", index);
                        match with_retry(&policy, &label, || fetch_image(service.as_ref(), &request)).await {
                            Ok(image) => store_png(image, target).await,
                            Err(e) => Err(e.to_string()),
                        }
                    }
                    Err(_) => Err("并发控制已关闭".to_string()),
                };
                (index, prompt, result)
            });
        }

        let mut failures = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, prompt, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("❌ [图像生成] 任务异常退出: {}", e);
                    continue;
                }
            };
            outstanding.remove(&index);

            let mut update = BTreeMap::new();
            match result {
                Ok(target) => {
                    let file = target.to_string_lossy().to_string();
                    info!("✅ [图像生成] 片段 {} 完成: {}", index, file);
                    let entry = ManifestEntry::new(&storyboard.source_audio, &storyboard.segments[index], prompt, file.clone());
                    manifest.images.insert(index, entry);
                    update.insert(index, Some(file));
                }
                Err(message) => {
                    let err = PipelineError::Synthesis {
                        index,
                        message: message.clone(),
                    };
                    warn!("⚠️  [图像生成] {}", err);
                    manifest.images.remove(&index);
                    update.insert(index, None);
                    failures.insert(index, message);
                }
            }

            manifest.save(images_dir)?;
            storyboard = storyboard.with_images(&update);
            storyboard.save(storyboard_path)?;
        }

        // 异常退出的任务没有返回片段编号，旧图片同样不能沿用
        if !outstanding.is_empty() {
            let update: BTreeMap<usize, Option<String>> = outstanding.iter().map(|&index| (index, None)).collect();
            for &index in &outstanding {
                manifest.images.remove(&index);
                failures.insert(index, "任务异常退出".to_string());
            }
            manifest.save(images_dir)?;
            storyboard = storyboard.with_images(&update);
            storyboard.save(storyboard_path)?;
        }

        let report = StageReport::from_failures(Stage::Synthesize, failures, requested, skipped);
        info!(
            "✅ [图像生成] {}，耗时: {:.2}秒",
            report.message(),
            start.elapsed().as_secs_f64()
        );
        Ok(report)
    }
}

/// 请求图片并确认返回的字节是可解码的图片
async fn fetch_image<S: ImageService>(service: &S, request: &ImageRequest) -> std::result::Result<DynamicImage, ServiceError> {
    let bytes = service.generate(request).await?;
    let image = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
        .await
        .map_err(|e| ServiceError::Malformed(format!("图片解码任务异常退出: {}", e)))?
        .map_err(|e| ServiceError::Malformed(format!("返回内容不是有效图片: {}", e)))?;
    debug!(
        "🖼️  [图像生成] 片段 {} 图片尺寸: {}x{}",
        request.index,
        image.width(),
        image.height()
    );
    Ok(image)
}

/// PNG 编码放到阻塞线程池，返回写入的路径
async fn store_png(image: DynamicImage, target: PathBuf) -> std::result::Result<PathBuf, String> {
    tokio::task::spawn_blocking(move || write_png(&image, &target).map(|()| target))
        .await
        .map_err(|e| format!("写入任务异常退出: {}", e))?
        .map_err(|e| e.to_string())
}

/// 以 PNG 格式写入，先写临时文件再重命名
fn write_png(image: &DynamicImage, target: &Path) -> Result<()> {
    let mut tmp_name = target.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    image
        .save_with_format(&tmp_path, ImageFormat::Png)
        .map_err(|e| PipelineError::io(&tmp_path, std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    std::fs::rename(&tmp_path, target).map_err(|e| PipelineError::io(target, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn png_bytes() -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(8, 6, image::Rgb([200, 40, 90])));
        let mut buf = Vec::new();
        image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    struct FakeImages {
        failing: HashSet<usize>,
        garbage: bool,
        panic_on: Option<usize>,
        calls: AtomicUsize,
    }

    impl FakeImages {
        fn new(failing: &[usize]) -> Self {
            Self {
                failing: failing.iter().copied().collect(),
                garbage: false,
                panic_on: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ImageService for FakeImages {
        async fn generate(&self, request: &ImageRequest) -> std::result::Result<Vec<u8>, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_on == Some(request.index) {
                panic!("image backend crashed on segment {}", request.index);
            }
            if self.failing.contains(&request.index) {
                return Err(ServiceError::Network("connection reset".to_string()));
            }
            if self.garbage {
                return Ok(b"{\"error\":\"model loading\"}".to_vec());
            }
            Ok(png_bytes())
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            timeout: Duration::from_secs(5),
        }
    }

    fn setup() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let storyboard_path = dir.path().join("storyboard.json");
        let images_dir = dir.path().join("frames");
        let mut storyboard = Storyboard::from_cuts("song.mp3", &[0.0, 1.0, 7.0, 10.0], None).unwrap();
        storyboard.segments[0].enhanced_prompt = Some("sunrise over a quiet lake".to_string());
        storyboard.save(&storyboard_path).unwrap();
        (dir, storyboard_path, images_dir)
    }

    fn synthesizer(service: FakeImages) -> FrameSynthesizer<FakeImages> {
        FrameSynthesizer::new(service, &PipelineConfig::default()).with_retry_policy(fast_retry())
    }

    #[tokio::test]
    async fn test_generates_deterministic_png_files() {
        let (_dir, storyboard_path, images_dir) = setup();
        let synth = synthesizer(FakeImages::new(&[]));

        let report = synth.generate_images(&storyboard_path, &images_dir).await.unwrap();
        assert_eq!(report.message(), "success");
        assert_eq!(report.requested, 3);

        let storyboard = Storyboard::load(&storyboard_path).unwrap();
        assert!(storyboard.is_ready_for_assembly());
        for (i, segment) in storyboard.segments.iter().enumerate() {
            let path = PathBuf::from(segment.image_path.as_deref().unwrap());
            assert_eq!(path, images_dir.join(image_file_name(i)));
            let decoded = image::open(&path).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (8, 6));
        }

        let manifest = ImageManifest::load(&images_dir);
        assert_eq!(manifest.images[&0].prompt, "sunrise over a quiet lake");
        assert_eq!(manifest.images.len(), 3);
    }

    #[tokio::test]
    async fn test_second_run_issues_no_requests() {
        let (_dir, storyboard_path, images_dir) = setup();
        let synth = synthesizer(FakeImages::new(&[]));

        synth.generate_images(&storyboard_path, &images_dir).await.unwrap();
        let first = Storyboard::load(&storyboard_path).unwrap();

        let report = synth.generate_images(&storyboard_path, &images_dir).await.unwrap();
        let second = Storyboard::load(&storyboard_path).unwrap();

        assert_eq!(synth.service.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.requested, 0);
        assert_eq!(report.skipped, 3);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_changed_prompt_regenerates_only_that_segment() {
        let (_dir, storyboard_path, images_dir) = setup();
        let synth = synthesizer(FakeImages::new(&[]));
        synth.generate_images(&storyboard_path, &images_dir).await.unwrap();

        let mut storyboard = Storyboard::load(&storyboard_path).unwrap();
        storyboard.segments[2].enhanced_prompt = Some("a desert highway at dusk".to_string());
        storyboard.save(&storyboard_path).unwrap();

        let report = synth.generate_images(&storyboard_path, &images_dir).await.unwrap();
        assert_eq!(report.requested, 1);
        assert_eq!(synth.service.calls.load(Ordering::SeqCst), 4);
        assert_eq!(ImageManifest::load(&images_dir).images[&2].prompt, "a desert highway at dusk");
    }

    #[tokio::test]
    async fn test_failed_segment_is_cleared_and_reported() {
        let (_dir, storyboard_path, images_dir) = setup();
        synthesizer(FakeImages::new(&[])).generate_images(&storyboard_path, &images_dir).await.unwrap();

        // 提示词变化后重新生成失败，旧图片不再有效
        let mut storyboard = Storyboard::load(&storyboard_path).unwrap();
        storyboard.segments[1].enhanced_prompt = Some("storm clouds".to_string());
        storyboard.save(&storyboard_path).unwrap();

        let synth = synthesizer(FakeImages::new(&[1]));
        let report = synth.generate_images(&storyboard_path, &images_dir).await.unwrap();
        assert_eq!(report.message(), "degraded success (1 segment incomplete)");
        assert_eq!(synth.service.calls.load(Ordering::SeqCst), 2);

        let storyboard = Storyboard::load(&storyboard_path).unwrap();
        assert_eq!(storyboard.segments[1].image_path, None);
        assert_eq!(storyboard.missing_images(), vec![1]);
        assert!(!ImageManifest::load(&images_dir).images.contains_key(&1));
    }

    #[tokio::test]
    async fn test_undecodable_bytes_are_failures() {
        let (_dir, storyboard_path, images_dir) = setup();
        let mut service = FakeImages::new(&[]);
        service.garbage = true;
        let synth = synthesizer(service);

        let report = synth.generate_images(&storyboard_path, &images_dir).await.unwrap();
        assert_eq!(report.failures.len(), 3);
        assert!(!images_dir.join(image_file_name(0)).exists());
    }

    #[tokio::test]
    async fn test_manual_image_path_is_respected() {
        let (dir, storyboard_path, images_dir) = setup();
        let manual = dir.path().join("my_photo.png");
        std::fs::write(&manual, png_bytes()).unwrap();

        let mut storyboard = Storyboard::load(&storyboard_path).unwrap();
        storyboard.segments[0].image_path = Some(manual.to_string_lossy().to_string());
        storyboard.save(&storyboard_path).unwrap();

        let synth = synthesizer(FakeImages::new(&[]));
        let report = synth.generate_images(&storyboard_path, &images_dir).await.unwrap();
        assert_eq!(report.requested, 2);

        let storyboard = Storyboard::load(&storyboard_path).unwrap();
        assert_eq!(storyboard.segments[0].image_path.as_deref(), Some(manual.to_string_lossy().as_ref()));
    }

    #[tokio::test]
    async fn test_new_song_with_same_segment_count_regenerates() {
        let (_dir, storyboard_path, images_dir) = setup();
        let synth = synthesizer(FakeImages::new(&[]));
        synth.generate_images(&storyboard_path, &images_dir).await.unwrap();

        // 默认提示词只和片段序号有关，换歌后提示词完全相同
        let next = Storyboard::from_cuts("another_song.mp3", &[0.0, 3.0, 5.0, 8.0], None).unwrap();
        next.save(&storyboard_path).unwrap();

        let report = synth.generate_images(&storyboard_path, &images_dir).await.unwrap();
        assert_eq!(report.requested, 3);
        assert_eq!(report.skipped, 0);
        assert_eq!(synth.service.calls.load(Ordering::SeqCst), 6);

        let manifest = ImageManifest::load(&images_dir);
        assert_eq!(manifest.images[&1].source_audio, "another_song.mp3");
        assert_eq!((manifest.images[&1].start_time, manifest.images[&1].end_time), (3.0, 5.0));
    }

    #[tokio::test]
    async fn test_moved_cut_regenerates_affected_segments() {
        let (_dir, storyboard_path, images_dir) = setup();
        let synth = synthesizer(FakeImages::new(&[]));
        synth.generate_images(&storyboard_path, &images_dir).await.unwrap();

        let mut storyboard = Storyboard::load(&storyboard_path).unwrap();
        storyboard.segments[1].end_time = 6.0;
        storyboard.segments[2].start_time = 6.0;
        storyboard.save(&storyboard_path).unwrap();

        let report = synth.generate_images(&storyboard_path, &images_dir).await.unwrap();
        assert_eq!(report.requested, 2);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_corrupt_manifest_regenerates_own_files() {
        let (_dir, storyboard_path, images_dir) = setup();
        let synth = synthesizer(FakeImages::new(&[]));
        synth.generate_images(&storyboard_path, &images_dir).await.unwrap();

        std::fs::write(images_dir.join(MANIFEST_FILE), "{not json").unwrap();
        let mut storyboard = Storyboard::load(&storyboard_path).unwrap();
        storyboard.segments[0].enhanced_prompt = Some("a neon city in the rain".to_string());
        storyboard.save(&storyboard_path).unwrap();

        let report = synth.generate_images(&storyboard_path, &images_dir).await.unwrap();
        assert_eq!(report.requested, 3);
        assert_eq!(report.message(), "success");
        assert_eq!(ImageManifest::load(&images_dir).images[&0].prompt, "a neon city in the rain");
    }

    #[tokio::test]
    async fn test_own_file_without_manifest_entry_is_stale() {
        let (_dir, storyboard_path, images_dir) = setup();
        let synth = synthesizer(FakeImages::new(&[]));
        synth.generate_images(&storyboard_path, &images_dir).await.unwrap();

        let mut manifest = ImageManifest::load(&images_dir);
        manifest.images.remove(&2);
        manifest.save(&images_dir).unwrap();

        let report = synth.generate_images(&storyboard_path, &images_dir).await.unwrap();
        assert_eq!(report.requested, 1);
        assert_eq!(report.skipped, 2);
        assert!(ImageManifest::load(&images_dir).images.contains_key(&2));
    }

    #[tokio::test]
    async fn test_crashed_task_clears_stale_image() {
        let (_dir, storyboard_path, images_dir) = setup();
        synthesizer(FakeImages::new(&[])).generate_images(&storyboard_path, &images_dir).await.unwrap();

        let mut storyboard = Storyboard::load(&storyboard_path).unwrap();
        storyboard.segments[2].enhanced_prompt = Some("fireworks over a harbour".to_string());
        storyboard.save(&storyboard_path).unwrap();

        let mut service = FakeImages::new(&[]);
        service.panic_on = Some(2);
        let report = synthesizer(service).generate_images(&storyboard_path, &images_dir).await.unwrap();
        assert_eq!(report.message(), "degraded success (1 segment incomplete)");
        assert!(report.failures.contains_key(&2));

        let storyboard = Storyboard::load(&storyboard_path).unwrap();
        assert_eq!(storyboard.missing_images(), vec![2]);
        assert!(!ImageManifest::load(&images_dir).images.contains_key(&2));
    }

    #[test]
    fn test_plan_restores_path_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let storyboard = Storyboard::from_cuts("song.mp3", &[0.0, 5.0], None).unwrap();
        let target = dir.path().join(image_file_name(0));
        std::fs::write(&target, png_bytes()).unwrap();

        let mut manifest = ImageManifest::default();
        let segment = &storyboard.segments[0];
        manifest.images.insert(
            0,
            ManifestEntry::new("song.mp3", segment, segment.effective_prompt(), target.to_string_lossy()),
        );

        let plans = FrameSynthesizer::<FakeImages>::plan(&storyboard, dir.path(), &manifest);
        assert_eq!(plans[&0], FramePlan::Keep(target.to_string_lossy().to_string()));

        let other_song = Storyboard::from_cuts("other.mp3", &[0.0, 5.0], None).unwrap();
        let plans = FrameSynthesizer::<FakeImages>::plan(&other_song, dir.path(), &manifest);
        assert!(matches!(plans[&0], FramePlan::Generate { .. }));

        let plans = FrameSynthesizer::<FakeImages>::plan(&storyboard, dir.path(), &ImageManifest::default());
        assert!(matches!(plans[&0], FramePlan::Generate { .. }));
    }
}
