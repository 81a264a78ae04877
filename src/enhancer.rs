use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::report::{Stage, StageReport};
use crate::services::{with_retry, RetryPolicy, ServiceError, TextRequest, TextService};
use crate::storyboard::Storyboard;

/// 提示词增强器：为每个片段调用文本服务生成更具体的画面描述
pub struct PromptEnhancer<S: TextService> {
    service: Arc<S>,
    retry: RetryPolicy,
    max_concurrency: usize,
}

impl<S: TextService> PromptEnhancer<S> {
    pub fn new(service: S, config: &PipelineConfig) -> Self {
        Self {
            service: Arc::new(service),
            retry: config.retry_policy(),
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 为尚未增强的片段构建请求，附带相邻片段的提示词
    pub fn build_requests(storyboard: &Storyboard) -> Vec<TextRequest> {
        let segments = &storyboard.segments;
        let total = segments.len();
        segments
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.has_enhanced_prompt())
            .map(|(index, segment)| TextRequest {
                index,
                total,
                start_time: segment.start_time,
                end_time: segment.end_time,
                base_prompt: segment.base_prompt.clone(),
                previous_prompt: index
                    .checked_sub(1)
                    .and_then(|i| segments.get(i))
                    .map(|s| s.effective_prompt().to_string()),
                next_prompt: segments.get(index + 1).map(|s| s.effective_prompt().to_string()),
            })
            .collect()
    }

    /// 增强分镜中所有未增强片段的提示词，并写回分镜文件
    ///
    /// 单个片段重试后仍失败时保留默认提示词，阶段结果为降级成功。
    pub async fn enhance_prompts(&self, storyboard_path: &Path) -> Result<StageReport> {
        let start = Instant::now();
        let mut storyboard = Storyboard::load(storyboard_path)?;
        let requests = Self::build_requests(&storyboard);
        let requested = requests.len();
        let skipped = storyboard.segments.len() - requested;

        info!(
            "📝 [提示词增强] 共 {} 个片段，待增强 {} 个，已完成 {} 个",
            storyboard.segments.len(),
            requested,
            skipped
        );

        if requests.is_empty() {
            return Ok(StageReport::from_failures(Stage::Enhance, BTreeMap::new(), 0, skipped));
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();

        for request in requests {
            let service = Arc::clone(&self.service);
            let semaphore = Arc::clone(&semaphore);
            let policy = self.retry;
            tasks.spawn(async move {
                let index = request.index;
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        let label = format!("提示词增强 片段 {}", index);
                        with_retry(&policy, &label, || service.complete(&request)).await
                    }
                    Err(_) => Err(ServiceError::Network("并发控制已关闭".to_string())),
                };
                (index, result)
            });
        }

        let mut failures = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("❌ [提示词增强] 任务异常退出: {}", e);
                    continue;
                }
            };

            match result {
                Ok(prompt) => {
                    info!("✅ [提示词增强] 片段 {} 完成", index);
                    let mut enhanced = BTreeMap::new();
                    enhanced.insert(index, prompt);
                    storyboard = storyboard.with_enhancements(&enhanced);
                    storyboard.save(storyboard_path)?;
                }
                Err(e) => {
                    let err = PipelineError::Enhancement {
                        index,
                        message: e.to_string(),
                    };
                    warn!("⚠️  [提示词增强] {}，保留默认提示词", err);
                    failures.insert(index, e.to_string());
                }
            }
        }

        // 异常退出的任务没有返回序号，按仍未增强的片段补记
        for (index, segment) in storyboard.segments.iter().enumerate() {
            if !segment.has_enhanced_prompt() {
                failures.entry(index).or_insert_with(|| "任务异常退出".to_string());
            }
        }

        let report = StageReport::from_failures(Stage::Enhance, failures, requested, skipped);
        info!(
            "✅ [提示词增强] {}，耗时: {:.2}秒",
            report.message(),
            start.elapsed().as_secs_f64()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// 按序号返回固定结果的假文本服务
    struct FakeText {
        failing: HashSet<usize>,
        calls: AtomicUsize,
        seen: Mutex<Vec<TextRequest>>,
    }

    impl FakeText {
        fn new(failing: &[usize]) -> Self {
            Self {
                failing: failing.iter().copied().collect(),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl TextService for FakeText {
        async fn complete(&self, request: &TextRequest) -> std::result::Result<String, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.clone());
            // 让完成顺序与序号无关
            tokio::time::sleep(Duration::from_millis(((request.total - request.index) * 3) as u64)).await;
            if self.failing.contains(&request.index) {
                Err(ServiceError::Quota("rate limited".to_string()))
            } else {
                Ok(format!("enhanced {}", request.index))
            }
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            timeout: Duration::from_secs(5),
        }
    }

    fn write_storyboard(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("storyboard.json");
        Storyboard::from_cuts("song.mp3", &[0.0, 1.0, 7.0, 10.0], None)
            .unwrap()
            .save(&path)
            .unwrap();
        path
    }

    #[tokio::test]
    async fn test_enhances_every_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_storyboard(dir.path());
        let enhancer = PromptEnhancer::new(FakeText::new(&[]), &PipelineConfig::default()).with_retry_policy(fast_retry());

        let report = enhancer.enhance_prompts(&path).await.unwrap();
        assert_eq!(report.message(), "success");
        assert_eq!(report.requested, 3);

        let storyboard = Storyboard::load(&path).unwrap();
        for (i, segment) in storyboard.segments.iter().enumerate() {
            assert_eq!(segment.enhanced_prompt.as_deref(), Some(format!("enhanced {}", i).as_str()));
        }
    }

    #[tokio::test]
    async fn test_failed_segment_keeps_base_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_storyboard(dir.path());
        let service = FakeText::new(&[1]);
        let enhancer = PromptEnhancer::new(service, &PipelineConfig::default()).with_retry_policy(fast_retry());

        let report = enhancer.enhance_prompts(&path).await.unwrap();
        assert_eq!(report.message(), "degraded success (1 segment incomplete)");
        assert!(report.failures.contains_key(&1));
        // 失败的片段重试到上限：1 + 1 + 3
        assert_eq!(enhancer.service.calls.load(Ordering::SeqCst), 5);

        let storyboard = Storyboard::load(&path).unwrap();
        assert_eq!(storyboard.segments[0].enhanced_prompt.as_deref(), Some("enhanced 0"));
        assert_eq!(storyboard.segments[1].enhanced_prompt, None);
        assert_eq!(storyboard.segments[1].effective_prompt(), storyboard.segments[1].base_prompt);
        assert_eq!(storyboard.segments[2].enhanced_prompt.as_deref(), Some("enhanced 2"));
    }

    #[tokio::test]
    async fn test_already_enhanced_segments_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_storyboard(dir.path());
        let mut storyboard = Storyboard::load(&path).unwrap();
        storyboard.segments[0].enhanced_prompt = Some("hand written".to_string());
        storyboard.save(&path).unwrap();

        let enhancer = PromptEnhancer::new(FakeText::new(&[]), &PipelineConfig::default()).with_retry_policy(fast_retry());
        let report = enhancer.enhance_prompts(&path).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.requested, 2);

        let storyboard = Storyboard::load(&path).unwrap();
        assert_eq!(storyboard.segments[0].enhanced_prompt.as_deref(), Some("hand written"));

        // 再次运行不会发出请求
        let report = enhancer.enhance_prompts(&path).await.unwrap();
        assert_eq!(report.requested, 0);
        assert_eq!(enhancer.service.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_requests_carry_neighbour_context() {
        let mut storyboard = Storyboard::from_cuts("song.mp3", &[0.0, 1.0, 7.0, 10.0], None).unwrap();
        storyboard.segments[0].enhanced_prompt = Some("misty harbour".to_string());

        let requests = PromptEnhancer::<FakeText>::build_requests(&storyboard);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].index, 1);
        assert_eq!(requests[0].total, 3);
        assert_eq!(requests[0].previous_prompt.as_deref(), Some("misty harbour"));
        assert_eq!(requests[0].next_prompt.as_deref(), Some(storyboard.segments[2].base_prompt.as_str()));
        assert_eq!(requests[1].next_prompt, None);
    }

    #[tokio::test]
    async fn test_missing_storyboard_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let enhancer = PromptEnhancer::new(FakeText::new(&[]), &PipelineConfig::default());
        let result = enhancer.enhance_prompts(&dir.path().join("absent.json")).await;
        assert!(matches!(result, Err(PipelineError::Io { .. })));
    }
}
