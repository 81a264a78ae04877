use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analyze,
    Enhance,
    Synthesize,
    Assemble,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Analyze => "analyze",
            Stage::Enhance => "enhance",
            Stage::Synthesize => "synthesize",
            Stage::Assemble => "assemble",
        };
        f.write_str(name)
    }
}

/// 阶段结果：成功、降级成功（部分片段不完整）、失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Success,
    Degraded { incomplete: Vec<usize> },
    Failed(String),
}

impl StageStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, StageStatus::Failed(_))
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Success => write!(f, "success"),
            StageStatus::Degraded { incomplete } => {
                let n = incomplete.len();
                let noun = if n == 1 { "segment" } else { "segments" };
                write!(f, "degraded success ({} {} incomplete)", n, noun)
            }
            StageStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

impl Serialize for StageStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// 单个阶段的执行报告
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    /// 失败片段序号 -> 失败原因
    pub failures: BTreeMap<usize, String>,
    /// 本次实际发出请求的片段数
    pub requested: usize,
    /// 已满足、被跳过的片段数
    pub skipped: usize,
}

impl StageReport {
    pub fn success(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::Success,
            failures: BTreeMap::new(),
            requested: 0,
            skipped: 0,
        }
    }

    pub fn failed(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed(reason.into()),
            ..Self::success(stage)
        }
    }

    /// 根据逐片段失败记录得出阶段状态
    pub fn from_failures(
        stage: Stage,
        failures: BTreeMap<usize, String>,
        requested: usize,
        skipped: usize,
    ) -> Self {
        let status = if failures.is_empty() {
            StageStatus::Success
        } else {
            StageStatus::Degraded {
                incomplete: failures.keys().copied().collect(),
            }
        };
        Self {
            stage,
            status,
            failures,
            requested,
            skipped,
        }
    }

    /// 展示给用户的状态字符串
    pub fn message(&self) -> String {
        self.status.to_string()
    }
}
