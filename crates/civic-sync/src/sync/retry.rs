use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CivicSyncError;

/// 同步失败原因分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFailureKind {
    /// 拉取失败（网络、上游 5xx/4xx、响应无法解析） - 可重试
    Fetch,
    /// 写缓存失败 - 走同一条重试路径
    Apply,
    /// 配置问题 - 不重试
    Permanent,
}

impl SyncFailureKind {
    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncFailureKind::Permanent)
    }

    /// 拉取阶段的错误分类
    pub fn classify_fetch(error: &CivicSyncError) -> Self {
        match error {
            CivicSyncError::Config(_)
            | CivicSyncError::UnknownEntityType(_)
            | CivicSyncError::UnresolvedEndpoint { .. } => SyncFailureKind::Permanent,
            _ => SyncFailureKind::Fetch,
        }
    }
}

/// 重试策略配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大重试次数，error_count 达到该值后不再重试
    pub max_retries: u32,
    /// 基础延迟时间（秒）
    pub base_delay_seconds: u64,
    /// 最大延迟时间（秒）
    pub max_delay_seconds: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)，默认关闭
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_seconds: 30,
            max_delay_seconds: 300, // 5分钟
            backoff_factor: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// 根据失败后的 error_count 计算下次重试延迟
    ///
    /// 延迟 = min(base · factor^error_count, max)；error_count 已达上限时返回 None。
    pub fn next_retry_delay(&self, error_count: u32) -> Option<Duration> {
        if error_count >= self.max_retries {
            return None;
        }

        let base_delay = self.base_delay_seconds as f64 * self.backoff_factor.powf(error_count as f64);
        let capped_delay = base_delay.min(self.max_delay_seconds as f64);

        let final_delay = if self.jitter_factor > 0.0 {
            let jitter = capped_delay * self.jitter_factor * (rand::random::<f64>() - 0.5);
            (capped_delay + jitter).max(0.0)
        } else {
            capped_delay
        };

        Some(Duration::from_secs_f64(final_delay))
    }

    /// 检查是否应该重试
    pub fn should_retry(&self, error_count: u32, kind: SyncFailureKind) -> bool {
        error_count < self.max_retries && kind.is_retryable()
    }
}
