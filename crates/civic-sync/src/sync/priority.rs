use serde::{Deserialize, Serialize};
use std::fmt;

/// 同步任务优先级
///
/// 取值 0..=10，数值越大越先执行：
/// - 10: 手动 force-sync
/// - 7..=9: 高频、用户直接感知的数据（法案、法案动作）
/// - 4..=6: 常规目录数据（代表、委员会）
/// - 0..=3: 后台数据与多次重试后的任务
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SyncPriority(u8);

impl SyncPriority {
    pub const MIN: SyncPriority = SyncPriority(0);
    pub const MAX: SyncPriority = SyncPriority(10);
    /// force-sync 使用的优先级
    pub const FORCE: SyncPriority = SyncPriority::MAX;

    /// 从数值创建优先级，超出范围返回 None
    pub fn new(value: u8) -> Option<Self> {
        if value <= Self::MAX.0 {
            Some(SyncPriority(value))
        } else {
            None
        }
    }

    /// 超出范围时截断到 MAX
    pub fn saturating(value: u8) -> Self {
        SyncPriority(value.min(Self::MAX.0))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// 降低一级（用于重试），最低到 MIN
    pub fn lowered(&self) -> Self {
        SyncPriority(self.0.saturating_sub(1))
    }

    /// 检查优先级 self 是否高于 other
    pub fn is_higher_than(&self, other: SyncPriority) -> bool {
        self.0 > other.0
    }
}

impl fmt::Display for SyncPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

impl Default for SyncPriority {
    fn default() -> Self {
        SyncPriority(5)
    }
}

impl TryFrom<u8> for SyncPriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        SyncPriority::new(value).ok_or_else(|| format!("priority {} out of range 0..=10", value))
    }
}

impl From<SyncPriority> for u8 {
    fn from(priority: SyncPriority) -> Self {
        priority.value()
    }
}
