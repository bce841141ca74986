//! 实体类型枚举 - 受控枚举
//!
//! entity_type 为受控枚举，新增数据源时需同步扩展 payload 与默认配置。

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::CivicSyncError;

/// 同步实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Bills,
    BillActions,
    Committees,
    Representatives,
    EngagementEvents,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bills => "bills",
            Self::BillActions => "bill_actions",
            Self::Committees => "committees",
            Self::Representatives => "representatives",
            Self::EngagementEvents => "engagement_events",
        }
    }

    pub fn all() -> [EntityType; 5] {
        [
            Self::Bills,
            Self::BillActions,
            Self::Committees,
            Self::Representatives,
            Self::EngagementEvents,
        ]
    }
}

impl FromStr for EntityType {
    type Err = CivicSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bills" => Ok(Self::Bills),
            "bill_actions" => Ok(Self::BillActions),
            "committees" => Ok(Self::Committees),
            "representatives" => Ok(Self::Representatives),
            "engagement_events" => Ok(Self::EngagementEvents),
            other => Err(CivicSyncError::UnknownEntityType(other.to_string())),
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
