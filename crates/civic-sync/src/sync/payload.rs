//! 实体负载 - 按 entity_type 区分的强类型 payload
//!
//! 上游数据源字段并不统一，这里只解析同步引擎关心的字段，
//! 其余字段原样保留在 `extra` 中透传到缓存。

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::EntityType;
use crate::error::{CivicSyncError, Result};

/// 法案
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub bill_number: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub sponsor_id: Option<String>,
    #[serde(default)]
    pub latest_action_date: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 法案进程动作（依附于某个法案）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillAction {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub bill_id: Option<String>,
    #[serde(default)]
    pub action_date: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub chamber: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 委员会
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Committee {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub chamber: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 民选代表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representative {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub party: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub office: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 公众参与活动（听证会、市政厅会议等）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementEvent {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub starts_at: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 按实体类型打标签的 payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "payload", rename_all = "snake_case")]
pub enum EntityPayload {
    Bills(Bill),
    BillActions(BillAction),
    Committees(Committee),
    Representatives(Representative),
    EngagementEvents(EngagementEvent),
}

impl EntityPayload {
    /// 按实体类型解析上游原始记录
    pub fn from_value(entity_type: EntityType, value: Value) -> Result<Self> {
        let parsed = match entity_type {
            EntityType::Bills => serde_json::from_value(value).map(Self::Bills),
            EntityType::BillActions => serde_json::from_value(value).map(Self::BillActions),
            EntityType::Committees => serde_json::from_value(value).map(Self::Committees),
            EntityType::Representatives => serde_json::from_value(value).map(Self::Representatives),
            EntityType::EngagementEvents => serde_json::from_value(value).map(Self::EngagementEvents),
        };
        parsed.map_err(|e| {
            CivicSyncError::InvalidData(format!("{} payload 解析失败: {}", entity_type, e))
        })
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Bills(_) => EntityType::Bills,
            Self::BillActions(_) => EntityType::BillActions,
            Self::Committees(_) => EntityType::Committees,
            Self::Representatives(_) => EntityType::Representatives,
            Self::EngagementEvents(_) => EntityType::EngagementEvents,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Bills(p) => &p.id,
            Self::BillActions(p) => &p.id,
            Self::Committees(p) => &p.id,
            Self::Representatives(p) => &p.id,
            Self::EngagementEvents(p) => &p.id,
        }
    }

    /// 以扁平 JSON 对象形式查看 payload（不含 entity 标签）
    pub fn to_flat_value(&self) -> Value {
        let value = match self {
            Self::Bills(p) => serde_json::to_value(p),
            Self::BillActions(p) => serde_json::to_value(p),
            Self::Committees(p) => serde_json::to_value(p),
            Self::Representatives(p) => serde_json::to_value(p),
            Self::EngagementEvents(p) => serde_json::to_value(p),
        };
        value.unwrap_or(Value::Null)
    }

    /// 读取增量字段并解析为水位时间
    pub fn incremental_value(&self, field: &str) -> Option<DateTime<Utc>> {
        self.to_flat_value().get(field).and_then(parse_watermark)
    }

    /// 供搜索索引使用的文本
    pub fn search_text(&self) -> String {
        let parts: Vec<&Option<String>> = match self {
            Self::Bills(p) => vec![&p.title, &p.bill_number, &p.status],
            Self::BillActions(p) => vec![&p.description, &p.chamber],
            Self::Committees(p) => vec![&p.name, &p.chamber],
            Self::Representatives(p) => vec![&p.name, &p.party, &p.state, &p.office],
            Self::EngagementEvents(p) => vec![&p.title, &p.location],
        };
        parts
            .into_iter()
            .filter_map(|s| s.as_deref())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// 将上游时间值解析为 UTC 时间
///
/// 支持 RFC3339、无时区的日期时间、纯日期，以及秒/毫秒级 epoch 数值。
pub fn parse_watermark(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_watermark_str(s),
        Value::Number(n) => {
            let raw = n.as_i64()?;
            // 超过 1e11 视为毫秒
            if raw.abs() >= 100_000_000_000 {
                DateTime::from_timestamp_millis(raw)
            } else {
                DateTime::from_timestamp(raw, 0)
            }
        }
        _ => None,
    }
}

fn parse_watermark_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// 水位时间的请求参数格式，保留亚秒精度
pub fn format_watermark(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Str(String),
        Int(i64),
        UInt(u64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Str(s) => s,
        RawId::Int(i) => i.to_string(),
        RawId::UInt(u) => u.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn parses_bill_and_keeps_unknown_fields() {
        let payload = EntityPayload::from_value(
            EntityType::Bills,
            json!({
                "id": 118,
                "title": "Clean Water Act Amendments",
                "latest_action_date": "2024-03-01",
                "congress": 118
            }),
        )
        .unwrap();

        assert_eq!(payload.entity_type(), EntityType::Bills);
        assert_eq!(payload.id(), "118");
        match &payload {
            EntityPayload::Bills(bill) => {
                assert_eq!(bill.title.as_deref(), Some("Clean Water Act Amendments"));
                assert_eq!(bill.extra.get("congress"), Some(&json!(118)));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn rejects_record_without_id() {
        let err = EntityPayload::from_value(EntityType::Committees, json!({"name": "Finance"}));
        assert!(matches!(err, Err(CivicSyncError::InvalidData(_))));
    }

    #[test]
    fn incremental_value_reads_named_field() {
        let payload = EntityPayload::from_value(
            EntityType::BillActions,
            json!({"id": "a1", "action_date": "2024-05-02T10:30:00Z"}),
        )
        .unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 5, 2, 10, 30, 0).unwrap();
        assert_eq!(payload.incremental_value("action_date"), Some(expected));
        assert_eq!(payload.incremental_value("missing"), None);
    }

    #[test]
    fn parse_watermark_accepts_common_formats() {
        let midnight = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(parse_watermark(&json!("2024-01-15")), Some(midnight));
        assert_eq!(parse_watermark(&json!("2024-01-15T00:00:00")), Some(midnight));
        assert_eq!(parse_watermark(&json!("2024-01-15 00:00:00")), Some(midnight));
        assert_eq!(parse_watermark(&json!("2024-01-15T02:00:00+02:00")), Some(midnight));
        assert_eq!(parse_watermark(&json!(midnight.timestamp())), Some(midnight));
        assert_eq!(parse_watermark(&json!(midnight.timestamp_millis())), Some(midnight));
        assert_eq!(parse_watermark(&json!("yesterday")), None);
        assert_eq!(parse_watermark(&json!(null)), None);
    }

    #[test]
    fn format_watermark_keeps_sub_second_precision() {
        let mark = parse_watermark(&json!("2024-05-01T09:30:00.500Z")).unwrap();
        assert_eq!(format_watermark(&mark), "2024-05-01T09:30:00.500Z");
        assert_eq!(parse_watermark(&json!(format_watermark(&mark))), Some(mark));

        let whole = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        assert_eq!(format_watermark(&whole), "2024-05-01T09:30:00Z");
    }

    #[test]
    fn tagged_serialization_round_trip() {
        let payload = EntityPayload::from_value(
            EntityType::Representatives,
            json!({"id": "rep-1", "name": "Jane Doe", "party": "I"}),
        )
        .unwrap();
        let stored = serde_json::to_value(&payload).unwrap();
        assert_eq!(stored["entity"], json!("representatives"));
        let restored: EntityPayload = serde_json::from_value(stored).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn search_text_joins_present_fields() {
        let payload = EntityPayload::from_value(
            EntityType::Committees,
            json!({"id": "c1", "name": "Appropriations", "chamber": "senate"}),
        )
        .unwrap();
        assert_eq!(payload.search_text(), "Appropriations senate");
    }
}
