//! 时间处理工具
//!
//! - **配置层**: `Duration` 一律以秒为单位序列化
//! - **状态层**: 水位与同步时间使用 `DateTime<Utc>`
//! - **调度层**: 定时器使用 tokio 单调时钟，不依赖墙上时间

/// `Duration` 以整数秒序列化
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// `Option<Duration>` 以整数秒序列化
pub mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "super::duration_secs")]
        interval: Duration,
        #[serde(with = "super::option_duration_secs", default)]
        sweep: Option<Duration>,
    }

    #[test]
    fn durations_serialize_as_seconds() {
        let sample = Sample {
            interval: Duration::from_secs(900),
            sweep: None,
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json, serde_json::json!({"interval": 900, "sweep": null}));

        let parsed: Sample = serde_json::from_str(r#"{"interval": 60}"#).unwrap();
        assert_eq!(parsed.interval, Duration::from_secs(60));
        assert_eq!(parsed.sweep, None);
    }
}
