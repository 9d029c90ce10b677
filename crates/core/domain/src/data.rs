use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 采集值的数据类型。
///
/// untagged 反序列化按变体顺序尝试：整数落到 `I64`，小数落到 `F64`，
/// `F32` 只能由代码显式构造。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    I64(i64),
    F64(f64),
    F32(f32),
    String(String),
}

impl TagValue {
    /// 转换为 JSON 值（用于报文体）。
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TagValue::Bool(v) => serde_json::Value::Bool(*v),
            TagValue::I64(v) => serde_json::Value::from(*v),
            TagValue::F32(v) => float_to_json(f64::from(*v)),
            TagValue::F64(v) => float_to_json(*v),
            TagValue::String(v) => serde_json::Value::String(v.clone()),
        }
    }

    /// 类型名称（日志用）。
    pub fn kind(&self) -> &'static str {
        match self {
            TagValue::Bool(_) => "bool",
            TagValue::I64(_) => "i64",
            TagValue::F32(_) => "f32",
            TagValue::F64(_) => "f64",
            TagValue::String(_) => "string",
        }
    }
}

// NaN/Inf 在 JSON 中无法表示，按 null 输出
fn float_to_json(value: f64) -> serde_json::Value {
    serde_json::Number::from_f64(value)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

impl std::fmt::Display for TagValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagValue::Bool(v) => write!(f, "{}", v),
            TagValue::I64(v) => write!(f, "{}", v),
            TagValue::F32(v) => write!(f, "{}", v),
            TagValue::F64(v) => write!(f, "{}", v),
            TagValue::String(v) => f.write_str(v),
        }
    }
}

/// 数据源上报的质量标志。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Quality {
    #[default]
    Good,
    Bad,
    Uncertain,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "Good",
            Quality::Bad => "Bad",
            Quality::Uncertain => "Uncertain",
        }
    }
}

/// 单个点位的采集值。
///
/// 由数据源产生，创建后不可变；一次分发周期内被路由和所有适配器只读共享。
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub tag: String,
    pub value: TagValue,
    pub quality: Quality,
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    /// 以当前时间构造采集值。
    pub fn new(tag: impl Into<String>, value: TagValue, quality: Quality) -> Self {
        Self::at(tag, value, quality, Utc::now())
    }

    pub fn at(
        tag: impl Into<String>,
        value: TagValue,
        quality: Quality,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            tag: tag.into(),
            value,
            quality,
            timestamp,
        }
    }
}
