//! 网关领域模型：采集值、点位映射表、指标样本。
//!
//! 所有协议适配器、路由与监控模块共享这些类型，本 crate 不做任何 I/O。

pub mod data;
pub mod metric;
pub mod register_map;

pub use data::{Measurement, Quality, TagValue};
pub use metric::MetricSample;
pub use register_map::RegisterMap;
