use domain::MetricSample;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 线程安全的指标表，按名称后写覆盖。
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    samples: Arc<RwLock<HashMap<String, MetricSample>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, name: &str, value: f64, unit: &str) {
        self.samples
            .write()
            .await
            .insert(name.to_string(), MetricSample::new(name, value, unit));
    }

    /// 计数器加一
    pub async fn increment(&self, name: &str) {
        let mut samples = self.samples.write().await;
        let current = samples.get(name).map(|sample| sample.value).unwrap_or(0.0);
        samples.insert(name.to_string(), MetricSample::new(name, current + 1.0, "count"));
    }

    pub async fn get(&self, name: &str) -> Option<MetricSample> {
        self.samples.read().await.get(name).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, MetricSample> {
        self.samples.read().await.clone()
    }
}
