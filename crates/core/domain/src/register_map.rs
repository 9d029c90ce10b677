//! 点位映射表：tag 名称 → 协议侧编码/地址。
//!
//! 在适配器初始化时由配置构建一次，之后只读，通过 `Arc` 在任务间共享，无需加锁。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// tag → 协议编码（MSA/MQTT 为文本编码，Modbus 为寄存器地址）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterMap<T> {
    entries: HashMap<String, T>,
}

impl<T> Default for RegisterMap<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> RegisterMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: &str) -> Option<&T> {
        self.entries.get(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &T)> {
        self.entries.iter()
    }
}

impl<T> FromIterator<(String, T)> for RegisterMap<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl RegisterMap<u16> {
    /// 未配置显式映射时的默认 Modbus 映射：按顺序分配寄存器偏移。
    ///
    /// `stride` 为每个 tag 预留的寄存器数，地址溢出 u16 的 tag 被忽略。
    pub fn sequential(tags: &[String], start: u16, stride: u16) -> Self {
        let stride = stride.max(1);
        tags.iter()
            .enumerate()
            .filter_map(|(index, tag)| {
                let offset = u16::try_from(index).ok()?.checked_mul(stride)?;
                let address = start.checked_add(offset)?;
                Some((tag.clone(), address))
            })
            .collect()
    }
}
