//! 模型检查点保存和加载
//!
//! 检查点包含三部分：
//! - `model`: 参数名到张量的映射
//! - `optim`: 优化器快照（继续训练时必需）
//! - `opt`: 训练时的配置
//!
//! 支持二进制（bincode）和 JSON 两种格式，以及旧版参数名的迁移。

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::{debug, info};

use crate::config::SummarizerConfig;
use crate::error::{Result, SummarizerError};
use crate::optim::OptimSnapshot;
use crate::param::StateDict;

/// 可序列化的张量
///
/// `ArrayD<f32>` 的序列化包装器（行优先数据 + 形状）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl From<&ArrayD<f32>> for SerializableTensor {
    fn from(arr: &ArrayD<f32>) -> Self {
        Self {
            shape: arr.shape().to_vec(),
            data: arr.iter().copied().collect(),
        }
    }
}

impl TryFrom<SerializableTensor> for ArrayD<f32> {
    type Error = SummarizerError;

    fn try_from(t: SerializableTensor) -> Result<Self> {
        let expected: usize = t.shape.iter().product();
        if expected != t.data.len() {
            return Err(SummarizerError::shape("serialized tensor", &t.shape, &[t.data.len()]));
        }
        ArrayD::from_shape_vec(IxDyn(&t.shape), t.data)
            .map_err(|e| SummarizerError::config(format!("invalid serialized tensor: {e}")))
    }
}

/// `#[serde(with = "serde_tensor")]` 用的张量序列化
pub mod serde_tensor {
    use super::*;
    use serde::de::Error as _;

    pub fn serialize<S: Serializer>(value: &ArrayD<f32>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        SerializableTensor::from(value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<ArrayD<f32>, D::Error> {
        let tensor = SerializableTensor::deserialize(deserializer)?;
        ArrayD::try_from(tensor).map_err(D::Error::custom)
    }
}

/// `#[serde(with = "serde_state_dict")]` 用的参数表序列化
pub mod serde_state_dict {
    use super::*;
    use serde::de::Error as _;

    pub fn serialize<S: Serializer>(value: &StateDict, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let map: BTreeMap<&str, SerializableTensor> = value
            .iter()
            .map(|(k, v)| (k.as_str(), SerializableTensor::from(v)))
            .collect();
        map.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<StateDict, D::Error> {
        let map = BTreeMap::<String, SerializableTensor>::deserialize(deserializer)?;
        map.into_iter()
            .map(|(k, v)| ArrayD::try_from(v).map(|arr| (k, arr)))
            .collect::<Result<StateDict>>()
            .map_err(D::Error::custom)
    }
}

/// 训练检查点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// 模型参数（共享权重的每个槽位各存一份）
    #[serde(with = "serde_state_dict")]
    pub model: StateDict,
    /// 优化器快照
    pub optim: Option<OptimSnapshot>,
    /// 训练配置
    pub opt: Option<SummarizerConfig>,
}

impl Checkpoint {
    pub fn new(model: StateDict) -> Self {
        Self {
            model,
            optim: None,
            opt: None,
        }
    }

    pub fn with_optim(mut self, optim: OptimSnapshot) -> Self {
        self.optim = Some(optim);
        self
    }

    pub fn with_opt(mut self, opt: SummarizerConfig) -> Self {
        self.opt = Some(opt);
        self
    }

    /// 保存为二进制格式
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        bincode::serialize_into(writer, self)?;
        info!(path = %path.as_ref().display(), tensors = self.model.len(), "saved checkpoint");
        Ok(())
    }

    /// 从二进制格式加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let checkpoint: Checkpoint = bincode::deserialize_from(reader)?;
        info!(path = %path.as_ref().display(), tensors = checkpoint.model.len(), "loaded checkpoint");
        Ok(checkpoint)
    }

    /// 保存为 JSON 格式
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// 从 JSON 格式加载
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// 迁移模型部分的旧版参数名
    pub fn migrated(mut self) -> Self {
        self.model = migrate_legacy_keys(self.model);
        self
    }
}

/// 把旧版层归一化参数名改为当前命名
///
/// 名字中的 `.a_2` 改为 `.weight`，`.b_2` 改为 `.bias`；其余条目原样保留，
/// 张量内容不变。
pub fn migrate_legacy_keys(state: StateDict) -> StateDict {
    let mut renamed = 0usize;
    let migrated = state
        .into_iter()
        .map(|(key, value)| {
            let new_key = key.replace(".a_2", ".weight").replace(".b_2", ".bias");
            if new_key != key {
                renamed += 1;
            }
            (new_key, value)
        })
        .collect();
    if renamed > 0 {
        debug!(renamed, "migrated legacy layer norm keys");
    }
    migrated
}
