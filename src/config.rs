//! 模型与训练配置
//!
//! 所有条件分支（编码器类型、权重共享、设备选择、优化器）都由这里的配置驱动。
//! 配置构造之后只读。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, SummarizerError};
use crate::param::Device;

/// 优化方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimMethod {
    Sgd,
    Adagrad,
    Adadelta,
    Adam,
}

impl OptimMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimMethod::Sgd => "sgd",
            OptimMethod::Adagrad => "adagrad",
            OptimMethod::Adadelta => "adadelta",
            OptimMethod::Adam => "adam",
        }
    }
}

impl fmt::Display for OptimMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 学习率衰减方式
///
/// - `"noam"`: 预热后按 step^-0.5 衰减
/// - `""` 或 `"step"`: 从 `start_decay_steps` 开始每 `decay_steps` 步乘以 `lr_decay`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DecayMethod {
    Noam,
    StepDecay,
}

impl FromStr for DecayMethod {
    type Err = SummarizerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "noam" => Ok(DecayMethod::Noam),
            "" | "step" => Ok(DecayMethod::StepDecay),
            other => Err(SummarizerError::config(format!("unknown decay_method `{other}`"))),
        }
    }
}

impl TryFrom<String> for DecayMethod {
    type Error = SummarizerError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DecayMethod> for String {
    fn from(m: DecayMethod) -> String {
        match m {
            DecayMethod::Noam => "noam".to_string(),
            DecayMethod::StepDecay => "step".to_string(),
        }
    }
}

/// 可见 GPU 列表
///
/// 命令行上沿用 `"-1"` 表示只用 CPU、`"0,1"` 表示 GPU 编号的写法，
/// 反序列化之后就是显式的枚举值。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VisibleGpus {
    Cpu,
    Gpus(Vec<usize>),
}

impl VisibleGpus {
    pub fn is_gpu(&self) -> bool {
        matches!(self, VisibleGpus::Gpus(_))
    }

    /// 模型放置的设备：有 GPU 时使用第一个可见设备
    pub fn device(&self) -> Device {
        match self {
            VisibleGpus::Cpu => Device::Cpu,
            VisibleGpus::Gpus(_) => Device::Cuda(0),
        }
    }
}

impl Default for VisibleGpus {
    fn default() -> Self {
        VisibleGpus::Cpu
    }
}

impl FromStr for VisibleGpus {
    type Err = SummarizerError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "-1" {
            return Ok(VisibleGpus::Cpu);
        }
        let ids = s
            .split(',')
            .map(|id| {
                id.trim()
                    .parse::<usize>()
                    .map_err(|_| SummarizerError::config(format!("invalid visible_gpus `{s}`")))
            })
            .collect::<Result<Vec<_>>>()?;
        if ids.is_empty() {
            return Err(SummarizerError::config("visible_gpus is empty"));
        }
        Ok(VisibleGpus::Gpus(ids))
    }
}

impl TryFrom<String> for VisibleGpus {
    type Error = SummarizerError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<VisibleGpus> for String {
    fn from(v: VisibleGpus) -> String {
        match v {
            VisibleGpus::Cpu => "-1".to_string(),
            VisibleGpus::Gpus(ids) => ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// 摘要模型配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// 继续训练的检查点路径，空字符串表示从头训练
    pub train_from: String,

    /// 优化方法
    pub optim: OptimMethod,
    /// 初始学习率
    pub lr: f64,
    /// 梯度裁剪的最大范数，0 表示不裁剪
    pub max_grad_norm: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub decay_method: DecayMethod,
    pub warmup_steps: usize,
    /// 非 noam 衰减的系数
    pub lr_decay: f64,
    pub start_decay_steps: Option<usize>,
    pub decay_steps: usize,
    /// Adagrad 累加器初值
    pub adagrad_accumulator_init: f64,

    pub enc_hidden_size: usize,
    pub dec_hidden_size: usize,
    pub enc_layers: usize,
    pub dec_layers: usize,
    pub heads: usize,
    pub ff_size: usize,
    pub enc_dropout: f32,
    pub dec_dropout: f32,
    pub emb_size: usize,
    /// 位置编码的最大长度
    pub max_pos: usize,

    pub share_embeddings: bool,
    pub share_decoder_embeddings: bool,

    /// 层次化（段落间注意力）模式
    pub hier: bool,
    /// 段落间注意力版本，只支持 2 和 3
    pub inter_att: u8,
    /// 编码器最后多少层使用段落间注意力
    pub inter_layers: usize,
    pub inter_heads: usize,

    pub visible_gpus: VisibleGpus,
    /// Xavier 初始化的随机种子
    pub seed: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            train_from: String::new(),
            optim: OptimMethod::Adam,
            lr: 3.0,
            max_grad_norm: 0.0,
            beta1: 0.9,
            beta2: 0.998,
            decay_method: DecayMethod::Noam,
            warmup_steps: 8000,
            lr_decay: 0.5,
            start_decay_steps: None,
            decay_steps: 10000,
            adagrad_accumulator_init: 0.0,
            enc_hidden_size: 256,
            dec_hidden_size: 256,
            enc_layers: 8,
            dec_layers: 1,
            heads: 8,
            ff_size: 1024,
            enc_dropout: 0.1,
            dec_dropout: 0.0,
            emb_size: 256,
            max_pos: 512,
            share_embeddings: true,
            share_decoder_embeddings: true,
            hier: false,
            inter_att: 2,
            inter_layers: 2,
            inter_heads: 8,
            visible_gpus: VisibleGpus::Cpu,
            seed: 666,
        }
    }
}

impl SummarizerConfig {
    /// 从 JSON 文件加载
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: SummarizerConfig = serde_json::from_reader(reader)?;
        Ok(config)
    }

    /// 是否从检查点继续训练
    pub fn is_resuming(&self) -> bool {
        !self.train_from.is_empty()
    }

    /// 模型放置的设备
    pub fn device(&self) -> Device {
        self.visible_gpus.device()
    }

    /// 检查配置的一致性
    pub fn validate(&self) -> Result<()> {
        if self.heads == 0 {
            return Err(SummarizerError::config("heads must be positive"));
        }
        for (name, size) in [
            ("enc_hidden_size", self.enc_hidden_size),
            ("dec_hidden_size", self.dec_hidden_size),
        ] {
            if size == 0 || size % self.heads != 0 {
                return Err(SummarizerError::config(format!(
                    "{name} ({size}) must be a positive multiple of heads ({})",
                    self.heads
                )));
            }
        }
        if self.emb_size != self.enc_hidden_size || self.emb_size != self.dec_hidden_size {
            return Err(SummarizerError::config(format!(
                "emb_size ({}) must equal enc_hidden_size ({}) and dec_hidden_size ({})",
                self.emb_size, self.enc_hidden_size, self.dec_hidden_size
            )));
        }
        for (name, p) in [("enc_dropout", self.enc_dropout), ("dec_dropout", self.dec_dropout)] {
            if !(0.0..1.0).contains(&p) {
                return Err(SummarizerError::config(format!("{name} must be in [0, 1), got {p}")));
            }
        }
        if self.hier {
            if self.inter_att != 2 && self.inter_att != 3 {
                return Err(SummarizerError::config(format!(
                    "hierarchical mode requires inter_att 2 or 3, got {}",
                    self.inter_att
                )));
            }
            if self.inter_layers > self.enc_layers {
                return Err(SummarizerError::config(format!(
                    "inter_layers ({}) exceeds enc_layers ({})",
                    self.inter_layers, self.enc_layers
                )));
            }
            if self.inter_heads == 0 || self.enc_hidden_size % self.inter_heads != 0 {
                return Err(SummarizerError::config(format!(
                    "enc_hidden_size ({}) must be a multiple of inter_heads ({})",
                    self.enc_hidden_size, self.inter_heads
                )));
            }
        }
        if self.decay_method == DecayMethod::Noam && self.warmup_steps == 0 {
            return Err(SummarizerError::config("noam decay requires warmup_steps > 0"));
        }
        if self.optim == OptimMethod::Adam
            && !((0.0..1.0).contains(&self.beta1) && (0.0..1.0).contains(&self.beta2))
        {
            return Err(SummarizerError::config(format!(
                "adam betas must be in [0, 1), got ({}, {})",
                self.beta1, self.beta2
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SummarizerConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.is_resuming());
        assert_eq!(config.device(), Device::Cpu);
    }

    #[test]
    fn test_visible_gpus_parse() {
        assert_eq!("-1".parse::<VisibleGpus>().unwrap(), VisibleGpus::Cpu);
        assert_eq!(
            "0, 1".parse::<VisibleGpus>().unwrap(),
            VisibleGpus::Gpus(vec![0, 1])
        );
        assert!("gpu".parse::<VisibleGpus>().is_err());

        let gpus = VisibleGpus::Gpus(vec![2, 3]);
        assert_eq!(gpus.device(), Device::Cuda(0));
        assert_eq!(String::from(gpus), "2,3");
    }

    #[test]
    fn test_json_with_sentinels() {
        let json = r#"{
            "visible_gpus": "0",
            "decay_method": "",
            "optim": "adagrad",
            "hier": true,
            "inter_att": 3
        }"#;
        let config: SummarizerConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.visible_gpus, VisibleGpus::Gpus(vec![0]));
        assert_eq!(config.decay_method, DecayMethod::StepDecay);
        assert_eq!(config.optim, OptimMethod::Adagrad);
        assert_eq!(config.inter_att, 3);
        // 未给出的字段取默认值
        assert_eq!(config.heads, 8);
    }

    #[test]
    fn test_unsupported_inter_att() {
        let config = SummarizerConfig {
            hier: true,
            inter_att: 4,
            ..SummarizerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SummarizerError::Config(_)));

        // 非层次化模式下 inter_att 不参与判断
        let config = SummarizerConfig {
            hier: false,
            inter_att: 4,
            ..SummarizerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mismatched_sizes() {
        let config = SummarizerConfig {
            emb_size: 128,
            ..SummarizerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SummarizerConfig {
            heads: 3,
            ..SummarizerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
