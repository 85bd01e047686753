//! 摘要模型组装
//!
//! 根据配置构建词嵌入、编码器、解码器和生成器，处理权重共享，
//! 并从检查点恢复参数或做 Xavier 初始化。
//!
//! ```text
//! src ─→ Encoder ─→ features (+ mask_hier) ─┐
//!                                          ├─→ Decoder ─→ 隐藏状态 ─→ (Generator)
//! tgt[..L-1] ──────────────────────────────┘
//! ```

use ndarray::{Array2, ArrayD};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::checkpoint::{migrate_legacy_keys, Checkpoint};
use crate::config::SummarizerConfig;
use crate::decoder::TransformerDecoder;
use crate::embedding::Embedding;
use crate::encoder::{Encoder, EncoderKind, EncoderOutput, EncoderSpec};
use crate::error::{Result, SummarizerError};
use crate::generator::{build_generator, Generator};
use crate::loss::{LossStats, NmtLoss};
use crate::optim::Optim;
use crate::param::{dedup_params, join_name, Device, Module, Param, StateDict};
use crate::tensor;

/// 抽象式摘要模型
#[derive(Debug)]
pub struct Summarizer {
    config: SummarizerConfig,
    encoder: Box<dyn Encoder>,
    decoder: TransformerDecoder,
    generator: Generator,
    padding_idx: usize,
    vocab_size: usize,
    device: Device,
}

impl Summarizer {
    /// 构建模型
    ///
    /// 1. 源端 / 目标端词嵌入，`share_embeddings` 时共享权重
    /// 2. 按配置选择编码器
    /// 3. 解码器、生成器，`share_decoder_embeddings` 时生成器投影与解码器嵌入共享权重
    /// 4. 有检查点时迁移旧参数名并严格载入，否则对二维及以上的参数做 Xavier 初始化
    /// 5. 放到指定设备
    pub fn new(
        config: &SummarizerConfig,
        padding_idx: usize,
        vocab_size: usize,
        device: Device,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<Self> {
        config.validate()?;
        if padding_idx >= vocab_size {
            return Err(SummarizerError::config(format!(
                "padding index {padding_idx} is outside vocabulary of size {vocab_size}"
            )));
        }

        let src_embeddings = Embedding::new(vocab_size, config.emb_size, Some(padding_idx));
        let mut tgt_embeddings = Embedding::new(vocab_size, config.emb_size, Some(padding_idx));
        if config.share_embeddings {
            tgt_embeddings.share_weight(&src_embeddings)?;
            debug!("target embeddings share the source embedding weight");
        }

        let spec = EncoderSpec::from_config(config, device)?;
        info!(encoder = %spec.kind(), layers = config.enc_layers, "building encoder");
        let encoder = spec.build(src_embeddings);

        let decoder = TransformerDecoder::new(
            config.dec_layers,
            config.dec_hidden_size,
            config.heads,
            config.ff_size,
            config.dec_dropout,
            tgt_embeddings,
            config.max_pos,
        );

        let mut generator = build_generator(config.dec_hidden_size, vocab_size, device);
        if config.share_decoder_embeddings {
            generator.tie_weight(decoder.embeddings().weight().clone())?;
            debug!("generator projection shares the decoder embedding weight");
        }

        let model = Self {
            config: config.clone(),
            encoder,
            decoder,
            generator,
            padding_idx,
            vocab_size,
            device,
        };

        match checkpoint {
            Some(checkpoint) => {
                let state = migrate_legacy_keys(checkpoint.model.clone());
                model.load_state_dict(&state, true)?;
                info!(tensors = state.len(), "restored model parameters from checkpoint");
            }
            None => model.xavier_init(config.seed),
        }

        model.to_device(device);
        info!(
            params = model.num_parameters(),
            device = %device,
            "summarizer ready"
        );
        Ok(model)
    }

    /// 对二维及以上的参数做 Xavier 均匀初始化，一维参数保持模块默认值
    fn xavier_init(&self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut initialized = 0usize;
        for (_, param) in self.named_parameters() {
            if param.ndim() < 2 {
                continue;
            }
            let shape = param.shape();
            param.update(|value| *value = tensor::xavier_uniform(&shape, &mut rng));
            initialized += 1;
        }
        debug!(initialized, seed, "xavier initialized parameters");
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `src`: [n_blocks, n_tokens]
    /// - `tgt`: 长度 L 的目标序列
    ///
    /// # 返回
    /// - 解码器隐藏状态 [L-1, dec_hidden_size]（不经过生成器）
    pub fn forward(&self, src: &Array2<usize>, tgt: &[usize]) -> Result<Array2<f32>> {
        if tgt.len() < 2 {
            return Err(SummarizerError::EmptyTarget(tgt.len()));
        }
        let dec_input = &tgt[..tgt.len() - 1];

        let EncoderOutput { features, mask_hier } = self.encoder.encode(src)?;
        let state = self.decoder.init_decoder_state(src, &features);
        let memory_masks = match self.encoder.kind() {
            EncoderKind::Hierarchical(_) => mask_hier.as_ref(),
            EncoderKind::Plain => None,
        };

        self.decoder.forward(dec_input, &features, &state, memory_masks)
    }

    /// 生成器：隐藏状态到词表 log 概率
    pub fn generate(&self, hidden: &Array2<f32>) -> Result<Array2<f32>> {
        self.generator.forward(hidden)
    }

    /// 前向传播 + 生成器 + 损失
    pub fn compute_loss(&self, src: &Array2<usize>, tgt: &[usize]) -> Result<LossStats> {
        let hidden = self.forward(src, tgt)?;
        let log_probs = self.generate(&hidden)?;
        NmtLoss::new(self.padding_idx).compute(&log_probs, tgt)
    }

    /// 所有参数槽位（共享权重在每个槽位各出现一次）
    fn slots(&self) -> Vec<(String, Param)> {
        self.named_params("")
    }

    /// 参数表，包含每个共享槽位
    pub fn state_dict(&self) -> StateDict {
        self.slots()
            .into_iter()
            .map(|(name, param)| (name, param.to_array()))
            .collect()
    }

    /// 去重后的可训练参数（共享存储只保留第一次出现的名字）
    pub fn named_parameters(&self) -> Vec<(String, Param)> {
        dedup_params(self.slots())
    }

    pub fn num_parameters(&self) -> usize {
        self.named_parameters().iter().map(|(_, p)| p.numel()).sum()
    }

    /// 载入参数
    ///
    /// `strict` 时参数名必须完全一致；形状总是要求一致。
    /// 所有检查通过之后才写入，失败时模型保持不变。
    pub fn load_state_dict(&self, state: &StateDict, strict: bool) -> Result<()> {
        let slots = self.slots();
        let names: BTreeSet<&str> = slots.iter().map(|(n, _)| n.as_str()).collect();

        if strict {
            let missing: Vec<String> = names
                .iter()
                .filter(|n| !state.contains_key(**n))
                .map(|n| n.to_string())
                .collect();
            let unexpected: Vec<String> = state
                .keys()
                .filter(|k| !names.contains(k.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() || !unexpected.is_empty() {
                return Err(SummarizerError::StateDictMismatch { missing, unexpected });
            }
        }

        let mut updates: Vec<(&str, &Param, &ArrayD<f32>)> = Vec::with_capacity(slots.len());
        for (name, param) in &slots {
            if let Some(value) = state.get(name) {
                let expected = param.shape();
                if value.shape() != expected.as_slice() {
                    return Err(SummarizerError::shape(name.as_str(), &expected, value.shape()));
                }
                updates.push((name.as_str(), param, value));
            }
        }
        for (name, param, value) in updates {
            param.set(name, value.clone())?;
        }
        Ok(())
    }

    /// 把所有参数放到指定设备
    pub fn to_device(&self, device: Device) {
        for (_, param) in self.slots() {
            param.to_device(device);
        }
    }

    /// 组装检查点
    pub fn checkpoint(&self, optim: Option<&Optim>) -> Checkpoint {
        let checkpoint = Checkpoint::new(self.state_dict()).with_opt(self.config.clone());
        match optim {
            Some(optim) => checkpoint.with_optim(optim.snapshot()),
            None => checkpoint,
        }
    }

    pub fn encoder(&self) -> &dyn Encoder {
        self.encoder.as_ref()
    }

    pub fn encoder_kind(&self) -> EncoderKind {
        self.encoder.kind()
    }

    pub fn decoder(&self) -> &TransformerDecoder {
        &self.decoder
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn config(&self) -> &SummarizerConfig {
        &self.config
    }

    pub fn padding_idx(&self) -> usize {
        self.padding_idx
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

impl Module for Summarizer {
    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Param)>) {
        self.encoder.collect_params(&join_name(prefix, "encoder"), out);
        self.decoder.collect_params(&join_name(prefix, "decoder"), out);
        self.generator.collect_params(&join_name(prefix, "generator"), out);
    }

    fn set_training(&mut self, training: bool) {
        self.encoder.set_training(training);
        self.decoder.set_training(training);
    }
}
