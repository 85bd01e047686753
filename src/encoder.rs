//! Transformer 编码器
//!
//! 两类编码器：
//! - `TransformerEncoder`：把所有段落拼成一个序列，普通自注意力
//! - `TransformerInterEncoder`：段落内自注意力 + 段落间注意力（层次化模式）
//!
//! 具体使用哪一个由 `EncoderSpec` 在构建时一次性决定。

use std::fmt;

use ndarray::{concatenate, s, Array1, Array2, Axis};
use tracing::debug;

use crate::attention::{MultiHeadedAttention, MultiHeadedPooling};
use crate::config::SummarizerConfig;
use crate::embedding::{Embedding, PositionalEncoding};
use crate::error::{Result, SummarizerError};
use crate::layers::{Dropout, LayerNorm, Linear, PositionwiseFeedForward};
use crate::param::{join_name, Device, Module, Param};
use crate::tensor::key_padding_mask;

/// 段落间注意力版本
///
/// - `V2`: 段落上下文直接加到段落内每个 token 上
/// - `V3`: 段落上下文经过门控后再加
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterAttVersion {
    V2,
    V3,
}

impl InterAttVersion {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            2 => Ok(InterAttVersion::V2),
            3 => Ok(InterAttVersion::V3),
            other => Err(SummarizerError::config(format!(
                "unsupported inter_att version {other}, expected 2 or 3"
            ))),
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            InterAttVersion::V2 => 2,
            InterAttVersion::V3 => 3,
        }
    }
}

/// 编码器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Plain,
    Hierarchical(InterAttVersion),
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderKind::Plain => write!(f, "plain"),
            EncoderKind::Hierarchical(v) => write!(f, "hierarchical(v{})", v.tag()),
        }
    }
}

/// 编码器输出
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// [n_blocks * n_tokens, d_model]
    pub features: Array2<f32>,
    /// 层次化模式下的记忆掩码 [n_blocks * n_tokens]，true 表示填充
    pub mask_hier: Option<Array1<bool>>,
}

/// 编码器接口
pub trait Encoder: Module + fmt::Debug {
    /// 编码源序列
    ///
    /// `src`: [n_blocks, n_tokens]，普通编码器把各段落按顺序拼接
    fn encode(&self, src: &Array2<usize>) -> Result<EncoderOutput>;

    fn kind(&self) -> EncoderKind;

    fn embeddings(&self) -> &Embedding;
}

/// 普通编码器的构造参数
#[derive(Debug, Clone, PartialEq)]
pub struct PlainEncoderParams {
    pub num_layers: usize,
    pub d_model: usize,
    pub heads: usize,
    pub d_ff: usize,
    pub dropout: f32,
    pub max_pos: usize,
}

/// 层次化编码器的构造参数
#[derive(Debug, Clone, PartialEq)]
pub struct InterEncoderParams {
    pub num_layers: usize,
    pub d_model: usize,
    pub heads: usize,
    pub d_ff: usize,
    pub dropout: f32,
    pub max_pos: usize,
    pub version: InterAttVersion,
    pub inter_layers: usize,
    pub inter_heads: usize,
    pub device: Device,
}

/// 编码器选择
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderSpec {
    Plain(PlainEncoderParams),
    Hierarchical(InterEncoderParams),
}

impl EncoderSpec {
    /// 根据配置选择编码器；`hier` 打开但 `inter_att` 不是 2 / 3 时报错
    pub fn from_config(config: &SummarizerConfig, device: Device) -> Result<Self> {
        if !config.hier {
            return Ok(EncoderSpec::Plain(PlainEncoderParams {
                num_layers: config.enc_layers,
                d_model: config.enc_hidden_size,
                heads: config.heads,
                d_ff: config.ff_size,
                dropout: config.enc_dropout,
                max_pos: config.max_pos,
            }));
        }

        let version = InterAttVersion::from_tag(config.inter_att)?;
        Ok(EncoderSpec::Hierarchical(InterEncoderParams {
            num_layers: config.enc_layers,
            d_model: config.enc_hidden_size,
            heads: config.heads,
            d_ff: config.ff_size,
            dropout: config.enc_dropout,
            max_pos: config.max_pos,
            version,
            inter_layers: config.inter_layers,
            inter_heads: config.inter_heads,
            device,
        }))
    }

    pub fn kind(&self) -> EncoderKind {
        match self {
            EncoderSpec::Plain(_) => EncoderKind::Plain,
            EncoderSpec::Hierarchical(p) => EncoderKind::Hierarchical(p.version),
        }
    }

    pub fn build(self, embeddings: Embedding) -> Box<dyn Encoder> {
        match self {
            EncoderSpec::Plain(p) => Box::new(TransformerEncoder::new(p, embeddings)),
            EncoderSpec::Hierarchical(p) => Box::new(TransformerInterEncoder::new(p, embeddings)),
        }
    }
}

fn padding_flags(tokens: &[usize], padding_idx: Option<usize>) -> Array1<bool> {
    tokens.iter().map(|&t| Some(t) == padding_idx).collect()
}

fn check_source(src: &Array2<usize>) -> Result<()> {
    if src.is_empty() {
        return Err(SummarizerError::EmptySource(src.shape().to_vec()));
    }
    Ok(())
}

/// 单个编码器层（先归一化）
///
/// ```text
/// out = x + dropout(SelfAttn(LN(x)))
/// out = FFN(out)
/// ```
#[derive(Debug, Clone)]
pub struct TransformerEncoderLayer {
    self_attn: MultiHeadedAttention,
    feed_forward: PositionwiseFeedForward,
    layer_norm: LayerNorm,
    dropout: Dropout,
}

impl TransformerEncoderLayer {
    pub fn new(d_model: usize, heads: usize, d_ff: usize, dropout: f32) -> Self {
        Self {
            self_attn: MultiHeadedAttention::new(heads, d_model, dropout),
            feed_forward: PositionwiseFeedForward::new(d_model, d_ff, dropout),
            layer_norm: LayerNorm::new(d_model),
            dropout: Dropout::new(dropout),
        }
    }

    /// - `inputs`: [seq_len, d_model]
    /// - `mask`: [seq_len, seq_len]
    pub fn forward(&self, inputs: &Array2<f32>, mask: Option<&Array2<bool>>) -> Result<Array2<f32>> {
        let input_norm = self.layer_norm.forward(inputs)?;
        let context = self.self_attn.forward(&input_norm, &input_norm, &input_norm, mask)?;
        let out = self.dropout.forward(&context) + inputs;
        self.feed_forward.forward(&out)
    }
}

impl Module for TransformerEncoderLayer {
    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Param)>) {
        self.self_attn.collect_params(&join_name(prefix, "self_attn"), out);
        self.feed_forward.collect_params(&join_name(prefix, "feed_forward"), out);
        self.layer_norm.collect_params(&join_name(prefix, "layer_norm"), out);
    }

    fn set_training(&mut self, training: bool) {
        self.self_attn.set_training(training);
        self.feed_forward.set_training(training);
        self.dropout.set_training(training);
    }
}

/// 普通 Transformer 编码器
///
/// ```text
/// src blocks → 拼接 → Embedding → PE → [EncoderLayer × N] → LayerNorm
/// ```
#[derive(Debug, Clone)]
pub struct TransformerEncoder {
    embeddings: Embedding,
    pos_emb: PositionalEncoding,
    transformer: Vec<TransformerEncoderLayer>,
    layer_norm: LayerNorm,
}

impl TransformerEncoder {
    pub fn new(params: PlainEncoderParams, embeddings: Embedding) -> Self {
        let transformer = (0..params.num_layers)
            .map(|_| TransformerEncoderLayer::new(params.d_model, params.heads, params.d_ff, params.dropout))
            .collect();

        Self {
            embeddings,
            pos_emb: PositionalEncoding::new(params.max_pos, params.d_model),
            transformer,
            layer_norm: LayerNorm::new(params.d_model),
        }
    }
}

impl Encoder for TransformerEncoder {
    fn encode(&self, src: &Array2<usize>) -> Result<EncoderOutput> {
        check_source(src)?;
        let tokens: Vec<usize> = src.iter().copied().collect();
        let pad = padding_flags(&tokens, self.embeddings.padding_idx());
        let mask = key_padding_mask(&pad, tokens.len());

        let mut x = self.pos_emb.forward(&self.embeddings.forward(&tokens)?)?;
        for layer in &self.transformer {
            x = layer.forward(&x, Some(&mask))?;
        }

        Ok(EncoderOutput {
            features: self.layer_norm.forward(&x)?,
            mask_hier: None,
        })
    }

    fn kind(&self) -> EncoderKind {
        EncoderKind::Plain
    }

    fn embeddings(&self) -> &Embedding {
        &self.embeddings
    }
}

impl Module for TransformerEncoder {
    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Param)>) {
        self.embeddings.collect_params(&join_name(prefix, "embeddings"), out);
        for (i, layer) in self.transformer.iter().enumerate() {
            layer.collect_params(&join_name(prefix, &format!("transformer.{i}")), out);
        }
        self.layer_norm.collect_params(&join_name(prefix, "layer_norm"), out);
    }

    fn set_training(&mut self, training: bool) {
        for layer in &mut self.transformer {
            layer.set_training(training);
        }
    }
}

/// 段落间注意力层
///
/// 1. 段落内自注意力（与普通编码器层相同）
/// 2. 每个段落经多头池化得到一个向量，段落向量之间做多头注意力
/// 3. 段落上下文回写到段落内每个 token（v2 直接相加，v3 门控相加）
/// 4. Feed-Forward
#[derive(Debug, Clone)]
pub struct TransformerInterLayer {
    version: InterAttVersion,
    layer_norm1: LayerNorm,
    local_attn: MultiHeadedAttention,
    layer_norm2: LayerNorm,
    pooling: MultiHeadedPooling,
    inter_attn: MultiHeadedAttention,
    /// 只在 v3 中存在: [2 * d_model → d_model]
    gate: Option<Linear>,
    feed_forward: PositionwiseFeedForward,
    dropout: Dropout,
}

impl TransformerInterLayer {
    pub fn new(
        d_model: usize,
        heads: usize,
        inter_heads: usize,
        d_ff: usize,
        dropout: f32,
        version: InterAttVersion,
    ) -> Self {
        let gate = match version {
            InterAttVersion::V2 => None,
            InterAttVersion::V3 => Some(Linear::new(2 * d_model, d_model)),
        };

        Self {
            version,
            layer_norm1: LayerNorm::new(d_model),
            local_attn: MultiHeadedAttention::new(heads, d_model, dropout),
            layer_norm2: LayerNorm::new(d_model),
            pooling: MultiHeadedPooling::new(inter_heads, d_model, dropout),
            inter_attn: MultiHeadedAttention::new(inter_heads, d_model, dropout),
            gate,
            feed_forward: PositionwiseFeedForward::new(d_model, d_ff, dropout),
            dropout: Dropout::new(dropout),
        }
    }

    /// - `blocks`: 每个段落 [n_tokens, d_model]
    /// - `pads`: 每个段落 [n_tokens]
    pub fn forward(&self, blocks: &[Array2<f32>], pads: &[Array1<bool>]) -> Result<Vec<Array2<f32>>> {
        let n_blocks = blocks.len();

        // 段落内自注意力
        let mut local = Vec::with_capacity(n_blocks);
        for (x, pad) in blocks.iter().zip(pads) {
            let norm = self.layer_norm1.forward(x)?;
            let mask = key_padding_mask(pad, x.nrows());
            let context = self.local_attn.forward(&norm, &norm, &norm, Some(&mask))?;
            local.push(self.dropout.forward(&context) + x);
        }

        // 段落向量与段落间注意力
        let mut pooled = Vec::with_capacity(n_blocks);
        for (h, pad) in local.iter().zip(pads) {
            pooled.push(self.pooling.forward(&self.layer_norm2.forward(h)?, pad)?);
        }
        let views: Vec<_> = pooled.iter().map(|p| p.view()).collect();
        let block_vecs = concatenate(Axis(0), &views)
            .map_err(|_| SummarizerError::shape("pooled blocks", &[n_blocks, 0], &[views.len()]))?;
        let block_pad: Array1<bool> = pads.iter().map(|p| p.iter().all(|&b| b)).collect();
        let block_mask = key_padding_mask(&block_pad, n_blocks);
        let context = self
            .inter_attn
            .forward(&block_vecs, &block_vecs, &block_vecs, Some(&block_mask))?;

        let mut outputs = Vec::with_capacity(n_blocks);
        for (b, h) in local.into_iter().enumerate() {
            let ctx = context.slice(s![b..b + 1, ..]).to_owned();
            let broadcast = Array2::from_shape_fn(h.raw_dim(), |(_, j)| ctx[[0, j]]);
            let fused = match (&self.version, &self.gate) {
                (InterAttVersion::V3, Some(gate)) => {
                    let joined = concatenate(Axis(1), &[h.view(), broadcast.view()])
                        .map_err(|_| SummarizerError::shape("gate input", h.shape(), broadcast.shape()))?;
                    let g = gate.forward(&joined)?.mapv(|v| 1.0 / (1.0 + (-v).exp()));
                    &h + &(g * &broadcast)
                }
                _ => &h + &self.dropout.forward(&broadcast),
            };
            outputs.push(self.feed_forward.forward(&fused)?);
        }

        Ok(outputs)
    }
}

impl Module for TransformerInterLayer {
    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Param)>) {
        self.layer_norm1.collect_params(&join_name(prefix, "layer_norm1"), out);
        self.local_attn.collect_params(&join_name(prefix, "local_attn"), out);
        self.layer_norm2.collect_params(&join_name(prefix, "layer_norm2"), out);
        self.pooling.collect_params(&join_name(prefix, "pooling"), out);
        self.inter_attn.collect_params(&join_name(prefix, "inter_attn"), out);
        if let Some(gate) = &self.gate {
            gate.collect_params(&join_name(prefix, "gate"), out);
        }
        self.feed_forward.collect_params(&join_name(prefix, "feed_forward"), out);
    }

    fn set_training(&mut self, training: bool) {
        self.local_attn.set_training(training);
        self.pooling.set_training(training);
        self.inter_attn.set_training(training);
        self.feed_forward.set_training(training);
        self.dropout.set_training(training);
    }
}

/// 层次化编码器
///
/// ```text
/// 每个段落: Embedding → PE(段内位置) → [EncoderLayer × (N - inter_layers)]
/// 全部段落: [InterLayer × inter_layers] → LayerNorm → 拼接
/// ```
///
/// 返回的 `mask_hier` 是拼接后的填充标记，解码器用它作为记忆掩码。
#[derive(Debug, Clone)]
pub struct TransformerInterEncoder {
    embeddings: Embedding,
    pos_emb: PositionalEncoding,
    transformer_local: Vec<TransformerEncoderLayer>,
    transformer_inter: Vec<TransformerInterLayer>,
    layer_norm: LayerNorm,
    version: InterAttVersion,
    device: Device,
}

impl TransformerInterEncoder {
    pub fn new(params: InterEncoderParams, embeddings: Embedding) -> Self {
        let n_local = params.num_layers.saturating_sub(params.inter_layers);
        let transformer_local = (0..n_local)
            .map(|_| TransformerEncoderLayer::new(params.d_model, params.heads, params.d_ff, params.dropout))
            .collect();
        let transformer_inter = (n_local..params.num_layers)
            .map(|_| {
                TransformerInterLayer::new(
                    params.d_model,
                    params.heads,
                    params.inter_heads,
                    params.d_ff,
                    params.dropout,
                    params.version,
                )
            })
            .collect();
        debug!(
            local = n_local,
            inter = params.inter_layers,
            version = params.version.tag(),
            "built hierarchical encoder layers"
        );

        Self {
            embeddings,
            pos_emb: PositionalEncoding::new(params.max_pos, params.d_model),
            transformer_local,
            transformer_inter,
            layer_norm: LayerNorm::new(params.d_model),
            version: params.version,
            device: params.device,
        }
    }

    pub fn version(&self) -> InterAttVersion {
        self.version
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

impl Encoder for TransformerInterEncoder {
    fn encode(&self, src: &Array2<usize>) -> Result<EncoderOutput> {
        check_source(src)?;
        let padding_idx = self.embeddings.padding_idx();

        let mut blocks = Vec::with_capacity(src.nrows());
        let mut pads = Vec::with_capacity(src.nrows());
        for row in src.rows() {
            let tokens: Vec<usize> = row.iter().copied().collect();
            let pad = padding_flags(&tokens, padding_idx);
            let mask = key_padding_mask(&pad, tokens.len());

            let mut x = self.pos_emb.forward(&self.embeddings.forward(&tokens)?)?;
            for layer in &self.transformer_local {
                x = layer.forward(&x, Some(&mask))?;
            }
            blocks.push(x);
            pads.push(pad);
        }

        for layer in &self.transformer_inter {
            blocks = layer.forward(&blocks, &pads)?;
        }

        let normed = blocks
            .iter()
            .map(|b| self.layer_norm.forward(b))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = normed.iter().map(|b| b.view()).collect();
        let features = concatenate(Axis(0), &views)
            .map_err(|_| SummarizerError::shape("encoder blocks", src.shape(), &[views.len()]))?;
        let mask_hier: Array1<bool> = pads.iter().flat_map(|p| p.iter().copied()).collect();

        Ok(EncoderOutput {
            features,
            mask_hier: Some(mask_hier),
        })
    }

    fn kind(&self) -> EncoderKind {
        EncoderKind::Hierarchical(self.version)
    }

    fn embeddings(&self) -> &Embedding {
        &self.embeddings
    }
}

impl Module for TransformerInterEncoder {
    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Param)>) {
        self.embeddings.collect_params(&join_name(prefix, "embeddings"), out);
        for (i, layer) in self.transformer_local.iter().enumerate() {
            layer.collect_params(&join_name(prefix, &format!("transformer_local.{i}")), out);
        }
        for (i, layer) in self.transformer_inter.iter().enumerate() {
            layer.collect_params(&join_name(prefix, &format!("transformer_inter.{i}")), out);
        }
        self.layer_norm.collect_params(&join_name(prefix, "layer_norm"), out);
    }

    fn set_training(&mut self, training: bool) {
        for layer in &mut self.transformer_local {
            layer.set_training(training);
        }
        for layer in &mut self.transformer_inter {
            layer.set_training(training);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn small_config(hier: bool, inter_att: u8) -> SummarizerConfig {
        SummarizerConfig {
            enc_hidden_size: 16,
            dec_hidden_size: 16,
            emb_size: 16,
            heads: 2,
            inter_heads: 2,
            ff_size: 32,
            enc_layers: 3,
            inter_layers: 1,
            enc_dropout: 0.0,
            max_pos: 32,
            hier,
            inter_att,
            ..SummarizerConfig::default()
        }
    }

    #[test]
    fn test_spec_selection() {
        let plain = EncoderSpec::from_config(&small_config(false, 7), Device::Cpu).unwrap();
        assert_eq!(plain.kind(), EncoderKind::Plain);

        let v2 = EncoderSpec::from_config(&small_config(true, 2), Device::Cpu).unwrap();
        assert_eq!(v2.kind(), EncoderKind::Hierarchical(InterAttVersion::V2));

        let v3 = EncoderSpec::from_config(&small_config(true, 3), Device::Cuda(0)).unwrap();
        assert_eq!(v3.kind(), EncoderKind::Hierarchical(InterAttVersion::V3));
        match v3 {
            EncoderSpec::Hierarchical(p) => {
                assert_eq!(p.inter_layers, 1);
                assert_eq!(p.device, Device::Cuda(0));
            }
            EncoderSpec::Plain(_) => panic!("expected hierarchical spec"),
        }

        let err = EncoderSpec::from_config(&small_config(true, 1), Device::Cpu).unwrap_err();
        assert!(matches!(err, SummarizerError::Config(_)));
    }

    #[test]
    fn test_plain_encoder_has_no_mask() {
        let spec = EncoderSpec::from_config(&small_config(false, 2), Device::Cpu).unwrap();
        let encoder = spec.build(Embedding::new(20, 16, Some(0)));
        let src = arr2(&[[3, 4, 5, 0], [6, 7, 0, 0]]);

        let out = encoder.encode(&src).unwrap();
        assert_eq!(out.features.shape(), &[8, 16]);
        assert!(out.mask_hier.is_none());
    }

    #[test]
    fn test_hier_encoder_mask_and_layers() {
        for tag in [2u8, 3] {
            let spec = EncoderSpec::from_config(&small_config(true, tag), Device::Cpu).unwrap();
            let encoder = spec.build(Embedding::new(20, 16, Some(0)));
            let src = arr2(&[[3, 4, 5, 0], [6, 7, 0, 0], [0, 0, 0, 0]]);

            let out = encoder.encode(&src).unwrap();
            assert_eq!(out.features.shape(), &[12, 16]);
            let mask = out.mask_hier.unwrap();
            assert_eq!(mask.len(), 12);
            assert_eq!(mask.iter().filter(|&&m| m).count(), 7);
            assert!(!mask[0] && mask[3]);

            let names: Vec<String> = encoder.named_params("encoder").into_iter().map(|(n, _)| n).collect();
            assert!(names.iter().any(|n| n.starts_with("encoder.transformer_local.1.")));
            assert!(names.iter().any(|n| n.starts_with("encoder.transformer_inter.0.")));
            assert!(!names.iter().any(|n| n.starts_with("encoder.transformer_local.2.")));
            let has_gate = names.iter().any(|n| n.contains(".gate."));
            assert_eq!(has_gate, tag == 3);
        }
    }

    #[test]
    fn test_empty_source() {
        let spec = EncoderSpec::from_config(&small_config(false, 2), Device::Cpu).unwrap();
        let encoder = spec.build(Embedding::new(20, 16, Some(0)));
        let src = Array2::<usize>::zeros((0, 4));
        assert!(matches!(encoder.encode(&src), Err(SummarizerError::EmptySource(_))));
    }
}
