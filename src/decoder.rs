//! Transformer 解码器
//!
//! 以目标 token、编码器特征和解码器状态为输入，输出每个位置的隐藏状态。
//!
//! ```text
//! tgt → Embedding → PE → [DecoderLayer × N] → LayerNorm
//!   DecoderLayer:
//!     ├── Masked Self-Attention（因果 + 目标填充）
//!     ├── Context Attention（记忆掩码）
//!     └── Feed Forward
//! ```

use ndarray::{Array1, Array2, Zip};

use crate::attention::MultiHeadedAttention;
use crate::embedding::{Embedding, PositionalEncoding};
use crate::error::{Result, SummarizerError};
use crate::layers::{Dropout, LayerNorm, PositionwiseFeedForward};
use crate::param::{join_name, Module, Param};
use crate::tensor::{causal_mask, key_padding_mask};

/// 解码器状态
///
/// 记录源序列，解码器在没有显式记忆掩码时据此推导源端填充。
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderState {
    src: Array2<usize>,
}

impl DecoderState {
    pub fn src(&self) -> &Array2<usize> {
        &self.src
    }

    /// 源端填充标记（按行拼接）
    pub fn src_padding(&self, padding_idx: Option<usize>) -> Array1<bool> {
        self.src.iter().map(|&t| Some(t) == padding_idx).collect()
    }
}

/// 单个解码器层
#[derive(Debug, Clone)]
pub struct TransformerDecoderLayer {
    self_attn: MultiHeadedAttention,
    context_attn: MultiHeadedAttention,
    feed_forward: PositionwiseFeedForward,
    layer_norm_1: LayerNorm,
    layer_norm_2: LayerNorm,
    drop: Dropout,
}

impl TransformerDecoderLayer {
    pub fn new(d_model: usize, heads: usize, d_ff: usize, dropout: f32) -> Self {
        Self {
            self_attn: MultiHeadedAttention::new(heads, d_model, dropout),
            context_attn: MultiHeadedAttention::new(heads, d_model, dropout),
            feed_forward: PositionwiseFeedForward::new(d_model, d_ff, dropout),
            layer_norm_1: LayerNorm::new(d_model),
            layer_norm_2: LayerNorm::new(d_model),
            drop: Dropout::new(dropout),
        }
    }

    /// - `inputs`: [tgt_len, d_model]
    /// - `memory_bank`: [src_len, d_model]
    /// - `src_mask`: [tgt_len, src_len]
    /// - `tgt_mask`: [tgt_len, tgt_len]
    pub fn forward(
        &self,
        inputs: &Array2<f32>,
        memory_bank: &Array2<f32>,
        src_mask: &Array2<bool>,
        tgt_mask: &Array2<bool>,
    ) -> Result<Array2<f32>> {
        let input_norm = self.layer_norm_1.forward(inputs)?;
        let query = self
            .self_attn
            .forward(&input_norm, &input_norm, &input_norm, Some(tgt_mask))?;
        let query = self.drop.forward(&query) + inputs;

        let query_norm = self.layer_norm_2.forward(&query)?;
        let mid = self
            .context_attn
            .forward(memory_bank, memory_bank, &query_norm, Some(src_mask))?;
        let output = self.drop.forward(&mid) + &query;

        self.feed_forward.forward(&output)
    }
}

impl Module for TransformerDecoderLayer {
    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Param)>) {
        self.self_attn.collect_params(&join_name(prefix, "self_attn"), out);
        self.context_attn.collect_params(&join_name(prefix, "context_attn"), out);
        self.feed_forward.collect_params(&join_name(prefix, "feed_forward"), out);
        self.layer_norm_1.collect_params(&join_name(prefix, "layer_norm_1"), out);
        self.layer_norm_2.collect_params(&join_name(prefix, "layer_norm_2"), out);
    }

    fn set_training(&mut self, training: bool) {
        self.self_attn.set_training(training);
        self.context_attn.set_training(training);
        self.feed_forward.set_training(training);
        self.drop.set_training(training);
    }
}

/// Transformer 解码器
#[derive(Debug, Clone)]
pub struct TransformerDecoder {
    embeddings: Embedding,
    pos_emb: PositionalEncoding,
    transformer_layers: Vec<TransformerDecoderLayer>,
    layer_norm: LayerNorm,
}

impl TransformerDecoder {
    pub fn new(
        num_layers: usize,
        d_model: usize,
        heads: usize,
        d_ff: usize,
        dropout: f32,
        embeddings: Embedding,
        max_pos: usize,
    ) -> Self {
        let transformer_layers = (0..num_layers)
            .map(|_| TransformerDecoderLayer::new(d_model, heads, d_ff, dropout))
            .collect();

        Self {
            embeddings,
            pos_emb: PositionalEncoding::new(max_pos, d_model),
            transformer_layers,
            layer_norm: LayerNorm::new(d_model),
        }
    }

    /// 用源序列初始化解码器状态
    pub fn init_decoder_state(&self, src: &Array2<usize>, _memory_bank: &Array2<f32>) -> DecoderState {
        DecoderState { src: src.clone() }
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `tgt`: 解码器输入 token（已去掉最后一个）
    /// - `memory_bank`: 编码器特征 [src_len, d_model]
    /// - `state`: `init_decoder_state` 的结果
    /// - `memory_masks`: 层次化编码器给出的记忆掩码 [src_len]，true 表示填充
    ///
    /// # 返回
    /// - [tgt.len(), d_model]
    pub fn forward(
        &self,
        tgt: &[usize],
        memory_bank: &Array2<f32>,
        state: &DecoderState,
        memory_masks: Option<&Array1<bool>>,
    ) -> Result<Array2<f32>> {
        if tgt.is_empty() {
            return Err(SummarizerError::EmptyTarget(0));
        }

        let padding_idx = self.embeddings.padding_idx();
        let src_pad = match memory_masks {
            Some(mask) => mask.clone(),
            None => state.src_padding(padding_idx),
        };
        if src_pad.len() != memory_bank.nrows() {
            return Err(SummarizerError::shape(
                "memory mask",
                &[memory_bank.nrows()],
                &[src_pad.len()],
            ));
        }

        let tgt_len = tgt.len();
        let src_mask = key_padding_mask(&src_pad, tgt_len);
        let tgt_pad: Array1<bool> = tgt.iter().map(|&t| Some(t) == padding_idx).collect();
        let mut dec_mask = causal_mask(tgt_len);
        Zip::from(&mut dec_mask)
            .and(&key_padding_mask(&tgt_pad, tgt_len))
            .for_each(|m, &p| *m = *m || p);

        let mut output = self.pos_emb.forward(&self.embeddings.forward(tgt)?)?;
        for layer in &self.transformer_layers {
            output = layer.forward(&output, memory_bank, &src_mask, &dec_mask)?;
        }

        self.layer_norm.forward(&output)
    }

    pub fn embeddings(&self) -> &Embedding {
        &self.embeddings
    }

    pub fn num_layers(&self) -> usize {
        self.transformer_layers.len()
    }
}

impl Module for TransformerDecoder {
    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Param)>) {
        self.embeddings.collect_params(&join_name(prefix, "embeddings"), out);
        for (i, layer) in self.transformer_layers.iter().enumerate() {
            layer.collect_params(&join_name(prefix, &format!("transformer_layers.{i}")), out);
        }
        self.layer_norm.collect_params(&join_name(prefix, "layer_norm"), out);
    }

    fn set_training(&mut self, training: bool) {
        for layer in &mut self.transformer_layers {
            layer.set_training(training);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn decoder() -> TransformerDecoder {
        TransformerDecoder::new(2, 8, 2, 16, 0.0, Embedding::new(12, 8, Some(0)), 32)
    }

    #[test]
    fn test_decoder_output_shape() {
        let dec = decoder();
        let src = arr2(&[[3, 4, 5, 0]]);
        let memory = Array2::from_shape_fn((4, 8), |(i, j)| (i + j) as f32 / 10.0);
        let state = dec.init_decoder_state(&src, &memory);

        let out = dec.forward(&[1, 6, 7], &memory, &state, None).unwrap();
        assert_eq!(out.shape(), &[3, 8]);
        assert_eq!(state.src(), &src);
    }

    #[test]
    fn test_decoder_is_causal() {
        let dec = decoder();
        let src = arr2(&[[3, 4, 5]]);
        let memory = Array2::from_shape_fn((3, 8), |(i, j)| (i * j) as f32 / 10.0);
        let state = dec.init_decoder_state(&src, &memory);

        let a = dec.forward(&[1, 6, 7], &memory, &state, None).unwrap();
        let b = dec.forward(&[1, 6, 9], &memory, &state, None).unwrap();
        for i in 0..2 {
            for j in 0..8 {
                assert!((a[[i, j]] - b[[i, j]]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_memory_mask_hides_padding() {
        let dec = decoder();
        let src = arr2(&[[3, 4], [5, 6]]);
        let mut memory = Array2::from_shape_fn((4, 8), |(i, j)| (i + j) as f32 / 10.0);
        let state = dec.init_decoder_state(&src, &memory);
        let mask = Array1::from(vec![false, false, true, true]);

        let before = dec.forward(&[1, 2], &memory, &state, Some(&mask)).unwrap();
        memory.row_mut(3).fill(50.0);
        let after = dec.forward(&[1, 2], &memory, &state, Some(&mask)).unwrap();
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-5);
        }

        let short = Array1::from(vec![false]);
        assert!(dec.forward(&[1, 2], &memory, &state, Some(&short)).is_err());
    }

    #[test]
    fn test_empty_target() {
        let dec = decoder();
        let src = arr2(&[[3]]);
        let memory = Array2::zeros((1, 8));
        let state = dec.init_decoder_state(&src, &memory);
        assert!(matches!(
            dec.forward(&[], &memory, &state, None),
            Err(SummarizerError::EmptyTarget(0))
        ));
    }

    #[test]
    fn test_param_names() {
        let dec = decoder();
        let names: Vec<String> = dec.named_params("decoder").into_iter().map(|(n, _)| n).collect();
        assert_eq!(names[0], "decoder.embeddings.weight");
        assert!(names.contains(&"decoder.transformer_layers.1.context_attn.final_linear.bias".to_string()));
        assert!(names.contains(&"decoder.layer_norm.weight".to_string()));
        assert_eq!(dec.num_layers(), 2);
    }
}
