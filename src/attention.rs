//! 多头注意力
//!
//! 编码器、解码器和段落间注意力共用的注意力组件。

use ndarray::{s, Array1, Array2};

use crate::error::{Result, SummarizerError};
use crate::layers::{Dropout, Linear};
use crate::param::{join_name, Module, Param};
use crate::tensor::{TensorExt, MASK_FILL};

/// Multi-Head Attention
///
/// ```text
/// Attention(Q, K, V) = softmax(QK^T / √d_k) * V
/// ```
///
/// 把 d_model 按列切成 `head_count` 份，每个头独立计算后拼接，再经过输出投影。
#[derive(Debug, Clone)]
pub struct MultiHeadedAttention {
    head_count: usize,
    dim_per_head: usize,
    model_dim: usize,
    linear_keys: Linear,
    linear_values: Linear,
    linear_query: Linear,
    final_linear: Linear,
    dropout: Dropout,
}

impl MultiHeadedAttention {
    pub fn new(head_count: usize, model_dim: usize, dropout: f32) -> Self {
        assert_eq!(model_dim % head_count, 0, "model_dim must be divisible by head_count");

        Self {
            head_count,
            dim_per_head: model_dim / head_count,
            model_dim,
            linear_keys: Linear::new(model_dim, model_dim),
            linear_values: Linear::new(model_dim, model_dim),
            linear_query: Linear::new(model_dim, model_dim),
            final_linear: Linear::new(model_dim, model_dim),
            dropout: Dropout::new(dropout),
        }
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `key`, `value`: [k_len, model_dim]
    /// - `query`: [q_len, model_dim]
    /// - `mask`: [q_len, k_len]，true 表示不可见
    ///
    /// # 返回
    /// - [q_len, model_dim]
    pub fn forward(
        &self,
        key: &Array2<f32>,
        value: &Array2<f32>,
        query: &Array2<f32>,
        mask: Option<&Array2<bool>>,
    ) -> Result<Array2<f32>> {
        if let Some(m) = mask {
            let expected = [query.nrows(), key.nrows()];
            if m.shape() != expected {
                return Err(SummarizerError::shape("attention mask", &expected, m.shape()));
            }
        }

        let k = self.linear_keys.forward(key)?;
        let v = self.linear_values.forward(value)?;
        let scale = (self.dim_per_head as f32).sqrt();
        let q = self.linear_query.forward(query)? / scale;

        let mut context = Array2::zeros((query.nrows(), self.model_dim));
        for h in 0..self.head_count {
            let cols = h * self.dim_per_head..(h + 1) * self.dim_per_head;
            let qh = q.slice(s![.., cols.clone()]).to_owned();
            let kh = k.slice(s![.., cols.clone()]).to_owned();
            let vh = v.slice(s![.., cols.clone()]).to_owned();

            let scores = qh.matmul(&kh.reversed_axes());
            let attn = self.dropout.forward(&scores.masked_softmax(mask));
            context.slice_mut(s![.., cols]).assign(&attn.matmul(&vh));
        }

        self.final_linear.forward(&context)
    }

    pub fn head_count(&self) -> usize {
        self.head_count
    }
}

impl Module for MultiHeadedAttention {
    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Param)>) {
        self.linear_keys.collect_params(&join_name(prefix, "linear_keys"), out);
        self.linear_values.collect_params(&join_name(prefix, "linear_values"), out);
        self.linear_query.collect_params(&join_name(prefix, "linear_query"), out);
        self.final_linear.collect_params(&join_name(prefix, "final_linear"), out);
    }

    fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
    }
}

/// 多头注意力池化
///
/// 把一个段落的 token 表示汇聚成一个向量：每个头对 token 打分，
/// 在非填充位置上做 softmax，再对投影后的值加权求和。
#[derive(Debug, Clone)]
pub struct MultiHeadedPooling {
    head_count: usize,
    dim_per_head: usize,
    model_dim: usize,
    linear_keys: Linear,
    linear_values: Linear,
    final_linear: Linear,
    dropout: Dropout,
}

impl MultiHeadedPooling {
    pub fn new(head_count: usize, model_dim: usize, dropout: f32) -> Self {
        assert_eq!(model_dim % head_count, 0, "model_dim must be divisible by head_count");

        Self {
            head_count,
            dim_per_head: model_dim / head_count,
            model_dim,
            linear_keys: Linear::new(model_dim, head_count),
            linear_values: Linear::new(model_dim, model_dim),
            final_linear: Linear::new(model_dim, model_dim),
            dropout: Dropout::new(dropout),
        }
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `x`: [n_tokens, model_dim]
    /// - `pad`: [n_tokens]，true 表示填充
    ///
    /// # 返回
    /// - [1, model_dim]
    pub fn forward(&self, x: &Array2<f32>, pad: &Array1<bool>) -> Result<Array2<f32>> {
        if pad.len() != x.nrows() {
            return Err(SummarizerError::shape("pooling mask", &[x.nrows()], &[pad.len()]));
        }

        let mut scores = self.linear_keys.forward(x)?;
        for (mut row, &is_pad) in scores.rows_mut().into_iter().zip(pad.iter()) {
            if is_pad {
                row.fill(MASK_FILL);
            }
        }
        // [n_heads, n_tokens]
        let attn = self.dropout.forward(&scores.reversed_axes().softmax(1));
        let values = self.linear_values.forward(x)?;

        let mut pooled = Array2::zeros((1, self.model_dim));
        for h in 0..self.head_count {
            let cols = h * self.dim_per_head..(h + 1) * self.dim_per_head;
            let weights = attn.slice(s![h..h + 1, ..]).to_owned();
            let vh = values.slice(s![.., cols.clone()]).to_owned();
            pooled.slice_mut(s![.., cols]).assign(&weights.matmul(&vh));
        }

        self.final_linear.forward(&pooled)
    }
}

impl Module for MultiHeadedPooling {
    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Param)>) {
        self.linear_keys.collect_params(&join_name(prefix, "linear_keys"), out);
        self.linear_values.collect_params(&join_name(prefix, "linear_values"), out);
        self.final_linear.collect_params(&join_name(prefix, "final_linear"), out);
    }

    fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
    }
}
