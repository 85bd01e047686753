//! 嵌入层和位置编码
//!
//! 将离散的 token ID 转换为连续的向量表示，并添加位置信息。

use ndarray::Array2;

use crate::error::{Result, SummarizerError};
use crate::param::{join_name, Module, Param};
use crate::tensor;

/// 词嵌入层
///
/// 将 token ID 映射到 d_model 维向量。填充 token 总是得到零向量。
#[derive(Debug, Clone)]
pub struct Embedding {
    /// 权重矩阵: [vocab_size, d_model]
    weight: Param,
    vocab_size: usize,
    d_model: usize,
    padding_idx: Option<usize>,
}

impl Embedding {
    /// 创建新的嵌入层（权重 N(0, 1)，填充行置零）
    ///
    /// # 参数
    /// - `vocab_size`: 词表大小
    /// - `d_model`: 嵌入维度
    /// - `padding_idx`: 填充 token 的 ID
    pub fn new(vocab_size: usize, d_model: usize, padding_idx: Option<usize>) -> Self {
        let mut rng = rand::thread_rng();
        let mut weight = tensor::standard_normal((vocab_size, d_model), &mut rng);
        if let Some(pad) = padding_idx.filter(|&p| p < vocab_size) {
            weight.row_mut(pad).fill(0.0);
        }

        Self {
            weight: Param::new(weight),
            vocab_size,
            d_model,
            padding_idx,
        }
    }

    /// 前向传播
    ///
    /// # 输入
    /// - `input`: [seq_len] token IDs
    ///
    /// # 输出
    /// - [seq_len, d_model]
    pub fn forward(&self, input: &[usize]) -> Result<Array2<f32>> {
        let weight = self.weight.matrix()?;
        let mut embedded = Array2::zeros((input.len(), self.d_model));

        for (i, &token_id) in input.iter().enumerate() {
            if token_id >= self.vocab_size {
                return Err(SummarizerError::TokenOutOfRange {
                    token: token_id,
                    vocab_size: self.vocab_size,
                });
            }
            if Some(token_id) == self.padding_idx {
                continue;
            }
            embedded.row_mut(i).assign(&weight.row(token_id));
        }

        Ok(embedded)
    }

    /// 与另一个嵌入层共享权重存储
    pub fn share_weight(&mut self, other: &Embedding) -> Result<()> {
        let expected = [self.vocab_size, self.d_model];
        if other.weight.shape() != expected {
            return Err(SummarizerError::shape(
                "shared embedding weight",
                &expected,
                &other.weight.shape(),
            ));
        }
        self.weight = other.weight.clone();
        Ok(())
    }

    pub fn weight(&self) -> &Param {
        &self.weight
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn padding_idx(&self) -> Option<usize> {
        self.padding_idx
    }
}

impl Module for Embedding {
    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Param)>) {
        out.push((join_name(prefix, "weight"), self.weight.clone()));
    }
}

/// 位置编码
///
/// 嵌入先乘以 √d_model，再加上正弦 / 余弦位置编码：
/// ```text
/// PE(pos, 2i)   = sin(pos / 10000^(2i/d_model))
/// PE(pos, 2i+1) = cos(pos / 10000^(2i/d_model))
/// ```
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    /// 预计算的位置编码: [max_seq_len, d_model]
    pe: Array2<f32>,
    max_seq_len: usize,
    d_model: usize,
}

impl PositionalEncoding {
    pub fn new(max_seq_len: usize, d_model: usize) -> Self {
        let mut pe = Array2::zeros((max_seq_len, d_model));
        let log_base = (10000.0f32).ln();

        for pos in 0..max_seq_len {
            for i in (0..d_model).step_by(2) {
                let div_term = (-(i as f32) * log_base / d_model as f32).exp();
                pe[[pos, i]] = (pos as f32 * div_term).sin();
                if i + 1 < d_model {
                    pe[[pos, i + 1]] = (pos as f32 * div_term).cos();
                }
            }
        }

        Self {
            pe,
            max_seq_len,
            d_model,
        }
    }

    /// 前向传播：缩放嵌入并加上位置编码
    ///
    /// # 输入
    /// - `emb`: [seq_len, d_model]
    pub fn forward(&self, emb: &Array2<f32>) -> Result<Array2<f32>> {
        let seq_len = emb.nrows();
        if seq_len > self.max_seq_len {
            return Err(SummarizerError::config(format!(
                "sequence length {seq_len} exceeds max_pos {}",
                self.max_seq_len
            )));
        }
        if emb.ncols() != self.d_model {
            return Err(SummarizerError::shape(
                "positional encoding input",
                &[seq_len, self.d_model],
                emb.shape(),
            ));
        }

        let scale = (self.d_model as f32).sqrt();
        let pe_slice = self.pe.slice(ndarray::s![..seq_len, ..]);
        Ok(emb * scale + &pe_slice)
    }

    /// 获取位置编码（用于可视化）
    pub fn encoding(&self) -> &Array2<f32> {
        &self.pe
    }
}
