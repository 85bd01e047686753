//! 基础层
//!
//! 包含 Linear、Layer Normalization、Feed-Forward Network 和 Dropout。

use ndarray::{Array1, Array2};

use crate::error::{Result, SummarizerError};
use crate::param::{join_name, Module, Param};
use crate::tensor::{self, TensorExt};

/// 线性层
///
/// ```text
/// y = x · Wᵀ + b
/// ```
///
/// 权重形状为 [out_features, in_features]，与词嵌入表 [vocab_size, d_model]
/// 同形，因此输出投影可以直接与嵌入共享权重。
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Param,
    bias: Option<Param>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// 创建线性层：权重 U(-1/√in, 1/√in)，偏置为 0
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self::with_bias(in_features, out_features, true)
    }

    pub fn with_bias(in_features: usize, out_features: usize, bias: bool) -> Self {
        let mut rng = rand::thread_rng();
        let limit = 1.0 / (in_features.max(1) as f32).sqrt();
        let weight = tensor::uniform((out_features, in_features), limit, &mut rng);

        Self {
            weight: Param::new(weight),
            bias: bias.then(|| Param::new(Array1::<f32>::zeros(out_features))),
            in_features,
            out_features,
        }
    }

    /// 前向传播
    ///
    /// 输入: [n, in_features]
    /// 输出: [n, out_features]
    pub fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.in_features {
            return Err(SummarizerError::shape(
                "linear input",
                &[x.nrows(), self.in_features],
                x.shape(),
            ));
        }

        let weight = self.weight.matrix()?;
        let output = x.matmul(&weight.reversed_axes());
        match &self.bias {
            Some(bias) => Ok(output + &bias.vector()?),
            None => Ok(output),
        }
    }

    pub fn weight(&self) -> &Param {
        &self.weight
    }

    /// 让权重与另一个参数共享存储
    pub fn tie_weight(&mut self, weight: Param) -> Result<()> {
        let expected = [self.out_features, self.in_features];
        if weight.shape() != expected {
            return Err(SummarizerError::shape("tied linear weight", &expected, &weight.shape()));
        }
        self.weight = weight;
        Ok(())
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Module for Linear {
    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Param)>) {
        out.push((join_name(prefix, "weight"), self.weight.clone()));
        if let Some(bias) = &self.bias {
            out.push((join_name(prefix, "bias"), bias.clone()));
        }
    }
}

/// Layer Normalization
///
/// ```text
/// y = weight * ((x - μ) / √(σ² + ε)) + bias
/// ```
///
/// 旧版检查点把 `weight` / `bias` 叫做 `a_2` / `b_2`。
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// 缩放参数 [d_model]
    weight: Param,
    /// 平移参数 [d_model]
    bias: Param,
    eps: f32,
}

impl LayerNorm {
    pub fn new(d_model: usize) -> Self {
        Self::with_eps(d_model, 1e-6)
    }

    pub fn with_eps(d_model: usize, eps: f32) -> Self {
        Self {
            weight: Param::new(Array1::<f32>::ones(d_model)),
            bias: Param::new(Array1::<f32>::zeros(d_model)),
            eps,
        }
    }

    /// 输入: [n, d_model]
    pub fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        let weight = self.weight.vector()?;
        let bias = self.bias.vector()?;
        if x.ncols() != weight.len() {
            return Err(SummarizerError::shape(
                "layer norm input",
                &[x.nrows(), weight.len()],
                x.shape(),
            ));
        }
        Ok(x.layer_norm(&weight, &bias, self.eps))
    }
}

impl Module for LayerNorm {
    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Param)>) {
        out.push((join_name(prefix, "weight"), self.weight.clone()));
        out.push((join_name(prefix, "bias"), self.bias.clone()));
    }
}

/// Dropout 层
///
/// 训练时随机将一部分输出置零并按 1/(1-p) 缩放，推理时原样返回。
#[derive(Debug, Clone)]
pub struct Dropout {
    dropout_prob: f32,
    training: bool,
}

impl Dropout {
    pub fn new(dropout_prob: f32) -> Self {
        Self {
            dropout_prob,
            training: false,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        if !self.training || self.dropout_prob == 0.0 {
            return x.clone();
        }

        let keep = 1.0 - self.dropout_prob;
        x.mapv(|v: f32| {
            if rand::random::<f32>() < self.dropout_prob {
                0.0
            } else {
                v / keep
            }
        })
    }
}

/// Position-wise Feed-Forward Network（先归一化，带残差）
///
/// ```text
/// FFN(x) = W2 · dropout(GELU(W1 · LN(x) + b1)) + b2 + x
/// ```
#[derive(Debug, Clone)]
pub struct PositionwiseFeedForward {
    layer_norm: LayerNorm,
    w_1: Linear,
    w_2: Linear,
    dropout_1: Dropout,
    dropout_2: Dropout,
}

impl PositionwiseFeedForward {
    pub fn new(d_model: usize, d_ff: usize, dropout: f32) -> Self {
        Self {
            layer_norm: LayerNorm::new(d_model),
            w_1: Linear::new(d_model, d_ff),
            w_2: Linear::new(d_ff, d_model),
            dropout_1: Dropout::new(dropout),
            dropout_2: Dropout::new(dropout),
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        let normed = self.layer_norm.forward(x)?;
        let inter = self.dropout_1.forward(&self.w_1.forward(&normed)?.gelu());
        let output = self.dropout_2.forward(&self.w_2.forward(&inter)?);
        Ok(output + x)
    }
}

impl Module for PositionwiseFeedForward {
    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Param)>) {
        self.layer_norm.collect_params(&join_name(prefix, "layer_norm"), out);
        self.w_1.collect_params(&join_name(prefix, "w_1"), out);
        self.w_2.collect_params(&join_name(prefix, "w_2"), out);
    }

    fn set_training(&mut self, training: bool) {
        self.dropout_1.set_training(training);
        self.dropout_2.set_training(training);
    }
}
