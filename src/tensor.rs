//! 张量操作扩展和工具函数
//!
//! 基于 ndarray 实现模型组装所需的张量操作。

use ndarray::{Array1, Array2, ArrayD, Axis, IxDyn};
use rand::distributions::Uniform;
use rand::Rng;
use rand_distr::StandardNormal;

/// 被掩码位置的分数（softmax 之后约等于 0）
pub const MASK_FILL: f32 = -1e18;

/// 张量扩展 trait
pub trait TensorExt<T> {
    /// 矩阵乘法
    fn matmul(&self, other: &Array2<T>) -> Array2<T>
    where
        T: num_traits::Num + Clone;

    /// 沿指定维度的 softmax
    fn softmax(&self, axis: usize) -> Array2<T>
    where
        T: num_traits::Float;

    /// 沿指定维度的 log-softmax
    fn log_softmax(&self, axis: usize) -> Array2<T>
    where
        T: num_traits::Float;

    /// 按行 softmax，`mask` 中为 true 的位置被屏蔽
    fn masked_softmax(&self, mask: Option<&Array2<bool>>) -> Array2<T>
    where
        T: num_traits::Float;

    /// GELU 激活函数
    fn gelu(&self) -> Array2<T>
    where
        T: num_traits::Float;

    /// 层归一化（一维的缩放和偏置）
    fn layer_norm(&self, weight: &Array1<T>, bias: &Array1<T>, eps: T) -> Array2<T>
    where
        T: num_traits::Float;
}

/// 为 f32 实现张量扩展
impl TensorExt<f32> for Array2<f32> {
    fn matmul(&self, other: &Array2<f32>) -> Array2<f32> {
        self.dot(other)
    }

    fn softmax(&self, axis: usize) -> Array2<f32> {
        // 减去最大值以提高数值稳定性
        let max = self.fold_axis(Axis(axis), f32::NEG_INFINITY, |a, &b| a.max(b));
        let max_view = max.insert_axis(Axis(axis));

        let exp = (self - &max_view).mapv(|x: f32| x.exp());
        let sum = exp.sum_axis(Axis(axis));
        let sum_view = sum.insert_axis(Axis(axis));

        exp / sum_view
    }

    fn log_softmax(&self, axis: usize) -> Array2<f32> {
        let max = self.fold_axis(Axis(axis), f32::NEG_INFINITY, |a, &b| a.max(b));
        let max_view = max.insert_axis(Axis(axis));

        let shifted = self - &max_view;
        let log_sum = shifted
            .mapv(|x: f32| x.exp())
            .sum_axis(Axis(axis))
            .mapv(|s: f32| s.ln())
            .insert_axis(Axis(axis));

        shifted - log_sum
    }

    fn masked_softmax(&self, mask: Option<&Array2<bool>>) -> Array2<f32> {
        match mask {
            Some(mask) => {
                let mut scores = self.clone();
                scores.zip_mut_with(mask, |s, &blocked| {
                    if blocked {
                        *s = MASK_FILL;
                    }
                });
                scores.softmax(1)
            }
            None => self.softmax(1),
        }
    }

    fn gelu(&self) -> Array2<f32> {
        // GELU(x) ≈ 0.5 * x * (1 + tanh(√(2/π) * (x + 0.044715 * x³)))
        self.mapv(|x: f32| {
            let sqrt_2_over_pi = (2.0 / std::f32::consts::PI).sqrt();
            let cube = x * x * x;
            0.5 * x * (1.0 + (sqrt_2_over_pi * (x + 0.044715 * cube)).tanh())
        })
    }

    fn layer_norm(&self, weight: &Array1<f32>, bias: &Array1<f32>, eps: f32) -> Array2<f32> {
        let n = self.ncols().max(1) as f32;
        let mean = self.sum_axis(Axis(1)) / n;
        let mean_view = mean.insert_axis(Axis(1));

        let centered = self - &mean_view;
        let var = centered.mapv(|x: f32| x * x).sum_axis(Axis(1)) / n;
        let std = var.mapv(|v: f32| (v + eps).sqrt()).insert_axis(Axis(1));

        &centered / &std * weight + bias
    }
}

/// Xavier 均匀初始化
///
/// ```text
/// bound = sqrt(6 / (fan_in + fan_out))
/// fan_in = shape[1] * receptive, fan_out = shape[0] * receptive
/// ```
///
/// 只对二维及以上的张量有意义。
pub fn xavier_uniform<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> ArrayD<f32> {
    let receptive: usize = shape.iter().skip(2).product();
    let fan_out = shape.first().copied().unwrap_or(1) * receptive;
    let fan_in = shape.get(1).copied().unwrap_or(1) * receptive;
    let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();

    let dist = Uniform::new_inclusive(-limit, limit);
    ArrayD::from_shape_fn(IxDyn(shape), |_| rng.sample(dist))
}

/// 均匀分布 `[-limit, limit]` 初始化
pub fn uniform<R: Rng + ?Sized>(shape: (usize, usize), limit: f32, rng: &mut R) -> Array2<f32> {
    let dist = Uniform::new_inclusive(-limit, limit);
    Array2::from_shape_fn(shape, |_| rng.sample(dist))
}

/// 标准正态分布初始化
pub fn standard_normal<R: Rng + ?Sized>(shape: (usize, usize), rng: &mut R) -> Array2<f32> {
    Array2::from_shape_fn(shape, |_| rng.sample::<f32, _>(StandardNormal))
}

/// 因果掩码：true 表示位置 j 在位置 i 之后（不可见）
pub fn causal_mask(seq_len: usize) -> Array2<bool> {
    Array2::from_shape_fn((seq_len, seq_len), |(i, j)| j > i)
}

/// 把 key 侧的填充标记扩展为 [q_len, k_len] 的注意力掩码
pub fn key_padding_mask(pad: &Array1<bool>, q_len: usize) -> Array2<bool> {
    Array2::from_shape_fn((q_len, pad.len()), |(_, j)| pad[j])
}
