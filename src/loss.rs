//! 损失函数
//!
//! 生成器输出的 log 概率与目标序列之间的负对数似然，忽略填充位置。

use ndarray::Array2;
use std::fmt;

use crate::error::{Result, SummarizerError};

/// 损失统计
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossStats {
    /// 累计的负对数似然（求和）
    pub loss: f64,
    /// 非填充的目标词数
    pub n_words: usize,
    /// 预测正确的词数
    pub n_correct: usize,
}

impl LossStats {
    pub fn new(loss: f64, n_words: usize, n_correct: usize) -> Self {
        Self {
            loss,
            n_words,
            n_correct,
        }
    }

    /// 累加另一批的统计
    pub fn update(&mut self, other: &LossStats) {
        self.loss += other.loss;
        self.n_words += other.n_words;
        self.n_correct += other.n_correct;
    }

    /// 准确率（百分比）
    pub fn accuracy(&self) -> f64 {
        if self.n_words == 0 {
            return 0.0;
        }
        100.0 * self.n_correct as f64 / self.n_words as f64
    }

    /// 平均交叉熵
    pub fn xent(&self) -> f64 {
        if self.n_words == 0 {
            return 0.0;
        }
        self.loss / self.n_words as f64
    }

    /// 困惑度
    pub fn ppl(&self) -> f64 {
        self.xent().min(100.0).exp()
    }
}

impl fmt::Display for LossStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "acc: {:6.2}; ppl: {:5.2}; xent: {:4.2}",
            self.accuracy(),
            self.ppl(),
            self.xent()
        )
    }
}

/// NMT 损失
///
/// ```text
/// L = -Σ_t log p(tgt[t+1] | tgt[..=t])，tgt[t+1] ≠ pad
/// ```
///
/// 解码器输入去掉了目标的最后一个 token，因此第 t 行预测的是 `tgt[t + 1]`。
#[derive(Debug, Clone, Copy)]
pub struct NmtLoss {
    padding_idx: usize,
}

impl NmtLoss {
    pub fn new(padding_idx: usize) -> Self {
        Self { padding_idx }
    }

    fn check(&self, log_probs: &Array2<f32>, tgt: &[usize]) -> Result<()> {
        if tgt.len() < 2 {
            return Err(SummarizerError::EmptyTarget(tgt.len()));
        }
        if log_probs.nrows() != tgt.len() - 1 {
            return Err(SummarizerError::shape(
                "generator output",
                &[tgt.len() - 1, log_probs.ncols()],
                log_probs.shape(),
            ));
        }
        let vocab_size = log_probs.ncols();
        if let Some(&token) = tgt[1..].iter().find(|&&t| t >= vocab_size) {
            return Err(SummarizerError::TokenOutOfRange { token, vocab_size });
        }
        Ok(())
    }

    /// 计算损失统计
    ///
    /// - `log_probs`: [L-1, vocab_size]
    /// - `tgt`: 完整目标序列（长度 L）
    pub fn compute(&self, log_probs: &Array2<f32>, tgt: &[usize]) -> Result<LossStats> {
        self.check(log_probs, tgt)?;

        let mut stats = LossStats::default();
        for (row, &gold) in log_probs.rows().into_iter().zip(&tgt[1..]) {
            if gold == self.padding_idx {
                continue;
            }
            stats.loss -= row[gold] as f64;
            stats.n_words += 1;

            let pred = row
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                .0;
            if pred == gold {
                stats.n_correct += 1;
            }
        }
        Ok(stats)
    }

    /// 损失对 log 概率的梯度（求和归约）
    pub fn grad(&self, log_probs: &Array2<f32>, tgt: &[usize]) -> Result<Array2<f32>> {
        self.check(log_probs, tgt)?;

        let mut grad = Array2::zeros(log_probs.raw_dim());
        for (t, &gold) in tgt[1..].iter().enumerate() {
            if gold != self.padding_idx {
                grad[[t, gold]] = -1.0;
            }
        }
        Ok(grad)
    }

    pub fn padding_idx(&self) -> usize {
        self.padding_idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorExt;
    use ndarray::arr2;

    #[test]
    fn test_nll_ignores_padding() {
        let loss = NmtLoss::new(0);
        let log_probs = arr2(&[[0.1f32, 0.7, 0.2], [0.5, 0.3, 0.2], [0.2, 0.2, 0.6]]).mapv(f32::ln);
        // 目标 [bos, 1, 0(pad), 2]，预测 1 和 2
        let stats = loss.compute(&log_probs, &[1, 1, 0, 2]).unwrap();

        assert_eq!(stats.n_words, 2);
        assert_eq!(stats.n_correct, 2);
        let expected = -(0.7f64.ln() + 0.6f64.ln());
        assert!((stats.loss - expected).abs() < 1e-5);
        assert!((stats.accuracy() - 100.0).abs() < 1e-9);
        assert!(stats.ppl() > 1.0);
    }

    #[test]
    fn test_shape_and_range_checks() {
        let loss = NmtLoss::new(0);
        let log_probs = Array2::<f32>::zeros((2, 4)).log_softmax(1);

        assert!(matches!(loss.compute(&log_probs, &[1]), Err(SummarizerError::EmptyTarget(1))));
        assert!(loss.compute(&log_probs, &[1, 2]).is_err());
        assert!(matches!(
            loss.compute(&log_probs, &[1, 2, 9]),
            Err(SummarizerError::TokenOutOfRange { token: 9, .. })
        ));
    }

    #[test]
    fn test_grad() {
        let loss = NmtLoss::new(0);
        let log_probs = Array2::<f32>::zeros((2, 3)).log_softmax(1);
        let grad = loss.grad(&log_probs, &[1, 2, 0]).unwrap();

        assert_eq!(grad[[0, 2]], -1.0);
        assert_eq!(grad.row(1).sum(), 0.0);
    }

    #[test]
    fn test_stats_update() {
        let mut total = LossStats::new(2.0, 2, 1);
        total.update(&LossStats::new(4.0, 2, 2));

        assert_eq!(total.n_words, 4);
        assert!((total.xent() - 1.5).abs() < 1e-12);
        assert!((total.accuracy() - 75.0).abs() < 1e-9);
        assert!(total.to_string().starts_with("acc:"));
        assert_eq!(LossStats::default().accuracy(), 0.0);
    }
}
