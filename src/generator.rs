//! 输出生成器
//!
//! 把解码器隐藏状态投影到词表并取 log-softmax。

use ndarray::Array2;

use crate::error::Result;
use crate::layers::Linear;
use crate::param::{join_name, Device, Module, Param};
use crate::tensor::TensorExt;

/// Linear + LogSoftmax
///
/// 参数名沿用顺序容器的编号：`generator.0.weight`、`generator.0.bias`。
#[derive(Debug, Clone)]
pub struct Generator {
    proj: Linear,
}

impl Generator {
    /// 前向传播
    ///
    /// 输入: [n, hidden]
    /// 输出: [n, vocab_size]，每行是 log 概率
    pub fn forward(&self, hidden: &Array2<f32>) -> Result<Array2<f32>> {
        Ok(self.proj.forward(hidden)?.log_softmax(1))
    }

    /// 投影权重 [vocab_size, hidden]
    pub fn weight(&self) -> &Param {
        self.proj.weight()
    }

    /// 与解码器词嵌入共享投影权重
    pub fn tie_weight(&mut self, weight: Param) -> Result<()> {
        self.proj.tie_weight(weight)
    }

    pub fn vocab_size(&self) -> usize {
        self.proj.out_features()
    }
}

impl Module for Generator {
    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Param)>) {
        self.proj.collect_params(&join_name(prefix, "0"), out);
    }
}

/// 构建生成器并放到指定设备上
pub fn build_generator(hidden_size: usize, vocab_size: usize, device: Device) -> Generator {
    let generator = Generator {
        proj: Linear::new(hidden_size, vocab_size),
    };
    for (_, param) in generator.named_params("") {
        param.to_device(device);
    }
    generator
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_log_probs() {
        let generator = build_generator(8, 20, Device::Cpu);
        let hidden = Array2::from_shape_fn((3, 8), |(i, j)| (i as f32 - j as f32) / 4.0);
        let out = generator.forward(&hidden).unwrap();

        assert_eq!(out.shape(), &[3, 20]);
        for row in out.rows() {
            let total: f32 = row.iter().map(|v| v.exp()).sum();
            assert!((total - 1.0).abs() < 1e-4);
            assert!(row.iter().all(|&v| v <= 0.0));
        }
    }

    #[test]
    fn test_generator_placement_and_names() {
        let generator = build_generator(4, 10, Device::Cuda(0));
        let params = generator.named_params("generator");
        let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();

        assert_eq!(names, vec!["generator.0.weight", "generator.0.bias"]);
        assert!(params.iter().all(|(_, p)| p.device() == Device::Cuda(0)));
        assert_eq!(generator.vocab_size(), 10);
    }

    #[test]
    fn test_tie_weight() {
        let mut generator = build_generator(4, 10, Device::Cpu);
        let shared = Param::new(Array2::<f32>::ones((10, 4)));
        generator.tie_weight(shared.clone()).unwrap();

        shared.update(|w| w.fill(0.5));
        assert!(generator.weight().shares_storage(&shared));
        assert_eq!(generator.weight().matrix().unwrap()[[9, 3]], 0.5);
        assert!(generator.tie_weight(Param::new(Array2::<f32>::ones((4, 10)))).is_err());
    }
}
