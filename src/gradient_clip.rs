//! 梯度裁剪
//!
//! 按所有参数梯度的全局 L2 范数统一缩放。

use ndarray::ArrayD;
use std::collections::BTreeMap;

/// 全局梯度范数
///
/// ```text
/// ||g|| = sqrt(Σ_i Σ_j g_ij²)
/// ```
pub fn global_grad_norm(grads: &BTreeMap<String, ArrayD<f32>>) -> f32 {
    let sum_squared: f64 = grads
        .values()
        .flat_map(|g| g.iter())
        .map(|&v| (v as f64) * (v as f64))
        .sum();
    sum_squared.sqrt() as f32
}

/// 原地裁剪梯度，返回裁剪前的全局范数
///
/// `max_norm <= 0` 时不裁剪。
pub fn clip_grad_norm(grads: &mut BTreeMap<String, ArrayD<f32>>, max_norm: f32) -> f32 {
    let total_norm = global_grad_norm(grads);
    if max_norm > 0.0 && total_norm > max_norm {
        let scale = max_norm / (total_norm + 1e-6);
        for grad in grads.values_mut() {
            grad.mapv_inplace(|g| g * scale);
        }
    }
    total_norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn grads() -> BTreeMap<String, ArrayD<f32>> {
        let mut g = BTreeMap::new();
        g.insert("a".to_string(), ArrayD::from_elem(IxDyn(&[2]), 3.0));
        g.insert("b".to_string(), ArrayD::from_elem(IxDyn(&[1, 2]), 3.0));
        g
    }

    #[test]
    fn test_global_norm() {
        // sqrt(4 * 9) = 6
        assert!((global_grad_norm(&grads()) - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_scales_all_gradients() {
        let mut g = grads();
        let norm = clip_grad_norm(&mut g, 3.0);

        assert!((norm - 6.0).abs() < 1e-6);
        assert!((global_grad_norm(&g) - 3.0).abs() < 1e-3);
        assert!((g["a"][[0]] - 1.5).abs() < 1e-3);
    }

    #[test]
    fn test_zero_max_norm_disables_clipping() {
        let mut g = grads();
        clip_grad_norm(&mut g, 0.0);
        assert_eq!(g, grads());

        // 范数未超过阈值时不变
        clip_grad_norm(&mut g, 10.0);
        assert_eq!(g, grads());
    }
}
