//! 学习率调度器
//!
//! - `NoamLR`：先线性预热，再按步数的平方根倒数衰减
//! - `StepDecayLR`：从某一步开始，每隔固定步数乘以衰减系数

use crate::config::DecayMethod;

/// 学习率调度器 trait
pub trait LRScheduler {
    /// 获取当前步骤的学习率（步数从 1 开始）
    fn get_lr(&self, step: usize) -> f64;

    /// 调度器名称
    fn name(&self) -> &str;
}

/// Noam 调度
///
/// ```text
/// lr = base_lr * model_size^(-0.5) * min(step^(-0.5), step * warmup^(-1.5))
/// ```
#[derive(Debug, Clone, Copy)]
pub struct NoamLR {
    base_lr: f64,
    model_size: usize,
    warmup_steps: usize,
}

impl NoamLR {
    pub fn new(base_lr: f64, model_size: usize, warmup_steps: usize) -> Self {
        Self {
            base_lr,
            model_size,
            warmup_steps,
        }
    }
}

impl LRScheduler for NoamLR {
    fn get_lr(&self, step: usize) -> f64 {
        let step = step.max(1) as f64;
        let warmup = self.warmup_steps.max(1) as f64;
        let scale = (self.model_size.max(1) as f64).powf(-0.5);
        self.base_lr * scale * step.powf(-0.5).min(step * warmup.powf(-1.5))
    }

    fn name(&self) -> &str {
        "NoamLR"
    }
}

/// 步进衰减
///
/// 到达 `start_decay_steps` 时第一次乘以 `lr_decay`，之后每隔 `decay_steps` 再乘一次。
/// 没有设置起始步时学习率保持不变。
#[derive(Debug, Clone, Copy)]
pub struct StepDecayLR {
    base_lr: f64,
    lr_decay: f64,
    start_decay_steps: Option<usize>,
    decay_steps: usize,
}

impl StepDecayLR {
    pub fn new(base_lr: f64, lr_decay: f64, start_decay_steps: Option<usize>, decay_steps: usize) -> Self {
        Self {
            base_lr,
            lr_decay,
            start_decay_steps,
            decay_steps,
        }
    }
}

impl LRScheduler for StepDecayLR {
    fn get_lr(&self, step: usize) -> f64 {
        match self.start_decay_steps {
            Some(start) if step >= start => {
                let n_decays = (step - start) / self.decay_steps.max(1) + 1;
                self.base_lr * self.lr_decay.powi(n_decays as i32)
            }
            _ => self.base_lr,
        }
    }

    fn name(&self) -> &str {
        "StepDecayLR"
    }
}

/// 根据衰减方法构建调度器
pub fn build_scheduler(
    decay_method: DecayMethod,
    base_lr: f64,
    model_size: usize,
    warmup_steps: usize,
    lr_decay: f64,
    start_decay_steps: Option<usize>,
    decay_steps: usize,
) -> Box<dyn LRScheduler> {
    match decay_method {
        DecayMethod::Noam => Box::new(NoamLR::new(base_lr, model_size, warmup_steps)),
        DecayMethod::StepDecay => Box::new(StepDecayLR::new(base_lr, lr_decay, start_decay_steps, decay_steps)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noam_warmup_then_decay() {
        let noam = NoamLR::new(2.0, 256, 100);

        let expected = 2.0 * 256f64.powf(-0.5) * 1.0 * 100f64.powf(-1.5);
        assert!((noam.get_lr(1) - expected).abs() < 1e-12);

        // 预热阶段递增，之后递减，峰值在 warmup 处
        assert!(noam.get_lr(50) < noam.get_lr(100));
        assert!(noam.get_lr(400) < noam.get_lr(100));
        let peak = 2.0 * 256f64.powf(-0.5) * 100f64.powf(-0.5);
        assert!((noam.get_lr(100) - peak).abs() < 1e-12);

        // step 0 按 1 处理
        assert_eq!(noam.get_lr(0), noam.get_lr(1));
    }

    #[test]
    fn test_step_decay() {
        let sched = StepDecayLR::new(1.0, 0.5, Some(10), 5);
        assert_eq!(sched.get_lr(9), 1.0);
        assert_eq!(sched.get_lr(10), 0.5);
        assert_eq!(sched.get_lr(14), 0.5);
        assert_eq!(sched.get_lr(15), 0.25);

        let constant = StepDecayLR::new(1.0, 0.5, None, 5);
        assert_eq!(constant.get_lr(1000), 1.0);
    }

    #[test]
    fn test_build_scheduler() {
        let s = build_scheduler(DecayMethod::Noam, 1.0, 16, 4, 0.5, None, 1);
        assert_eq!(s.name(), "NoamLR");
        let s = build_scheduler(DecayMethod::StepDecay, 1.0, 16, 4, 0.5, None, 1);
        assert_eq!(s.name(), "StepDecayLR");
    }
}
