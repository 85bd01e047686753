//! 优化器封装
//!
//! `Optim` 持有优化方法、学习率调度和梯度裁剪的设置，以及绑定到模型参数上的
//! 内部优化器。检查点里保存的是 `OptimSnapshot`，恢复时先重新绑定参数，再载入状态。

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::checkpoint::Checkpoint;
use crate::config::{DecayMethod, OptimMethod, SummarizerConfig};
use crate::error::{Result, SummarizerError};
use crate::gradient_clip::clip_grad_norm;
use crate::lr_scheduler::{build_scheduler, LRScheduler};
use crate::model_builder::Summarizer;
use crate::optimizer::{Adadelta, Adagrad, Adam, Optimizer, OptimizerStateDict, Sgd};
use crate::param::{Device, Param};

/// 优化器超参数与训练步数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimSettings {
    pub method: OptimMethod,
    /// 当前学习率
    pub lr: f64,
    /// 调度之前的基础学习率
    pub original_lr: f64,
    pub max_grad_norm: f64,
    pub betas: (f64, f64),
    pub decay_method: DecayMethod,
    pub warmup_steps: usize,
    pub model_size: usize,
    pub lr_decay: f64,
    pub start_decay_steps: Option<usize>,
    pub decay_steps: usize,
    pub adagrad_accum: f64,
    /// 已经执行的更新步数
    pub step: usize,
}

impl OptimSettings {
    /// 从配置构建；`model_size` 取编码器隐藏维度
    pub fn from_config(config: &SummarizerConfig) -> Self {
        Self {
            method: config.optim,
            lr: config.lr,
            original_lr: config.lr,
            max_grad_norm: config.max_grad_norm,
            betas: (config.beta1, config.beta2),
            decay_method: config.decay_method,
            warmup_steps: config.warmup_steps,
            model_size: config.enc_hidden_size,
            lr_decay: config.lr_decay,
            start_decay_steps: config.start_decay_steps,
            decay_steps: config.decay_steps,
            adagrad_accum: config.adagrad_accumulator_init,
            step: 0,
        }
    }

    fn scheduler(&self) -> Box<dyn LRScheduler> {
        build_scheduler(
            self.decay_method,
            self.original_lr,
            self.model_size,
            self.warmup_steps,
            self.lr_decay,
            self.start_decay_steps,
            self.decay_steps,
        )
    }
}

/// 写入检查点的优化器快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimSnapshot {
    pub settings: OptimSettings,
    pub state: OptimizerStateDict,
}

/// 优化器封装
#[derive(Debug)]
pub struct Optim {
    settings: OptimSettings,
    optimizer: Option<Box<dyn Optimizer>>,
    /// 从快照恢复、尚未绑定参数时保留的状态
    saved_state: OptimizerStateDict,
}

impl Optim {
    pub fn new(settings: OptimSettings) -> Self {
        Self {
            settings,
            optimizer: None,
            saved_state: OptimizerStateDict::default(),
        }
    }

    /// 从检查点快照恢复（尚未绑定参数）
    pub fn from_snapshot(snapshot: OptimSnapshot) -> Self {
        Self {
            settings: snapshot.settings,
            optimizer: None,
            saved_state: snapshot.state,
        }
    }

    pub fn snapshot(&self) -> OptimSnapshot {
        OptimSnapshot {
            settings: self.settings.clone(),
            state: self.state_dict(),
        }
    }

    pub fn settings(&self) -> &OptimSettings {
        &self.settings
    }

    pub fn method(&self) -> OptimMethod {
        self.settings.method
    }

    pub fn lr(&self) -> f64 {
        self.settings.lr
    }

    pub fn step_count(&self) -> usize {
        self.settings.step
    }

    pub fn is_bound(&self) -> bool {
        self.optimizer.is_some()
    }

    /// 用模型参数（重新）创建内部优化器，状态为空
    pub fn set_parameters(&mut self, params: Vec<(String, Param)>) {
        let s = &self.settings;
        let optimizer: Box<dyn Optimizer> = match s.method {
            OptimMethod::Sgd => Box::new(Sgd::new(params, s.lr)),
            OptimMethod::Adagrad => Box::new(Adagrad::new(params, s.lr, s.adagrad_accum)),
            OptimMethod::Adadelta => Box::new(Adadelta::new(params, s.lr)),
            OptimMethod::Adam => Box::new(Adam::new(params, s.lr, s.betas)),
        };
        debug!(
            method = optimizer.name(),
            params = optimizer.bound().params().len(),
            "optimizer bound to parameters"
        );
        self.optimizer = Some(optimizer);
    }

    /// 当前状态：已绑定时取内部优化器的状态，否则取快照中保留的状态
    pub fn state_dict(&self) -> OptimizerStateDict {
        match &self.optimizer {
            Some(optimizer) => optimizer.state_dict(),
            None => self.saved_state.clone(),
        }
    }

    /// 把状态载入已绑定的内部优化器
    pub fn load_state_dict(&mut self, state_dict: OptimizerStateDict) -> Result<()> {
        let optimizer = self.bound_optimizer()?;
        optimizer.load_state_dict(state_dict)
    }

    /// 把所有张量状态移动到指定设备
    pub fn state_to_device(&mut self, device: Device) -> Result<()> {
        let optimizer = self.bound_optimizer()?;
        let mut state = optimizer.state_dict();
        state.to_device(device);
        optimizer.load_state_dict(state)
    }

    /// 执行一次更新
    ///
    /// 1. 步数加一，按衰减方法更新学习率
    /// 2. 按全局范数裁剪梯度
    /// 3. 内部优化器更新参数
    ///
    /// 返回裁剪前的梯度范数。
    pub fn step(&mut self, mut grads: BTreeMap<String, ArrayD<f32>>) -> Result<f32> {
        let step = self.settings.step + 1;
        let lr = self.settings.scheduler().get_lr(step);
        let max_grad_norm = self.settings.max_grad_norm as f32;

        let optimizer = self.bound_optimizer()?;
        optimizer.set_lr(lr);
        let norm = clip_grad_norm(&mut grads, max_grad_norm);
        optimizer.step(&grads)?;

        self.settings.step = step;
        self.settings.lr = lr;
        debug!(step, lr, grad_norm = norm, "optimizer step");
        Ok(norm)
    }

    fn bound_optimizer(&mut self) -> Result<&mut Box<dyn Optimizer>> {
        self.optimizer
            .as_mut()
            .ok_or_else(|| SummarizerError::config("optimizer has no parameters; call set_parameters first"))
    }
}

/// 构建优化器
///
/// - 从头训练：按配置新建
/// - 继续训练：取检查点里的优化器，重新绑定模型参数后载入保存的状态，
///   使用 GPU 时把状态张量移到 GPU；Adam 恢复后状态为空视为错误
pub fn build_optim(
    config: &SummarizerConfig,
    model: &Summarizer,
    checkpoint: Option<&Checkpoint>,
) -> Result<Optim> {
    let (mut optim, saved_state) = if config.is_resuming() {
        let snapshot = checkpoint
            .and_then(|c| c.optim.clone())
            .ok_or_else(|| SummarizerError::MissingOptimizerState(config.train_from.clone()))?;
        let optim = Optim::from_snapshot(snapshot);
        let saved_state = optim.state_dict();
        (optim, Some(saved_state))
    } else {
        (Optim::new(OptimSettings::from_config(config)), None)
    };

    optim.set_parameters(model.named_parameters());

    if let Some(saved_state) = saved_state {
        optim.load_state_dict(saved_state)?;
        if config.visible_gpus.is_gpu() {
            optim.state_to_device(config.device())?;
        }

        let n_states = optim.state_dict().len();
        if optim.method() == OptimMethod::Adam && n_states < 1 {
            return Err(SummarizerError::EmptyOptimizerState {
                method: optim.method().to_string(),
            });
        }
        info!(
            method = %optim.method(),
            step = optim.step_count(),
            states = n_states,
            "restored optimizer from checkpoint"
        );
    } else {
        info!(method = %optim.method(), lr = optim.lr(), "created fresh optimizer");
    }

    Ok(optim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VisibleGpus;
    use crate::optimizer::StateValue;

    fn small_config() -> SummarizerConfig {
        SummarizerConfig {
            enc_hidden_size: 8,
            dec_hidden_size: 8,
            emb_size: 8,
            heads: 2,
            ff_size: 16,
            enc_layers: 1,
            dec_layers: 1,
            max_pos: 16,
            warmup_steps: 4,
            ..SummarizerConfig::default()
        }
    }

    fn model(config: &SummarizerConfig) -> Summarizer {
        Summarizer::new(config, 0, 12, config.device(), None).unwrap()
    }

    fn ones_grads(model: &Summarizer) -> BTreeMap<String, ArrayD<f32>> {
        model
            .named_parameters()
            .into_iter()
            .map(|(name, p)| (name, ArrayD::from_elem(p.shape(), 0.1)))
            .collect()
    }

    #[test]
    fn test_fresh_optim() {
        let config = small_config();
        let model = model(&config);
        let optim = build_optim(&config, &model, None).unwrap();

        assert!(optim.is_bound());
        assert_eq!(optim.method(), OptimMethod::Adam);
        assert_eq!(optim.settings().model_size, 8);
        assert!(optim.state_dict().is_empty());
    }

    #[test]
    fn test_noam_rate_after_step() {
        let config = small_config();
        let model = model(&config);
        let mut optim = build_optim(&config, &model, None).unwrap();

        optim.step(ones_grads(&model)).unwrap();
        let expected = 3.0 * 8f64.powf(-0.5) * 4f64.powf(-1.5);
        assert!((optim.lr() - expected).abs() < 1e-12);
        assert_eq!(optim.step_count(), 1);
    }

    #[test]
    fn test_tied_weights_stay_equal_after_step() {
        let config = small_config();
        let model = model(&config);
        let mut optim = build_optim(&config, &model, None).unwrap();
        optim.step(ones_grads(&model)).unwrap();

        let sd = model.state_dict();
        assert_eq!(sd["encoder.embeddings.weight"], sd["decoder.embeddings.weight"]);
        assert_eq!(sd["decoder.embeddings.weight"], sd["generator.0.weight"]);
    }

    #[test]
    fn test_resume_restores_state() {
        let config = small_config();
        let model_a = model(&config);
        let mut optim = build_optim(&config, &model_a, None).unwrap();
        optim.step(ones_grads(&model_a)).unwrap();
        let checkpoint = model_a.checkpoint(Some(&optim));

        let resume_config = SummarizerConfig {
            train_from: "model_step_1.pt".to_string(),
            ..small_config()
        };
        let model_b = model(&resume_config);
        let restored = build_optim(&resume_config, &model_b, Some(&checkpoint)).unwrap();

        assert_eq!(restored.step_count(), 1);
        assert_eq!(restored.state_dict(), optim.state_dict());
    }

    #[test]
    fn test_resume_moves_state_to_gpu() {
        let config = small_config();
        let model_a = model(&config);
        let mut optim = build_optim(&config, &model_a, None).unwrap();
        optim.step(ones_grads(&model_a)).unwrap();
        let checkpoint = model_a.checkpoint(Some(&optim));

        let gpu_config = SummarizerConfig {
            train_from: "model_step_1.pt".to_string(),
            visible_gpus: VisibleGpus::Gpus(vec![0]),
            ..small_config()
        };
        let model_b = model(&gpu_config);
        let restored = build_optim(&gpu_config, &model_b, Some(&checkpoint)).unwrap();

        let state = restored.state_dict();
        for entry in state.state.values().flat_map(|s| s.values()) {
            match entry {
                StateValue::Tensor { device, .. } => assert_eq!(*device, Device::Cuda(0)),
                StateValue::Scalar(_) => {}
            }
        }
    }

    #[test]
    fn test_resume_with_empty_adam_state_fails() {
        let config = small_config();
        let model_a = model(&config);
        let optim = build_optim(&config, &model_a, None).unwrap();
        // 没有执行过任何一步，Adam 状态为空
        let checkpoint = model_a.checkpoint(Some(&optim));

        let resume_config = SummarizerConfig {
            train_from: "model_step_0.pt".to_string(),
            ..small_config()
        };
        let model_b = model(&resume_config);
        let err = build_optim(&resume_config, &model_b, Some(&checkpoint)).unwrap_err();
        assert!(matches!(err, SummarizerError::EmptyOptimizerState { .. }));
    }

    #[test]
    fn test_resume_empty_sgd_state_is_fine() {
        let config = SummarizerConfig {
            optim: OptimMethod::Sgd,
            ..small_config()
        };
        let model_a = model(&config);
        let optim = build_optim(&config, &model_a, None).unwrap();
        let checkpoint = model_a.checkpoint(Some(&optim));

        let resume_config = SummarizerConfig {
            train_from: "model_step_0.pt".to_string(),
            ..config
        };
        let model_b = model(&resume_config);
        assert!(build_optim(&resume_config, &model_b, Some(&checkpoint)).is_ok());
    }

    #[test]
    fn test_resume_without_optimizer_fails() {
        let config = small_config();
        let model_a = model(&config);
        let checkpoint = model_a.checkpoint(None);

        let resume_config = SummarizerConfig {
            train_from: "model.pt".to_string(),
            ..small_config()
        };
        let model_b = model(&resume_config);
        let err = build_optim(&resume_config, &model_b, Some(&checkpoint)).unwrap_err();
        assert!(matches!(err, SummarizerError::MissingOptimizerState(_)));
    }

    #[test]
    fn test_step_before_binding_fails() {
        let mut optim = Optim::new(OptimSettings::from_config(&small_config()));
        assert!(optim.step(BTreeMap::new()).is_err());
    }
}
