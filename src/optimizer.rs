//! 优化器
//!
//! 实现 SGD、Adagrad、Adadelta、Adam。每个优化器按参数名保存状态，
//! 状态可以导出为 `OptimizerStateDict` 写入检查点，并在恢复时重新载入。

use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::checkpoint::serde_tensor;
use crate::error::{Result, SummarizerError};
use crate::param::{Device, Param};

/// 单个状态项：张量（带设备标记）或标量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    Tensor {
        #[serde(with = "serde_tensor")]
        value: ArrayD<f32>,
        device: Device,
    },
    Scalar(f64),
}

impl StateValue {
    pub fn tensor(value: ArrayD<f32>, device: Device) -> Self {
        StateValue::Tensor { value, device }
    }

    pub fn as_tensor(&self) -> Option<&ArrayD<f32>> {
        match self {
            StateValue::Tensor { value, .. } => Some(value),
            StateValue::Scalar(_) => None,
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            StateValue::Scalar(v) => Some(*v),
            StateValue::Tensor { .. } => None,
        }
    }

    /// 张量状态的设备；标量没有设备
    pub fn device(&self) -> Option<Device> {
        match self {
            StateValue::Tensor { device, .. } => Some(*device),
            StateValue::Scalar(_) => None,
        }
    }

    /// 把张量状态移动到指定设备，标量不变
    pub fn to_device(&mut self, target: Device) {
        if let StateValue::Tensor { device, .. } = self {
            *device = target;
        }
    }
}

/// 一个参数的全部状态（如 `step`、`exp_avg`、`exp_avg_sq`）
pub type ParamState = BTreeMap<String, StateValue>;

/// 参数组
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub lr: f64,
    /// 组内参数名，按绑定顺序
    pub params: Vec<String>,
}

/// 优化器状态快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerStateDict {
    pub state: BTreeMap<String, ParamState>,
    pub param_groups: Vec<ParamGroup>,
}

impl OptimizerStateDict {
    /// 有状态的参数个数
    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// 把所有张量状态移动到指定设备
    pub fn to_device(&mut self, device: Device) {
        for entry in self.state.values_mut().flat_map(|s| s.values_mut()) {
            entry.to_device(device);
        }
    }
}

/// 绑定的参数、学习率和按参数名索引的状态
#[derive(Debug, Clone, Default)]
pub struct BoundParams {
    lr: f64,
    params: Vec<(String, Param)>,
    state: BTreeMap<String, ParamState>,
}

impl BoundParams {
    pub fn new(params: Vec<(String, Param)>, lr: f64) -> Self {
        Self {
            lr,
            params,
            state: BTreeMap::new(),
        }
    }

    pub fn params(&self) -> &[(String, Param)] {
        &self.params
    }

    pub fn state(&self) -> &BTreeMap<String, ParamState> {
        &self.state
    }

    fn state_for(&mut self, name: &str) -> &mut ParamState {
        self.state.entry(name.to_string()).or_default()
    }
}

/// 取出（必要时初始化）张量状态
fn tensor_entry<'a>(
    state: &'a mut ParamState,
    key: &str,
    shape: &[usize],
    device: Device,
    init: f32,
) -> Result<&'a mut ArrayD<f32>> {
    let entry = state
        .entry(key.to_string())
        .or_insert_with(|| StateValue::tensor(ArrayD::from_elem(IxDyn(shape), init), device));
    match entry {
        StateValue::Tensor { value, .. } if value.shape() == shape => Ok(value),
        _ => Err(SummarizerError::OptimizerStateMismatch(format!(
            "state `{key}` is not a tensor of shape {shape:?}"
        ))),
    }
}

/// 取出（必要时初始化为 0）标量状态
fn scalar_entry<'a>(state: &'a mut ParamState, key: &str) -> Result<&'a mut f64> {
    match state.entry(key.to_string()).or_insert(StateValue::Scalar(0.0)) {
        StateValue::Scalar(v) => Ok(v),
        StateValue::Tensor { .. } => Err(SummarizerError::OptimizerStateMismatch(format!(
            "state `{key}` should be a scalar"
        ))),
    }
}

/// 优化器 trait
///
/// 实现者只需提供单个参数的更新规则；遍历、状态导出与载入由默认方法完成。
pub trait Optimizer: fmt::Debug {
    /// 优化器名称
    fn name(&self) -> &str;

    fn bound(&self) -> &BoundParams;

    fn bound_mut(&mut self) -> &mut BoundParams;

    /// 用梯度更新一个参数
    fn update_param(&mut self, name: &str, param: &Param, grad: &ArrayD<f32>) -> Result<()>;

    /// 获取当前学习率
    fn lr(&self) -> f64 {
        self.bound().lr
    }

    /// 设置学习率
    fn set_lr(&mut self, lr: f64) {
        self.bound_mut().lr = lr;
    }

    /// 对所有有梯度的绑定参数做一次更新
    fn step(&mut self, grads: &BTreeMap<String, ArrayD<f32>>) -> Result<()> {
        let params = self.bound().params.clone();
        for (name, param) in &params {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            if grad.shape() != param.shape().as_slice() {
                return Err(SummarizerError::shape(format!("grad of {name}"), &param.shape(), grad.shape()));
            }
            self.update_param(name, param, grad)?;
        }
        Ok(())
    }

    /// 导出状态
    fn state_dict(&self) -> OptimizerStateDict {
        let bound = self.bound();
        OptimizerStateDict {
            state: bound.state.clone(),
            param_groups: vec![ParamGroup {
                lr: bound.lr,
                params: bound.params.iter().map(|(n, _)| n.clone()).collect(),
            }],
        }
    }

    /// 载入状态
    ///
    /// 参数组数量、组大小、参数名以及张量状态的形状都必须与当前绑定一致。
    fn load_state_dict(&mut self, state_dict: OptimizerStateDict) -> Result<()> {
        let bound = self.bound();
        let [group] = state_dict.param_groups.as_slice() else {
            return Err(SummarizerError::OptimizerStateMismatch(format!(
                "expected 1 parameter group, got {}",
                state_dict.param_groups.len()
            )));
        };
        if group.params.len() != bound.params.len() {
            return Err(SummarizerError::OptimizerStateMismatch(format!(
                "parameter group has {} parameters, optimizer is bound to {}",
                group.params.len(),
                bound.params.len()
            )));
        }

        let shapes: BTreeMap<&str, Vec<usize>> =
            bound.params.iter().map(|(n, p)| (n.as_str(), p.shape())).collect();
        let saved: BTreeSet<&str> = group.params.iter().map(String::as_str).collect();
        if let Some(name) = shapes.keys().find(|n| !saved.contains(*n)) {
            return Err(SummarizerError::OptimizerStateMismatch(format!(
                "parameter `{name}` is missing from the saved parameter group"
            )));
        }

        for (name, param_state) in &state_dict.state {
            let Some(shape) = shapes.get(name.as_str()) else {
                return Err(SummarizerError::OptimizerStateMismatch(format!(
                    "state for unknown parameter `{name}`"
                )));
            };
            for (key, value) in param_state {
                if let Some(tensor) = value.as_tensor() {
                    if tensor.shape() != shape.as_slice() {
                        return Err(SummarizerError::shape(format!("{name}.{key}"), shape, tensor.shape()));
                    }
                }
            }
        }

        let lr = group.lr;
        let bound = self.bound_mut();
        bound.lr = lr;
        bound.state = state_dict.state;
        Ok(())
    }
}

/// SGD
///
/// ```text
/// param = param - lr * grad
/// ```
#[derive(Debug, Clone)]
pub struct Sgd {
    bound: BoundParams,
}

impl Sgd {
    pub fn new(params: Vec<(String, Param)>, lr: f64) -> Self {
        Self {
            bound: BoundParams::new(params, lr),
        }
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        "sgd"
    }

    fn bound(&self) -> &BoundParams {
        &self.bound
    }

    fn bound_mut(&mut self) -> &mut BoundParams {
        &mut self.bound
    }

    fn update_param(&mut self, _name: &str, param: &Param, grad: &ArrayD<f32>) -> Result<()> {
        let lr = self.bound.lr as f32;
        param.update(|p| p.zip_mut_with(grad, |p, &g| *p -= lr * g));
        Ok(())
    }
}

/// Adagrad
///
/// ```text
/// sum += grad²
/// param = param - lr * grad / (√sum + ε)
/// ```
#[derive(Debug, Clone)]
pub struct Adagrad {
    bound: BoundParams,
    initial_accumulator_value: f32,
    eps: f32,
}

impl Adagrad {
    pub fn new(params: Vec<(String, Param)>, lr: f64, initial_accumulator_value: f64) -> Self {
        Self {
            bound: BoundParams::new(params, lr),
            initial_accumulator_value: initial_accumulator_value as f32,
            eps: 1e-10,
        }
    }
}

impl Optimizer for Adagrad {
    fn name(&self) -> &str {
        "adagrad"
    }

    fn bound(&self) -> &BoundParams {
        &self.bound
    }

    fn bound_mut(&mut self) -> &mut BoundParams {
        &mut self.bound
    }

    fn update_param(&mut self, name: &str, param: &Param, grad: &ArrayD<f32>) -> Result<()> {
        let lr = self.bound.lr as f32;
        let (eps, init) = (self.eps, self.initial_accumulator_value);
        let state = self.bound.state_for(name);

        *scalar_entry(state, "step")? += 1.0;
        let sum = tensor_entry(state, "sum", grad.shape(), param.device(), init)?;
        sum.zip_mut_with(grad, |s, &g| *s += g * g);

        param.update(|p| {
            Zip::from(p).and(&*sum).and(grad).for_each(|p, &s, &g| {
                *p -= lr * g / (s.sqrt() + eps);
            })
        });
        Ok(())
    }
}

/// Adadelta
///
/// ```text
/// square_avg = ρ * square_avg + (1 - ρ) * grad²
/// delta = √(acc_delta + ε) / √(square_avg + ε) * grad
/// acc_delta = ρ * acc_delta + (1 - ρ) * delta²
/// param = param - lr * delta
/// ```
#[derive(Debug, Clone)]
pub struct Adadelta {
    bound: BoundParams,
    rho: f32,
    eps: f32,
}

impl Adadelta {
    pub fn new(params: Vec<(String, Param)>, lr: f64) -> Self {
        Self {
            bound: BoundParams::new(params, lr),
            rho: 0.9,
            eps: 1e-6,
        }
    }
}

impl Optimizer for Adadelta {
    fn name(&self) -> &str {
        "adadelta"
    }

    fn bound(&self) -> &BoundParams {
        &self.bound
    }

    fn bound_mut(&mut self) -> &mut BoundParams {
        &mut self.bound
    }

    fn update_param(&mut self, name: &str, param: &Param, grad: &ArrayD<f32>) -> Result<()> {
        let lr = self.bound.lr as f32;
        let (rho, eps) = (self.rho, self.eps);
        let device = param.device();
        let state = self.bound.state_for(name);

        *scalar_entry(state, "step")? += 1.0;
        let square_avg = {
            let sq = tensor_entry(state, "square_avg", grad.shape(), device, 0.0)?;
            sq.zip_mut_with(grad, |s, &g| *s = rho * *s + (1.0 - rho) * g * g);
            sq.clone()
        };

        let acc_delta = tensor_entry(state, "acc_delta", grad.shape(), device, 0.0)?;
        let mut delta = grad.clone();
        Zip::from(&mut delta)
            .and(&square_avg)
            .and(&*acc_delta)
            .for_each(|d, &sq, &acc| *d *= (acc + eps).sqrt() / (sq + eps).sqrt());
        acc_delta.zip_mut_with(&delta, |a, &d| *a = rho * *a + (1.0 - rho) * d * d);

        param.update(|p| p.zip_mut_with(&delta, |p, &d| *p -= lr * d));
        Ok(())
    }
}

/// Adam 优化器
///
/// ```text
/// m = β1 * m + (1 - β1) * grad
/// v = β2 * v + (1 - β2) * grad²
/// param = param - lr * √(1 - β2^t) / (1 - β1^t) * m / (√v + ε)
/// ```
#[derive(Debug, Clone)]
pub struct Adam {
    bound: BoundParams,
    beta1: f32,
    beta2: f32,
    eps: f32,
}

impl Adam {
    pub fn new(params: Vec<(String, Param)>, lr: f64, betas: (f64, f64)) -> Self {
        Self {
            bound: BoundParams::new(params, lr),
            beta1: betas.0 as f32,
            beta2: betas.1 as f32,
            eps: 1e-9,
        }
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        "adam"
    }

    fn bound(&self) -> &BoundParams {
        &self.bound
    }

    fn bound_mut(&mut self) -> &mut BoundParams {
        &mut self.bound
    }

    fn update_param(&mut self, name: &str, param: &Param, grad: &ArrayD<f32>) -> Result<()> {
        let lr = self.bound.lr as f32;
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.eps);
        let device = param.device();
        let state = self.bound.state_for(name);

        let step = {
            let step = scalar_entry(state, "step")?;
            *step += 1.0;
            *step as i32
        };

        let exp_avg = {
            let m = tensor_entry(state, "exp_avg", grad.shape(), device, 0.0)?;
            m.zip_mut_with(grad, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
            m.clone()
        };
        let exp_avg_sq = tensor_entry(state, "exp_avg_sq", grad.shape(), device, 0.0)?;
        exp_avg_sq.zip_mut_with(grad, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

        // 偏差修正
        let bias_correction1 = 1.0 - beta1.powi(step);
        let bias_correction2 = 1.0 - beta2.powi(step);
        let step_size = lr * bias_correction2.sqrt() / bias_correction1;

        param.update(|p| {
            Zip::from(p)
                .and(&exp_avg)
                .and(&*exp_avg_sq)
                .for_each(|p, &m, &v| *p -= step_size * m / (v.sqrt() + eps));
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn bound_pair() -> (Param, Vec<(String, Param)>) {
        let w = Param::new(arr2(&[[1.0f32, 2.0], [3.0, 4.0]]));
        let params = vec![("w".to_string(), w.clone())];
        (w, params)
    }

    fn grads(value: f32) -> BTreeMap<String, ArrayD<f32>> {
        let mut g = BTreeMap::new();
        g.insert("w".to_string(), ArrayD::from_elem(IxDyn(&[2, 2]), value));
        g
    }

    #[test]
    fn test_sgd() {
        let (w, params) = bound_pair();
        let mut sgd = Sgd::new(params, 0.1);
        sgd.step(&grads(1.0)).unwrap();

        assert!((w.matrix().unwrap()[[0, 0]] - 0.9).abs() < 1e-6);
        assert!(sgd.state_dict().is_empty());
    }

    #[test]
    fn test_adam_first_step() {
        let (w, params) = bound_pair();
        let mut adam = Adam::new(params, 0.01, (0.9, 0.999));
        adam.step(&grads(0.5)).unwrap();

        // 第一步的更新量约等于 lr
        assert!((w.matrix().unwrap()[[0, 0]] - 0.99).abs() < 1e-4);

        let sd = adam.state_dict();
        assert_eq!(sd.len(), 1);
        let state = &sd.state["w"];
        assert_eq!(state["step"].as_scalar(), Some(1.0));
        assert!(state.contains_key("exp_avg"));
        assert!(state.contains_key("exp_avg_sq"));
        assert_eq!(sd.param_groups[0].params, vec!["w".to_string()]);
    }

    #[test]
    fn test_adagrad_and_adadelta_move_against_gradient() {
        let (w, params) = bound_pair();
        let mut adagrad = Adagrad::new(params, 0.1, 0.1);
        adagrad.step(&grads(1.0)).unwrap();
        assert!(w.matrix().unwrap()[[1, 1]] < 4.0);
        assert!(adagrad.state_dict().state["w"].contains_key("sum"));

        let (w, params) = bound_pair();
        let mut adadelta = Adadelta::new(params, 1.0);
        adadelta.step(&grads(1.0)).unwrap();
        assert!(w.matrix().unwrap()[[1, 1]] < 4.0);
        assert!(adadelta.state_dict().state["w"].contains_key("acc_delta"));
    }

    #[test]
    fn test_grad_shape_checked() {
        let (_, params) = bound_pair();
        let mut sgd = Sgd::new(params, 0.1);
        let mut bad = BTreeMap::new();
        bad.insert("w".to_string(), arr1(&[1.0f32, 2.0]).into_dyn());
        assert!(sgd.step(&bad).is_err());
    }

    #[test]
    fn test_load_state_dict_roundtrip() {
        let (_, params) = bound_pair();
        let mut adam = Adam::new(params.clone(), 0.01, (0.9, 0.998));
        adam.step(&grads(1.0)).unwrap();
        let saved = adam.state_dict();

        let mut fresh = Adam::new(params, 0.5, (0.9, 0.998));
        assert!(fresh.state_dict().is_empty());
        fresh.load_state_dict(saved.clone()).unwrap();
        assert_eq!(fresh.state_dict(), saved);
        assert!((fresh.lr() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_load_state_dict_rejects_mismatch() {
        let (_, params) = bound_pair();
        let mut adam = Adam::new(params, 0.01, (0.9, 0.998));
        adam.step(&grads(1.0)).unwrap();
        let saved = adam.state_dict();

        // 参数名不同
        let other = vec![("v".to_string(), Param::new(arr2(&[[0.0f32, 0.0], [0.0, 0.0]])))];
        let mut renamed = Adam::new(other, 0.01, (0.9, 0.998));
        assert!(matches!(
            renamed.load_state_dict(saved.clone()),
            Err(SummarizerError::OptimizerStateMismatch(_))
        ));

        // 参数组大小不同
        let (_, mut params) = bound_pair();
        params.push(("b".to_string(), Param::new(arr1(&[0.0f32]))));
        let mut bigger = Adam::new(params, 0.01, (0.9, 0.998));
        assert!(bigger.load_state_dict(saved.clone()).is_err());

        // 形状不同
        let reshaped = vec![("w".to_string(), Param::new(arr1(&[0.0f32, 0.0, 0.0, 0.0])))];
        let mut wrong_shape = Adam::new(reshaped, 0.01, (0.9, 0.998));
        assert!(wrong_shape.load_state_dict(saved).is_err());
    }

    #[test]
    fn test_state_to_device() {
        let (_, params) = bound_pair();
        let mut adam = Adam::new(params, 0.01, (0.9, 0.998));
        adam.step(&grads(1.0)).unwrap();

        let mut sd = adam.state_dict();
        sd.to_device(Device::Cuda(0));
        let state = &sd.state["w"];
        assert_eq!(state["exp_avg"].device(), Some(Device::Cuda(0)));
        assert_eq!(state["step"].device(), None);
    }
}
