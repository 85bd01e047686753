//! 参数存储与模块遍历
//!
//! `Param` 是引用计数的共享存储：同一个 `Param` 的多个克隆就是绑定（tied）
//! 在一起的权重，任何一处的更新对另一处立即可见。

use ndarray::{Array, Array1, Array2, ArrayD, Dimension, Ix1, Ix2};
use serde::{Deserialize, Serialize};
use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{Result, SummarizerError};

/// 参数名到张量的映射（与检查点中的 "model" 部分对应）
pub type StateDict = BTreeMap<String, ArrayD<f32>>;

/// 计算设备
///
/// ndarray 后端只有主机内存，设备是张量的放置标记；
/// 所有放置操作都在构造或恢复时一次性完成。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl Device {
    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(i) => write!(f, "cuda:{i}"),
        }
    }
}

#[derive(Debug)]
struct ParamData {
    value: ArrayD<f32>,
    device: Device,
}

/// 可训练参数
#[derive(Debug, Clone)]
pub struct Param(Rc<RefCell<ParamData>>);

impl Param {
    pub fn new<D: Dimension>(value: Array<f32, D>) -> Self {
        Self(Rc::new(RefCell::new(ParamData {
            value: value.into_dyn(),
            device: Device::Cpu,
        })))
    }

    pub fn shape(&self) -> Vec<usize> {
        self.0.borrow().value.shape().to_vec()
    }

    pub fn ndim(&self) -> usize {
        self.0.borrow().value.ndim()
    }

    pub fn numel(&self) -> usize {
        self.0.borrow().value.len()
    }

    /// 借用当前值
    pub fn value(&self) -> Ref<'_, ArrayD<f32>> {
        Ref::map(self.0.borrow(), |d| &d.value)
    }

    /// 当前值的拷贝
    pub fn to_array(&self) -> ArrayD<f32> {
        self.0.borrow().value.clone()
    }

    /// 以二维矩阵取出（权重）
    pub fn matrix(&self) -> Result<Array2<f32>> {
        let data = self.0.borrow();
        let shape = data.value.shape().to_vec();
        data.value
            .clone()
            .into_dimensionality::<Ix2>()
            .map_err(|_| SummarizerError::shape("matrix parameter", &[0, 0], &shape))
    }

    /// 以一维向量取出（偏置、归一化参数）
    pub fn vector(&self) -> Result<Array1<f32>> {
        let data = self.0.borrow();
        let shape = data.value.shape().to_vec();
        data.value
            .clone()
            .into_dimensionality::<Ix1>()
            .map_err(|_| SummarizerError::shape("vector parameter", &[0], &shape))
    }

    /// 替换参数值，形状必须一致
    pub fn set(&self, name: &str, value: ArrayD<f32>) -> Result<()> {
        let mut data = self.0.borrow_mut();
        if data.value.shape() != value.shape() {
            return Err(SummarizerError::shape(name, data.value.shape(), value.shape()));
        }
        data.value = value;
        Ok(())
    }

    /// 原地修改参数值
    pub fn update<R>(&self, f: impl FnOnce(&mut ArrayD<f32>) -> R) -> R {
        f(&mut self.0.borrow_mut().value)
    }

    pub fn device(&self) -> Device {
        self.0.borrow().device
    }

    pub fn to_device(&self, device: Device) {
        self.0.borrow_mut().device = device;
    }

    /// 两个参数是否共享同一份存储
    pub fn shares_storage(&self, other: &Param) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// 带参数的网络模块
pub trait Module {
    /// 以 `prefix.name` 的形式收集参数；绑定的权重在每个槽位各出现一次
    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Param)>);

    /// 切换训练 / 推理模式
    fn set_training(&mut self, _training: bool) {}

    /// 所有参数槽位
    fn named_params(&self, prefix: &str) -> Vec<(String, Param)> {
        let mut out = Vec::new();
        self.collect_params(prefix, &mut out);
        out
    }
}

/// 拼接参数名
pub fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// 去掉共享存储的重复槽位，保留第一次出现的名字
pub fn dedup_params(params: Vec<(String, Param)>) -> Vec<(String, Param)> {
    let mut unique: Vec<(String, Param)> = Vec::with_capacity(params.len());
    for (name, param) in params {
        if !unique.iter().any(|(_, p)| p.shares_storage(&param)) {
            unique.push((name, param));
        }
    }
    unique
}
