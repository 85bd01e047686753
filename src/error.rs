//! 错误类型
//!
//! 模型组装、检查点恢复和优化器恢复过程中的所有致命错误。

use thiserror::Error;

/// 本 crate 的结果类型
pub type Result<T> = std::result::Result<T, SummarizerError>;

/// 摘要模型错误
#[derive(Debug, Error)]
pub enum SummarizerError {
    /// 配置不合法（例如 hier 模式下 inter_att 既不是 2 也不是 3）
    #[error("invalid configuration: {0}")]
    Config(String),

    /// 从检查点恢复 Adam 之后状态为空
    #[error("optimizer state is empty after restoring from checkpoint (method `{method}`)")]
    EmptyOptimizerState { method: String },

    /// 继续训练但检查点中没有优化器
    #[error("checkpoint has no `optim` entry, cannot resume from `{0}`")]
    MissingOptimizerState(String),

    /// 严格加载时参数名不一致
    #[error("state dict mismatch: missing keys {missing:?}, unexpected keys {unexpected:?}")]
    StateDictMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    /// 张量形状不一致
    #[error("shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// 优化器状态与当前绑定的参数不匹配
    #[error("optimizer state does not match bound parameters: {0}")]
    OptimizerStateMismatch(String),

    /// token 超出词表
    #[error("token id {token} is out of range for vocabulary of size {vocab_size}")]
    TokenOutOfRange { token: usize, vocab_size: usize },

    /// 源序列没有任何 token
    #[error("source has no tokens (shape {0:?})")]
    EmptySource(Vec<usize>),

    /// 去掉最后一个 token 后目标序列为空
    #[error("target sequence of length {0} leaves nothing to decode")]
    EmptyTarget(usize),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化错误
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// 二进制序列化错误
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl SummarizerError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SummarizerError::Config(msg.into())
    }

    pub(crate) fn shape(name: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        SummarizerError::ShapeMismatch {
            name: name.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
