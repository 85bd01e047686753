//! # Abstractive Summarizer
//!
//! 基于 ndarray 的抽象式摘要 Seq2Seq 模型组装：编码器（普通或层次化）、
//! 解码器、生成器、权重共享、检查点恢复和优化器状态管理。
//!
//! ## 架构概览
//!
//! ```text
//! src blocks → Embedding → Encoder ──────────────┐
//!     ├── TransformerEncoder（拼接后自注意力）     │ features, mask_hier
//!     └── TransformerInterEncoder（段内 + 段间）   │
//! tgt[..L-1] → Embedding → Decoder ←─────────────┘
//!     ├── Masked Self-Attention
//!     ├── Context Attention
//!     └── Feed Forward
//! → Generator (Linear + LogSoftmax)
//! ```
//!
//! 共享权重通过 `Param` 的引用计数存储实现：源端 / 目标端嵌入、
//! 解码器嵌入 / 生成器投影可以在构建时绑定到同一份张量。

pub mod error;
pub mod config;
pub mod param;
pub mod tensor;
pub mod layers;
pub mod embedding;
pub mod attention;
pub mod encoder;
pub mod decoder;
pub mod generator;
pub mod loss;
pub mod optimizer;
pub mod lr_scheduler;
pub mod gradient_clip;
pub mod optim;
pub mod checkpoint;
pub mod model_builder;

pub use error::{Result, SummarizerError};
pub use config::{DecayMethod, OptimMethod, SummarizerConfig, VisibleGpus};
pub use param::{Device, Module, Param, StateDict};
pub use tensor::TensorExt;
pub use layers::{Dropout, LayerNorm, Linear, PositionwiseFeedForward};
pub use embedding::{Embedding, PositionalEncoding};
pub use attention::{MultiHeadedAttention, MultiHeadedPooling};
pub use encoder::{
    Encoder, EncoderKind, EncoderOutput, EncoderSpec, InterAttVersion, TransformerEncoder,
    TransformerInterEncoder,
};
pub use decoder::{DecoderState, TransformerDecoder};
pub use generator::{build_generator, Generator};
pub use loss::{LossStats, NmtLoss};
pub use optimizer::{Adadelta, Adagrad, Adam, Optimizer, OptimizerStateDict, Sgd, StateValue};
pub use lr_scheduler::{LRScheduler, NoamLR, StepDecayLR};
pub use gradient_clip::{clip_grad_norm, global_grad_norm};
pub use optim::{build_optim, Optim, OptimSettings, OptimSnapshot};
pub use checkpoint::{migrate_legacy_keys, Checkpoint, SerializableTensor};
pub use model_builder::Summarizer;
