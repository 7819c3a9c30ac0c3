//! # nGPT
//!
//! A normalized transformer: every embedding, every hidden state and every
//! weight vector lives on the unit hypersphere.
//!
//! ## Components
//!
//! 1. **L2Norm**: grouped hypersphere projection with an optional tolerance band
//! 2. **Scale**: decoupled per-channel scales (`init` and learning-rate `scale`)
//! 3. **NormLinear**: projections whose rows or columns stay unit-norm, under
//!    eager (normalize on read) or lazy (renormalize after update) enforcement
//! 4. **Residual**: spherical interpolation `N(x + alpha ⊙ (N(f(x)) - x))`
//! 5. **Attention**: rotary, per-head normalized queries and keys, value residual
//! 6. **FeedForward**: scaled SiLU gating
//! 7. **NgptModel**: embedding, residual stack, scaled logits, next-token loss

pub mod config;
pub mod core;
pub mod error;
pub mod kernels;

pub use crate::config::{NetworkConfig, PerLayer};
pub use crate::core::model::{ForwardOptions, ForwardOutput, NgptModel, Prediction};
pub use crate::core::params::Parameters;
pub use crate::error::{NgptError, Result};
