//! Compute kernels behind the model's pluggable seams.
//!
//! Only the CPU math backend ships here; alternative backends plug in through
//! [`attention::AttentionKernel`].

pub mod attention;
