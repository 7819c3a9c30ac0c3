//! Core module: hypersphere normalization, norm-constrained projections,
//! residual fusion, attention and feedforward blocks, and the network.

pub mod attention;
pub mod feedforward;
pub mod l2norm;
pub mod model;
pub mod norm_linear;
pub mod params;
pub mod residual;
pub mod rotary;
pub mod scale;
