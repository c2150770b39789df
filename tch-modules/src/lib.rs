//! Loss building blocks on top of tch.

mod common;
pub mod focal_loss;
pub mod label;

pub use focal_loss::*;
pub use label::*;
