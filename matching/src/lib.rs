//! Patch matching between SAR and optical images.
//!
//! A generator predicts a classification score map and a center-offset map.
//! The offsets are decoded against a fixed center grid into 512x512 boxes and
//! the box at the best scoring pixel is taken as the prediction.

mod common;

pub mod checkpoint;
pub mod config;
pub mod decode;
pub mod metric;
pub mod model;
pub mod result;
pub mod utils;

pub use config::{
    Config, GeneratorConfig, GeneratorRegistry, Loss, LossConfig, Model, ModelConfig,
};
pub use decode::{CenterGrid, BOX_SIDE};
pub use model::*;
