pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use chrono::{DateTime, Local};
pub use derivative::Derivative;
pub use getset::Getters;
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools as _};
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use serde::{de::DeserializeOwned, Deserialize, Serialize};
pub use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    str::FromStr,
};
pub use strum::{AsRefStr, EnumString};
pub use tch::{
    kind::FLOAT_CPU,
    nn::{self, OptimizerConfig as _},
    Device, IndexOp, Kind, Tensor,
};
pub use tch_modules::{FocalLoss, FocalLossInit, NormType};
pub use tch_tensor_like::TensorLike;
