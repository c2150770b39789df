pub use anyhow::{ensure, format_err, Result};
pub use itertools::Itertools;
pub use log::debug;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    fmt::{self, Display, Formatter},
    str::FromStr,
};
pub use strum::{AsRefStr, EnumString};
pub use tch::{Device, Kind, Tensor};

