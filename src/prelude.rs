pub use anyhow::{anyhow, bail, Context, Result};
pub use log::{debug, error, info, trace, warn};

pub use crate::config::{self, Config};
pub use crate::envertech::frame::Serial;
pub use crate::options::Options;
pub use crate::utils::Utils;
