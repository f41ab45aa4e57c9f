use anyhow::Context;
use config::Config;
use serde::Deserialize;
use std::path::PathBuf;

/// Reads any serde type from a config file; the format follows the extension.
pub fn load_cfg<T: for<'a> Deserialize<'a>>(path: impl AsRef<str>) -> anyhow::Result<T> {
    let cfg = Config::builder()
        .add_source(config::File::from(PathBuf::from(path.as_ref())))
        .build()
        .with_context(|| format!("failed to read stream config from {}", path.as_ref()))?;

    cfg.try_deserialize()
        .with_context(|| format!("failed to deserialize stream config from {}", path.as_ref()))
}
