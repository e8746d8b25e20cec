use crate::config::project_dirs;
use std::fs::File;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Routes tracing output to `synapse-desk.log` in the data dir. Stdout is
/// left to the chat shell.
pub fn init_logging() -> anyhow::Result<()> {
    let Some(dirs) = project_dirs() else {
        return Ok(());
    };

    let dir = dirs.data_dir().join("logs");
    std::fs::create_dir_all(&dir)?;
    let file = File::create(dir.join("synapse-desk.log"))?;

    let file_layer = fmt::layer()
        .with_writer(Arc::new(file))
        .with_ansi(false);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    Registry::default()
        .with(filter)
        .with(file_layer)
        .try_init()?;

    Ok(())
}
