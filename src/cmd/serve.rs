//! Build status server command (`anvil serve`).

use std::path::{Path, PathBuf};

use anyhow::Result;
use anvil::config::AnvilConfig;
use anvil::factory::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    project_dir: &Path,
    verbose: bool,
    host: Option<String>,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    let config = AnvilConfig::new(project_dir.to_path_buf())?.with_overrides(host, port, db_path, dev);
    let warnings = config.toml.validate();

    let mut logging = config.toml.logging.clone();
    logging.log_dir = logging.log_dir.map(|dir| config.resolve(&dir));
    let _guard = anvil::logging::init(&logging, verbose)?;
    for warning in &warnings {
        tracing::warn!(%warning, "configuration warning");
    }
    config.build_config().validate()?;

    start_server(ServerConfig::from_config(&config)).await
}
