//! Project initialization command (`anvil init`).
//!
//! ```text
//! .anvil/
//! ├── anvil.toml       # Default configuration (kept if present)
//! ├── anvil.db         # Factory database with schema applied
//! └── workspaces/      # Per-factory trees and snapshot objects
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use anvil::config::{AnvilConfig, AnvilToml};
use anvil::factory::db::FactoryDb;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    let config = AnvilConfig::new(project_dir.to_path_buf())?;
    let created = !config.anvil_dir.exists();

    std::fs::create_dir_all(&config.anvil_dir)
        .with_context(|| format!("Failed to create directory: {}", config.anvil_dir.display()))?;

    let config_path = config.config_path();
    if !config_path.exists() {
        AnvilToml::default().save(&config_path)?;
    }

    let workspace_root = config.workspace_root();
    std::fs::create_dir_all(&workspace_root).with_context(|| {
        format!("Failed to create workspace root: {}", workspace_root.display())
    })?;

    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    FactoryDb::new(&db_path)?;

    println!();
    if created {
        println!("Initialized anvil project at {}", config.anvil_dir.display());
    } else {
        println!("Anvil project already initialized at {}", config.anvil_dir.display());
        println!("Missing pieces were recreated; existing files were left alone.");
    }
    println!();
    println!("  config:     {}", config_path.display());
    println!("  database:   {}", db_path.display());
    println!("  workspaces: {}", workspace_root.display());
    println!();
    println!("Next steps:");
    println!("  1. Point [reasoning] endpoint at your planning service");
    println!("  2. Run 'anvil serve' to start accepting feature requests");
    println!();

    Ok(())
}
