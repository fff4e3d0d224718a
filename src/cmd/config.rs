//! Configuration view and validation commands (`anvil config`).

use anyhow::Result;
use anvil::config::{AnvilConfig, AnvilToml, CONFIG_FILE_NAME};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = AnvilConfig::new(project_dir.to_path_buf())?;
    let config_path = config.config_path();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Anvil Configuration");
            println!("===================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}", CONFIG_FILE_NAME, config_path.display());
                println!("Using default configuration.");
            }
            println!();
            print_toml(&config.toml);

            println!("Resolved paths:");
            println!("  database = \"{}\"", config.db_path().display());
            println!("  workspaces = \"{}\"", config.workspace_root().display());
            println!();

            if !config_path.exists() {
                println!("Run 'anvil config init' to create an anvil.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE_NAME);
                return Ok(());
            }

            let warnings = config.toml.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE_NAME, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !config.anvil_dir.exists() {
                std::fs::create_dir_all(&config.anvil_dir)?;
            }

            AnvilToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE_NAME, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [build] max_iterations, plan_retry_limit, timeouts");
            println!("  - [validation.lint] and [validation.test] commands");
            println!("  - [reasoning] endpoint and retry policy");
            println!("  - [escalation] webhook_url for out-of-band review");
            println!();
        }
    }

    Ok(())
}

fn print_toml(toml: &AnvilToml) {
    println!("[server]");
    println!("  host = \"{}\"", toml.server.host);
    println!("  port = {}", toml.server.port);
    println!("  db_path = \"{}\"", toml.server.db_path.display());
    println!();

    println!("[build]");
    println!("  max_iterations = {}", toml.build.max_iterations);
    println!("  plan_retry_limit = {}", toml.build.plan_retry_limit);
    let t = &toml.build.timeouts;
    println!(
        "  timeouts = plan {}s, synthesize {}s, validate {}s, test {}s",
        t.plan_secs, t.synthesize_secs, t.validate_secs, t.test_secs
    );
    println!();

    println!("[validation]");
    println!("  lint = \"{}\"", toml.validation.lint.display());
    println!("  test = \"{}\"", toml.validation.test.display());
    println!();

    println!("[reasoning]");
    println!("  endpoint = \"{}\"", toml.reasoning.endpoint);
    println!("  transient_retries = {}", toml.reasoning.transient_retries);
    println!();

    if let Some(url) = &toml.escalation.webhook_url {
        println!("[escalation]");
        println!("  webhook_url = \"{}\"", url);
        println!();
    }

    println!("[logging]");
    println!("  level = \"{}\"", toml.logging.level);
    println!("  format = {:?}", toml.logging.format);
    println!();
}
