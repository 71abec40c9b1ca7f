//! Configuration view and validation commands (`stagegate config`).

use std::path::Path;

use anyhow::Result;

use stagegate::config::{CONFIG_FILE, StagegateToml, config_dir};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let dir = config_dir(project_dir);
    let config_path = dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Stagegate Configuration");
            println!("=======================");
            println!();

            let mut toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                StagegateToml::load(&config_path)?
            } else {
                println!("No stagegate.toml found at {}", config_path.display());
                println!("Using default configuration.");
                StagegateToml::default()
            };
            println!();

            // Show effective values (including env overrides)
            toml.apply_env();
            print_config(&toml);

            if !config_path.exists() {
                println!("Run 'stagegate config init' to create a stagegate.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No stagegate.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = StagegateToml::load(&config_path)?;
            let warnings = toml.validate();

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
                println!("stagegate.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&dir)?;
            StagegateToml::default().save(&config_path)?;

            println!("Created stagegate.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [reviews] capacity, timeout and stage whitelist");
            println!("  - [context] budget for prompt generation");
            println!("  - [generator] command used to draft artifacts");
            println!();
        }
    }

    Ok(())
}

fn print_config(toml: &StagegateToml) {
    println!("[reviews]");
    println!(
        "  max_concurrent_reviews = {}",
        toml.reviews.max_concurrent_reviews
    );
    println!("  timeout_secs = {}", toml.reviews.timeout_secs);
    println!("  max_content_length = {}", toml.reviews.max_content_length);
    println!(
        "  valid_pipeline_stages = [{}]",
        toml.reviews
            .valid_pipeline_stages
            .iter()
            .map(|s| format!("\"{}\"", s))
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  sweep_interval_secs = {}", toml.reviews.sweep_interval_secs);
    println!();

    println!("[context]");
    println!("  budget = \"{}\"", toml.context.budget);
    println!("  model_window_chars = {}", toml.context.model_window_chars);
    println!("  related_top_k = {}", toml.context.related_top_k);
    println!("  max_excerpt_chars = {}", toml.context.max_excerpt_chars);
    println!();

    println!("[generator]");
    println!("  command = \"{}\"", toml.generator.command);
    if !toml.generator.args.is_empty() {
        println!("  args = {:?}", toml.generator.args);
    }
    println!("  timeout_secs = {}", toml.generator.timeout_secs);
    println!();

    println!("[server]");
    println!("  host = \"{}\"", toml.server.host);
    println!("  port = {}", toml.server.port);
    println!();
}
