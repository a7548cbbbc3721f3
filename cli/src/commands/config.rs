// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `ensemble config` subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use ensemble_core::domain::config::{LLMConfig, OrchestratorConfig};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration as YAML
    Show,

    /// Check a configuration file without composing
    Validate {
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Write a starter configuration file
    Generate {
        #[arg(short, long, default_value = "./ensemble-config.yaml")]
        output: PathBuf,

        /// Fill in sample model and generator endpoints
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let config = load(config_override)?;
            print!("{}", config.to_yaml_string()?);
        }
        ConfigCommand::Validate { file } => {
            load(file.or(config_override))?
                .validate()
                .context("Configuration validation failed")?;
            println!("{}", "✓ Configuration is valid".green());
        }
        ConfigCommand::Generate { output, examples } => {
            std::fs::write(&output, sample_config(examples).to_yaml_string()?)
                .with_context(|| format!("Failed to write config to {:?}", output))?;
            println!("{}", format!("✓ Wrote {}", output.display()).green());
        }
    }
    Ok(())
}

fn load(path: Option<PathBuf>) -> Result<OrchestratorConfig> {
    OrchestratorConfig::load_or_default(path).context("Failed to load configuration")
}

fn sample_config(with_examples: bool) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    if with_examples {
        config.generator.endpoint = Some("http://localhost:8765".to_string());
        config.llm = Some(LLMConfig {
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: Some("env:OPENAI_API_KEY".to_string()),
            model: "gpt-4o".to_string(),
        });
    }
    config
}
