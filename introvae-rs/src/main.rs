//! CLI entry point for introvae-rs.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use introvae_rs::checkpoint;
use introvae_rs::{IntroVaeConfig, IntroVaeError, Result, Trainer};

#[derive(Parser)]
#[command(name = "introvae")]
#[command(about = "Train introspective variational autoencoders")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        /// Resume from the latest checkpoint in this directory
        #[arg(long)]
        resume: Option<PathBuf>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Dataset preset (mnist-28, celeba-64)
        #[arg(long, default_value = "celeba-64")]
        preset: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = IntroVaeConfig::from_file(&config)?;
            config.validate()?;
            let (c, h, w) = config.dataset.original_shape();
            println!("✓ Configuration is valid");
            println!("  Dataset: {}", config.dataset.data_path().display());
            println!("  Images: {c}x{h}x{w}");
            println!("  Latent dim: {}", config.model.latent_dim);
            println!("  Iterations: {}", config.iterations());
        }
        Commands::Train { config, resume } => {
            tracing::info!("Starting training with config: {}", config);
            let mut config = IntroVaeConfig::from_file(&config)?;
            if let Some(model_path) = resume {
                if checkpoint::latest_checkpoint(&model_path)?.is_none() {
                    return Err(IntroVaeError::checkpoint(format!(
                        "no checkpoint to resume in {}",
                        model_path.display()
                    )));
                }
                config.model_path = Some(model_path);
            }
            config.validate()?;

            let mut trainer = Trainer::new(config)?;
            trainer.train()?;
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = IntroVaeConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
