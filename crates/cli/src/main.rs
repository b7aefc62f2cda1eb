//! nosrelay CLI, the main entry point.
//!
//! Commands:
//! - `onboard`  Write a default config file
//! - `serve`    Start the streaming chat gateway
//! - `config`   Show, locate or validate the configuration
//! - `tokens`   Count tokens the way the planner does

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "nosrelay",
    about = "nosrelay: streaming chat relay with token-budget planning",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Onboard,

    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Count the tokens of a text for a model
    Tokens {
        /// Model id used to pick the encoding
        #[arg(short, long, default_value = "gpt-3.5-turbo")]
        model: String,

        /// Text to count
        text: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (keys redacted)
    Show,
    /// Print the config file path
    Path,
    /// Load and validate the configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Onboard => commands::onboard::run().await?,
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
            ConfigAction::Validate => commands::config_cmd::validate().await?,
        },
        Commands::Tokens { model, text } => commands::tokens::run(&model, &text).await?,
    }

    Ok(())
}
