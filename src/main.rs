use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use aquatrack::{chart, chat, constants, web_server, FootprintEstimator, GeminiClient, GeminiConfig};

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    gemini: GeminiArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct GeminiArgs {
    /// Gemini API key (falls back to API_KEY).
    #[arg(long, global = true, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model used for both estimates and chat.
    #[arg(long, global = true, env = "AQUATRACK_MODEL", default_value = constants::DEFAULT_MODEL)]
    model: String,

    /// Base URL of the Gemini API.
    #[arg(long, global = true, env = "GEMINI_API_BASE", default_value = constants::DEFAULT_API_BASE)]
    api_base: String,
}

impl GeminiArgs {
    fn into_config(self) -> GeminiConfig {
        let api_key = self
            .api_key
            .or_else(|| std::env::var(constants::FALLBACK_API_KEY_VAR).ok());
        GeminiConfig::new(api_key)
            .with_model(self.model)
            .with_base_url(self.api_base)
    }
}

// Define the available subcommands
#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the AquaTrack web server.
    Serve {
        #[arg(long, env = "AQUATRACK_PORT", default_value_t = constants::DEFAULT_PORT, help = "Port for the web server.")]
        port: u16,
    },
    /// Estimate the water footprint of a single item.
    Estimate {
        /// The item, e.g. "1 cup of coffee".
        item: String,
        #[arg(long, help = "Print the raw result as JSON.")]
        json: bool,
    },
    /// Chat with Aqua, the water conservation assistant, in the terminal.
    Chat,
}

/// The estimator is built once; a missing API key stops startup here.
fn build_estimator(client: &GeminiClient) -> Result<Arc<FootprintEstimator>> {
    let estimator =
        FootprintEstimator::new(client.clone()).context("Failed to initialize the footprint estimator")?;
    Ok(Arc::new(estimator))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for environment variables like API keys)
    dotenvy::dotenv().ok();

    // Reads log level from RUST_LOG environment variable (e.g., RUST_LOG=info,aquatrack=debug)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    info!("AquaTrack starting with command: {:?}", cli.command);

    let client = GeminiClient::new(cli.gemini.into_config());

    match cli.command {
        Commands::Serve { port } => {
            let estimator = build_estimator(&client)?;
            info!("Starting AquaTrack on port {}...", port);

            let mut web_server_handle = tokio::spawn(async move {
                if let Err(e) = web_server::start_web_server(port, estimator, client).await {
                    error!("Web server failed: {:?}", e);
                }
            });

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Ctrl-C received, initiating shutdown...");
                }
                res = &mut web_server_handle => {
                    match res {
                        Ok(_) => info!("Web server task completed unexpectedly."),
                        Err(e) if e.is_panic() => error!("Web server task panicked: {:?}", e),
                        Err(e) => error!("Web server task failed: {:?}", e),
                    }
                }
            }

            if !web_server_handle.is_finished() {
                info!("Aborting web server task...");
                web_server_handle.abort();
            }
            info!("Shutdown complete.");
        }
        Commands::Estimate { item, json } => {
            if item.trim().is_empty() {
                bail!(constants::BLANK_ITEM_MESSAGE);
            }
            let estimator = build_estimator(&client)?;
            let result = match estimator.estimate(&item).await {
                Ok(result) => result,
                Err(e) => bail!(e.user_message()),
            };
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&result).context("Failed to encode result")?
                );
            } else {
                print!("{}", chart::render_card(&result, 30));
            }
        }
        Commands::Chat => {
            info!("Starting interactive chat session...");
            chat::run_terminal_chat(&client)
                .await
                .context("Chat session failed")?;
        }
    }

    Ok(())
}
