use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use strand_config::{ConfigurationLoader, GenericConfiguration};
use strand_error::{ErrorContext as _, GenericError};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(about)]
pub struct Cli {
    /// Log more: `-v` for debug, `-vv` for trace.
    #[arg(global = true, short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Path to a YAML configuration file.
    ///
    /// Values from the file are overridden by `STRAND_`-prefixed environment variables.
    #[arg(global = true, short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// What to do with the endpoint.
    #[command(subcommand)]
    pub action: Action,
}

impl Cli {
    /// Gets the default log level based on the user-supplied verbosity level.
    ///
    /// A `log_level` from the configuration file or `STRAND_LOG_LEVEL` takes precedence when set.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// Loads the configuration file, if one was given, and the environment.
    pub fn load_configuration(&self) -> Result<GenericConfiguration, GenericError> {
        let mut loader = ConfigurationLoader::default();
        if let Some(path) = &self.config {
            loader = loader
                .from_yaml(path)
                .with_error_context(|| format!("Failed to load configuration from {}.", path.display()))?;
        }

        Ok(loader.from_environment("STRAND")?.into_generic())
    }
}

#[derive(Subcommand)]
pub enum Action {
    /// Listen on a server endpoint and print every message received.
    #[command(name = "serve")]
    Serve(ServeConfig),

    /// Connect to an endpoint and send messages to it.
    #[command(name = "send")]
    Send(SendConfig),
}

/// Serve configuration.
#[derive(Args, Clone)]
pub struct ServeConfig {
    /// Endpoint to listen on, such as `tcp://*:9000`.
    pub url: String,

    /// Number of supervised workers draining the channel.
    #[arg(long, default_value_t = 1)]
    pub workers: usize,
}

/// Send configuration.
#[derive(Args, Clone)]
pub struct SendConfig {
    /// Endpoint to send to, such as `tcp://127.0.0.1:9000`.
    pub url: String,

    /// Messages to send.
    ///
    /// When no messages are given, each line read from standard input is sent as a message.
    pub messages: Vec<String>,
}
