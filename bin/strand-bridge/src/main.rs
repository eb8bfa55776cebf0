//! Network bridge for strand channels.
//!
//! `strand-bridge serve` attaches a server endpoint to a channel and prints every message that arrives, using a
//! supervised pool of workers to drain the channel. `strand-bridge send` attaches a client endpoint and transmits
//! messages to a server.

#![deny(warnings)]
#![deny(missing_docs)]
use std::io::BufRead as _;

use bytes::Bytes;
use clap::Parser as _;
use strand_app::prelude::*;
use strand_config::GenericConfiguration;
use strand_core::{
    channel::{Channel, ChannelError, ChannelPattern},
    runtime::{worker_pool, ProcessShutdown, RestartStrategy, TaskFn},
};
use strand_error::{generic_error, ErrorContext as _, GenericError};
use strand_io::{net::TransportConfig, DistributedChannel};
use tracing::{error, info, warn};

mod config;
use self::config::{Action, Cli, SendConfig, ServeConfig};

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let configuration = match cli.load_configuration() {
        Ok(configuration) => configuration,
        Err(e) => {
            fatal_and_exit(format!("failed to load configuration: {:?}", e));
            return;
        }
    };

    if let Err(e) = initialize_logging_from_configuration(&configuration, Some(cli.log_level())) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(cli, configuration).await {
        Ok(()) => info!("Bridge stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli, configuration: GenericConfiguration) -> Result<(), GenericError> {
    match cli.action {
        Action::Serve(config) => serve(configuration, config).await,
        Action::Send(config) => tokio::task::spawn_blocking(move || send(&configuration, config))
            .await
            .error_context("Send task panicked.")?,
    }
}

fn bridge_channel(
    configuration: &GenericConfiguration, pattern: ChannelPattern,
) -> Result<DistributedChannel<Bytes>, GenericError> {
    let capacity = configuration
        .try_get_typed::<usize>("channel.capacity")?
        .unwrap_or(DEFAULT_CHANNEL_CAPACITY);
    let transport = TransportConfig::from_configuration(configuration)?;

    Ok(DistributedChannel::new(Channel::with_pattern(capacity, pattern)?).with_config(transport))
}

async fn serve(configuration: GenericConfiguration, config: ServeConfig) -> Result<(), GenericError> {
    if config.workers == 0 {
        return Err(generic_error!("At least one worker is required."));
    }

    let mut bridge = bridge_channel(&configuration, ChannelPattern::Pull)?;
    bridge
        .attach(&config.url)
        .with_error_context(|| format!("Failed to attach endpoint {}.", config.url))?;
    if !bridge.endpoint().is_some_and(|endpoint| endpoint.is_server()) {
        return Err(generic_error!("{} is not a server endpoint (expected a '*' host).", config.url));
    }

    let strategy = RestartStrategy::from_configuration(&configuration)?;
    let channel = bridge.channel().clone();
    let supervisor = worker_pool("bridge", config.workers, |index| {
        let channel = channel.clone();
        TaskFn::new(format!("printer_{}", index), move |shutdown| print_messages(&channel, &shutdown))
    })?
    .with_restart_strategy(strategy);
    supervisor.supervise_channel(bridge.channel().clone());
    supervisor.start()?;

    info!(
        endpoint = %config.url,
        local_addr = ?bridge.local_addr(),
        workers = config.workers,
        "Bridge serving, waiting for interrupt..."
    );

    tokio::signal::ctrl_c()
        .await
        .error_context("Failed to listen for interrupt.")?;
    info!("Received interrupt, stopping bridge...");

    tokio::task::spawn_blocking(move || {
        bridge.shutdown();
        supervisor.stop()
    })
    .await
    .error_context("Shutdown task panicked.")??;

    Ok(())
}

fn print_messages(channel: &Channel<Bytes>, shutdown: &ProcessShutdown) -> Result<(), GenericError> {
    loop {
        match channel.receive_until(shutdown.token()) {
            Ok(payload) => println!("{}", String::from_utf8_lossy(&payload)),
            Err(ChannelError::Closed) | Err(ChannelError::Interrupted) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

fn send(configuration: &GenericConfiguration, config: SendConfig) -> Result<(), GenericError> {
    let mut bridge = bridge_channel(configuration, ChannelPattern::Push)?;
    bridge
        .attach(&config.url)
        .with_error_context(|| format!("Failed to attach endpoint {}.", config.url))?;

    let mut sent = 0;
    if config.messages.is_empty() {
        for line in std::io::stdin().lock().lines() {
            let line = line.error_context("Failed to read from standard input.")?;
            bridge.send_to_endpoint(&Bytes::from(line))?;
            sent += 1;
        }
    } else {
        for message in config.messages {
            bridge.send_to_endpoint(&Bytes::from(message))?;
            sent += 1;
        }
    }

    if sent == 0 {
        warn!("No messages to send.");
    }
    info!(endpoint = %config.url, sent, "Finished sending.");
    Ok(())
}
