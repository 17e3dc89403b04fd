//! Command handlers for the flowrelay CLI

use tracing::{info, warn};

use flowrelay_core::{
    Drain, Engine, EventHandler, FlowController, Handshaker, Pool, Relay, Spout,
};
use flowrelay_runtime::Driver;

use crate::cli::{resolve_address, Cli, Commands};
use crate::config::AppConfig;
use crate::error::Result;

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command with its options applied over `config`
    pub async fn execute(cli: Cli, mut config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Serve { host, port, window } => {
                if let Some(host) = host {
                    config.serve.host = host;
                }
                if let Some(port) = port {
                    config.serve.port = port;
                }
                if let Some(window) = window {
                    config.relay.credit_window = window;
                }
                config.validate()?;
                Self::handle_serve_command(config).await
            }
            Commands::Drain {
                address,
                count,
                block,
            } => {
                if let Some(count) = count {
                    config.drain.count = count;
                }
                config.drain.block |= block;
                let address = resolve_address(address.as_deref());
                Self::handle_drain_command(config, address).await
            }
            Commands::Spout {
                address,
                count,
                body,
            } => {
                if let Some(count) = count {
                    config.spout.count = count;
                }
                if let Some(body) = body {
                    config.spout.body = body;
                }
                let address = resolve_address(address.as_deref());
                Self::handle_spout_command(config, address).await
            }
        }
    }

    /// Run the relay until Ctrl-C
    async fn handle_serve_command(config: AppConfig) -> Result<()> {
        let mut driver = Driver::new(Engine::with_config(config.engine.clone()), config.driver.clone())?;
        let local = driver.listen(&config.serve.host, config.serve.port).await?;
        info!(
            "Relay serving on {} with credit window {}",
            local, config.relay.credit_window
        );

        let mut handshaker = Handshaker::new();
        let mut flow = FlowController::new(config.relay.credit_window)?;
        let mut relay = Relay::new(&config.relay);
        let mut handlers: [&mut dyn EventHandler; 3] = [&mut handshaker, &mut flow, &mut relay];

        tokio::select! {
            result = driver.run(&mut handlers) => result?,
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Interrupted, shutting down");
            }
        }

        let stats = relay.stats();
        info!(
            "Relay received {} message(s), sent {}, rejected {}, evicted {}",
            stats.received, stats.sent, stats.rejected, stats.evicted
        );
        Ok(())
    }

    /// Consume up to `count` messages from `address` and print their bodies
    async fn handle_drain_command(config: AppConfig, address: String) -> Result<()> {
        let mut engine = Engine::with_config(config.engine.clone());
        Pool::new().incoming(&mut engine, &address, None)?;
        let mut driver = Driver::new(engine, config.driver.clone())?;

        let mut handshaker = Handshaker::new();
        let mut drain = Drain::new(&config.drain);
        {
            let mut handlers: [&mut dyn EventHandler; 2] = [&mut handshaker, &mut drain];
            driver.run(&mut handlers).await?;
        }

        for message in drain.messages() {
            println!("{}", String::from_utf8_lossy(message.payload()));
        }
        if drain.received() < config.drain.count {
            warn!(
                "Received {} of {} message(s) from {}",
                drain.received(),
                config.drain.count,
                address
            );
        } else {
            info!("Received {} message(s) from {}", drain.received(), address);
        }
        Ok(())
    }

    /// Publish `count` messages to `address`
    async fn handle_spout_command(config: AppConfig, address: String) -> Result<()> {
        let mut engine = Engine::with_config(config.engine.clone());
        Pool::new().outgoing(&mut engine, &address, None)?;
        let mut driver = Driver::new(engine, config.driver.clone())?;

        let mut handshaker = Handshaker::new();
        let mut spout = Spout::new(&config.spout);
        {
            let mut handlers: [&mut dyn EventHandler; 2] = [&mut handshaker, &mut spout];
            driver.run(&mut handlers).await?;
        }

        info!(
            "Sent {} message(s) to {}: {} confirmed, {} rejected",
            spout.sent(),
            address,
            spout.confirmed(),
            spout.rejected()
        );
        Ok(())
    }
}
