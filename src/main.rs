use clap::Parser;
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use std::sync::Arc;
use stream_gambler::{
    bot::Bot,
    config::{
        BotConfig,
        ConfigStore,
        EnvFileWriter,
        load_env_file,
    },
    health::HealthServer,
    logging::init_tracing,
    transport::stdio::StdioTransport,
    trusted::{
        JsonTrustedUserStore,
        TrustedUsers,
    },
};
use tokio::{
    signal,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    error,
    info,
    warn,
};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let env_file = load_env_file()?;
    let config = BotConfig::parse();
    let _log_guard = init_tracing(&config.log_level, config.log_dir().as_deref())?;
    if let Some(path) = env_file {
        info!(path = %path.display(), "loaded env file");
    }

    let env_path = config.env_path();
    let trusted_store = match config.trusted_users_path() {
        Some(path) => JsonTrustedUserStore::new(path),
        None => JsonTrustedUserStore::beside(&env_path),
    };
    info!(path = %trusted_store.path().display(), "trusted users file");
    let trusted = TrustedUsers::load(&config.username, Box::new(trusted_store));
    let health_port = config.health_port;
    let channel = config.channel.clone();
    let config = Arc::new(ConfigStore::new(config, Box::new(EnvFileWriter::new(env_path)))?);

    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (console_tx, mut console_rx) = mpsc::unbounded_channel::<String>();
    let transport = Arc::new(StdioTransport::new(channel, events_tx.clone(), console_tx));
    let bot = Bot::new(config, transport, trusted, cancel.clone());

    let _health = match health_port {
        0 => None,
        port => match HealthServer::bind("0.0.0.0", port, bot.clone()) {
            Ok(server) => Some(server),
            Err(err) => {
                error!(?err, "health endpoint unavailable");
                None
            }
        },
    };

    let console = {
        let bot = bot.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = console_rx.recv() => match line {
                        Some(line) => {
                            bot.execute_command(&line).await;
                        }
                        None => break,
                    },
                }
            }
        })
    };

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = signal::ctrl_c().await {
                warn!(?err, "could not listen for ctrl-c");
                return;
            }
            info!("interrupt received, shutting down");
            cancel.cancel();
        });
    }

    let result = bot.run(events_tx, events_rx).await;
    let _ = console.await;
    result.wrap_err("Could not keep a connection to chat")
}
