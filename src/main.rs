use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use avatar_relay::config::{Config, TaskType};
use avatar_relay::credential::{CredentialFetcher, CredentialSource, StaticCredential};
use avatar_relay::sdk::SdkEvent;
use avatar_relay::sdk::mock::{MockAvatarSdk, MockMicrophone, MockVideoSink};
use avatar_relay::session::SessionController;

#[derive(Parser)]
#[command(name = "avatar-relay", version, about = "Token proxy and session engine for streaming avatars")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "AVATAR_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the token proxy server
    Serve {
        /// Listen address, overrides `server.bind`
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Drive a session against the in-process mock SDK; stdin lines become
    /// user turns
    Session {
        /// Open the voice channel on start
        #[arg(long)]
        voice: bool,

        /// Use a fixed credential instead of calling the token proxy
        #[arg(long)]
        offline: bool,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the default config file location
    Path,
}

fn init_logging(verbose: u8, json: bool) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match cli.command {
        Command::Config {
            action: ConfigAction::Path,
        } => {
            match Config::default_path() {
                Some(path) => println!("{}", path.display()),
                None => println!("(no platform config directory)"),
            }
            Ok(())
        }
        command => {
            let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
            run(command, config).await
        }
    }
}

async fn run(command: Command, mut config: Config) -> Result<()> {
    match command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl+C, shutting down");
                }
                signal.cancel();
            });
            avatar_relay::server::serve(&config.server, shutdown).await
        }
        Command::Session { voice, offline } => run_session(&config, voice, offline).await,
        Command::Config {
            action: ConfigAction::Show,
        } => {
            let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
            print!("{}", rendered);
            Ok(())
        }
        Command::Config {
            action: ConfigAction::Path,
        } => Ok(()),
    }
}

async fn run_session(config: &Config, voice: bool, offline: bool) -> Result<()> {
    let sdk = MockAvatarSdk::new();
    let credentials: Arc<dyn CredentialSource> = if offline {
        Arc::new(StaticCredential::new("offline-token"))
    } else {
        let fetcher =
            CredentialFetcher::new(config.client.token_endpoint.clone(), config.client.fetch);
        info!(endpoint = fetcher.endpoint(), "Fetching session tokens from the token proxy");
        Arc::new(fetcher)
    };

    let sink = MockVideoSink::new();
    let frozen = Arc::new(AtomicBool::new(false));
    let playback = CancellationToken::new();
    spawn_playback_clock(sink.clone(), frozen.clone(), playback.clone());

    let controller = SessionController::builder(Arc::new(sdk.clone()), credentials)
        .config(config)
        .microphone(Arc::new(MockMicrophone::new()))
        .sink(Arc::new(sink))
        .build()
        .context("invalid trigger words")?;

    controller.start(voice).await.context("failed to start session")?;
    println!(
        "Session {}. Type an utterance, or /say <text>, /freeze, /disconnect, /state, /stop.",
        controller.state()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/stop" => break,
            "/freeze" => {
                let now_frozen = !frozen.fetch_xor(true, Ordering::SeqCst);
                println!("video {}", if now_frozen { "frozen" } else { "playing" });
            }
            "/disconnect" => {
                sdk.emit(SdkEvent::StreamDisconnected);
            }
            "/state" => {
                let counters = controller.counters().await;
                println!(
                    "state={} reconnect_attempts={} freeze_detections={}",
                    controller.state(),
                    counters.reconnect_attempts,
                    counters.freeze_detections
                );
            }
            _ => {
                if let Some(text) = line.strip_prefix("/say ") {
                    if let Err(e) = controller.speak(text, TaskType::Repeat).await {
                        warn!("speak failed: {}", e);
                    }
                    continue;
                }
                let fragments: Vec<&str> = line.split_inclusive(' ').collect();
                if !sdk.emit_turn(&fragments) {
                    warn!("No live session to receive the utterance");
                }
            }
        }
    }

    controller.stop().await;
    playback.cancel();
    println!("Session {}.", controller.state());
    Ok(())
}

/// Advance the mock video clock once a second unless frozen.
fn spawn_playback_clock(sink: MockVideoSink, frozen: Arc<AtomicBool>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !frozen.load(Ordering::SeqCst) {
                        sink.advance(1.0);
                    }
                }
            }
        }
    });
}
