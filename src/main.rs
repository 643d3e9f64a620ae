use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parley::client::{CallClient, CallHandle};
use parley::config::{AppConfig, TurnServer};
use parley::identity::Identity;
use parley::media::SyntheticMediaSource;
use parley::presenter::TracingPresenter;
use parley::signaling::SignalingChannel;
use parley::transport::webrtc::WebRtcFactory;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Parley command line arguments
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about = "Two-party voice/video calling with text chat", long_about = None)]
struct CliArgs {
    /// Signaling relay URL (ws:// or wss://)
    #[arg(short = 'r', long, value_name = "URL")]
    relay: Option<String>,

    /// Display name announced to the relay (default: generated id)
    #[arg(short = 'n', long, value_name = "NAME")]
    name: Option<String>,

    /// STUN server URL (repeatable; replaces the defaults)
    #[arg(long = "stun", value_name = "URL")]
    stun: Vec<String>,

    /// TURN server URL
    #[arg(long, value_name = "URL")]
    turn_url: Option<String>,

    /// Username for TURN authentication
    #[arg(long, value_name = "USER", requires = "turn_url")]
    turn_username: Option<String>,

    /// Credential for TURN authentication
    #[arg(long, value_name = "SECRET", requires = "turn_url")]
    turn_credential: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting Parley v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::default();
    if let Some(relay) = args.relay {
        config.relay_url = relay;
    }
    if let Some(name) = args.name {
        config.display_name = name;
    }
    if !args.stun.is_empty() {
        config.ice.stun_servers = args.stun;
    }
    if let Some(url) = args.turn_url {
        config.ice.turn_servers.push(TurnServer::new(
            url,
            args.turn_username.unwrap_or_default(),
            args.turn_credential.unwrap_or_default(),
        ));
    }

    let identity = if config.display_name.is_empty() {
        Identity::new()
    } else {
        Identity::with_name(&config.display_name)
    };
    tracing::info!(id = %identity.current_id(), "local identity");

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let signaling = Arc::new(SignalingChannel::connect(&config.relay_url, signal_tx).await?);

    let (client, handle) = CallClient::new(
        identity,
        signaling.clone(),
        Arc::new(SyntheticMediaSource),
        Arc::new(WebRtcFactory::new(config.ice.clone())),
        Arc::new(TracingPresenter),
        signal_rx,
    );
    let client_task = tokio::spawn(client.run());

    print_help();
    run_repl(&handle).await?;

    handle.shutdown();
    signaling.shutdown();
    client_task.await?;
    Ok(())
}

/// Read commands from stdin until /quit or EOF
async fn run_repl(handle: &CallHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(command) = line.strip_prefix('/') {
            let (name, rest) = match command.split_once(' ') {
                Some((name, rest)) => (name, rest.trim()),
                None => (command, ""),
            };
            match name {
                "media" => handle.start_media(),
                "call" => handle.place_call(rest),
                "hangup" => handle.hang_up(),
                "name" => handle.set_name(rest),
                "help" => print_help(),
                "quit" => break,
                other => println!("Unknown command: /{}", other),
            }
        } else {
            // Anything that is not a command is a chat message
            handle.send_chat(line);
        }
    }
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  /media          start camera/microphone");
    println!("  /call <peer>    call the named peer");
    println!("  /hangup         end the current call");
    println!("  /name <name>    change your display name");
    println!("  /help           show this help");
    println!("  /quit           exit");
    println!("  <anything else> send a chat message");
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "parley=error,webrtc=error",
        LogLevel::Warn => "parley=warn,webrtc=warn",
        LogLevel::Info => "parley=info,webrtc=error",
        LogLevel::Debug => "parley=debug,webrtc=warn",
        LogLevel::Trace => "parley=trace,webrtc=info",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
