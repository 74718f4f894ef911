//! pipeline-run CLI - headless client for pipeline runs.
//!
//! This is the main binary entry point. See the `pipeline_run` library
//! for the core functionality.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio::io::{AsyncBufReadExt, BufReader};

use pipeline_run::api::{ApiClient, LogQuery};
use pipeline_run::audio::{AudioBuffer, AudioEvent, AudioPump, FileSourceBuffer};
use pipeline_run::chat::{ChatChange, MessageId, Role};
use pipeline_run::constants::AUDIO_INPUT_CHUNK_BYTES;
use pipeline_run::logs::{LogAction, LogEntry, LogFeed, LogWindow};
use pipeline_run::session::{
    InitialInput, InterfaceKind, JoinArgs, RunSessionConfig, StartArgs, StopHandle,
};
use pipeline_run::{Config, PhoenixSocket, RunSession, SessionUpdate, Transport};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "pipeline-run")]
#[command(about = "Realtime client for pipeline runs", long_about = None)]
#[command(version)]
struct Cli {
    /// Server URL (overrides config and PIPELINE_RUN_SERVER_URL)
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with a pipeline over stdin/stdout
    Chat {
        /// Organization id
        org: u64,
        /// Pipeline id
        pipeline: u64,
        /// Join an existing run instead of starting one
        #[arg(long)]
        run: Option<String>,
        /// Alias for the new run
        #[arg(long)]
        alias: Option<String>,
        /// Initial input as name=value (repeatable)
        #[arg(long = "input", value_parser = parse_initial_input)]
        inputs: Vec<InitialInput>,
        /// Request a channel token before joining
        #[arg(long)]
        auth: bool,
    },
    /// Stream a voice run's audio output into a file
    Voice {
        /// Organization id
        org: u64,
        /// Pipeline id
        pipeline: u64,
        /// File receiving the audio output
        #[arg(long)]
        out: PathBuf,
        /// Audio file pushed to the audio input block
        #[arg(long)]
        input: Option<PathBuf>,
        /// Alias for the new run
        #[arg(long)]
        alias: Option<String>,
    },
    /// Print a run's logs
    Logs {
        /// Organization id
        org: u64,
        /// Pipeline id
        pipeline: u64,
        /// Run id
        run: String,
        /// Only logs of this block
        #[arg(long)]
        block: Option<String>,
        /// Number of historical pages to fetch
        #[arg(long, default_value_t = 1)]
        pages: u32,
        /// Keep printing live log lines
        #[arg(long)]
        follow: bool,
    },
    /// Show or set configuration
    Config {
        /// Config key to show or set
        key: Option<String>,
        /// New value
        value: Option<String>,
    },
}

fn parse_initial_input(raw: &str) -> Result<InitialInput, String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    if name.is_empty() {
        return Err(format!("missing input name in '{raw}'"));
    }
    Ok(InitialInput {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn init_logging() -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    // Keep stdout for conversation output; logs go to a file or stderr.
    if let Ok(path) = std::env::var("PIPELINE_RUN_LOG_FILE") {
        let log_file =
            std::fs::File::create(&path).with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    } else {
        builder.target(env_logger::Target::Stderr);
    }
    builder.init();
    Ok(())
}

/// Stops the session when Ctrl-C is pressed.
fn stop_on_ctrl_c(stop: StopHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, stopping run");
            stop.stop();
        }
    });
}

fn open_session(config: &Config, session_config: RunSessionConfig) -> Result<(Arc<PhoenixSocket>, RunSession)> {
    let socket = Arc::new(PhoenixSocket::new(config.socket_config()));
    let transport: Arc<dyn Transport> = Arc::clone(&socket) as Arc<dyn Transport>;
    let mut session = RunSession::new(transport, session_config.clone());
    if session_config.use_auth {
        let api = ApiClient::new(&config.server_url, config.token.clone())?;
        session = session.with_authenticator(Arc::new(api));
    }
    Ok((socket, session))
}

fn session_config(config: &Config, org: u64, pipeline: u64, interface: InterfaceKind) -> RunSessionConfig {
    RunSessionConfig {
        interface,
        start_delay: config.start_delay(),
        use_auth: config.use_auth,
        ..RunSessionConfig::new(org, pipeline)
    }
}

/// Prints the unseen suffix of streamed messages.
#[derive(Default)]
struct ChatPrinter {
    printed: HashMap<MessageId, usize>,
}

impl ChatPrinter {
    fn render(&mut self, session: &RunSession, update: &SessionUpdate) {
        match update {
            SessionUpdate::Chat(ChatChange::MessageCreated(id) | ChatChange::MessageAppended(id)) => {
                let Some(message) = session.chat().messages().get(*id) else {
                    return;
                };
                let printed = self.printed.entry(*id).or_insert(0);
                if *printed == 0 {
                    match message.role {
                        Role::User => print!("> "),
                        Role::Ai => print!("[{}] ", message.block_name),
                    }
                }
                print!("{}", &message.text[*printed..]);
                *printed = message.text.len();
                if message.role == Role::User {
                    println!();
                }
            }
            SessionUpdate::Status {
                change: ChatChange::Status { sealed: Some(_), .. },
                ..
            } => println!(),
            SessionUpdate::BlockError { block, errors } => {
                eprintln!("[{}] error: {}", block, errors.join("; "));
            }
            SessionUpdate::Run(status) => eprintln!("Run {:?}", status),
            _ => {}
        }
        let _ = std::io::stdout().flush();
    }
}

async fn run_chat(
    config: &Config,
    org: u64,
    pipeline: u64,
    run: Option<String>,
    start: StartArgs,
) -> Result<()> {
    let (socket, mut session) = open_session(config, session_config(config, org, pipeline, InterfaceKind::Webchat))?;
    let stop = session.stop_handle();
    stop_on_ctrl_c(stop.clone());

    let started = match run {
        Some(run_id) => session.join_run(JoinArgs { run_id, start }).await,
        None => session.start_run(start).await,
    };
    started.context("Failed to start run")?;
    eprintln!(
        "Run {} started. Type a message, /quit to leave.",
        session.run_id().unwrap_or("?")
    );

    let mut printer = ChatPrinter::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/quit" => break,
                Some(line) => {
                    if session.push_message(&line) == 0 {
                        eprintln!("(nothing sent)");
                    }
                }
                None => break,
            },
            update = session.next_update() => match update {
                Some(update) => printer.render(&session, &update),
                None => break,
            },
            () = stop.stopped() => break,
        }
    }

    session.stop_run().await;
    socket.disconnect().await;
    Ok(())
}

async fn push_audio_file(session: &RunSession, path: &Path) -> Result<usize> {
    let audio = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let audio = Bytes::from(audio);
    let mut pushed = 0;
    for start in (0..audio.len()).step_by(AUDIO_INPUT_CHUNK_BYTES) {
        let end = (start + AUDIO_INPUT_CHUNK_BYTES).min(audio.len());
        if session.push_audio(audio.slice(start..end)) {
            pushed += 1;
        }
    }
    Ok(pushed)
}

async fn run_voice(
    config: &Config,
    org: u64,
    pipeline: u64,
    out: &Path,
    input: Option<&Path>,
    alias: Option<String>,
) -> Result<()> {
    let (socket, mut session) = open_session(config, session_config(config, org, pipeline, InterfaceKind::Voice))?;
    let stop = session.stop_handle();
    stop_on_ctrl_c(stop.clone());

    session
        .start_run(StartArgs {
            alias,
            ..StartArgs::default()
        })
        .await
        .context("Failed to start voice run")?;

    let sink = FileSourceBuffer::create(out).await?;
    let pump = AudioPump::spawn(AudioBuffer::new(config.playback_end_threshold()), sink);
    pump.send(AudioEvent::Activate);

    if let Some(input) = input {
        let chunks = push_audio_file(&session, input).await?;
        eprintln!("Pushed {} audio chunks from {}", chunks, input.display());
    }
    eprintln!("Streaming audio into {} (Ctrl-C to stop)", out.display());

    let mut voice = pump.voice_watch();
    loop {
        tokio::select! {
            update = session.next_update() => match update {
                Some(SessionUpdate::AudioChunk { chunk, .. }) => {
                    pump.push_chunk(chunk);
                }
                Some(SessionUpdate::InputMuted(muted)) => {
                    pump.send(AudioEvent::Muted(muted));
                }
                Some(SessionUpdate::Run(status)) => {
                    eprintln!("Run {:?}", status);
                }
                Some(_) => {}
                None => break,
            },
            changed = voice.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *voice.borrow_and_update();
                eprintln!("Voice: {:?}", state);
            }
            () = stop.stopped() => break,
        }
    }

    session.stop_run().await;
    socket.disconnect().await;
    pump.send(AudioEvent::Deactivate);
    let sink = pump.finish().await?;
    eprintln!("Wrote {} bytes to {}", sink.bytes_written(), sink.path().display());
    Ok(())
}

fn print_log(entry: &LogEntry) {
    println!(
        "{} {} {} {} {}",
        entry.created_at.as_deref().unwrap_or("-"),
        entry.context,
        entry.block_name.as_deref().unwrap_or("-"),
        entry.message,
        entry.message_types.join(" -> ")
    );
}

async fn run_logs(
    config: &Config,
    org: u64,
    pipeline: u64,
    run: &str,
    block: Option<String>,
    pages: u32,
    follow: bool,
) -> Result<()> {
    let api = ApiClient::new(&config.server_url, config.token.clone())?;
    let mut window = LogWindow::new();
    for _ in 0..pages {
        if !window.has_more() {
            break;
        }
        let query = LogQuery {
            after: window.next_cursor().map(str::to_string),
            block_name: block.clone(),
            per_page: Some(config.logs_per_page),
        };
        let page = api.run_logs(org, pipeline, run, &query).await?;
        window.apply(LogAction::FetchOlder {
            entries: page.data,
            after: page.meta.after,
        });
    }
    for entry in window.entries() {
        print_log(entry);
    }
    if !follow {
        return Ok(());
    }

    let socket = Arc::new(PhoenixSocket::new(config.socket_config()));
    let transport: Arc<dyn Transport> = Arc::clone(&socket) as Arc<dyn Transport>;
    let mut feed = LogFeed::open(transport, org, pipeline, run, block.as_deref())
        .await
        .context("Failed to follow logs")?;
    loop {
        tokio::select! {
            action = feed.next_action() => match action {
                Some(LogAction::Log(entry)) => {
                    print_log(&entry);
                    window.apply(LogAction::Log(entry));
                }
                Some(older @ LogAction::FetchOlder { .. }) => window.apply(older),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    feed.close().await;
    socket.disconnect().await;
    Ok(())
}

fn run_config(key: Option<&str>, value: Option<&str>) -> Result<()> {
    match (key, value) {
        (None, _) => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        (Some(key), None) => {
            let config = serde_json::to_value(Config::load()?)?;
            match config.get(key) {
                Some(value) => println!("{}", value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }
        (Some(key), Some(value)) => {
            let dir = Config::config_dir()?;
            let mut config = Config::load_from(&dir)?;
            config.set(key, value)?;
            config.save_to(&dir)?;
            println!("{} = {}", key, value);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    if let Commands::Config { key, value } = &cli.command {
        return run_config(key.as_deref(), value.as_deref());
    }

    let mut config = Config::load()?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }

    match cli.command {
        Commands::Chat {
            org,
            pipeline,
            run,
            alias,
            inputs,
            auth,
        } => {
            config.use_auth |= auth;
            let start = StartArgs {
                alias,
                initial_inputs: inputs,
                ..StartArgs::default()
            };
            run_chat(&config, org, pipeline, run, start).await
        }
        Commands::Voice {
            org,
            pipeline,
            out,
            input,
            alias,
        } => run_voice(&config, org, pipeline, &out, input.as_deref(), alias).await,
        Commands::Logs {
            org,
            pipeline,
            run,
            block,
            pages,
            follow,
        } => run_logs(&config, org, pipeline, &run, block, pages, follow).await,
        Commands::Config { .. } => Ok(()),
    }
}
