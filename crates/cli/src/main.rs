use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use willow::backend::{Backend, BackendError, HttpBackend, TalkResponse};
use willow::clock::{Clock, SystemClock};
use willow::config;
use willow::device::{CapabilityError, MediaSink, UnsupportedSpeech};
use willow::engine::{
    ConversationEngine, EngineSettings, Exchange, Phase, RestoreOutcome, RevealStep, Status,
    GREETING,
};
use willow::leads::LeadBook;
use willow::session::{LeadRecord, Sender};
use willow::store::{FileStore, Store};

type ExchangeResult = (Exchange, Result<TalkResponse, BackendError>);

#[derive(Parser)]
#[command(name = "willow")]
#[command(about = "Willow CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory, a default config, and the storage directory.
    Init {
        /// Config file path (default: WILLOW_CONFIG_PATH or ~/.willow/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Chat with the assistant (interactive). A previous chat is resumed if it was active within the idle threshold.
    Chat {
        /// Config file path (default: WILLOW_CONFIG_PATH or ~/.willow/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Backend base URL (default from WILLOW_BACKEND_URL or config)
        #[arg(long, value_name = "URL")]
        backend: Option<String>,
    },

    /// Review captured leads.
    Leads {
        /// Config file path (default: WILLOW_CONFIG_PATH or ~/.willow/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[command(subcommand)]
        action: LeadsAction,
    },
}

#[derive(Subcommand)]
enum LeadsAction {
    /// List stored leads, oldest first.
    List,
    /// Show one lead (numbered as in `list`) with its summary fields expanded.
    Show { number: usize },
    /// Delete one lead (numbered as in `list`).
    Delete { number: usize },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("willow {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config, backend }) => {
            if let Err(e) = run_chat(config, backend).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Leads { config, action }) => {
            if let Err(e) = run_leads(config, action).await {
                log::error!("leads failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let storage = config::init_config_dir(&path)?;
    println!("initialized configuration at {}", path.display());
    println!("session data will be stored in {}", storage.display());
    Ok(())
}

/// Prints audio and video cues; the terminal cannot play them itself.
struct TerminalMedia;

impl MediaSink for TerminalMedia {
    fn play_audio(&self, url: &str) -> Result<(), CapabilityError> {
        println!("\n[audio reply] {}", url);
        Ok(())
    }

    fn show_video(&self, url: &str) -> Result<(), CapabilityError> {
        if !url.is_empty() {
            println!("\n[demo video] {}", url);
        }
        Ok(())
    }
}

enum Flow {
    Continue,
    Quit,
}

async fn run_chat(config_path: Option<PathBuf>, backend_url: Option<String>) -> anyhow::Result<()> {
    let (config, path) = config::load_config(config_path)?;
    let base_url = backend_url
        .map(|u| u.trim_end_matches('/').to_string())
        .unwrap_or_else(|| config::resolve_backend_url(&config));
    let storage = config::resolve_storage_dir(&config, &path);
    log::info!("chat: backend {}, storage {}", base_url, storage.display());

    let mut engine = ConversationEngine::new(
        HttpBackend::new(base_url),
        FileStore::new(storage),
        EngineSettings::from(&config.session),
    )
    .with_media(Arc::new(TerminalMedia))
    .with_speech(Arc::new(UnsupportedSpeech));

    match engine.restore().await {
        RestoreOutcome::Resumed => println!("(resumed your previous chat)"),
        RestoreOutcome::Discarded => println!("(your previous chat expired and was cleared)"),
        RestoreOutcome::Empty | RestoreOutcome::Unavailable => {}
    }
    print_transcript(&engine);
    print_notice(&engine);
    println!("commands: /retry /dismiss /end /mic /quit");
    prompt()?;

    let (tx, mut rx) = mpsc::channel::<ExchangeResult>(1);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tick = tokio::time::interval(Duration::from_millis(config.session.typing_tick_ms.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let idle_in = idle_wait(engine.idle_deadline());
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if let Flow::Quit = handle_line(&mut engine, &tx, line.trim()).await {
                    break;
                }
                if engine.phase() == Phase::Idle {
                    prompt()?;
                }
            }
            Some((exchange, result)) = rx.recv() => {
                if engine.finish_exchange(exchange, result).await.is_err() {
                    print_notice(&engine);
                    prompt()?;
                }
            }
            _ = tick.tick(), if engine.phase() == Phase::Typing => {
                match engine.tick_reveal() {
                    RevealStep::Shown(prefix) => {
                        print!("\r< {}", prefix);
                        std::io::stdout().flush()?;
                    }
                    RevealStep::Done => {
                        println!();
                        if engine.status() == Status::Ended {
                            println!("(conversation ended; /end to start a new chat)");
                        }
                        print_notice(&engine);
                        prompt()?;
                    }
                    RevealStep::Inactive => {}
                }
            }
            _ = tokio::time::sleep(idle_in.unwrap_or(Duration::from_secs(3600))), if idle_in.is_some() => {
                if engine.check_idle().await {
                    println!("\n(chat cleared after inactivity)");
                    println!("< {}", GREETING);
                    print_notice(&engine);
                    prompt()?;
                }
            }
        }
    }
    Ok(())
}

async fn handle_line<B: Backend + 'static, S: Store>(
    engine: &mut ConversationEngine<B, S>,
    tx: &mpsc::Sender<ExchangeResult>,
    input: &str,
) -> Flow {
    match input {
        "/quit" | "/exit" => return Flow::Quit,
        "/retry" => match engine.begin_retry() {
            Ok(exchange) => spawn_exchange(engine.backend(), exchange, tx.clone()),
            Err(e) => println!("! {}", e),
        },
        "/dismiss" => engine.dismiss_notice(),
        "/end" => {
            engine.end_chat().await;
            println!("(chat ended)");
            print_notice(engine);
            println!("< {}", GREETING);
        }
        "/mic" => match engine.start_listening() {
            Ok(()) => println!("(listening to you...)"),
            Err(e) => println!("! {}", e),
        },
        "" => {
            // An empty line sends whatever speech recognition left in the input.
            let pending = engine.pending_input().to_string();
            if !pending.is_empty() {
                println!("> {}", pending);
                send(engine, tx, &pending).await;
            }
        }
        text => {
            engine.set_pending_input(text);
            send(engine, tx, text).await;
        }
    }
    Flow::Continue
}

async fn send<B: Backend + 'static, S: Store>(
    engine: &mut ConversationEngine<B, S>,
    tx: &mpsc::Sender<ExchangeResult>,
    text: &str,
) {
    match engine.begin_send(text).await {
        Ok(Some(exchange)) => {
            println!("(waiting for Willow...)");
            spawn_exchange(engine.backend(), exchange, tx.clone());
        }
        Ok(None) => {}
        Err(e) => println!("! {}", e),
    }
}

fn spawn_exchange<B: Backend + 'static>(
    backend: Arc<B>,
    exchange: Exchange,
    tx: mpsc::Sender<ExchangeResult>,
) {
    tokio::spawn(async move {
        let result = backend.talk(&exchange.text).await;
        if tx.send((exchange, result)).await.is_err() {
            log::debug!("chat: reply arrived after the session loop stopped");
        }
    });
}

fn idle_wait(deadline: Option<i64>) -> Option<Duration> {
    let now = SystemClock.now_ms();
    deadline.map(|d| Duration::from_millis((d - now).max(0) as u64))
}

fn prompt() -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()
}

fn print_transcript<B: Backend + 'static, S: Store>(engine: &ConversationEngine<B, S>) {
    if engine.conversation().is_empty() {
        println!("< {}", GREETING);
        return;
    }
    for m in engine.conversation() {
        match m.sender {
            Sender::User => println!("> {}", m.text),
            Sender::Assistant => println!("< {}", m.text),
        }
    }
    if engine.status() == Status::Ended {
        println!("(conversation ended; /end to start a new chat)");
    }
}

fn print_notice<B: Backend + 'static, S: Store>(engine: &ConversationEngine<B, S>) {
    if let Some(n) = engine.notice() {
        let actions = if n.retryable {
            "/retry to resend, /dismiss to close"
        } else {
            "/dismiss to close"
        };
        println!("! {} ({})", n.message, actions);
    }
}

async fn run_leads(config_path: Option<PathBuf>, action: LeadsAction) -> anyhow::Result<()> {
    let (config, path) = config::load_config(config_path)?;
    let store = FileStore::new(config::resolve_storage_dir(&config, &path));
    let book = LeadBook::new(&store);

    match action {
        LeadsAction::List => {
            let leads = book.list().await?;
            if leads.is_empty() {
                println!("No leads found");
            }
            for (i, lead) in leads.iter().enumerate() {
                let shown = lead.merged_for_display();
                println!(
                    "{:>3}. {} [{}] {}",
                    i + 1,
                    shown.company.as_deref().unwrap_or("Untitled"),
                    shown.status.as_deref().unwrap_or("-"),
                    summary_preview(&shown)
                );
            }
        }
        LeadsAction::Show { number } => {
            let index = lead_index(number)?;
            let lead = book
                .get(index)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no lead #{}", number))?;
            println!("{}", serde_json::to_string_pretty(&lead.merged_for_display())?);
        }
        LeadsAction::Delete { number } => {
            let index = lead_index(number)?;
            match book.delete(index).await? {
                Some(_) => println!("deleted lead #{}", number),
                None => anyhow::bail!("no lead #{}", number),
            }
        }
    }
    Ok(())
}

fn lead_index(number: usize) -> anyhow::Result<usize> {
    number
        .checked_sub(1)
        .ok_or_else(|| anyhow::anyhow!("leads are numbered from 1"))
}

fn summary_preview(lead: &LeadRecord) -> String {
    let summary = lead.summary.trim();
    let text = if summary.starts_with("```") {
        lead.problem.as_deref().unwrap_or("")
    } else {
        summary.lines().next().unwrap_or("")
    };
    if text.chars().count() > 60 {
        format!("{}...", text.chars().take(60).collect::<String>())
    } else {
        text.to_string()
    }
}
