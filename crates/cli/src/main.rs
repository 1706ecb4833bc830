use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use waybot::agent::{self, PollPolicy};
use waybot::llm::{AssistantBackend, AssistantsClient};

#[derive(Parser)]
#[command(name = "waybot")]
#[command(about = "WhatsApp travel assistant relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Serve the WhatsApp webhook. Credentials come from the environment (or a .env file) and the optional config file.
    Serve {
        /// Config file path (default: WAYBOT_CONFIG_PATH or ~/.waybot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// HTTP port (default from PORT, config, or 3000)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Ask the assistant directly, bypassing WhatsApp. Without TEXT, reads questions from stdin.
    Ask {
        /// Config file path (default: WAYBOT_CONFIG_PATH or ~/.waybot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Question to send.
        #[arg(trailing_var_arg = true)]
        text: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("waybot {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("serve failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Ask { config, text }) => {
            if let Err(e) = run_ask(config, text).await {
                log::error!("ask failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_serve(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = waybot::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::debug!("config path: {}", path.display());
    log::info!(
        "starting gateway on {}:{}",
        config.gateway.bind,
        config.gateway.port
    );
    waybot::gateway::run_gateway(config).await
}

async fn run_ask(config_path: Option<PathBuf>, text: Vec<String>) -> anyhow::Result<()> {
    use std::io::{self, BufRead, Write};

    let (config, _) = waybot::config::load_config(config_path)?;
    let settings = waybot::config::resolve_assistant_settings(&config)?;
    let backend: Arc<dyn AssistantBackend> = Arc::new(AssistantsClient::new(
        Some(config.assistant.base_url.clone()),
        settings.api_key,
    ));
    let policy = PollPolicy::from(&config.assistant);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    if !text.is_empty() {
        let question = text.join(" ");
        let reply = agent::get_reply(
            backend.as_ref(),
            &settings.assistant_id,
            &policy,
            &cancel,
            &question,
        )
        .await;
        println!("{}", reply.trim());
        return Ok(());
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 || cancel.is_cancelled() {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        let reply = agent::get_reply(
            backend.as_ref(),
            &settings.assistant_id,
            &policy,
            &cancel,
            input,
        )
        .await;
        println!("< {}", reply.trim());
    }
    Ok(())
}
