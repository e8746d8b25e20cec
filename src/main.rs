use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use synapse_desk::app::{parse_input, Action, App};
use synapse_desk::config::Config;
use synapse_desk::logging::init_logging;

#[derive(Parser, Debug)]
#[command(version, about = "Multi-session chat client for a local Ollama server")]
struct Cli {
    /// Path to a config.toml, instead of the platform config dir
    #[arg(long)]
    config: Option<PathBuf>,
    /// Inference server base URL, overriding the config file
    #[arg(long)]
    url: Option<String>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    if let Err(e) = init_logging() {
        eprintln!("Warning: logging disabled: {}", e);
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path).map_err(|e| color_eyre::eyre::eyre!("{:#}", e))?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Failed to load config, using defaults. Error: {}", e);
            Config::default()
        }),
    };
    if let Some(url) = cli.url {
        config.ollama_url = url;
    }
    tracing::info!(url = %config.ollama_url, model = %config.default_model, "starting");

    let (action_tx, mut action_rx) = mpsc::unbounded_channel();
    let mut app = App::new(action_tx.clone(), &config)?;

    // Input handling task
    let input_handle = {
        let tx = action_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(parse_input(&line)).is_err() {
                            return;
                        }
                    }
                    Ok(None) | Err(_) => {
                        let _ = tx.send(Action::Quit);
                        return;
                    }
                }
            }
        })
    };

    // One-shot model discovery
    let _ = action_tx.send(Action::LoadModels);

    println!("Synapse Desk. Type /help for commands.");
    print_prompt(&app);

    loop {
        tokio::select! {
            Some(action) = action_rx.recv() => {
                let quit = action == Action::Quit;
                let changed = app.update(action);
                if quit {
                    break;
                }
                if changed {
                    for line in app.take_output() {
                        println!("{}", line);
                    }
                    print_prompt(&app);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = action_tx.send(Action::Quit);
            }
        }
    }

    input_handle.abort();
    tracing::info!("exiting");
    // The stdin reader can stay blocked in a read; exit rather than wait on it.
    std::process::exit(0);
}

fn print_prompt(app: &App) {
    print!("{}", app.prompt());
    let _ = std::io::stdout().flush();
}
