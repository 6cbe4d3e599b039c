use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use garden_assistant::llm::{self, GeminiClient, LlmError};
use garden_assistant::services::chat::ChatSessionManager;
use garden_assistant::services::identify::{
    AnalysisOutcome, DEFAULT_INSTRUCTION, IdentifyError, ImageAnalyzer, ImageFile,
};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("LLM not configured: {0}")]
    Llm(#[from] LlmError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Identify(#[from] IdentifyError),
    #[error("unsupported image type: {0} (expected PNG, JPEG or WEBP)")]
    UnsupportedImage(PathBuf),
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    AnalysisFailed(String),
}

#[derive(Parser, Debug)]
#[command(name = "garden", about = "Gardening assistant: streamed chat and plant identification")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat with the assistant, one line per message. Ctrl-D quits.
    Chat,
    /// Identify the plant in a PNG, JPEG or WEBP image (max 4MB).
    Identify {
        image: PathBuf,
        #[arg(short, long, default_value = DEFAULT_INSTRUCTION)]
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    // Logs go to stderr; stdout carries the conversation.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let client = Arc::new(llm::from_env()?);
    tracing::info!(model = client.model(), "LLM client initialized");

    match cli.command {
        Command::Chat => chat(client).await,
        Command::Identify { image, prompt } => identify(client, &image, prompt).await,
    }
}

async fn chat(client: Arc<GeminiClient>) -> Result<(), CliError> {
    let manager = ChatSessionManager::new(client);
    manager.initialize().await;

    if let Some(greeting) = manager.transcript().first() {
        println!("garden> {}", greeting.text);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        print!("garden> ");
        let mut printed = String::new();
        let mut write_error = None;
        let sent = manager
            .send_turn_with(&line, |message| {
                if write_error.is_none() {
                    write_error = show_update(&mut std::io::stdout().lock(), &mut printed, &message.text).err();
                }
            })
            .await;
        if let Some(e) = write_error {
            return Err(CliError::Io(e));
        }
        println!();
        if let Err(e) = sent {
            eprintln!("{e}");
        }
    }
    Ok(())
}

async fn identify(client: Arc<GeminiClient>, path: &Path, prompt: String) -> Result<(), CliError> {
    let mime_type = mime_for(path).ok_or_else(|| CliError::UnsupportedImage(path.to_path_buf()))?;
    let file = ImageFile::from_path(path, mime_type).await?;

    let analyzer = ImageAnalyzer::new(client);
    if let Err(e) = analyzer.accept(file) {
        return Err(CliError::Rejected(analyzer.error().unwrap_or_else(|| e.to_string())));
    }
    analyzer.set_instruction(prompt);

    eprintln!("Analyzing...");
    match analyzer.analyze().await? {
        AnalysisOutcome::Completed(text) => {
            println!("{text}");
            Ok(())
        }
        AnalysisOutcome::Failed(message) => Err(CliError::AnalysisFailed(message)),
        AnalysisOutcome::Superseded => Ok(()),
    }
}

/// Write the unseen part of `text` and flush, so fragments appear as they
/// stream in.
fn show_update(out: &mut impl std::io::Write, printed: &mut String, text: &str) -> std::io::Result<()> {
    let delta = render_delta(printed, text);
    text.clone_into(printed);
    write!(out, "{delta}")?;
    out.flush()
}

/// What to write so the terminal shows `text`, given `printed` is already
/// on screen. A reply that no longer extends the printed text (the error
/// fallback) starts on a new line.
fn render_delta(printed: &str, text: &str) -> String {
    match text.strip_prefix(printed) {
        Some(delta) => delta.to_string(),
        None => format!("\n{text}"),
    }
}

/// Media type from the file extension; the picker only offers these three.
fn mime_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
