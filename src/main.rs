use clap::{Parser, Subcommand};
use polyglot_lsp::config::SERVER_COMMAND_ENV;
use polyglot_lsp::logging::{LogConfig, init_logging};
use polyglot_lsp::{
    CompletionEntry, DocumentSymbols, FileLocation, FlatSymbol, Language, LanguageServer,
    LspError, SessionConfig,
};

use lsp_types::Hover;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// CLI arguments for the LSP client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workspace root (defaults to current directory)
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Workspace language (inferred from the file extension when omitted)
    #[arg(long, value_enum)]
    language: Option<Language>,

    /// Language server executable (overrides POLYGLOT_LSP_SERVER env var)
    #[arg(long, value_name = "COMMAND")]
    server: Option<String>,

    /// Argument passed to the language server (repeatable)
    #[arg(long = "server-arg", value_name = "ARG", allow_hyphen_values = true)]
    server_args: Vec<String>,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout_secs: Option<u64>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides POLYGLOT_LSP_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Where the symbol at a position is defined
    Definition(PositionArgs),
    /// Every reference to the symbol at a position
    References(PositionArgs),
    /// Symbols of one document
    Symbols {
        /// File path relative to the workspace root
        file: PathBuf,
    },
    /// Hover information at a position
    Hover(PositionArgs),
    /// Completion candidates at a position
    Completions(PositionArgs),
    /// Workspace-wide symbol search
    WorkspaceSymbols {
        /// Search query
        query: String,
    },
}

#[derive(clap::Args, Debug)]
struct PositionArgs {
    /// File path relative to the workspace root
    file: PathBuf,
    /// Zero-based line
    line: u32,
    /// Zero-based character (UTF-16 code units)
    character: u32,
}

/// Result of one command, printed as JSON
#[derive(Serialize)]
#[serde(untagged)]
enum Output {
    Locations(Vec<FileLocation>),
    Symbols(DocumentSymbols),
    Hover(Option<Hover>),
    Completions(Vec<CompletionEntry>),
    WorkspaceSymbols(Vec<FlatSymbol>),
}

/// Resolve the server command from CLI args and environment
fn resolve_server_command(server_arg: Option<String>) -> Option<String> {
    // Priority: CLI arg > POLYGLOT_LSP_SERVER env var > language default
    server_arg.or_else(|| std::env::var(SERVER_COMMAND_ENV).ok())
}

/// Language from the flag, else from the extension of the queried file
fn resolve_language(language: Option<Language>, command: &Command) -> Option<Language> {
    language.or_else(|| match command {
        Command::Definition(at)
        | Command::References(at)
        | Command::Hover(at)
        | Command::Completions(at) => Language::from_path(&at.file),
        Command::Symbols { file } => Language::from_path(file),
        Command::WorkspaceSymbols { .. } => None,
    })
}

async fn run(server: LanguageServer, command: Command) -> Result<Output, LspError> {
    Ok(match command {
        Command::Definition(at) => Output::Locations(
            server
                .request_definition(&at.file, at.line, at.character)
                .await?,
        ),
        Command::References(at) => Output::Locations(
            server
                .request_references(&at.file, at.line, at.character)
                .await?,
        ),
        Command::Symbols { file } => Output::Symbols(server.request_document_symbols(&file).await?),
        Command::Hover(at) => {
            Output::Hover(server.request_hover(&at.file, at.line, at.character).await?)
        }
        Command::Completions(at) => Output::Completions(
            server
                .request_completions(&at.file, at.line, at.character)
                .await?,
        ),
        Command::WorkspaceSymbols { query } => {
            Output::WorkspaceSymbols(server.request_workspace_symbols(&query).await?)
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config = LogConfig::from_env().with_overrides(args.log_level, args.log_file);
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let root = match args.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };

    let mut builder = SessionConfig::builder().root(root);
    // Without a language, build() reports the missing field
    if let Some(language) = resolve_language(args.language, &args.command) {
        builder = builder.language(language);
    }
    if let Some(command) = resolve_server_command(args.server) {
        builder = builder.command(command);
    }
    if !args.server_args.is_empty() {
        builder = builder.add_args(args.server_args);
    }
    if let Some(secs) = args.timeout_secs {
        builder = builder.request_timeout(Duration::from_secs(secs));
    }

    let config = match builder.build() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    info!(
        "Using {} server '{}' in {}",
        config.language,
        config.command,
        config.root.display()
    );

    let command = args.command;
    match LanguageServer::scoped(config, |server| run(server, command)).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
