// ratted.systems CLI: upload files by multipart POST or over the chunked socket protocol.

mod config;
mod post;
mod progress_line;
mod token_store;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ratted_core::{UploadError, LARGE_FILE_THRESHOLD};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, UploadMethod};
use crate::progress_line::TerminalProgress;
use crate::token_store::TokenStore;

const EXIT_FAILURE: u8 = 1;
/// Conventional status for termination by SIGINT.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "ratted", version, about = "ratted.systems cli")]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a file to ratted.systems and print its link.
    Upload {
        path: PathBuf,
        /// Override the configured upload method.
        #[arg(long, value_enum)]
        method: Option<UploadMethod>,
    },
    /// Manage the upload token.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Store a new upload token.
    Set { token: String },
    /// Delete the stored token.
    Clear,
    /// Print the configured token.
    Show,
    /// Exit 0 if a token is configured, 1 otherwise.
    Check,
}

/// Transport actually used for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Post,
    Socket,
}

fn route_for(method: UploadMethod, file_size: u64) -> Route {
    match method {
        UploadMethod::Post => Route::Post,
        UploadMethod::Socket => Route::Socket,
        UploadMethod::Auto if file_size > LARGE_FILE_THRESHOLD => Route::Socket,
        UploadMethod::Auto => Route::Post,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let cfg = config::load();

    let result = match cli.command {
        Command::Upload { path, method } => upload(&path, method, &cfg).map(|_| ExitCode::SUCCESS),
        Command::Token { action } => token(action),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            let cancelled = e
                .downcast_ref::<UploadError>()
                .map(UploadError::is_cancelled)
                .unwrap_or(false);
            if cancelled {
                error!("upload cancelled");
                ExitCode::from(EXIT_CANCELLED)
            } else {
                error!("{e:#}");
                ExitCode::from(EXIT_FAILURE)
            }
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn token_store() -> anyhow::Result<TokenStore> {
    TokenStore::from_env().context("cannot locate the home directory for the token file")
}

fn upload(path: &Path, method: Option<UploadMethod>, cfg: &Config) -> anyhow::Result<()> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("file not found: {}", path.display()))?;
    if !meta.is_file() {
        bail!("not a regular file: {}", path.display());
    }
    let store = token_store()?;
    let Some(token) = store.get() else {
        return Err(UploadError::MissingToken).with_context(|| {
            format!(
                "set one with `ratted token set <token>` (stored at {})",
                store.path().display()
            )
        });
    };

    let route = route_for(method.unwrap_or(cfg.upload_method), meta.len());
    if route == Route::Socket && meta.len() > LARGE_FILE_THRESHOLD {
        info!("file is larger than 100 MB, using socket upload method");
    }
    info!(path = %path.display(), ?route, "uploading file");
    let endpoint = cfg.endpoint();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match route {
            Route::Post => {
                let reply = post::upload_file(&endpoint, &token, path).await?;
                info!("file uploaded successfully");
                if let Some(thumbnail) = reply.thumbnail.filter(|t| !t.trim().is_empty()) {
                    info!(%thumbnail, "thumbnail available");
                }
                println!("{}", reply.resource.unwrap_or_default());
            }
            Route::Socket => {
                let cancel = CancellationToken::new();
                let on_interrupt = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        on_interrupt.cancel();
                    }
                });
                let mut progress = TerminalProgress::default();
                let outcome = ratted_core::upload_file(
                    &endpoint,
                    &store,
                    path,
                    cfg.solver_workers(),
                    &mut progress,
                    &cancel,
                )
                .await?;
                info!(elapsed = ?outcome.elapsed, chunks = outcome.chunks_sent, "file uploaded successfully");
                println!("{}", outcome.link);
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

fn token(action: TokenAction) -> anyhow::Result<ExitCode> {
    let store = token_store()?;
    match action {
        TokenAction::Set { token } => {
            if token.trim().is_empty() {
                bail!("token must not be empty");
            }
            store.set(&token)?;
            info!(path = %store.path().display(), "new upload token written");
        }
        TokenAction::Clear => {
            store.clear()?;
            info!("upload token cleared");
        }
        TokenAction::Show => match store.get() {
            Some(token) => println!("{token}"),
            None => return Ok(no_token(&store)),
        },
        TokenAction::Check => match store.get() {
            Some(_) => info!("upload token is configured"),
            None => return Ok(no_token(&store)),
        },
    }
    Ok(ExitCode::SUCCESS)
}

fn no_token(store: &TokenStore) -> ExitCode {
    info!(path = %store.path().display(), "no upload token configured");
    ExitCode::from(EXIT_FAILURE)
}
