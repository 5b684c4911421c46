use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
mod auth;
use notevault::{BackupSummary, CancelToken, Notevault, default_data_dir};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn resolve_data_dir(path: Option<PathBuf>) -> Result<PathBuf> {
    match path {
        Some(p) => Ok(p),
        None => default_data_dir(),
    }
}

#[derive(Debug, Parser)]
#[command(name = "notevault")]
#[command(
    version,
    about = "Offline notes and file vault with password-protected encrypted backups."
)]
struct Cli {
    /// Directory holding the vault's records and files
    #[arg(long, global = true, value_name = "DIR", env = "NOTEVAULT_DATA")]
    data: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Adds a note
    #[command(arg_required_else_help = true)]
    AddNote {
        title: String,
        #[arg(default_value = "")]
        content: String,
    },

    /// Copies a file into the vault
    #[command(arg_required_else_help = true)]
    Attach {
        path: PathBuf,
        /// MIME type stored with the file
        #[arg(long)]
        mime: Option<String>,
    },

    /// Lists notes and attached files
    List,

    /// Writes an encrypted backup of the whole vault
    #[command(arg_required_else_help = true)]
    Export {
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
    },

    /// Restores an encrypted backup into the vault
    #[command(arg_required_else_help = true)]
    Import {
        #[arg(long, value_name = "FILE")]
        from: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let dir = resolve_data_dir(args.data)?;

    match args.command {
        Commands::AddNote { title, content } => {
            let mut vault = Notevault::open_in(&dir)?;
            let note = vault.add_note(&title, &content)?;
            println!("note #{} added", note.id);
        }
        Commands::Attach { path, mime } => {
            let mut vault = Notevault::open_in(&dir)?;
            let item = vault.attach_file(&path, mime)?;
            println!(
                "file '{}' attached ({} bytes)",
                item.original_file_name, item.file_size
            );
        }
        Commands::List => {
            let vault = Notevault::open_in(&dir)?;
            let notes = vault.notes()?;
            let files = vault.file_items()?;

            if notes.is_empty() && files.is_empty() {
                println!("Vault is empty.");
                return Ok(());
            }

            for note in notes {
                println!("#{:<4} {}  {}", note.id, format_time(note.timestamp), note.title);
            }
            for file in files {
                println!(
                    "#{:<4} {}  {} ({} bytes)",
                    file.id,
                    format_time(file.timestamp),
                    file.original_file_name,
                    file.file_size
                );
            }
        }
        Commands::Export { out } => {
            let vault = Notevault::open_in(&dir)?;
            let password = auth::read_new_password_with_confirmation()?;
            let summary = vault.export_backup(&out, password, cancel_on_ctrlc()?, print_progress)?;
            print_warnings(&summary);
            println!("backup written to {}: {summary}", out.display());
        }
        Commands::Import { from } => {
            let mut vault = Notevault::open_in(&dir)?;
            let password = auth::read_password()?;
            let summary =
                vault.import_backup(&from, password, cancel_on_ctrlc()?, print_progress)?;
            print_warnings(&summary);
            println!("restore complete: {summary}");
        }
    }

    Ok(())
}

fn cancel_on_ctrlc() -> Result<CancelToken> {
    let token = CancelToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("failed to install Ctrl-C handler")?;
    Ok(token)
}

fn print_progress(percent: i32, message: &str) {
    if percent < 0 {
        eprintln!("{message}");
    } else {
        eprintln!("[{percent:>3}%] {message}");
    }
}

fn print_warnings(summary: &BackupSummary) {
    for warning in &summary.warnings {
        eprintln!("warning: {warning}");
    }
}

fn format_time(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}
