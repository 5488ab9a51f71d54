//! Command-line entry point for book-to-audio.
//!
//! Responsibilities here are intentionally minimal:
//! - Parse command-line arguments.
//! - Load user configuration from `conf/config.toml`.
//! - Open the progress store and resolve the book and destination.
//! - Hand off to the library for loading, sessions and consolidation.

use anyhow::{Context, Result, anyhow, bail};
use book_to_audio::book::Book;
use book_to_audio::cancellation::CancellationToken;
use book_to_audio::config::{AppConfig, load_config};
use book_to_audio::consolidate::consolidate;
use book_to_audio::engine::CommandEngine;
use book_to_audio::session::{
    SessionJob, SessionOptions, SessionOutcome, progress_line, run_session,
};
use book_to_audio::store::{FileStore, ProgressStore, destination_identity, document_identity};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

const USAGE: &str = "Usage: book-to-audio <command> [book] [--dest DIR]

Commands:
  run [book] [--dest DIR]          synthesize the remaining segments
  status [book] [--dest DIR]       show how far the book has been transcribed
  reset [book] [--dest DIR]        forget progress so the next run starts over
  chapters [book]                  list chapters and their segment counts
  show [book] <chapter>            print the numbered segments of a chapter
  consolidate [book] [--dest DIR]  join segment audio into chapter files
  recent                           list recently opened books

Without a book path the last opened book is used.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    Status,
    Reset,
    Chapters,
    Show,
    Consolidate,
    Recent,
}

#[derive(Debug)]
struct Cli {
    command: Command,
    book: Option<PathBuf>,
    dest: Option<PathBuf>,
    chapter: Option<usize>,
}

fn main() {
    let reload_handle = init_tracing();
    if let Err(err) = run(&reload_handle) {
        error!("{err:?}");
        std::process::exit(1);
    }
}

fn run(reload_handle: &ReloadHandle) -> Result<()> {
    let cli = parse_args(env::args().skip(1))?;
    let config = load_config(Path::new("conf/config.toml"));
    set_log_level(reload_handle, config.log_level.as_filter_str());
    info!(
        command = ?cli.command,
        level = %config.log_level,
        "Starting book-to-audio"
    );

    let store_path = config.store_path();
    let store = FileStore::open(&store_path)
        .with_context(|| format!("Failed to open progress store {}", store_path.display()))?;
    let mut progress = ProgressStore::new(store);

    if cli.command == Command::Recent {
        let recent = progress.recent_files()?;
        if recent.paths().is_empty() {
            println!("No recently opened books.");
        }
        for path in recent.paths() {
            println!("{path}");
        }
        return Ok(());
    }

    let book_path = match cli.book.clone() {
        Some(path) => path,
        None => progress
            .last_file()
            .ok_or_else(|| anyhow!("No book given and no last opened book.\n\n{USAGE}"))?,
    };
    if !book_path.exists() {
        bail!("File not found: {}", book_path.display());
    }
    let destination = cli
        .dest
        .clone()
        .unwrap_or_else(|| default_destination(&config, &book_path));
    let document = document_identity(&book_path);
    let destination_key = destination_identity(&destination);

    match cli.command {
        Command::Run => {
            let book = load_book(&book_path)?;
            progress.remember_opened(&book_path, config.recent_files_limit)?;
            transcribe(&config, &mut progress, &book, &document, &destination)
        }
        Command::Status => {
            let book = load_book(&book_path)?;
            let total = book.total_segments();
            let done = progress.resume_index(&document, &destination_key).min(total);
            println!("{}", progress_line(done, total));
            println!("destination: {}", destination.display());
            Ok(())
        }
        Command::Reset => {
            progress.clear(&document, &destination_key)?;
            println!(
                "Progress cleared for {} -> {}",
                book_path.display(),
                destination.display()
            );
            Ok(())
        }
        Command::Chapters => {
            let book = load_book(&book_path)?;
            progress.remember_opened(&book_path, config.recent_files_limit)?;
            let ranges = book.chapter_ranges();
            for (number, (range, chapter)) in ranges.iter().zip(&book.chapters).enumerate() {
                println!(
                    "{:>3}  {}  (play order {}, segments {}..{})",
                    number + 1,
                    chapter.descriptor.label,
                    chapter.descriptor.play_order,
                    range.start,
                    range.end
                );
            }
            Ok(())
        }
        Command::Show => {
            let number = cli
                .chapter
                .ok_or_else(|| anyhow!("show needs a chapter number\n\n{USAGE}"))?;
            let book = load_book(&book_path)?;
            progress.remember_opened(&book_path, config.recent_files_limit)?;
            let ranges = book.chapter_ranges();
            let (range, chapter) = number
                .checked_sub(1)
                .and_then(|i| ranges.get(i).zip(book.chapters.get(i)))
                .ok_or_else(|| {
                    anyhow!(
                        "Chapter {number} does not exist; the book has {}",
                        book.chapters.len()
                    )
                })?;
            println!("{}", chapter.descriptor.label);
            for (index, blob) in range.clone().zip(&chapter.blobs) {
                println!("[{index}] {blob}");
            }
            Ok(())
        }
        Command::Consolidate => {
            let book = load_book(&book_path)?;
            let total = book.total_segments();
            let done = progress.resume_index(&document, &destination_key);
            if done < total {
                bail!(
                    "Book is not fully transcribed yet: {}",
                    progress_line(done, total)
                );
            }
            let chapters = consolidate(&destination, &book.chapter_ranges())
                .context("Failed to consolidate chapter audio")?;
            for chapter in chapters {
                println!("{}", chapter.wav.display());
            }
            Ok(())
        }
        Command::Recent => Ok(()),
    }
}

fn transcribe(
    config: &AppConfig,
    progress: &mut ProgressStore<FileStore>,
    book: &Book,
    document: &str,
    destination: &Path,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        handler_token.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;

    info!(
        command = %config.tts_command,
        args = ?config.tts_args,
        progress_log_interval_secs = config.tts_progress_log_interval_secs,
        drain_timeout_secs = config.drain_timeout_secs,
        "Active TTS configuration"
    );
    let mut engine = CommandEngine::from_config(config);
    let segments = book.segments();
    let fingerprint = book.fingerprint();
    let job = SessionJob {
        document,
        destination,
        segments: &segments,
        fingerprint: Some(&fingerprint),
    };
    let report = run_session(
        &mut engine,
        progress,
        &job,
        &SessionOptions::from_config(config),
        &cancel,
    )?;

    println!("{}", report.progress_line());
    match report.outcome {
        SessionOutcome::Completed => info!("Book fully transcribed"),
        SessionOutcome::Stopped { next_index } => {
            info!(next_index, "Stopped; run again to resume")
        }
        SessionOutcome::SubmitFailed {
            index,
            text,
            message,
        } => error!(index, text = %text, "Segment could not be submitted: {message}"),
        SessionOutcome::EngineError {
            index,
            text,
            message,
        } => error!(?index, ?text, "Engine failed: {message}"),
        SessionOutcome::EngineCancelled { message } => warn!("Engine cancelled: {message}"),
        SessionOutcome::DrainTimedOut { waiting_for } => {
            warn!(waiting_for, "Engine did not finish in time; run again to resume")
        }
    }
    Ok(())
}

fn load_book(path: &Path) -> Result<Book> {
    Book::open(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn default_destination(config: &AppConfig, book_path: &Path) -> PathBuf {
    let stem = book_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "book".to_string());
    Path::new(&config.output_root).join(stem)
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Cli> {
    let command = match args.next().as_deref() {
        Some("run") => Command::Run,
        Some("status") => Command::Status,
        Some("reset") => Command::Reset,
        Some("chapters") => Command::Chapters,
        Some("show") => Command::Show,
        Some("consolidate") => Command::Consolidate,
        Some("recent") => Command::Recent,
        Some(other) => bail!("Unknown command: {other}\n\n{USAGE}"),
        None => bail!("{USAGE}"),
    };

    let mut positionals = Vec::new();
    let mut dest = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dest" => {
                let dir = args
                    .next()
                    .ok_or_else(|| anyhow!("--dest needs a directory"))?;
                dest = Some(PathBuf::from(dir));
            }
            flag if flag.starts_with("--") => bail!("Unknown option: {flag}\n\n{USAGE}"),
            _ => positionals.push(arg),
        }
    }

    let mut chapter = None;
    if command == Command::Show {
        let last = positionals
            .pop()
            .ok_or_else(|| anyhow!("show needs a chapter number\n\n{USAGE}"))?;
        chapter = Some(
            last.parse()
                .with_context(|| format!("Chapter must be a number, got {last}"))?,
        );
    }
    if positionals.len() > 1 {
        bail!("Too many arguments\n\n{USAGE}");
    }

    Ok(Cli {
        command,
        book: positionals.pop().map(PathBuf::from),
        dest,
        chapter,
    })
}

fn init_tracing() -> ReloadHandle {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let (filter_layer, handle) = reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(std::io::stderr)
                .with_filter(filter_layer),
        )
        .init();
    handle
}

fn set_log_level(handle: &ReloadHandle, level: &str) {
    if env::var_os("RUST_LOG").is_some() {
        return;
    }
    let parsed = EnvFilter::builder()
        .parse(level)
        .unwrap_or_else(|_| EnvFilter::new("debug"));
    if let Err(err) = handle.modify(|filter| *filter = parsed) {
        warn!(%level, "Failed to update log level from config: {err}");
    }
}
