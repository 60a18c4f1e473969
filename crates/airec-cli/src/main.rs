use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use airec_core::{
    archive, models, CaptureSession, Config, HubModelProvider, ModelState, RecordStore, Recording,
    Transcriber, TranscriptionOrchestrator, WhisperEngine,
};

#[derive(Parser)]
#[command(author, version, about = "Offline voice recorder with Whisper transcription")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output including whisper initialization details
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Record from the default input device
    Record,

    /// List saved recordings
    List,

    /// Search recordings by name or transcript content
    Search {
        query: String,
    },

    /// Show a recording's transcript
    Show {
        id: i64,
    },

    /// Transcribe a recording and save the result
    Transcribe {
        id: i64,
    },

    /// Rename a recording
    Rename {
        id: i64,
        name: String,
    },

    /// Edit a recording's name and/or transcript content
    Edit {
        id: i64,

        /// New display name
        #[arg(long)]
        name: Option<String>,

        /// Replacement transcript content
        #[arg(long)]
        content: Option<String>,
    },

    /// Delete a recording and its audio file
    Delete {
        id: i64,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Manage speech models
    Models {
        /// List model variants available for download
        #[arg(long)]
        available: bool,

        /// Download a model variant
        #[arg(long)]
        download: Option<String>,
    },

    /// View or edit configuration
    Config {
        /// Set the transcription language (ISO-639-1)
        #[arg(long)]
        language: Option<String>,

        /// Enable or disable archival export
        #[arg(long)]
        archive: Option<bool>,

        /// Set the archival export root
        #[arg(long)]
        archive_root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "airec=debug" } else { "airec=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load_or_default();

    match cli.command {
        Commands::Record => {
            let store = open_store()?;
            cmd_record(&store, &config).await?;
        }
        Commands::List => {
            let store = open_store()?;
            cmd_list(&store)?;
        }
        Commands::Search { query } => {
            let store = open_store()?;
            cmd_search(&store, &query)?;
        }
        Commands::Show { id } => {
            let store = open_store()?;
            cmd_show(&store, id)?;
        }
        Commands::Transcribe { id } => {
            let store = open_store()?;
            let transcriber = build_transcriber(cli.verbose);
            let orchestrator = Arc::new(TranscriptionOrchestrator::new(
                transcriber.clone(),
                store,
                config.transcription.language.clone(),
            ));
            cmd_transcribe(orchestrator, transcriber, id).await?;
        }
        Commands::Rename { id, name } => {
            let store = open_store()?;
            cmd_rename(&store, id, &name)?;
        }
        Commands::Edit { id, name, content } => {
            let store = open_store()?;
            cmd_edit(&store, id, name, content)?;
        }
        Commands::Delete { id, yes } => {
            let store = open_store()?;
            cmd_delete(&store, id, yes)?;
        }
        Commands::Models {
            available,
            download,
        } => {
            cmd_models(available, download).await?;
        }
        Commands::Config {
            language,
            archive,
            archive_root,
        } => {
            cmd_config(language, archive, archive_root)?;
        }
    }

    Ok(())
}

fn open_store() -> Result<RecordStore> {
    RecordStore::open(&Config::documents_dir()).context("opening record store")
}

/// Composition root for the model stack: the device tier picks both the
/// model variant and the engine's compute backend, weights come from the
/// hub, whisper runs the inference.
fn build_transcriber(verbose: bool) -> Arc<Transcriber> {
    let tier = models::detect_tier();
    let variant = models::variant_for_tier(tier);
    let provider = Arc::new(HubModelProvider::new(Config::models_dir(), variant));
    let engine = Arc::new(WhisperEngine { verbose, tier });
    Arc::new(Transcriber::new(provider, engine))
}

async fn cmd_record(store: &RecordStore, config: &Config) -> Result<()> {
    let mut session = CaptureSession::start(&Config::documents_dir())?;
    println!(
        "{} {}",
        style("Recording from").bold(),
        session.device().display()
    );
    println!("{}", style("Enter = stop, p + Enter = pause/resume").dim());

    // stdin is read on its own thread so the status line keeps updating.
    let (tx, rx) = std::sync::mpsc::channel::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            if stdin.read_line(&mut line).is_err() {
                break;
            }
            if tx.send(line.trim().to_string()).is_err() {
                break;
            }
        }
    });

    let finished = loop {
        print_capture_status(&session);
        match rx.try_recv() {
            Ok(cmd) if cmd == "p" => {
                if session.is_paused() {
                    session.resume();
                } else {
                    session.pause();
                }
            }
            Ok(_) | Err(std::sync::mpsc::TryRecvError::Disconnected) => break session.stop()?,
            Err(std::sync::mpsc::TryRecvError::Empty) => {}
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    println!();

    let id = store.insert(
        &finished.name,
        &finished.relative_path,
        finished.created_at,
        "",
    )?;
    println!(
        "{} Saved recording {} ({}, {}s)",
        style("✓").green(),
        id,
        finished.name,
        finished.duration_secs
    );

    // Archival is best-effort: a failed export never affects the recording.
    if config.archive.enabled {
        match &config.archive.root {
            Some(root) => match archive::export(&finished.absolute_path, finished.created_at as i64, root) {
                Ok(dest) => {
                    println!("{}", style(format!("Archived to {}", dest.display())).dim())
                }
                Err(e) => warn!("archive export failed: {}", e),
            },
            None => warn!("archive enabled but no root configured"),
        }
    }

    Ok(())
}

fn print_capture_status(session: &CaptureSession) {
    let elapsed = session.elapsed_secs();
    let level = session.meter_level();
    let filled = (level * 20.0).round() as usize;
    let meter = format!("{}{}", "#".repeat(filled), "-".repeat(20 - filled));
    let state = if session.is_paused() {
        style("paused   ").yellow()
    } else {
        style("recording").red()
    };
    print!(
        "\r{} {:02}:{:02} [{}] ",
        state,
        elapsed / 60,
        elapsed % 60,
        meter
    );
    let _ = std::io::stdout().flush();
}

fn cmd_list(store: &RecordStore) -> Result<()> {
    let recordings = store.all()?;
    if recordings.is_empty() {
        println!("No recordings yet. Run 'airec record' to create one.");
        return Ok(());
    }
    print_recordings(&recordings);
    Ok(())
}

fn cmd_search(store: &RecordStore, query: &str) -> Result<()> {
    let recordings = store.search(query)?;
    if recordings.is_empty() {
        println!("No recordings match '{}'.", query);
        return Ok(());
    }
    print_recordings(&recordings);
    Ok(())
}

fn print_recordings(recordings: &[Recording]) {
    println!(
        "{}",
        style(format!(
            "{:>4}  {:<19}  {:<24}  {}",
            "id", "created", "name", "transcript"
        ))
        .bold()
    );
    for rec in recordings {
        let status = if rec.content.is_empty() {
            style("-").dim().to_string()
        } else {
            style("yes").green().to_string()
        };
        println!(
            "{:>4}  {:<19}  {:<24}  {}",
            rec.id,
            format_timestamp(rec.created_at),
            rec.name,
            status
        );
    }
}

fn format_timestamp(secs: f64) -> String {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "-".to_string())
}

fn cmd_show(store: &RecordStore, id: i64) -> Result<()> {
    let rec = store
        .get(id)?
        .ok_or_else(|| anyhow::anyhow!("No recording with id {}", id))?;

    println!("{}", style(&rec.name).bold());
    println!("{}", style(format_timestamp(rec.created_at)).dim());
    println!();
    if rec.content.is_empty() {
        println!(
            "{}",
            style(format!(
                "Not transcribed yet. Run 'airec transcribe {}'.",
                id
            ))
            .dim()
        );
    } else {
        println!("{}", rec.content);
    }
    Ok(())
}

async fn cmd_transcribe(
    orchestrator: Arc<TranscriptionOrchestrator>,
    transcriber: Arc<Transcriber>,
    id: i64,
) -> Result<()> {
    let task = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.transcribe_recording(id).await })
    };

    // Surface download progress while the orchestrator works.
    let mut download_bar: Option<ProgressBar> = None;
    while !task.is_finished() {
        match transcriber.state() {
            ModelState::Downloading => {
                let bar = download_bar.get_or_insert_with(|| {
                    let bar = ProgressBar::new(100);
                    bar.set_style(
                        ProgressStyle::default_bar()
                            .template("{spinner:.green} downloading model [{bar:40.cyan/blue}] {percent}%")
                            .unwrap()
                            .progress_chars("#>-"),
                    );
                    bar
                });
                bar.set_position((transcriber.download_progress() * 100.0) as u64);
            }
            _ => {
                if let Some(bar) = download_bar.take() {
                    bar.finish_and_clear();
                    println!("{} Model downloaded", style("✓").green());
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if let Some(bar) = download_bar.take() {
        bar.finish_and_clear();
    }

    let transcript = task.await??;
    if transcript.is_empty() {
        println!("Transcription produced no text.");
    } else {
        println!("{}", transcript);
    }
    Ok(())
}

fn cmd_rename(store: &RecordStore, id: i64, name: &str) -> Result<()> {
    store
        .get(id)?
        .ok_or_else(|| anyhow::anyhow!("No recording with id {}", id))?;
    store.update_name(id, name)?;
    println!("{} Renamed recording {} to '{}'", style("✓").green(), id, name);
    Ok(())
}

fn cmd_edit(
    store: &RecordStore,
    id: i64,
    name: Option<String>,
    content: Option<String>,
) -> Result<()> {
    store
        .get(id)?
        .ok_or_else(|| anyhow::anyhow!("No recording with id {}", id))?;

    match (name, content) {
        (None, None) => {
            return Err(anyhow::anyhow!(
                "Nothing to change; pass --name and/or --content."
            ))
        }
        (Some(name), None) => store.update_name(id, &name)?,
        (None, Some(content)) => store.update_content(id, &content)?,
        (Some(name), Some(content)) => store.update_content_and_name(id, &content, &name)?,
    }

    println!("{} Updated recording {}", style("✓").green(), id);
    Ok(())
}

fn cmd_delete(store: &RecordStore, id: i64, yes: bool) -> Result<()> {
    let rec = store
        .get(id)?
        .ok_or_else(|| anyhow::anyhow!("No recording with id {}", id))?;

    if !yes {
        print!("Delete '{}' and its audio file? [y/N] ", rec.name);
        std::io::stdout().flush()?;
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if input.trim().to_lowercase() != "y" {
            println!("Cancelled.");
            return Ok(());
        }
    }

    // File and row removal are attempted independently; a missing file
    // must not leave the row behind.
    let path = rec.resolve(store.root());
    if let Err(e) = std::fs::remove_file(&path) {
        warn!(path = %path.display(), "could not remove audio file: {}", e);
    }
    store.delete(&rec.relative_path)?;

    println!("{} Deleted recording {}", style("✓").green(), id);
    Ok(())
}

async fn cmd_models(available: bool, download: Option<String>) -> Result<()> {
    if let Some(name) = download {
        let variant = models::get_variant(&name)
            .ok_or_else(|| anyhow::anyhow!("Unknown model variant: {}", name))?;

        if models::is_downloaded(&Config::models_dir(), variant) {
            println!("{} already downloaded.", variant.name);
            return Ok(());
        }

        println!("Downloading {} ({} MB)...", variant.name, variant.size_mb);
        let bar = ProgressBar::hidden();
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .unwrap()
                .progress_chars("#>-"),
        );
        let bar_progress = bar.clone();
        let path = models::download_variant(
            &Config::models_dir(),
            variant,
            Box::new(move |downloaded, total| {
                if total > 0 && bar_progress.length().unwrap_or(0) != total {
                    bar_progress.set_length(total);
                    bar_progress.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                }
                bar_progress.set_position(downloaded);
            }),
        )
        .await?;
        bar.finish_and_clear();

        println!("{} Downloaded to {}", style("✓").green(), path.display());
        return Ok(());
    }

    if available {
        println!("{}", style("Available Model Variants").bold());
        println!("{}", style("-".repeat(25)).dim());
        println!();
        for variant in models::MODEL_VARIANTS {
            let status = if models::is_downloaded(&Config::models_dir(), variant) {
                style("[downloaded]").green()
            } else {
                style("").dim()
            };
            println!(
                "  {} ({} MB) {} - {}",
                style(variant.name).cyan(),
                variant.size_mb,
                status,
                variant.description
            );
        }
        println!();
        println!(
            "{}",
            style("Use 'airec models --download <name>' to download.").dim()
        );
        return Ok(());
    }

    let tier = models::detect_tier();
    let variant = models::variant_for_tier(tier);
    let downloaded = models::is_downloaded(&Config::models_dir(), variant);

    println!("Device tier: {:?}", tier);
    println!(
        "Selected variant: {} ({} MB){}",
        style(variant.name).cyan(),
        variant.size_mb,
        if downloaded {
            format!(" {}", style("[downloaded]").green())
        } else {
            String::new()
        }
    );
    if !downloaded {
        println!();
        println!(
            "{}",
            style(format!(
                "Run 'airec models --download {}' or just 'airec transcribe <id>'.",
                variant.name
            ))
            .dim()
        );
    }
    Ok(())
}

fn cmd_config(
    language: Option<String>,
    archive: Option<bool>,
    archive_root: Option<PathBuf>,
) -> Result<()> {
    let mut config = Config::load_or_default();

    let changed = language.is_some() || archive.is_some() || archive_root.is_some();
    if let Some(language) = language {
        config.transcription.language = language;
    }
    if let Some(enabled) = archive {
        config.archive.enabled = enabled;
    }
    if let Some(root) = archive_root {
        config.archive.root = Some(root);
    }
    if changed {
        config.save()?;
        println!("{} Configuration saved.", style("✓").green());
        println!();
    }

    println!("{}", style("Current Configuration").bold());
    println!("{}", style("-".repeat(25)).dim());
    println!();
    println!("Config file: {}", Config::config_path().display());
    println!();
    println!("{}", style("[transcription]").cyan());
    println!("  language = {}", config.transcription.language);
    println!();
    println!("{}", style("[archive]").cyan());
    println!("  enabled = {}", config.archive.enabled);
    println!(
        "  root    = {}",
        config
            .archive
            .root
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(unset)".to_string())
    );

    Ok(())
}
