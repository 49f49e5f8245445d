//! lyric-render - Render job pipeline for lyric videos
//!
//! Entry point for the render server and the command-line tools around it.

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Level, info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use lyric_render::cancel::cancel_pair;
use lyric_render::channel::{EventChannel, ReconnectPolicy, WsChannel, ws::ws_url};
use lyric_render::cli::{Args, Commands, ConfigAction};
use lyric_render::config::Config;
use lyric_render::executor::RenderExecutor;
use lyric_render::invoker::TranscodeInvoker;
use lyric_render::lifecycle::RenderJobManager;
use lyric_render::media::MediaProcessorFactory;
use lyric_render::protocol::RenderState;
use lyric_render::reconcile::CompletionClient;
use lyric_render::server;
use lyric_render::store::JsonFileStore;
use lyric_render::subtitle::{Segmenter, Word, to_caption_track};

const DEFAULT_CONFIG_FILE: &str = "lyric-render.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging to both console and file
    setup_logging(args.verbose)?;

    let config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            if Path::new(DEFAULT_CONFIG_FILE).exists() {
                info!("Found {} in current directory, loading...", DEFAULT_CONFIG_FILE);
                Config::from_file(DEFAULT_CONFIG_FILE)?
            } else {
                Config::default()
            }
        }
    };

    match args.command {
        Commands::Serve { bind } => {
            let invoker = TranscodeInvoker::from_config(&config)?;
            if let Err(e) = invoker.media().check_availability().await {
                warn!("Transcoder unavailable, renders will fail: {}", e);
            }

            let store = Arc::new(JsonFileStore::new(&config.storage.projects_dir));
            let executor = RenderExecutor::new(store, invoker);
            let bind = bind.unwrap_or_else(|| config.server.bind_addr.clone());
            server::serve(executor, &bind).await?;
        }
        Commands::Render { source, words, id } => {
            let words = read_words(&words)?;
            let invoker = TranscodeInvoker::from_config(&config)?;
            let scratch = invoker.scratch_dir().await?;

            let (cancel_handle, cancel) = cancel_pair();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling render");
                    cancel_handle.cancel();
                }
            });

            let pb = progress_bar();
            let progress = pb.clone();
            let on_progress = move |percent: u8, status: &str| {
                progress.set_position(u64::from(percent));
                progress.set_message(status.to_string());
            };

            let output = invoker
                .render(&id, &source, &words, scratch.path(), &on_progress, cancel)
                .await;
            match output {
                Ok(output) => {
                    pb.finish_with_message("Done");
                    println!("{}", output.output_path.display());
                    println!("{}", output.media_ref);
                }
                Err(e) => {
                    pb.abandon_with_message("Failed");
                    if let Some(detail) = e.detail() {
                        eprintln!("{}", detail);
                    }
                    return Err(e.into());
                }
            }
        }
        Commands::Submit { id, server } => {
            let server = server.unwrap_or_else(|| config.client.server_url.clone());
            submit(&config, &server, &id).await?;
        }
        Commands::Segment { words, output } => {
            let words = read_words(&words)?;
            let chunks = Segmenter::from(&config.segmenter).segment(&words);
            let track = to_caption_track(&chunks);

            match output {
                Some(path) => {
                    std::fs::write(&path, track)?;
                    info!("Wrote {} caption chunks to {}", chunks.len(), path.display());
                }
                None => print!("{}", track),
            }
        }
        Commands::Probe { input } => {
            let media = MediaProcessorFactory::create_processor(config.media.clone());
            println!("ffmpeg:  {}", media.transcoder_path());
            println!("ffprobe: {}", media.inspector_path());

            match media.get_version_info().await {
                Ok(version) => println!("{}", version.lines().next().unwrap_or_default()),
                Err(e) => println!("ffmpeg not usable: {}", e),
            }

            if let Some(input) = input {
                let probe = media.probe(&input).await;
                println!("visual track: {}", if probe.has_video { "yes" } else { "no" });
                if let Some(duration) = probe.duration {
                    println!("duration: {:.2}s", duration.as_secs_f64());
                }
            }
        }
        Commands::Complete { id, server } => {
            let server = server.unwrap_or_else(|| config.client.server_url.clone());
            match CompletionClient::new(server)?.check(&id).await? {
                Some(status) => println!("{}", serde_json::to_string(&status)?),
                None => bail!("Project {} not found", id),
            }
        }
        Commands::Config { action } => run_config_action(&action)?,
    }

    Ok(())
}

fn run_config_action(action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists, use --force to overwrite", path.display());
            }
            Config::default().save_to_file(path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}

/// Start a render on the server and follow it until it ends
async fn submit(config: &Config, server: &str, id: &str) -> Result<()> {
    let channel = WsChannel::new(ws_url(server), ReconnectPolicy::from(&config.client));
    let manager = RenderJobManager::from_config(channel.clone(), &config.client);
    let completion = CompletionClient::new(server)?;

    info!("Submitting render for {} to {}", id, channel.url());
    manager.open_project(id);
    manager.start_render();

    let pb = progress_bar();
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut ctrl_c => {
                manager.cancel_render();
                let deadline = Instant::now() + Duration::from_secs(10);
                while manager.is_cancelling() && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                pb.abandon_with_message("Cancelled");
                break Ok(());
            }
        }

        pb.set_position(u64::from(manager.progress()));
        pb.set_message(manager.status_message());

        if manager.is_stalled(Instant::now()) {
            warn!("No render events for {}, checking completion", id);
            match completion.check(id).await {
                Ok(Some(status)) => manager.apply_completion(status),
                Ok(None) => break Err(anyhow::anyhow!("Project {} not found", id)),
                Err(e) => warn!("Completion check failed: {}", e),
            }
            if !manager.state().is_terminal() {
                break Err(anyhow::anyhow!(
                    "Render for {} stalled, no events for {}s",
                    id,
                    config.client.stall_timeout_secs
                ));
            }
        }

        match manager.state() {
            RenderState::Completed => {
                pb.finish_with_message("Done");
                match manager.result_media_ref() {
                    Some(video) => println!("{}", video),
                    None => println!("Render for {} completed", id),
                }
                break Ok(());
            }
            RenderState::Error => {
                pb.abandon_with_message("Failed");
                break Err(anyhow::anyhow!(
                    "Render failed: {}",
                    manager.error_message().unwrap_or_default()
                ));
            }
            _ => {}
        }
    };

    manager.teardown();
    channel.disconnect();
    result
}

fn read_words(path: &Path) -> Result<Vec<Word>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read words file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid words file {}", path.display()))
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir = std::env::current_dir()?.join(".lyric-render").join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&log_dir, "lyric-render.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);
    // Keep the guard alive for the duration of the program
    std::mem::forget(guard);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Logging initialized - console: {}, file: {}",
        log_level,
        log_dir.join("lyric-render.log").display()
    );

    Ok(())
}
