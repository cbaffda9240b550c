use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use houndforward_core::{
    ClientConfig, DogProfile, FfmpegBackend, FrameExtractor, HoundError, HttpTransport,
    OverlaySurface, OverlayView, PlaybackControls, PlaybackSpeed, Protocol, SessionController,
    SessionError, VideoFile, format_result_readable, overlay,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::fs;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod media;

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{:.0}m {:.0}s", (secs / 60.0).floor(), secs % 60.0)
    }
}

/// CLI wrapper for Protocol enum (needed for clap ValueEnum)
#[derive(Clone, Default, ValueEnum)]
enum CliProtocol {
    #[default]
    Direct,
    Queued,
}

impl From<CliProtocol> for Protocol {
    fn from(cli: CliProtocol) -> Self {
        match cli {
            CliProtocol::Direct => Protocol::Direct,
            CliProtocol::Queued => Protocol::Queued,
        }
    }
}

#[derive(Clone, ValueEnum)]
enum CliSpeed {
    #[value(name = "1")]
    Normal,
    #[value(name = "0.5")]
    Half,
    #[value(name = "0.25")]
    Quarter,
}

impl From<CliSpeed> for PlaybackSpeed {
    fn from(cli: CliSpeed) -> Self {
        match cli {
            CliSpeed::Normal => PlaybackSpeed::Normal,
            CliSpeed::Half => PlaybackSpeed::Half,
            CliSpeed::Quarter => PlaybackSpeed::Quarter,
        }
    }
}

#[derive(Parser)]
#[command(name = "houndforward")]
#[command(about = "Upload a video of your dog walking and get a gait analysis back")]
struct Cli {
    /// Print debug logs to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analyse a video
    Analyze(AnalyzeArgs),
    /// Check that the analysis service is up
    Health {
        /// Analysis service base URL
        #[arg(long)]
        api_url: Option<String>,
    },
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Video of the dog walking or trotting, filmed side-on
    video: PathBuf,

    /// I agree to this video being uploaded and analysed
    #[arg(long)]
    consent: bool,

    /// Height at the withers in cm (defaults to 50)
    #[arg(long)]
    withers: Option<String>,

    #[arg(long)]
    breed: Option<String>,

    #[arg(long)]
    age: Option<String>,

    /// Known conditions, e.g. "arthritis,previous injury"
    #[arg(long, value_delimiter = ',')]
    conditions: Vec<String>,

    /// Analysis service base URL
    #[arg(long)]
    api_url: Option<String>,

    #[arg(long)]
    protocol: Option<CliProtocol>,

    /// Draw demonstration markers when the service detects none
    #[arg(long)]
    illustrative: bool,

    /// Also show the markers for live playback at this speed
    #[arg(long)]
    live: Option<CliSpeed>,

    /// Where to write frames (defaults to the cache directory)
    #[arg(short, long)]
    out: Option<PathBuf>,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "houndforward=debug,houndforward_core=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn create_progress_bar(msg: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{bar:30.cyan/dim}] {pos:>3}%")?
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
            .progress_chars("=> "),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    Ok(pb)
}

fn load_config(
    api_url: Option<String>,
    protocol: Option<CliProtocol>,
    illustrative: bool,
) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env()?;
    if let Some(url) = api_url {
        config.api_base_url = url;
    }
    if let Some(protocol) = protocol {
        config.protocol = protocol.into();
    }
    if illustrative {
        config.illustrative_overlay = true;
    }
    config.validate()?;
    debug!(?config, "configuration loaded");
    Ok(config)
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("{} {}", style("Error:").red().bold(), msg);
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Analyze(args) => analyze(args).await,
        Command::Health { api_url } => health(api_url).await,
    }
}

async fn health(api_url: Option<String>) -> Result<()> {
    let config = load_config(api_url, None, false)?;
    let transport = HttpTransport::new(config.clone())?;
    match transport.health().await {
        Ok(status) => {
            println!(
                "{} {} {}",
                style("✓").green().bold(),
                config.api_base_url,
                style(&status.status).dim()
            );
            Ok(())
        }
        Err(e) => fail(format!("{} is not reachable: {e}", config.api_base_url)),
    }
}

async fn analyze(args: AnalyzeArgs) -> Result<()> {
    let config = load_config(args.api_url.clone(), args.protocol.clone(), args.illustrative)?;

    println!(
        "\n{}  {}\n",
        style("houndforward").cyan().bold(),
        style("Gait Analysis").dim()
    );

    let data = fs::read(&args.video)
        .await
        .with_context(|| format!("Could not read {}", args.video.display()))?;
    let name = args
        .video
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "video".to_string());
    let video = VideoFile::new(name, media::mime_for_path(&args.video), data);

    let transport = Arc::new(HttpTransport::new(config.clone())?);
    let backend = Arc::new(FfmpegBackend::new(&config.ffmpeg_bin, &config.ffprobe_bin));
    let extractor = FrameExtractor::new(backend, config.extract_timeout());
    let controller = SessionController::new(config.clone(), transport, extractor);

    controller
        .set_profile(DogProfile {
            withers_cm: args.withers.clone(),
            breed: args.breed.clone(),
            age: args.age.clone(),
            conditions: args.conditions.clone(),
        })
        .await?;

    if let Err(e) = controller.select_file(video).await {
        fail(e);
    }
    println!(
        "{} Selected: {}",
        style("✓").green().bold(),
        style(args.video.display()).dim()
    );

    controller.set_consent(args.consent).await?;
    match controller.submit().await {
        Ok(_) => {}
        Err(HoundError::Session(SessionError::ConsentRequired)) => fail(format!(
            "{} (pass {})",
            SessionError::ConsentRequired,
            style("--consent").bold()
        )),
        Err(e) => return Err(e.into()),
    }

    println!("{}", style("─".repeat(60)).dim());

    let step_start = Instant::now();
    let pb = create_progress_bar("Analysing gait...")?;
    let mut progress = controller.progress().subscribe();
    let bar = pb.clone();
    let progress_task = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let state = *progress.borrow_and_update();
            bar.set_position(state.percent as u64);
            if state.finished {
                break;
            }
        }
    });

    tokio::select! {
        _ = controller.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            controller.cancel().await?;
            progress_task.abort();
            pb.abandon_with_message(format!("{} Cancelled", style("✗").red().bold()));
            return Ok(());
        }
    }
    progress_task.abort();

    let session = controller.snapshot().await;
    let Some(result) = session.result() else {
        fail("the analysis finished without a result");
    };

    let status = if result.outcome.is_degraded() {
        style("✗").red().bold()
    } else {
        style("✓").green().bold()
    };
    pb.set_position(session.progress_percent() as u64);
    pb.finish_with_message(format!(
        "{} Analysed {}",
        status,
        style(format!("[{}]", format_duration(step_start.elapsed()))).dim()
    ));

    // Frames
    let out_dir = args
        .out
        .clone()
        .unwrap_or_else(|| media::get_session_dir(session.id()));
    if let Some(frame) = &result.frame_image {
        fs::create_dir_all(&out_dir).await?;
        let frame_path = out_dir.join(format!("frame.{}", frame.format.extension()));
        fs::write(&frame_path, &frame.bytes).await?;

        let overlay_path = out_dir.join("overlay.png");
        overlay::write_annotated_png(result, &overlay_path).await?;
        println!(
            "\n{} {}",
            style("Saved:").dim(),
            style(overlay_path.display()).cyan()
        );
    }

    println!("{}", style("─".repeat(60)).dim());
    println!("{}", format_result_readable(result));

    if let Some(speed) = args.live {
        controller.show_overlay().await?;
        let step = controller.step().await;
        let snapshot = controller.snapshot().await;
        if let (Some(surface), Some(result)) = (OverlaySurface::for_step(step), snapshot.result()) {
            let mut controls = PlaybackControls::default();
            controls.set_speed(speed.into());
            controls.toggle_playback();
            print_markers(&overlay::render(result, surface), &controls);
        }
    }

    Ok(())
}

fn print_markers(view: &OverlayView<'_>, controls: &PlaybackControls) {
    match view {
        OverlayView::Placeholder(text) => println!("{}", style(text).dim()),
        OverlayView::Frame {
            surface,
            markers,
            illustrative,
            ..
        } => {
            println!(
                "{} {:?} at {}x {}",
                style("Overlay:").dim(),
                surface,
                controls.speed.multiplier(),
                if *illustrative {
                    style("(illustrative)").yellow()
                } else {
                    style("").dim()
                }
            );
            for marker in markers.iter() {
                println!(
                    "  • {:>5.1}% {:>5.1}%  {}",
                    marker.left_percent, marker.top_percent, marker.color
                );
            }
        }
    }
}
