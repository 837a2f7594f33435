use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::error;

use youtube_converter_lib::downloader::{DownloadEvent, MediaKind};
use youtube_converter_lib::{logging, Core};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Video,
    Audio,
}

impl From<Format> for MediaKind {
    fn from(f: Format) -> Self {
        match f {
            Format::Video => MediaKind::Video,
            Format::Audio => MediaKind::Audio,
        }
    }
}

/// Download a YouTube video or its audio track, signing in when YouTube asks.
#[derive(Debug, Parser)]
#[command(name = "youtube-converter", version)]
struct Args {
    /// Video URL
    #[arg(required_unless_present_any = ["login", "clear_session"])]
    url: Option<String>,

    #[arg(short, long, value_enum, default_value_t = Format::Video)]
    format: Format,

    /// "Highest" or a height such as 720p (saved preference when omitted)
    #[arg(short, long)]
    quality: Option<String>,

    /// Output directory (saved preference when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory holding cookies, session and settings
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Sign in through the browser and store the session
    #[arg(long)]
    login: bool,

    /// Forget the stored session before doing anything else
    #[arg(long)]
    clear_session: bool,

    /// -v info, -vv debug, -vvv trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.verbose);

    let core = match Core::open(args.data_dir.clone()) {
        Ok(core) => core,
        Err(e) => {
            error!("Startup failed: {}", e);
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.clear_session {
        if let Err(e) = core.clear_session().await {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
        println!("Session cleared");
    }

    if args.login {
        match core.login().await {
            Ok(view) => println!("Signed in (session {})", view.generation),
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    let Some(url) = args.url else {
        return ExitCode::SUCCESS;
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = core.download(
        &url,
        args.format.into(),
        args.quality.as_deref(),
        args.output,
        Arc::new(tx),
    );

    let mut cancel_requested = false;
    let mut last_shown = -1i32;
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    DownloadEvent::Progress { percent, message } => {
                        if percent as i32 != last_shown || percent == 0.0 {
                            last_shown = percent as i32;
                            eprintln!("[{:>5.1}%] {}", percent, message);
                        }
                    }
                    DownloadEvent::Completed { file_path } => {
                        println!("{}", file_path.display());
                        return ExitCode::SUCCESS;
                    }
                    DownloadEvent::Failed { kind, message } => {
                        eprintln!("error ({}): {}", kind, message);
                        return ExitCode::FAILURE;
                    }
                    DownloadEvent::Cancelled => {
                        eprintln!("Download cancelled");
                        return ExitCode::from(130);
                    }
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                eprintln!("Cancelling...");
                cancel_requested = true;
                handle.cancel();
            }
        }
    }

    // sink dropped without a terminal event
    match handle.join().await {
        DownloadEvent::Completed { .. } => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
