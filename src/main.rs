//! nettriage - capture-to-triage pipeline for network anomaly detection

mod constants;
mod logic;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use logic::capture;
use logic::config::PipelineConfig;
use logic::dissect;
use logic::pipeline::{self, PipelineDriver};
use logic::triage::client::{OllamaClient, ReasoningService};

/// Network traffic anomaly triage pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory rotating capture files are written to
    #[arg(long, value_parser)]
    capture_dir: Option<PathBuf>,

    /// Directory session/scored/analysis documents are written to
    #[arg(long, value_parser)]
    output_dir: Option<PathBuf>,

    /// Path of the model artifact
    #[arg(long, value_parser)]
    model: Option<PathBuf>,

    /// Interface to capture on
    #[arg(short = 'i', long, value_parser)]
    interface: Option<String>,

    /// Minimum anomaly score for triage dispatch
    #[arg(short = 't', long, value_parser)]
    threshold: Option<f64>,

    /// Expected anomalous fraction when training
    #[arg(short = 'c', long, value_parser)]
    contamination: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start capture and run the processing loop until interrupted
    Start,
    /// Stop a running capture process
    Stop,
    /// Run the processing loop against an existing capture directory
    Monitor,
    /// Process a single capture file and exit
    Process {
        /// pcap file to process
        file: PathBuf,
    },
    /// Train a model from a previously written sessions document
    Train {
        /// *_sessions.json file to train on
        sessions: PathBuf,
    },
}

fn build_config(args: &Args) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    if let Some(dir) = &args.capture_dir {
        config.capture_dir = dir.clone();
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(path) = &args.model {
        config.model_path = path.clone();
    }
    if let Some(interface) = &args.interface {
        config.capture_interface = interface.clone();
    }
    if let Some(threshold) = args.threshold {
        config.anomaly_threshold = threshold;
    }
    if let Some(contamination) = args.contamination {
        config.contamination = contamination;
    }
    config
}

fn require_tshark() {
    if let Err(e) = dissect::check_available() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn reasoning_client(config: &PipelineConfig) -> Arc<OllamaClient> {
    Arc::new(OllamaClient::new(
        config.reasoning_url.clone(),
        config.reasoning_model.clone(),
    ))
}

async fn run_loop(config: PipelineConfig) {
    let service = reasoning_client(&config);
    if !service.is_available().await {
        log::warn!(
            "reasoning service not reachable at {}; triage will be skipped until it is",
            config.reasoning_url
        );
    }

    let mut driver = PipelineDriver::new(config, service);
    let stop = driver.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupt received, finishing current pass");
            stop.store(true, Ordering::SeqCst);
        }
    });

    driver.run().await;
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = build_config(&args);

    match args.command {
        Command::Start => {
            require_tshark();
            if !capture::check_available() {
                log::error!("tcpdump not found on PATH");
                std::process::exit(1);
            }
            match capture::start_capture(&config) {
                Ok(pid) => log::info!("capture running (pid {})", pid),
                Err(e) => {
                    log::error!("{}", e);
                    std::process::exit(1);
                }
            }
            run_loop(config).await;
        }
        Command::Stop => match capture::stop_capture(&config) {
            Ok(pid) => println!("stopped capture (pid {})", pid),
            Err(e) => {
                log::error!("{}", e);
                std::process::exit(1);
            }
        },
        Command::Monitor => {
            require_tshark();
            run_loop(config).await;
        }
        Command::Process { file } => {
            require_tshark();
            let service = reasoning_client(&config);
            let mut driver = PipelineDriver::new(config, service);
            match driver.process_file(&file).await {
                Ok(summary) => println!(
                    "{}: {} sessions, {} scored, {} flagged, {} analyzed",
                    file.display(),
                    summary.sessions,
                    summary.scored,
                    summary.flagged,
                    summary.analyzed
                ),
                Err(e) => {
                    log::error!("failed to process {}: {}", file.display(), e);
                    std::process::exit(1);
                }
            }
        }
        Command::Train { sessions } => match pipeline::train_from_file(&sessions, &config) {
            Ok(artifact) => println!(
                "model trained (threshold {:.4}) and saved to {}",
                artifact.threshold,
                config.model_path.display()
            ),
            Err(e) => {
                log::error!("training failed: {}", e);
                std::process::exit(1);
            }
        },
    }
}
