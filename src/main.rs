use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use nrf_legacy_dfu::config::DfuConfig;
use nrf_legacy_dfu::orchestrator::perform_dfu;
use nrf_legacy_dfu::transport_btleplug::BtleplugTransportManager;

/// Update firmware on Nordic Legacy DFU BLE targets
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a DFU package (.zip as produced by `nrfutil pkg generate`)
    package: PathBuf,

    /// Target device name, or a colon-separated BLE address
    #[arg(long)]
    device: String,

    /// Suppress all non-error output
    #[arg(long)]
    quiet: bool,

    /// Packets sent between receipt notifications (default: platform-sensitive, see DfuConfig)
    #[arg(long)]
    packets_per_notification: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = DfuConfig {
        packets_per_notification: args.packets_per_notification,
        ..DfuConfig::default()
    };

    let progress = if args.quiet {
        None
    } else {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {msg}")
                .unwrap()
                .progress_chars("##-"),
        );
        Some(bar)
    };

    let on_progress = |percent: f32| {
        if let Some(bar) = &progress {
            bar.set_position(percent as u64);
        }
    };
    let on_log = |message: &str| {
        log::info!("{message}");
        if let Some(bar) = &progress {
            bar.set_message(message.to_string());
        }
    };

    let manager = BtleplugTransportManager::new();
    let result = perform_dfu(&manager, &args.package, &args.device, &config, on_progress, on_log).await;

    match result {
        Ok(()) => {
            if let Some(bar) = &progress {
                bar.finish_with_message("done");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("{err}");
            if !args.quiet {
                eprintln!("error: {err}");
            }
            ExitCode::FAILURE
        }
    }
}
