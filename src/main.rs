mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use micspectrum::audio::{
    downsampled, list_input_sources, signals, AudioHost, CaptureConfiguration, CaptureSettings,
    CpalHost, StaticPermission, SyntheticHost, SyntheticSignal,
};
use micspectrum::CaptureController;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cli::Cli;

const METER_LEVELS: &[char] = &[' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    if cli.list_devices {
        let sources = list_input_sources()?;
        println!("Input devices:");
        for source in &sources {
            println!(
                "  {}{} ({} ch)",
                if source.is_default { "* " } else { "  " },
                source.name,
                source.max_channels
            );
        }
        return Ok(());
    }

    let settings = match &cli.settings {
        Some(path) => CaptureSettings::from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => CaptureSettings::default(),
    };

    let config = match cli.window {
        Some(window) => {
            CaptureConfiguration::from_band_count_with_window(cli.bands, window, cli.stride)?
        }
        None => CaptureConfiguration::from_band_count(
            cli.bands,
            cli.stride,
            settings.max_window_samples,
        )?,
    };

    let host: Arc<dyn AudioHost> = match cli.synthetic {
        Some(frequency) => {
            log::info!("Using synthetic {} Hz sine input", frequency);
            Arc::new(SyntheticHost::generator(
                SyntheticSignal::Sine {
                    frequency,
                    amplitude: 0.5,
                },
                settings.sample_rate.unwrap_or(signals::DEFAULT_SAMPLE_RATE),
            ))
        }
        None => Arc::new(CpalHost),
    };

    let mut controller =
        CaptureController::new(host, Arc::new(StaticPermission::granted()), settings);
    controller.start(config).await?;

    let sample_rate = controller
        .format()
        .map(|f| f.sample_rate)
        .unwrap_or(signals::DEFAULT_SAMPLE_RATE);
    let hz_per_band = sample_rate as f32 / config.window_samples() as f32;
    let ceiling = controller.settings().magnitude_ceiling;
    let factor = (config.band_count() / cli.bars.max(1)).max(1);

    let outputs = controller.outputs();
    let deadline = Instant::now()
        .checked_add(Duration::try_from_secs_f32(cli.seconds)?)
        .context("--seconds is too large")?;
    let mut ticker = tokio::time::interval(Duration::from_millis(100));

    while Instant::now() < deadline {
        ticker.tick().await;
        if !outputs.is_running() {
            if let Some(e) = outputs.last_error() {
                log::error!("Capture stopped: {}", e);
            }
            break;
        }

        let snapshot = outputs.current_snapshot();
        let meter: String = downsampled(&snapshot, factor)
            .iter()
            .map(|&m| {
                let top = (METER_LEVELS.len() - 1) as f32;
                let level = ((m / ceiling).sqrt() * top).round() as usize;
                METER_LEVELS[level.min(METER_LEVELS.len() - 1)]
            })
            .collect();

        match snapshot.peak() {
            Some((band, magnitude)) if magnitude > 0.0 => println!(
                "[{}] peak {:>7.1} Hz  {:>6.2}",
                meter,
                band as f32 * hz_per_band,
                magnitude
            ),
            _ => println!("[{}] silent", meter),
        }
    }

    controller.stop();
    Ok(())
}
