use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "micspectrum", about = "Live microphone spectrum analyser")]
pub struct Cli {
    /// List input devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Number of frequency bands to produce
    #[arg(short, long, default_value_t = 512)]
    pub bands: usize,

    /// Analysis window in samples (power of two). Derived from --bands when unset.
    #[arg(short, long)]
    pub window: Option<usize>,

    /// Samples between consecutive windows
    #[arg(short, long, default_value_t = 512)]
    pub stride: usize,

    /// JSON settings file
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Analyse a generated sine at this frequency (Hz) instead of the microphone
    #[arg(long)]
    pub synthetic: Option<f32>,

    /// How long to capture, in seconds
    #[arg(long, default_value_t = 10.0, value_parser = parse_seconds)]
    pub seconds: f32,

    /// Bars shown in the terminal meter
    #[arg(long, default_value_t = 32)]
    pub bars: usize,
}

/// Finite, non-negative seconds that fit in a `Duration`
fn parse_seconds(value: &str) -> Result<f32, String> {
    let seconds: f32 = value.parse().map_err(|e| format!("{}", e))?;
    std::time::Duration::try_from_secs_f32(seconds).map_err(|e| format!("{}", e))?;
    Ok(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_must_be_a_finite_duration() {
        let parse = |value: &str| Cli::try_parse_from(["micspectrum", "--seconds", value]);
        assert_eq!(parse("2.5").unwrap().seconds, 2.5);
        assert!(parse("inf").is_err());
        assert!(parse("NaN").is_err());
        assert!(parse("-1").is_err());
    }

    #[test]
    fn defaults_match_help_text() {
        let cli = Cli::try_parse_from(["micspectrum"]).unwrap();
        assert_eq!(cli.bands, 512);
        assert_eq!(cli.stride, 512);
        assert_eq!(cli.seconds, 10.0);
        assert!(cli.window.is_none());
    }
}
