//! Clear-color viewer.
//!
//! Opens a window and clears each swapchain image, exercising the frame
//! pipeline, swapchain rebuilds on resize and orderly shutdown.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p vkl-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--vsync`: Wait for vertical blank when presenting (default)
//! - `--no-vsync`: Present without waiting for vertical blank
//! - `--frames-in-flight <N>`: Number of frame slots (default: 2)
//! - `--validation`: Enable the Khronos validation layer
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use anyhow::{bail, Context};
use vkl_app::{AppConfig, Application};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

fn main() -> anyhow::Result<()> {
    // Check for help flag before starting the app
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let config = parse_args(
        AppConfig::new("vkl viewer").with_size(WIDTH, HEIGHT),
        std::env::args().skip(1),
    )?;
    Application::new(config).run()
}

fn parse_args(
    mut config: AppConfig,
    args: impl IntoIterator<Item = String>,
) -> anyhow::Result<AppConfig> {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--vsync" => config = config.with_vsync(true),
            "--no-vsync" => config = config.with_vsync(false),
            "--validation" => config = config.with_validation(true),
            "--frames-in-flight" => {
                let value = args.next().context("--frames-in-flight needs a value")?;
                let frames: usize = value
                    .parse()
                    .with_context(|| format!("Invalid frame count: {value}"))?;
                if frames == 0 {
                    bail!("--frames-in-flight must be at least 1");
                }
                config = config.with_frames_in_flight(frames);
            }
            other => bail!("Unknown argument: {other} (see --help)"),
        }
    }
    Ok(config)
}

fn print_help() {
    eprintln!(
        "vkl viewer

USAGE:
    cargo run -p vkl-viewer -- [OPTIONS]

OPTIONS:
    --vsync                  Wait for vertical blank when presenting (default)
    --no-vsync               Present without waiting for vertical blank
    --frames-in-flight <N>   Number of frame slots (default: 2)
    --validation             Enable the Khronos validation layer
    -h, --help               Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                 Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<AppConfig> {
        parse_args(AppConfig::default(), args.iter().map(ToString::to_string))
    }

    #[test]
    fn parses_flags() {
        let config = parse(&["--no-vsync", "--frames-in-flight", "3"]).unwrap();
        assert!(!config.vsync);
        assert_eq!(config.frames_in_flight, 3);

        let config = parse(&["--no-vsync", "--vsync"]).unwrap();
        assert!(config.vsync);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse(&["--frames-in-flight"]).is_err());
        assert!(parse(&["--frames-in-flight", "zero"]).is_err());
        assert!(parse(&["--frames-in-flight", "0"]).is_err());
        assert!(parse(&["--fullscreen"]).is_err());
    }
}
