use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use tracing::info;

use rawcam_process::{process_bundle, LogProgress};
use rawcam_types::PostProcessSettings;

#[derive(Debug, Parser)]
#[command(name = "rawcam-cli", author, version)]
struct Opt {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Develop a capture bundle into an sRGB JPEG.
    Process {
        /// Input bundle filename
        input: PathBuf,

        /// Output JPEG filename
        #[arg(short, long)]
        output: PathBuf,

        /// JSON file overriding the bundle's post-process settings
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Also rebuild the raw mosaic for DNG export
        #[arg(long)]
        dng: bool,
    },
    /// Print a bundle's manifest.
    Info {
        /// Input bundle filename
        input: PathBuf,
    },
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    tracing_subscriber::registry()
        .with(fmt::layer().compact())
        .with(EnvFilter::from_default_env())
        .init();
}

fn main() -> eyre::Result<()> {
    init_logging();
    let opt = Opt::parse();

    match opt.command {
        Command::Process {
            input,
            output,
            settings,
            dng,
        } => {
            let settings_override = match settings {
                Some(path) => {
                    let json = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading settings {}", path.display()))?;
                    let value: serde_json::Value = serde_json::from_str(&json)
                        .with_context(|| format!("parsing settings {}", path.display()))?;
                    let mut parsed = PostProcessSettings::from_json(&value)
                        .with_context(|| format!("interpreting settings {}", path.display()))?;
                    parsed.dng |= dng;
                    Some(parsed)
                }
                None if dng => {
                    // Keep the bundle's own settings, only forcing the
                    // raw output on.
                    let bundle = rawbundle::open(&input)
                        .with_context(|| format!("opening {}", input.display()))?;
                    let mut parsed = bundle.manifest().post_processing_settings.clone();
                    parsed.dng = true;
                    Some(parsed)
                }
                None => None,
            };

            let mut progress = LogProgress;
            let saved = process_bundle(&input, &output, settings_override, &mut progress)
                .with_context(|| format!("processing {}", input.display()))?;
            info!("wrote {}", saved.display());
        }
        Command::Info { input } => {
            let bundle =
                rawbundle::open(&input).with_context(|| format!("opening {}", input.display()))?;
            let manifest = bundle.manifest();
            println!("{}", serde_json::to_string_pretty(manifest)?);
        }
    }

    Ok(())
}
