//! Command-line runner for the synthetic-tracking pipeline.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use stacker::scheduler::{run_pipeline, PipelineControl};
use stacker::settings::Settings;
use stacker::sweep::SweepState;
use stacker::{loader, report};

#[derive(Parser, Debug)]
#[command(
    name = "hunt",
    about = "Search three groups of FITS frames for faint moving objects"
)]
struct Args {
    /// Settings file (JSON); missing fields fall back to defaults.
    #[arg(long, default_value = "hunt_settings.json")]
    config: PathBuf,

    /// Write a default settings template to the given path and exit.
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Comma-separated FITS files of one group; pass exactly three times.
    #[arg(long = "group")]
    groups: Vec<String>,

    /// Mover report output path.
    #[arg(long, default_value = "movers.log")]
    out: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if let Some(path) = args.write_config {
        Settings::write_template(&path)
            .with_context(|| format!("writing settings template to {}", path.display()))?;
        println!("wrote settings template to {}", path.display());
        return Ok(());
    }

    if args.groups.len() != 3 {
        bail!(
            "expected exactly three --group arguments, got {}",
            args.groups.len()
        );
    }
    let group_paths: Vec<Vec<PathBuf>> = args
        .groups
        .iter()
        .map(|list| list.split(',').map(PathBuf::from).collect())
        .collect();

    let settings = Settings::load(&args.config);
    let (groups, arcsec_per_px) = loader::load_groups(&group_paths)?;
    info!("plate scale {arcsec_per_px:.3} arcsec/px");

    let progress = ProgressBar::new(SweepState::new(&settings).step_bound());
    progress.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} sweep steps")
            .expect("static progress template"),
    );

    let control = PipelineControl::new();
    let output = run_pipeline(groups, &settings, arcsec_per_px, &control, Some(&progress))?;
    progress.finish_and_clear();

    println!("{} mover(s) found", output.movers.len());
    for (i, mover) in output.movers.iter().enumerate() {
        println!(
            "#{i}: motion {:.2} \"/min, PA {:.1} deg, errMid {:.2} px, score {:.1}",
            mover.motion,
            mover.pa.to_degrees(),
            mover.err_mid,
            mover.score
        );
    }

    report::write_report(&args.out, &output.movers)
        .with_context(|| format!("writing report to {}", args.out.display()))?;
    println!("report written to {}", args.out.display());
    Ok(())
}
