use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use neuromorph::config::Config;
use neuromorph::pipeline::{Pipeline, SeriesDisposition, Upload};
use neuromorph::registry::{JsonFileRegistry, SeriesRegistry};
use neuromorph::toolchain::FslToolchain;

#[derive(Parser)]
#[command(name = "neuromorph", version, about = "DICOM series ingestion and brain morphometry")]
struct Cli {
    /// JSON registry file for committed series records
    #[arg(long, env = "NEUROMORPH_REGISTRY", default_value = "registry.json")]
    registry: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stage a batch of DICOM slice files and commit the resulting series
    Ingest {
        patient_id: String,
        #[arg(required = true)]
        slices: Vec<PathBuf>,
    },
    /// Run the volumetric analysis on a committed series
    Analyze {
        patient_id: String,
        series_id: String,
    },
    /// Delete a series record and all of its storage
    Remove {
        patient_id: String,
        series_id: String,
    },
    /// Print a committed series record as JSON
    Show {
        patient_id: String,
        series_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "neuromorph=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let pipeline = Pipeline::new(Config::from_env(), JsonFileRegistry::new(&cli.registry));

    match cli.command {
        Command::Ingest { patient_id, slices } => {
            let mut uploads = Vec::with_capacity(slices.len());
            for path in &slices {
                uploads.push(Upload {
                    filename: path.to_string_lossy().into_owned(),
                    bytes: fs::read(path).with_context(|| format!("reading {}", path.display()))?,
                });
            }

            let rejected = pipeline.stage_batch(&patient_id, &uploads)?;
            for slice in &rejected {
                println!("rejected slice {}: {}", slice.filename, slice.reason);
            }

            let report = pipeline.commit_staged(&patient_id)?;
            for slice in &report.rejected_slices {
                println!("rejected slice {}: {}", slice.filename, slice.reason);
            }
            for disposition in &report.series {
                match disposition {
                    SeriesDisposition::Committed {
                        series_id,
                        description,
                    } => println!("committed series \"{description}\" ({series_id})"),
                    SeriesDisposition::Rejected {
                        description: _,
                        reason,
                    } => println!("rejected series: {reason}"),
                }
            }
        }

        Command::Analyze {
            patient_id,
            series_id,
        } => {
            let series = pipeline
                .analyze(&FslToolchain::new(), &patient_id, &series_id)
                .await?;
            println!("status: {}", series.status);
            if let (Some(whole), Some(left), Some(right)) = (
                series.whole_brain_volume,
                series.left_volume,
                series.right_volume,
            ) {
                println!("whole brain volume: {whole:.3} mm^3");
                println!("left hippocampus:   {left:.3} mm^3");
                println!("right hippocampus:  {right:.3} mm^3");
                if let (Some(nl), Some(nr)) = (
                    series.normalized_left_volume(),
                    series.normalized_right_volume(),
                ) {
                    println!("normalized left:  {nl:.5}");
                    println!("normalized right: {nr:.5}");
                }
            }
        }

        Command::Remove {
            patient_id,
            series_id,
        } => {
            pipeline.remove(&patient_id, &series_id)?;
            println!("series {series_id} removed");
        }

        Command::Show {
            patient_id,
            series_id,
        } => {
            let series = pipeline
                .registry()
                .find(&patient_id, &series_id)?
                .with_context(|| format!("series {series_id} is not registered"))?;
            println!("{}", serde_json::to_string_pretty(&series)?);
        }
    }

    Ok(())
}
