//! `equilibra` — run a CGE model file against a configuration and write
//! the reports as JSON sheet-sets.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use equilibra_eval::{Model, RunConfig};

#[derive(Debug, Parser)]
#[command(name = "equilibra", version, about = "Computable general equilibrium solver")]
struct Args {
    /// The model file to solve.
    #[arg(long)]
    model: PathBuf,

    /// The YAML run configuration.
    #[arg(long, default_value = "default.yml")]
    config: PathBuf,

    /// Directory the report files are written into.
    #[arg(long, default_value = ".")]
    output: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = RunConfig::from_path(&args.config)
        .with_context(|| format!("loading configuration {}", args.config.display()))?;
    let output_paths = config.files.clone();

    let mut model = Model::new(config);
    model
        .load_model_file(&args.model)
        .with_context(|| format!("parsing model {}", args.model.display()))?;

    let output = model.run().context("running the model")?;

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("creating output directory {}", args.output.display()))?;
    for (name, sheets) in &output.reports {
        let path = args.output.join(format!("{name}.json"));
        equilibra_tables::save_json(&path, sheets)
            .with_context(|| format!("writing report {}", path.display()))?;
        info!("wrote {}", path.display());
    }
    for (symbol, sheets) in &output.write_files {
        // Output files resolve through the configured path map, falling
        // back to the output directory under their symbolic name.
        let path = output_paths
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| args.output.join(format!("{symbol}.json")));
        equilibra_tables::save_json(&path, sheets)
            .with_context(|| format!("writing output file {}", path.display()))?;
        info!("wrote {}", path.display());
    }

    Ok(())
}
