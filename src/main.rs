use anyhow::Context;
use biomed_geojson::config::{parse_override, AppConfig};
use biomed_geojson::pipeline::{self, LevelOutcome};
use biomed_geojson::server;
use biomed_geojson::types::{Level, Reduction};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build one GeoJSON file per requested level
    Generate {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Input CSV, overriding `input.data_csv`
        #[arg(short, long, value_name = "CSV")]
        input: Option<PathBuf>,
        /// Comma-separated levels (zip,county,chapter,region,division)
        #[arg(short, long, value_delimiter = ',')]
        levels: Vec<Level>,
        /// Output directory, overriding `output.dir`
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
        /// Reduction for one column, e.g. `Donors=max`; repeatable
        #[arg(long = "reduce", value_name = "COL=RULE", value_parser = parse_override)]
        reduce: Vec<(String, Reduction)>,
    },
    /// Accept uploads and run the pipeline over HTTP
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

fn print_summary(outcomes: &[LevelOutcome]) {
    println!("{:<10} {:>8} {:>8} {:>8} {:>8}  output", "level", "groups", "skipped", "missing", "features");
    for outcome in outcomes {
        match (&outcome.report, &outcome.error) {
            (Some(report), _) => println!(
                "{:<10} {:>8} {:>8} {:>8} {:>8}  {}",
                report.level.slug(),
                report.groups_produced,
                report.rows_skipped,
                report.join_misses,
                report.features_written,
                report
                    .output_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
            (None, Some(error)) => println!("{:<10} failed: {}", outcome.level.slug(), error),
            (None, None) => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            config,
            input,
            levels,
            output,
            reduce,
        } => {
            let mut app_config = AppConfig::load_or_default(&config)?;
            if let Some(dir) = output {
                app_config.output.dir = dir;
            }
            app_config.aggregation.apply_overrides(reduce);
            let input = input
                .or_else(|| app_config.input.data_csv.clone())
                .context("no input CSV; pass --input or set input.data_csv")?;
            let levels = if levels.is_empty() {
                app_config.input.levels.clone()
            } else {
                levels
            };

            println!("Generating {:?} for {:?}", levels, input);
            let outcomes =
                tokio::task::spawn_blocking(move || pipeline::process_file(&input, &levels, &app_config))
                    .await??;
            print_summary(&outcomes);

            if !outcomes.is_empty() && outcomes.iter().all(|o| o.error.is_some()) {
                anyhow::bail!("every requested level failed");
            }
        }
        Commands::Serve { config } => {
            let app_config = AppConfig::load_or_default(&config)?;
            server::start_server(app_config).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_flag_repeats() {
        let cli = Cli::try_parse_from([
            "biomed-geojson",
            "generate",
            "--reduce",
            "Donors=max",
            "--reduce",
            "2023=mean",
        ])
        .unwrap();
        match cli.command {
            Commands::Generate { reduce, .. } => assert_eq!(
                reduce,
                vec![
                    ("Donors".to_string(), Reduction::Max),
                    ("2023".to_string(), Reduction::Mean),
                ]
            ),
            Commands::Serve { .. } => panic!("expected generate"),
        }
    }
}
