use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vivienda_map::config::AppConfig;
use vivienda_map::data::parse_month;
use vivienda_map::normalize::{AliasTable, Normalizer, RuleKind};
use vivienda_map::pipeline::{Dashboard, MonthRange};
use vivienda_map::{render, server};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the joined table, choropleth GeoJSON, scale and PNG preview
    Generate {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        /// Only this dataset (default: all)
        #[arg(short, long)]
        dataset: Option<String>,
        /// First month to include (YYYY-MM)
        #[arg(long)]
        from: Option<String>,
        /// Last month to include (YYYY-MM)
        #[arg(long)]
        to: Option<String>,
    },
    /// Serve the dashboard API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print the canonical form of municipality names
    Normalize {
        /// Alias table (default: the embedded one)
        #[arg(long, value_name = "FILE")]
        aliases: Option<PathBuf>,
        /// Compare names with their accents
        #[arg(long)]
        keep_accents: bool,
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Validate and list the alias table
    Aliases {
        #[arg(long, value_name = "FILE")]
        aliases: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Generate {
            config,
            dataset,
            from,
            to,
        } => {
            println!("Generating outputs with config: {:?}", config);
            let app_config = AppConfig::load_from_file(config)?;
            let range = MonthRange {
                from: cli_month(from.as_deref())?,
                to: cli_month(to.as_deref())?,
            };

            let selected: Vec<_> = match dataset {
                Some(name) => vec![app_config.dataset(Some(name))?.clone()],
                None => app_config.datasets.clone(),
            };
            let output = app_config.output.clone();
            let dashboard = Dashboard::from_config(app_config)?;

            for dataset in &selected {
                println!("Processing dataset: {}", dataset.name);
                let snapshot = dashboard
                    .snapshot(dataset, range)
                    .await
                    .with_context(|| format!("Failed to build dataset '{}'", dataset.name))?;

                let dir = if selected.len() > 1 {
                    output.dir.join(&dataset.name)
                } else {
                    output.dir.clone()
                };
                let files = render::write_outputs(
                    &snapshot,
                    &dataset.name_property,
                    &dir,
                    output.width,
                    output.height,
                )
                .with_context(|| format!("Failed to write outputs to {:?}", dir))?;

                println!(
                    "  {} regions, {} with prices -> {:?}",
                    snapshot.joined.len(),
                    snapshot.joined.matched_count(),
                    files.geojson
                );
                if let Some(advisory) = snapshot.joined.missing_advisory() {
                    println!("  Note: {}", advisory);
                }
                if !snapshot.joined.unmatched_sources().is_empty() {
                    let unmatched = snapshot.joined.unmatched_sources().join(", ");
                    println!("  Unmatched names: {}", unmatched);
                }
            }

            println!("Generation complete!");
        }
        Commands::Serve { config } => {
            println!("Serving dashboard with config: {:?}", config);
            let app_config = AppConfig::load_from_file(config)?;
            let dashboard = Dashboard::from_config(app_config)?;
            server::start_server(dashboard).await?;
        }
        Commands::Normalize {
            aliases,
            keep_accents,
            names,
        } => {
            let table = load_aliases(aliases.as_ref())?;
            let normalizer = Normalizer::new(&table, !keep_accents)?;
            for name in names {
                let resolution = normalizer.resolve(name);
                let via = match resolution.via {
                    Some(RuleKind::Alias) => " (alias)",
                    Some(RuleKind::SubLocality) => " (sub-locality)",
                    None => "",
                };
                println!("{} -> {}{}", name, resolution.canonical, via);
            }
        }
        Commands::Aliases { aliases } => {
            let table = load_aliases(aliases.as_ref())?;
            Normalizer::new(&table, true).context("Alias table is inconsistent")?;
            println!("Alias table version {} ({} rules)", table.version(), table.rules.len());
            for rule in &table.rules {
                println!("  {:<32} -> {} [{:?}]", rule.observed, rule.canonical, rule.kind);
            }
        }
    }

    Ok(())
}

fn load_aliases(path: Option<&PathBuf>) -> Result<AliasTable> {
    let table = match path {
        Some(path) => AliasTable::load(path)
            .with_context(|| format!("Failed to load alias table {:?}", path))?,
        None => AliasTable::embedded()?,
    };
    Ok(table)
}

fn cli_month(value: Option<&str>) -> Result<Option<chrono::NaiveDate>> {
    value
        .map(|v| parse_month(v).with_context(|| format!("Invalid month '{}', expected YYYY-MM", v)))
        .transpose()
}
