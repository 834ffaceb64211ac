#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use classmoments::config::EngineConfig;
use classmoments::data::{LabelColumns, TableSchema, TsvBlockSource, load_table};
use classmoments::progress::{AccumulationObserver, AccumulationStage};
use classmoments::report::MomentsReport;
use classmoments::{
    ClassLayout, MomentEstimates, Normalization, estimate, estimate_chunked_with_progress,
};

#[derive(Clone, Copy, ValueEnum)]
pub enum NormalizationCli {
    /// Divide second moments by count - 1
    Unbiased,
    /// Divide second moments by count
    Biased,
}

impl From<NormalizationCli> for Normalization {
    fn from(value: NormalizationCli) -> Self {
        match value {
            NormalizationCli::Unbiased => Normalization::Unbiased,
            NormalizationCli::Biased => Normalization::Biased,
        }
    }
}

#[derive(Args)]
pub struct EstimateArgs {
    /// Path to a tab-separated table with a header row
    pub data: PathBuf,

    /// Column holding integer class labels (0 excludes a row)
    #[arg(long, value_name = "COLUMN", conflicts_with = "soft_columns")]
    pub label_column: Option<String>,

    /// Comma-separated columns holding per-class membership weights
    #[arg(long, value_name = "COLUMNS", value_delimiter = ',')]
    pub soft_columns: Option<Vec<String>>,

    /// Comma-separated feature columns; defaults to every non-label column
    #[arg(long, value_name = "COLUMNS", value_delimiter = ',')]
    pub features: Option<Vec<String>>,

    /// Number of classes; classes absent from the data are reported as empty
    #[arg(long, value_name = "N")]
    pub classes: Option<usize>,

    /// Normalization of the covariances (overrides the configuration file)
    #[arg(long, value_enum)]
    pub normalization: Option<NormalizationCli>,

    /// Compute class means only
    #[arg(long)]
    pub means_only: bool,

    /// Stream the table in blocks instead of loading it into memory
    #[arg(long)]
    pub chunked: bool,

    /// Upper bound on rows per block in chunked mode
    #[arg(long, value_name = "ROWS")]
    pub max_block_rows: Option<usize>,

    /// Largest class count accepted from the label column
    #[arg(long, value_name = "N")]
    pub max_classes: Option<usize>,

    /// Comma-separated class priors stored alongside the statistics
    #[arg(long, value_name = "PRIORS", value_delimiter = ',')]
    pub priors: Option<Vec<f64>>,

    /// Engine configuration file (.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Where to write the report
    #[arg(long, default_value = "moments.toml")]
    pub output: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "classmoments",
    version,
    about = "Streaming per-class mean and covariance estimation",
    long_about = "Computes class-conditional means and covariances of tabular data \
                 under hard labels, soft label weights, or no labels at all."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate class moments from a TSV file
    #[command(about = "Estimate class means and covariances (outputs: moments.toml)")]
    Estimate(EstimateArgs),
}

/// Drives an indicatif bar from accumulation events.
struct BarProgress {
    bar: Option<ProgressBar>,
}

fn create_progress_bar(len: Option<usize>, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(len.map(|rows| rows as u64), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos} rows ({per_sec}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

impl AccumulationObserver for BarProgress {
    fn on_stage_start(&mut self, stage: AccumulationStage, total_rows: Option<usize>) {
        if stage == AccumulationStage::BlockAccumulation {
            self.bar = Some(create_progress_bar(total_rows, stage.describe()));
        }
    }

    fn on_stage_advance(&mut self, stage: AccumulationStage, processed_rows: usize) {
        let _ = stage;
        if let Some(bar) = &self.bar {
            bar.set_position(processed_rows as u64);
        }
    }

    fn on_stage_finish(&mut self, stage: AccumulationStage) {
        let _ = stage;
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

fn schema_from_args(args: &EstimateArgs) -> TableSchema {
    let labels = match (&args.label_column, &args.soft_columns) {
        (Some(column), _) => LabelColumns::Hard(column.clone()),
        (None, Some(columns)) => LabelColumns::Soft(columns.clone()),
        (None, None) => LabelColumns::None,
    };
    TableSchema {
        features: args.features.clone().unwrap_or_default(),
        labels,
    }
}

fn load_config(args: &EstimateArgs) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(normalization) = args.normalization {
        config.normalization = normalization.into();
    }
    if args.means_only {
        config.covariances = false;
    }
    if let Some(rows) = args.max_block_rows {
        config.max_block_rows = rows;
    }
    if let Some(classes) = args.max_classes {
        config.max_classes = classes;
    }
    config.validate()?;
    Ok(config)
}

fn print_summary(estimates: &MomentEstimates) {
    println!(
        "Estimated {} {} over {} features ({})",
        estimates.n_classes(),
        if estimates.pooled { "pooled group" } else { "classes" },
        estimates.n_features,
        estimates.normalization.describe()
    );
    for (name, class) in estimates.layout.names.iter().zip(&estimates.classes) {
        println!("  {name}: {:?}, weight {:.3}", class.status(), class.weight());
    }
}

pub fn run_estimate(args: EstimateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    let schema = schema_from_args(&args);

    let (estimates, feature_names) = if args.chunked {
        println!(
            "Streaming {} in blocks of at most {} rows",
            args.data.display(),
            config.max_block_rows
        );
        let mut source = TsvBlockSource::open(&args.data, &schema)?;
        if let Some(classes) = args.classes {
            source = source.with_classes(classes);
        }
        let feature_names = source.feature_names().to_vec();
        let mut progress = BarProgress { bar: None };
        let estimates =
            estimate_chunked_with_progress(&mut source, &config.chunk_options(), &mut progress)?;
        (estimates, feature_names)
    } else {
        println!("Loading {}", args.data.display());
        let table = load_table(&args.data, &schema, config.max_in_memory_rows)?;
        println!(
            "Loaded {} rows with {} features",
            table.n_rows(),
            table.feature_names.len()
        );
        let layout = table.class_layout(args.classes);
        let estimates = estimate(
            table.samples.view(),
            &table.assignment(args.classes),
            &config.estimate_options(),
        )?
        .with_layout(layout)?;
        (estimates, table.feature_names)
    };

    let estimates = match args.priors {
        Some(priors) => {
            let layout = ClassLayout {
                names: estimates.layout.names.clone(),
                priors: Some(priors),
            };
            estimates.with_layout(layout)?
        }
        None => estimates,
    };

    print_summary(&estimates);
    let report = MomentsReport::from_estimates(&estimates, &feature_names)?;
    report.save(&args.output)?;
    println!("Report saved to: {}", args.output.display());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result: Result<(), Box<dyn std::error::Error>> = match command {
        Some(Commands::Estimate(args)) => run_estimate(args),
        None => Cli::command().print_help().map_err(|e| e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
