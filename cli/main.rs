#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fs::File;
use std::io::{BufWriter, IsTerminal, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;

use acuity::cohort::CohortKind;
use acuity::config::WorkflowConfig;
use acuity::data::{
    CohortData, ColumnSpec, DataError, load_cohort_data, load_cohort_data_with_labels,
    load_feature_data,
};
use acuity::evaluate::{EvaluationSettings, evaluate_model};
use acuity::metrics::BootstrapSettings;
use acuity::model::TrainedModel;
use acuity::progress::SearchProgressObserver;
use acuity::search::Scoring;
use acuity::workflow::{CV_REPORT_FILE, run_workflow};

#[derive(Clone, Copy, ValueEnum)]
pub enum ScoringCli {
    #[value(name = "roc_auc")]
    RocAuc,
    #[value(name = "neg_log_loss")]
    NegLogLoss,
}

impl From<ScoringCli> for Scoring {
    fn from(value: ScoringCli) -> Self {
        match value {
            ScoringCli::RocAuc => Scoring::RocAuc,
            ScoringCli::NegLogLoss => Scoring::NegLogLoss,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CohortCli {
    Full,
    #[value(name = "high_risk")]
    HighRisk,
    Control,
}

impl From<CohortCli> for CohortKind {
    fn from(value: CohortCli) -> Self {
        match value {
            CohortCli::Full => CohortKind::Full,
            CohortCli::HighRisk => CohortKind::HighRisk,
            CohortCli::Control => CohortKind::Control,
        }
    }
}

#[derive(Args)]
pub struct TrainArgs {
    /// Path to a TSV (or .csv) file with icustay_id, outcome, risk and feature columns
    pub data: String,

    /// Separate file holding the outcome and risk columns, joined on the identifier
    #[arg(long)]
    pub labels: Option<String>,

    /// Workflow configuration (.toml); flags below override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory the fitted models and cv_report.tsv are written to
    #[arg(long)]
    pub model_dir: Option<PathBuf>,

    /// Metric used to rank hyperparameter candidates
    #[arg(long, value_enum)]
    pub scoring: Option<ScoringCli>,

    /// Reference risk at or above which a stay is high-risk
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Seed for the control sample and the boosted search
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of randomized boosted configurations to evaluate
    #[arg(long, value_name = "N")]
    pub n_iter: Option<usize>,

    /// Number of cross-validation folds
    #[arg(long, value_name = "K")]
    pub folds: Option<usize>,

    /// Cohorts to train (repeatable); all three by default
    #[arg(long, value_enum)]
    pub cohort: Vec<CohortCli>,
}

#[derive(Args)]
pub struct EvaluateArgs {
    /// Path to a labelled TSV (or .csv) file
    pub data: String,

    /// Path to trained model file (.toml)
    #[arg(long)]
    pub model: String,

    /// Separate file holding the outcome and risk columns
    #[arg(long)]
    pub labels: Option<String>,

    /// Workflow configuration (.toml) naming the identifier, outcome and risk columns
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of features listed in the ranking
    #[arg(long, default_value = "10")]
    pub top_features: usize,

    /// Bootstrap resamples for the confidence intervals
    #[arg(long, default_value = "2000")]
    pub n_bootstraps: usize,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Path to a TSV (or .csv) file with the identifier and feature columns
    pub data: String,

    /// Path to trained model file (.toml)
    #[arg(long)]
    pub model: String,

    /// Workflow configuration (.toml) naming the identifier column
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Output path for the predictions
    #[arg(long, default_value = "predictions.tsv")]
    pub output: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "acuity",
    about = "ICU severity-of-illness mortality models",
    long_about = "Trains penalized logistic regression and gradient-boosted mortality models \
                 on full, high-risk and control cohorts of ICU stays, with cross-validated \
                 hyperparameter selection, and evaluates saved models on new stays."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train cohort models from labelled stays
    #[command(about = "Train logistic and boosted models per cohort (outputs: <model_dir>/*.toml)")]
    Train(TrainArgs),

    /// Evaluate a trained model on labelled stays
    #[command(about = "Report AUC, observed:predicted ratio and calibration for a model")]
    Evaluate(EvaluateArgs),

    /// Apply a trained model to new stays
    #[command(about = "Predict mortality for new stays (outputs: predictions.tsv)")]
    Predict(PredictArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Commands::Train(args) => train(args),
        Commands::Evaluate(args) => evaluate(args),
        Commands::Predict(args) => predict(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Shows one progress bar per running search on stderr.
struct SearchProgressBar {
    bar: Mutex<Option<ProgressBar>>,
}

impl SearchProgressBar {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

impl SearchProgressObserver for SearchProgressBar {
    fn on_search_start(&self, label: &str, total_candidates: usize) {
        let pb = create_progress_bar(total_candidates as u64, label);
        if let Ok(mut slot) = self.bar.lock() {
            *slot = Some(pb);
        }
    }

    fn on_candidate_finished(&self, label: &str) {
        let _ = label;
        if let Ok(slot) = self.bar.lock() {
            if let Some(pb) = slot.as_ref() {
                pb.inc(1);
            }
        }
    }

    fn on_search_finish(&self, label: &str) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(pb) = slot.take() {
                pb.finish_with_message(format!("{label} done"));
            }
        }
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

fn load_config(path: Option<&PathBuf>) -> Result<WorkflowConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            Ok(WorkflowConfig::load(path)?)
        }
        None => Ok(WorkflowConfig::default()),
    }
}

fn load_labelled(
    data: &str,
    labels: Option<&str>,
    columns: &ColumnSpec,
) -> Result<CohortData, DataError> {
    match labels {
        Some(labels) => {
            println!("Loading features from: {data}");
            println!("Loading outcome and risk from: {labels}");
            load_cohort_data_with_labels(data, labels, columns)
        }
        None => {
            println!("Loading cohort data from: {data}");
            load_cohort_data(data, columns)
        }
    }
}

pub fn train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(model_dir) = args.model_dir {
        config.model_dir = model_dir;
    }
    if let Some(scoring) = args.scoring {
        config.scoring = scoring.into();
    }
    if let Some(threshold) = args.threshold {
        config.risk_threshold = threshold;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(n_iter) = args.n_iter {
        config.boosted.n_iter = n_iter;
    }
    if let Some(folds) = args.folds {
        config.folds = folds;
    }
    if !args.cohort.is_empty() {
        config.cohorts = args.cohort.into_iter().map(CohortKind::from).collect();
    }
    config.validate()?;

    let data = load_labelled(&args.data, args.labels.as_deref(), &config.columns)?;
    println!(
        "Loaded {} stays ({} deaths) with {} features",
        data.n_rows(),
        data.n_events(),
        data.feature_names.len()
    );

    println!(
        "Training {} cohort(s) with {}-fold CV scored by {}",
        config.cohorts.len(),
        config.folds,
        config.scoring
    );
    let progress = SearchProgressBar::new();
    let report = run_workflow(&data, &config, &progress)?;

    println!("\nBest cross-validated {}:", config.scoring);
    for entry in &report.models {
        println!(
            "  {:<10} {:<9} {:.4} (+/- {:.4})  {}",
            entry.cohort.to_string(),
            entry.kind.to_string(),
            entry.cv.best_score,
            entry.cv.best_std,
            entry.cv.best_params
        );
    }
    println!(
        "Models and {CV_REPORT_FILE} saved to: {}",
        config.model_dir.display()
    );
    Ok(())
}

pub fn evaluate(args: EvaluateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_ref())?;
    println!("Loading model from: {}", args.model);
    let model = TrainedModel::load(&args.model)?;
    println!(
        "Model: {} trained on the {} cohort ({} stays, CV {} {:.4})",
        model.kind(),
        model.cohort,
        model.n_training_rows,
        model.cv.scoring,
        model.cv.best_score
    );

    let data = load_labelled(&args.data, args.labels.as_deref(), &config.columns)?;
    let settings = EvaluationSettings {
        bootstrap: BootstrapSettings {
            n_bootstraps: args.n_bootstraps,
            seed: config.seed,
            ..BootstrapSettings::default()
        },
        top_features: args.top_features,
        ..EvaluationSettings::default()
    };
    let report = evaluate_model(&model, &data, &settings)?;
    print!("{report}");
    Ok(())
}

pub fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_ref())?;
    println!("Loading model from: {}", args.model);
    let model = TrainedModel::load(&args.model)?;
    println!("Model expects {} features", model.feature_names.len());

    println!("Loading stays from: {}", args.data);
    let data = load_feature_data(&args.data, &config.columns)?;
    let x = data.aligned_features(&model.feature_names)?;
    println!("Loaded {} stays for prediction", data.ids.len());

    let probabilities = model.predict_proba(x.view())?;
    let mut file = BufWriter::new(File::create(&args.output)?);
    writeln!(file, "{}\tprobability", config.columns.id)?;
    for (id, p) in data.ids.iter().zip(probabilities.iter()) {
        writeln!(file, "{id}\t{p}")?;
    }
    file.flush()?;
    println!("Predictions saved to: {}", args.output.display());
    Ok(())
}
