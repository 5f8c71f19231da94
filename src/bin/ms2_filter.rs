use std::process::ExitCode;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ms2_filter::batch::{self, BatchRunner};
use ms2_filter::config::{ConfigLoader, ResolvedConfig};
use ms2_filter::convert::{ConversionGate, DisabledConverter, DockerMsconvert, ExternalConverter};
use ms2_filter::counter::SpectralCounter;
use ms2_filter::domain::{FoodItemKey, RemoteFileEntry, SpectralFormat};
use ms2_filter::error::FilterError;
use ms2_filter::listing::LftpListingClient;
use ms2_filter::orchestrator::StudyOrchestrator;
use ms2_filter::output::{JsonOutput, ToolReport};
use ms2_filter::remote::SystemContentSource;
use ms2_filter::tool;

#[derive(Parser)]
#[command(name = "ms2-filter")]
#[command(about = "Count MS2 spectra in public metabolomics studies selected for a food item")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Process decided_<food>_gnps_datasets.json files")]
    Run(RunArgs),
    #[command(about = "Count MS2 spectra in one local file")]
    Count(CountArgs),
    #[command(about = "Report external tool availability")]
    Tools(PolicyArgs),
}

#[derive(Args, Clone)]
struct PolicyArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    enable_conversion: bool,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, conflicts_with = "data_dir", required_unless_present = "data_dir")]
    input: Option<Utf8PathBuf>,

    #[arg(long)]
    data_dir: Option<Utf8PathBuf>,

    #[arg(long, requires = "input")]
    output: Option<Utf8PathBuf>,

    #[arg(long)]
    food_item: Option<String>,

    #[arg(long)]
    max_files: Option<usize>,

    #[command(flatten)]
    policy: PolicyArgs,
}

#[derive(Args)]
struct CountArgs {
    path: Utf8PathBuf,

    #[arg(long)]
    format: Option<SpectralFormat>,

    #[command(flatten)]
    policy: PolicyArgs,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<FilterError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &FilterError) -> u8 {
    match error {
        FilterError::ConfigRead(_)
        | FilterError::ConfigParse(_)
        | FilterError::InputParse(_)
        | FilterError::InvalidRule { .. }
        | FilterError::InvalidTier(_)
        | FilterError::InvalidRemoteLocation(_) => 2,
        FilterError::RemoteUnavailable(_)
        | FilterError::MissingTool(_)
        | FilterError::Conversion(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_batch(args),
        Commands::Count(args) => run_count(args),
        Commands::Tools(args) => run_tools(args),
    }
}

fn resolve_policy(policy: &PolicyArgs) -> Result<ResolvedConfig, FilterError> {
    let mut config = ConfigLoader::resolve(policy.config.as_deref())?;
    config.enable_conversion |= policy.enable_conversion;
    Ok(config)
}

fn build_converter(config: &ResolvedConfig) -> Arc<dyn ExternalConverter> {
    if config.enable_conversion {
        Arc::new(DockerMsconvert::new(
            config.converter_image.clone(),
            config.timeouts.conversion,
        ))
    } else {
        Arc::new(DisabledConverter)
    }
}

fn run_batch(args: RunArgs) -> miette::Result<()> {
    let mut config = resolve_policy(&args.policy)?;
    if let Some(max_files) = args.max_files {
        config.max_files_per_study = max_files;
    }
    info!(
        conversion = config.enable_conversion,
        max_files_per_study = config.max_files_per_study,
        study_workers = config.study_workers,
        file_workers = config.file_workers,
        "starting MS2 filter"
    );

    let inputs = match (&args.input, &args.data_dir) {
        (Some(input), _) => vec![input.clone()],
        (None, Some(dir)) => batch::discover_inputs(dir)?,
        (None, None) => return Err(miette::Report::msg("--input or --data-dir is required")),
    };
    if inputs.is_empty() {
        return Err(FilterError::InputParse(
            "no decided_*_gnps_datasets.json files found".to_string(),
        )
        .into());
    }

    let listing = LftpListingClient::new(config.timeouts.listing);
    if !listing.is_available() {
        return Err(FilterError::MissingTool("lftp".to_string()).into());
    }
    let source = SystemContentSource::new(config.timeouts.stream)?;
    let gate = ConversionGate::new(config.max_concurrent_conversions);
    let orchestrator =
        StudyOrchestrator::new(&config, listing, source, build_converter(&config), gate)?;
    let runner = BatchRunner::new(orchestrator, config.study_workers)?;

    let food_item = args.food_item.map(FoodItemKey::new);
    let mut summaries = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let summary = runner.run_file(input, args.output.as_deref(), food_item.as_ref())?;
        summaries.push(summary);
    }
    JsonOutput::print_batch(&summaries).into_diagnostic()?;
    Ok(())
}

fn run_count(args: CountArgs) -> miette::Result<()> {
    let config = resolve_policy(&args.policy)?;
    let absolute = absolute_path(&args.path)?;
    let size = std::fs::metadata(absolute.as_std_path())
        .ok()
        .map(|meta| meta.len());
    let mut entry = RemoteFileEntry::new(absolute.as_str(), size);
    if let Some(format) = args.format {
        entry.inferred.format = Some(format);
    }

    let source = SystemContentSource::new(config.timeouts.stream)?;
    let gate = ConversionGate::new(config.max_concurrent_conversions);
    let counter =
        SpectralCounter::new(source, build_converter(&config), gate, config.enable_conversion)?;
    let result = counter.count(&entry, &format!("file://{absolute}"));
    JsonOutput::print_count(&result).into_diagnostic()?;
    Ok(())
}

fn run_tools(args: PolicyArgs) -> miette::Result<()> {
    let config = resolve_policy(&args)?;
    let converter = DockerMsconvert::new(config.converter_image.clone(), config.timeouts.conversion);
    let report = ToolReport {
        lftp: LftpListingClient::new(config.timeouts.listing).is_available(),
        curl: tool::find_in_path("curl").is_some(),
        converter: converter.tool_info(),
        converter_available: converter.is_available(),
    };
    JsonOutput::print_tools(&report).into_diagnostic()?;
    Ok(())
}

fn absolute_path(path: &Utf8Path) -> miette::Result<Utf8PathBuf> {
    let canonical = std::fs::canonicalize(path.as_std_path())
        .map_err(|err| FilterError::Filesystem(format!("{path}: {err}")))?;
    Utf8PathBuf::from_path_buf(canonical)
        .map_err(|path| FilterError::Filesystem(format!("non UTF-8 path {}", path.display())).into())
}
