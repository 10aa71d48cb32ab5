use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use log::{error, info};

use mzbatch::library::{build_reference_library, TierRequest};
use mzbatch::params::{split_file_paths, LibraryParameters};
use mzbatch::{ConfigurationError, FormatRegistry, Polarity, Workflow, WorkflowError, WorkflowParameters};

#[derive(Parser)]
#[command(version, about = "Annotate LC-MS/MS runs against a reference spectral library")]
struct App {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a batch
    Run(RunArgs),
    /// Build one polarity's reference indices from a list of precursor masses
    BuildIndex(BuildIndexArgs),
    /// Print a workflow parameter file with every default filled in
    DumpConfigTemplate,
}

#[derive(Args)]
struct RunArgs {
    /// A JSON workflow parameter file. Other options override its values.
    #[arg(short, long)]
    params: Option<PathBuf>,

    /// Input files, repeated or comma-separated
    #[arg(short, long, value_delimiter = ',')]
    input: Vec<PathBuf>,

    /// Add every recognized instrument file in this directory
    #[arg(long)]
    input_dir: Option<PathBuf>,

    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(short, long)]
    engine_config: Option<PathBuf>,

    #[arg(short, long)]
    library: Option<PathBuf>,

    /// The scan routing table. Without one every tandem scan goes to the high
    /// resolution tier.
    #[arg(short, long)]
    routes: Option<PathBuf>,

    #[arg(short, long)]
    cores: Option<usize>,

    /// Precursor tolerance for selecting reference entries, in ppm
    #[arg(long)]
    ppm: Option<f64>,

    /// Reuse the work recorded in the output directory's manifest
    #[arg(long)]
    resume: bool,

    /// Cache built reference libraries in the output directory
    #[arg(long)]
    cache_index: bool,
}

#[derive(Args)]
struct BuildIndexArgs {
    #[arg(short, long)]
    library: PathBuf,

    #[arg(short, long)]
    polarity: Polarity,

    /// A text file with one precursor m/z per line
    #[arg(short, long)]
    masses: PathBuf,

    #[arg(short, long)]
    output: PathBuf,

    #[arg(long, default_value_t = 10.0)]
    ppm: f64,

    /// Also build the low resolution tier
    #[arg(long)]
    low: bool,
}

/// Every file in `directory` with an extension the registry recognizes, sorted
fn collect_input_dir(directory: &Path, registry: &FormatRegistry) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.is_file() && registry.recognizes(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn run_batch(args: RunArgs) -> Result<ExitCode, WorkflowError> {
    let mut params = match args.params.as_ref() {
        Some(path) => WorkflowParameters::from_path(path)?,
        None => WorkflowParameters::default(),
    };
    let registry = FormatRegistry::default();

    params.file_paths.extend(
        args.input
            .iter()
            .flat_map(|p| split_file_paths(&p.to_string_lossy())),
    );
    if let Some(directory) = args.input_dir.as_ref() {
        let found = collect_input_dir(directory, &registry).map_err(|source| {
            ConfigurationError::Read {
                path: directory.clone(),
                source,
            }
        })?;
        info!("Found {} input files in {}", found.len(), directory.display());
        params.file_paths.extend(found);
    }
    if let Some(output) = args.output {
        params.output_directory = output;
    }
    if let Some(engine_config) = args.engine_config {
        params.engine_config_path = engine_config;
    }
    if let Some(library) = args.library {
        params.reference_library_path = library;
    }
    if let Some(routes) = args.routes {
        params.scan_routes_path = Some(routes);
    }
    if let Some(cores) = args.cores {
        params.cores = cores;
    }
    if let Some(ppm) = args.ppm {
        params.library.ppm_tolerance = ppm;
    }
    params.resume |= args.resume;
    params.cache_index |= args.cache_index;

    let request = params.into_request(&registry)?;
    let summary = Workflow::new(request).with_registry(registry).run()?;
    print!("{summary}");
    if summary.is_complete() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}

fn read_masses(path: &Path) -> Result<Vec<f64>, ConfigurationError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            line.parse::<f64>().map_err(|e| {
                ConfigurationError::Invalid(format!("{}: {line:?} is not a mass: {e}", path.display()))
            })
        })
        .collect()
}

fn build_index(args: BuildIndexArgs) -> Result<ExitCode, WorkflowError> {
    if !args.output.is_dir() {
        return Err(ConfigurationError::MissingOutputDirectory(args.output).into());
    }
    let masses = read_masses(&args.masses)?;
    let parameters = LibraryParameters::default();
    let tiers = TierRequest {
        high: parameters.high_resolution,
        low: args.low.then_some(parameters.low_resolution),
    };
    let library = build_reference_library(
        &args.library,
        args.polarity,
        &masses,
        args.ppm,
        parameters.normalize,
        &tiers,
    )?;
    for path in library.write_contents(&args.output)? {
        println!("{}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn dump_config_template() -> Result<ExitCode, WorkflowError> {
    let text = serde_json::to_string_pretty(&WorkflowParameters::default()).map_err(|e| {
        WorkflowError::export("<stdout>", io::Error::new(io::ErrorKind::InvalidData, e))
    })?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{text}").map_err(|e| WorkflowError::export("<stdout>", e))?;
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let app = App::parse();
    let result = match app.command {
        Command::Run(args) => run_batch(args),
        Command::BuildIndex(args) => build_index(args),
        Command::DumpConfigTemplate => dump_config_template(),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
