use sim_matrix::data::RawTriple;
use sim_matrix::error::{Error, Result};
use sim_matrix::freeze::{freeze, thaw, FreezeConfig};
use sim_matrix::histogram::{Binning, Histogram};
use sim_matrix::matrix::DenseMatrix;
use sim_matrix::merge::{merge, MergeConfig};
use sim_matrix::pairs::{PairStore, StoreConfig};
use sim_matrix::query::{self, ExportFilter, PdbFilter};
use sim_matrix::reader::{self, FpneighReader, TsvReader};

use clap::{Parser, Subcommand, ValueEnum};
use glob::glob;
use kdam::tqdm;
use log::info;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)] #[command(author, version, about, long_about = None)]
struct Args {

    #[command(subcommand)]
    task: Task,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum Format {
    Tsv,
    Fpneigh,
}

#[derive(Subcommand, Debug)]
enum Task {

    /// Import raw scores into a pair store, creating it when missing
    Import {
        /// Raw score file, - for stdin
        input: String,
        store: PathBuf,
        #[arg(long, value_enum, default_value_t = Format::Tsv)]
        format: Format,
        /// Drop rows whose first identifier sorts after the second
        #[arg(long)]
        ignore_upper_triangle: bool,
        /// TSV input has no header line
        #[arg(long)]
        no_header: bool,
        /// New store keeps both orientations of each pair
        #[arg(long)]
        full_matrix: bool,
        #[arg(long)]
        frame_size: Option<usize>,
    },

    /// Merge pair stores, inputs may be glob patterns
    Merge {
        #[arg(required = true)]
        inputs: Vec<String>,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        frame_size: Option<usize>,
    },

    /// Freeze a pair store into a dense matrix
    Freeze {
        store: PathBuf,
        matrix: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        frame_size: Option<usize>,
        /// Matrix cells held in memory per pass over the pairs
        #[arg(long)]
        memory_budget: Option<usize>,
        #[arg(long)]
        single_sided: bool,
        #[arg(long)]
        compression_level: Option<i32>,
        /// Copy only the first N pairs
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Turn a dense matrix back into a pair store
    Thaw {
        matrix: PathBuf,
        store: PathBuf,
    },

    /// Most similar fragments of a query fragment in a dense matrix or pair store
    Similar {
        input: PathBuf,
        query: String,
        #[arg(long, default_value_t = 0.55)]
        cutoff: f64,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },

    /// Export scored pairs of a dense matrix as TSV
    Export {
        matrix: PathBuf,
        /// Output file, - for stdout
        output: String,
        #[arg(long)]
        no_header: bool,
        /// Only pairs with a *frag1 member
        #[arg(long)]
        frag1: bool,
        /// Only pairs with a member from these structure codes, one per line
        #[arg(long)]
        pdb: Option<PathBuf>,
        /// Treat --pdb as a deny list
        #[arg(long)]
        deny_pdb: bool,
        /// Only pairs with a member from these identifiers, one per line
        #[arg(long)]
        keep: Option<PathBuf>,
        /// Drop pairs with a member from these identifiers, one per line
        #[arg(long)]
        skip: Option<PathBuf>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Distribution of scores in a pair store or dense matrix
    Histogram {
        input: PathBuf,
        /// Output file, - for stdout
        output: String,
        #[arg(long, default_value_t = 0.01)]
        bucket: f64,
        /// Bucket on stored integer scores
        #[arg(long)]
        raw_score: bool,
        /// Count the lower instead of the upper half of a matrix
        #[arg(long)]
        lower_triangle: bool,
        #[arg(long, default_value_t = 100_000)]
        frame_size: usize,
        /// Fail when any score falls below this cutoff
        #[arg(long)]
        cutoff: Option<f64>,
    },

    /// Copy a pair store keeping or skipping pairs touching listed identifiers
    Filter {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        keep: Option<PathBuf>,
        #[arg(long)]
        skip: Option<PathBuf>,
    },

    /// Convert an fpneigh file to TSV
    Fpneigh2tsv {
        input: String,
        output: String,
    },
}

fn open_input(name: &str) -> Result<Box<dyn BufRead>> {

    match name {
        "-" => Ok(Box::new(BufReader::new(io::stdin()))),
        _ => Ok(Box::new(BufReader::new(File::open(name)?))),
    }
}

fn open_output(name: &str) -> Result<Box<dyn Write>> {

    match name {
        "-" => Ok(Box::new(BufWriter::new(io::stdout()))),
        _ => Ok(Box::new(BufWriter::new(File::create(name)?))),
    }
}

fn read_identifiers(filename: &Path) -> Result<HashSet<String>> {

    let mut identifiers = HashSet::new();
    for line in BufReader::new(File::open(filename)?).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            identifiers.insert(line.trim().to_string());
        }
    }

    Ok(identifiers)
}

fn expand_patterns(patterns: &[String]) -> Result<Vec<PathBuf>> {

    let mut inputs: Vec<PathBuf> = Vec::new();

    for pattern in patterns.iter() {
        let paths = glob(pattern)
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, format!("{}: {}", pattern, e))))?;

        let mut matched: Vec<PathBuf> = paths.map(|x| x.map_err(|e| Error::Io(e.into_error()))).collect::<Result<_>>()?;
        matched.sort();

        match matched.is_empty() {
            true => inputs.push(PathBuf::from(pattern)),
            false => inputs.extend(matched),
        }
    }

    Ok(inputs)
}

fn import(input: &str, store: &Path, format: Format, ignore_upper_triangle: bool, no_header: bool,
          full_matrix: bool, frame_size: Option<usize>) -> Result<()> {

    let mut store = match store.join("config.yaml").is_file() {
        true => PairStore::open(store, true)?,
        false => {
            let mut config = StoreConfig::with_directory(store);
            config.full_matrix = full_matrix;
            PairStore::create_with_config(config)?
        }
    };

    if let Some(frame_size) = frame_size {
        store.config.frame_size = frame_size;
    }

    let reader = open_input(input)?;
    let rows: Box<dyn Iterator<Item = Result<RawTriple>>> = match format {
        Format::Tsv => Box::new(TsvReader::new(reader, !no_header)),
        Format::Fpneigh => Box::new(FpneighReader::new(reader, ignore_upper_triangle)),
    };

    let stats = store.import(tqdm!(rows), ignore_upper_triangle)?;
    store.close()?;

    println!("imported {} pairs, {} duplicates, {} skipped", stats.imported, stats.duplicates, stats.skipped);

    Ok(())
}

fn run_merge(inputs: &[String], output: &Path, config: Option<PathBuf>, frame_size: Option<usize>) -> Result<()> {

    let mut config = match config {
        Some(filename) => MergeConfig::from_file(&filename)?,
        None => MergeConfig::default(),
    };

    if let Some(frame_size) = frame_size {
        config.frame_size = frame_size;
    }

    let inputs = expand_patterns(inputs)?;
    info!("merging {} stores into {}", inputs.len(), output.display());

    let stats = merge(&inputs, output, &config)?;

    println!("merged {} stores: {} pairs, {} duplicates", stats.inputs, stats.records, stats.duplicates);

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_freeze(store: &Path, matrix: &Path, config: Option<PathBuf>, frame_size: Option<usize>,
              memory_budget: Option<usize>, single_sided: bool, compression_level: Option<i32>,
              limit: Option<usize>) -> Result<()> {

    let mut config = match config {
        Some(filename) => FreezeConfig::from_file(&filename)?,
        None => FreezeConfig::default(),
    };

    config.frame_size = frame_size.unwrap_or(config.frame_size);
    config.memory_budget = memory_budget.unwrap_or(config.memory_budget);
    config.compression_level = compression_level.unwrap_or(config.compression_level);
    config.single_sided = config.single_sided || single_sided;
    config.limit = limit.or(config.limit);

    let store = PairStore::open(store, false)?;
    let matrix = freeze(&store, matrix, &config)?;

    println!("froze {} pairs into a {}x{} matrix", store.len(), matrix.dimension(), matrix.dimension());

    Ok(())
}

fn similar(input: &Path, query_identifier: &str, cutoff: f64, limit: Option<usize>, json: bool) -> Result<()> {

    let hits = match input.join("scores").is_file() {
        true => query::most_similar(&DenseMatrix::open(input)?, query_identifier, cutoff, limit)?,
        false => query::most_similar_in_store(&PairStore::open(input, false)?, query_identifier, cutoff, limit)?,
    };

    match json {
        true => println!("{}", query::hits_to_json(query_identifier, &hits)?),
        false => {
            for hit in hits.iter() {
                println!("{}\t{}\t{}", query_identifier, hit.identifier, hit.score);
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn export(matrix: &Path, output: &str, no_header: bool, frag1: bool, pdb: Option<PathBuf>, deny_pdb: bool,
          keep: Option<PathBuf>, skip: Option<PathBuf>, limit: Option<usize>) -> Result<()> {

    let pdb = match pdb {
        Some(filename) => {
            let codes = query::load_pdb_codes(BufReader::new(File::open(filename)?))?;
            match deny_pdb {
                true => Some(PdbFilter::Deny(codes)),
                false => Some(PdbFilter::Allow(codes)),
            }
        },
        None => None,
    };

    let filter = ExportFilter {
        keep: keep.as_deref().map(read_identifiers).transpose()?,
        skip: skip.as_deref().map(read_identifiers).transpose()?,
        frag1,
        pdb,
        limit,
    };

    let matrix = DenseMatrix::open_cached(matrix)?;
    let mut writer = open_output(output)?;

    let rows = query::export(&matrix, &filter)?;
    let written = reader::write_tsv(&mut writer, tqdm!(rows), !no_header)?;

    info!("exported {} pairs", written);

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn histogram(input: &Path, output: &str, bucket: f64, raw_score: bool, lower_triangle: bool,
             frame_size: usize, cutoff: Option<f64>) -> Result<ExitCode> {

    let binning = match raw_score {
        true => Binning::Raw,
        false => Binning::width(bucket),
    };

    let histogram = match input.join("scores").is_file() {
        true => Histogram::from_matrix(&DenseMatrix::open(input)?, lower_triangle, binning, cutoff)?,
        false => Histogram::from_store(&PairStore::open(input, false)?, frame_size, binning, cutoff)?,
    };

    let mut writer = open_output(output)?;
    histogram.write_tsv(&mut writer)?;

    match (cutoff, histogram.count_below()) {
        (Some(cutoff), below) if below > 0 => {
            eprintln!("{} of {} scores fall below {}", below, histogram.total(), cutoff);
            Ok(ExitCode::FAILURE)
        },
        _ => Ok(ExitCode::SUCCESS),
    }
}

fn filter(input: &Path, output: &Path, keep: Option<PathBuf>, skip: Option<PathBuf>) -> Result<()> {

    let store = PairStore::open(input, false)?;

    let mut config = store.config.clone();
    config.directory = output.to_string_lossy().to_string();

    let filter = ExportFilter {
        keep: keep.as_deref().map(read_identifiers).transpose()?,
        skip: skip.as_deref().map(read_identifiers).transpose()?,
        ..ExportFilter::default()
    };

    let filtered = store.filter_into(config, &filter)?;

    println!("kept {} of {} pairs", filtered.len(), store.len());

    filtered.close()
}

fn fpneigh2tsv(input: &str, output: &str) -> Result<()> {

    let mut writer = open_output(output)?;
    let written = reader::fpneigh2tsv(open_input(input)?, &mut writer)?;

    info!("converted {} pairs", written);

    Ok(())
}

fn error_kind(error: &Error) -> &'static str {

    match error {
        Error::UnknownIdentifier(_) => "unknown identifier",
        Error::NotFound(_) => "not found",
        Error::DuplicateRecord { .. } => "duplicate record",
        Error::DimensionMismatch { .. } => "dimension mismatch",
        Error::Io(_) => "io failure",
        Error::Parse { .. } => "parse error",
        Error::InvalidIdentifier(_) => "invalid identifier",
        Error::ScoreOutOfRange(_) => "score out of range",
        Error::PrecisionMismatch { .. } => "precision mismatch",
        Error::ReadOnly(_) => "read only",
        Error::AlreadyExists(_) => "already exists",
        Error::Corrupt { .. } => "corrupt file",
        Error::Config(_) => "config error",
        Error::Json(_) => "json error",
    }
}

fn run(args: Args) -> Result<ExitCode> {

    match args.task {
        Task::Import { input, store, format, ignore_upper_triangle, no_header, full_matrix, frame_size } =>
            import(&input, &store, format, ignore_upper_triangle, no_header, full_matrix, frame_size)?,
        Task::Merge { inputs, output, config, frame_size } =>
            run_merge(&inputs, &output, config, frame_size)?,
        Task::Freeze { store, matrix, config, frame_size, memory_budget, single_sided, compression_level, limit } =>
            run_freeze(&store, &matrix, config, frame_size, memory_budget, single_sided, compression_level, limit)?,
        Task::Thaw { matrix, store } => {
            let matrix = DenseMatrix::open_cached(&matrix)?;
            thaw(&matrix, StoreConfig::with_directory(&store))?.close()?;
        },
        Task::Similar { input, query, cutoff, limit, json } =>
            similar(&input, &query, cutoff, limit, json)?,
        Task::Export { matrix, output, no_header, frag1, pdb, deny_pdb, keep, skip, limit } =>
            export(&matrix, &output, no_header, frag1, pdb, deny_pdb, keep, skip, limit)?,
        Task::Histogram { input, output, bucket, raw_score, lower_triangle, frame_size, cutoff } =>
            return histogram(&input, &output, bucket, raw_score, lower_triangle, frame_size, cutoff),
        Task::Filter { input, output, keep, skip } =>
            filter(&input, &output, keep, skip)?,
        Task::Fpneigh2tsv { input, output } =>
            fpneigh2tsv(&input, &output)?,
    }

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {

    env_logger::init();

    let args = Args::parse();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: {}", error_kind(&e), e);
            ExitCode::FAILURE
        }
    }
}
