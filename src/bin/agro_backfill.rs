use std::fs;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use agro_backfill::audit::RunLog;
use agro_backfill::backfill::{BackfillReport, BackfillRequest, Backfiller, ProgressSink};
use agro_backfill::config::{ConfigLoader, ResolvedConfig};
use agro_backfill::domain::{AreaId, RecordKind};
use agro_backfill::error::BackfillError;
use agro_backfill::geometry::Geometry;
use agro_backfill::output::{JsonOutput, OutputMode};
use agro_backfill::soil::SoilHttpClient;
use agro_backfill::store::{Area, SchemaManifest, Store};
use agro_backfill::tui::Tui;
use agro_backfill::vegetation::VegetationHttpClient;

#[derive(Parser)]
#[command(name = "agro-backfill")]
#[command(about = "Backfill historical vegetation and soil metrics for monitored areas")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Backfill an area over a date range")]
    Run(RunArgs),
    #[command(about = "Manage monitored areas")]
    Area(AreaArgs),
    #[command(about = "List stored records for an area")]
    Records(RecordsArgs),
    #[command(about = "List past backfill runs")]
    Runs,
    #[command(about = "Write the default schema manifest into the store")]
    Init,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    area: String,

    #[arg(long)]
    start: String,

    #[arg(long)]
    end: String,

    #[arg(long)]
    period_days: Option<u32>,

    #[arg(long)]
    collection: Option<String>,

    #[arg(long)]
    soil: bool,

    #[arg(long)]
    soil_scale: Option<u32>,
}

#[derive(Args)]
struct AreaArgs {
    #[command(subcommand)]
    command: AreaCommand,
}

#[derive(Subcommand)]
enum AreaCommand {
    #[command(about = "Import an area from a GeoJSON or KML file")]
    Import(ImportArgs),
    #[command(about = "List known areas")]
    List,
}

#[derive(Args)]
struct ImportArgs {
    id: String,

    file: String,

    #[arg(long)]
    name: Option<String>,
}

#[derive(Args)]
struct RecordsArgs {
    area: String,

    #[arg(long)]
    soil: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<BackfillError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &BackfillError) -> u8 {
    match error {
        BackfillError::AreaNotFound(_)
        | BackfillError::InvalidRange(_)
        | BackfillError::InvalidAreaId(_)
        | BackfillError::InvalidGeometry(_)
        | BackfillError::ConfigRead(_) => 2,
        err if err.is_provider_failure() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;
    let store = Store::new(resolved.store_root.clone());

    match cli.command {
        Commands::Run(args) => run_backfill(args, &resolved, store, output_mode),
        Commands::Area(AreaArgs {
            command: AreaCommand::Import(args),
        }) => run_import(args, &store),
        Commands::Area(AreaArgs {
            command: AreaCommand::List,
        }) => {
            let areas = store.list_areas()?;
            JsonOutput::print_areas(&areas).into_diagnostic()
        }
        Commands::Records(args) => {
            let area_id: AreaId = args.area.parse()?;
            let kind = if args.soil {
                RecordKind::Soil
            } else {
                RecordKind::Vegetation
            };
            let records = store.list_records(kind, area_id)?;
            JsonOutput::print_records(&records).into_diagnostic()
        }
        Commands::Runs => {
            let runs = RunLog::new(&store).list()?;
            JsonOutput::print_runs(&runs).into_diagnostic()
        }
        Commands::Init => {
            store.ensure_root()?;
            store.write_schema(&SchemaManifest::defaults())?;
            println!("wrote {}", store.schema_path());
            Ok(())
        }
    }
}

fn run_backfill(
    args: RunArgs,
    resolved: &ResolvedConfig,
    store: Store,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let defaults = &resolved.defaults;
    let request = BackfillRequest {
        area_id: args.area.parse()?,
        start_date: args.start,
        end_date: args.end,
        period_days: args.period_days.unwrap_or(defaults.period_days),
        collection: args
            .collection
            .unwrap_or_else(|| defaults.collection.clone()),
        include_soil: args.soil || defaults.include_soil,
        soil_scale: args.soil_scale.unwrap_or(defaults.soil_scale),
    };

    let vegetation =
        VegetationHttpClient::new(resolved.vegetation_url.clone(), resolved.request_timeout)?;
    let soil = SoilHttpClient::new(resolved.soil_url.clone(), resolved.request_timeout)?;
    info!(
        vegetation_url = vegetation.url(),
        soil_url = soil.url(),
        "providers configured"
    );
    let runs = RunLog::new(&store);
    let backfiller = Backfiller::new(store.clone(), store, vegetation, soil);

    match output_mode {
        OutputMode::NonInteractive => {
            let report = execute(&backfiller, &runs, &request, &JsonOutput)?;
            JsonOutput::print_report(&report).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new();
            let report = tui.run(move |sink| execute(&backfiller, &runs, &request, sink))?;
            print_summary(&report);
        }
    }
    Ok(())
}

/// Wraps one backfill in a run record so failures are audited too.
fn execute(
    backfiller: &Backfiller<Store, Store, VegetationHttpClient, SoilHttpClient>,
    runs: &RunLog,
    request: &BackfillRequest,
    sink: &dyn ProgressSink,
) -> Result<BackfillReport, BackfillError> {
    let mut record = runs.start(request)?;
    info!(run_id = %record.id, "run started");
    let outcome = backfiller.backfill(request, sink);
    runs.finish(&mut record, outcome.as_ref())?;
    outcome
}

fn run_import(args: ImportArgs, store: &Store) -> miette::Result<()> {
    let id: AreaId = args.id.parse()?;
    let content = fs::read_to_string(&args.file)
        .map_err(|err| BackfillError::Filesystem(format!("read {}: {err}", args.file)))?;
    let geometry = if args.file.to_ascii_lowercase().ends_with(".kml") {
        Geometry::from_kml(&content)?
    } else {
        let value: serde_json::Value = serde_json::from_str(&content)
            .map_err(|err| BackfillError::InvalidGeometry(err.to_string()))?;
        Geometry::from_geojson(value)?
    };

    let area = Area {
        id,
        name: args.name,
        geometry,
    };
    store.put_area(&area)?;
    println!("imported area {} ({})", area.id, area.geometry.kind());
    Ok(())
}

fn print_summary(report: &BackfillReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}agro-backfill summary: area {}{reset}", report.area_id);
    println!(
        "{cyan}chunks: {}/{}{}{reset}",
        report.processed_chunks,
        report.requested_chunks,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    println!(
        "{green}vegetation: {} inserted, {} existing{reset}",
        report.vegetation_inserted.len(),
        report.vegetation_existing.len()
    );
    println!(
        "{green}soil: {} inserted, {} existing{reset}",
        report.soil_inserted.len(),
        report.soil_existing.len()
    );

    if report.errors.is_empty() {
        println!("{green}errors: 0{reset}");
        return;
    }
    println!("{yellow}errors: {}{reset}", report.errors.len());
    for error in &report.errors {
        let depth = error
            .depth
            .map(|depth| format!(" {depth}"))
            .unwrap_or_default();
        println!(
            "{red}  [{}, {}] {}{depth} {:?}: {}{reset}",
            error.start,
            error.end,
            error.track.as_str(),
            error.stage,
            error.message
        );
    }
}
