use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fsx_core::{is_year_key, FieldEdit, RowEdit};
use fsx_pipeline::{build_export, build_matcher, open_store, ExportTable, Pipeline, PipelineConfig};
use indexmap::IndexMap;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fsx", version)]
#[command(about = "Financial statement extraction: reconcile, match and export")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract and reconcile a directory of rendered pages as a new job.
    Run(RunArgs),
    /// Create or upgrade the database schema.
    Migrate,
    /// List recent jobs.
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Export a job as CSV.
    Export(ExportArgs),
    /// Correct a persisted page value.
    #[command(subcommand)]
    Edit(EditCommand),
    /// Resolve one label onto the taxonomy.
    Match { label: String },
    /// Print the extracted content of a notes page as JSON.
    Notes { job_id: i64, page: u32 },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Directory with page_NNN.png and page_NNN.words.json files.
    pages_dir: PathBuf,
    /// Source document name; defaults to the directory name.
    #[arg(long)]
    document: Option<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ExportView {
    /// One line per taxonomy field, in template order.
    Taxonomy,
    /// One line per consolidated label.
    Labels,
}

#[derive(Debug, Args)]
struct ExportArgs {
    job_id: i64,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = ExportView::Taxonomy)]
    view: ExportView,
    /// Print the full export, header fields and resolutions included, as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum EditCommand {
    /// Edit a tabular row; unknown rows are created.
    Row {
        job_id: i64,
        page: u32,
        item: String,
        /// Year value as YEAR=VALUE; repeatable.
        #[arg(long = "year", value_parser = parse_year_value)]
        years: Vec<(String, String)>,
        #[arg(long)]
        nota: Option<String>,
        #[arg(long)]
        confidence: Option<f64>,
    },
    /// Edit a free-standing page field.
    Field {
        job_id: i64,
        page: u32,
        item: String,
        #[arg(long)]
        value: String,
        #[arg(long, default_value = "")]
        item_type: String,
        #[arg(long, default_value = "")]
        confidence_score: String,
    },
}

fn parse_year_value(raw: &str) -> Result<(String, String), String> {
    let (year, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected YEAR=VALUE, got {raw:?}"))?;
    let year = year.trim();
    if !is_year_key(year) {
        return Err(format!("{year:?} is not a four digit year"));
    }
    Ok((year.to_string(), value.trim().to_string()))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Run(args) => run(config, args).await?,
        Commands::Migrate => {
            open_store(&config.database_url).await?;
            info!(database_url = %config.database_url, "migrations applied");
        }
        Commands::Jobs { limit } => {
            let store = open_store(&config.database_url).await?;
            for job in store.list_jobs(limit).await? {
                let range = match (job.start_page, job.end_page) {
                    (Some(start), Some(end)) => format!("{start}-{end}"),
                    _ => "-".to_string(),
                };
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    job.id,
                    job.created_at.format("%Y-%m-%d %H:%M"),
                    job.status,
                    range,
                    job.document_name
                );
            }
        }
        Commands::Export(args) => export(config, args).await?,
        Commands::Edit(edit) => apply_edit(config, edit).await?,
        Commands::Match { label } => {
            let store = open_store(&config.database_url).await?;
            let chat = fsx_pipeline::chat_client(&config)?;
            let matcher = build_matcher(&config, &store, chat)?;
            let resolution = matcher.resolve(&label).await;
            println!("{}", serde_json::to_string_pretty(&resolution)?);
        }
        Commands::Notes { job_id, page } => {
            let store = open_store(&config.database_url).await?;
            let stored = store.page(job_id, page).await?;
            let Some(notes) = stored.notes else {
                bail!("page {page} of job {job_id} is not a notes page");
            };
            println!("{}", serde_json::to_string_pretty(&notes)?);
        }
    }

    Ok(())
}

async fn run(config: PipelineConfig, args: RunArgs) -> Result<()> {
    let document = match args.document {
        Some(name) => name,
        None => args
            .pages_dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .context("cannot derive a document name from the pages directory")?,
    };
    let pipeline = Pipeline::from_config(config).await?;
    let summary = pipeline.run_document(&document, &args.pages_dir).await?;
    println!(
        "job {} complete: pages {}-{} reconciled={} notes={} skipped={}",
        summary.job_id,
        summary.start_page,
        summary.end_page,
        summary.pages_reconciled,
        summary.notes_pages,
        summary.pages_skipped
    );
    Ok(())
}

async fn export(config: PipelineConfig, args: ExportArgs) -> Result<()> {
    let store = open_store(&config.database_url).await?;
    store.job(args.job_id).await?;
    let chat = fsx_pipeline::chat_client(&config)?;
    let matcher = build_matcher(&config, &store, chat)?;
    let export = build_export(&store, &matcher, args.job_id, &config.export_years).await?;

    match &args.out {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            write_export(&export, &args, BufWriter::new(file))?;
            info!(path = %path.display(), "export written");
        }
        None => write_export(&export, &args, io::stdout().lock())?,
    }
    Ok(())
}

fn write_export<W: Write>(export: &ExportTable, args: &ExportArgs, mut writer: W) -> Result<()> {
    if args.json {
        serde_json::to_writer_pretty(&mut writer, export)?;
        writeln!(writer)?;
        return Ok(());
    }
    match args.view {
        ExportView::Taxonomy => export.write_taxonomy_csv(writer),
        ExportView::Labels => export.write_labels_csv(writer),
    }
}

async fn apply_edit(config: PipelineConfig, edit: EditCommand) -> Result<()> {
    let store = open_store(&config.database_url).await?;
    match edit {
        EditCommand::Row {
            job_id,
            page,
            item,
            years,
            nota,
            confidence,
        } => {
            if years.is_empty() && nota.is_none() && confidence.is_none() {
                bail!("nothing to edit: pass --year, --nota or --confidence");
            }
            let edit = RowEdit {
                years: years.into_iter().collect::<IndexMap<_, _>>(),
                note_reference: nota,
                confidence,
            };
            let row = store.apply_row_edit(job_id, page, &item, &edit).await?;
            println!("{}", serde_json::to_string_pretty(&row)?);
        }
        EditCommand::Field {
            job_id,
            page,
            item,
            value,
            item_type,
            confidence_score,
        } => {
            let edit = FieldEdit {
                value,
                item_type,
                confidence_score,
            };
            let field = store.apply_field_edit(job_id, page, &item, &edit).await?;
            println!("{}", serde_json::to_string_pretty(&field)?);
        }
    }
    Ok(())
}
