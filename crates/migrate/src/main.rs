//! Helios FHIR bulk upgrade tool (hfs-migrate)
//!
//! Loads a rule catalog, ingests an NDJSON file into an in-memory canonical
//! store, optionally runs a migration job over it, and writes every
//! resource back out as NDJSON in the requested version.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use helios_transform::migration::{MigrationFilter, MigrationRequest};
use helios_transform::store::InMemoryStore;
use helios_transform::{
    EngineConfig, FhirVersion, MigrationJob, MigrationState, RegistryDocument, ResourceKey,
    TracingSink, TransformService, init_logging,
};
use serde_json::Value;
use tracing::{info, warn};

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "hfs-migrate", version)]
#[command(about = "Convert FHIR NDJSON between versions using a transformation rule catalog")]
struct Args {
    /// Rule catalog (JSON).
    #[arg(long, env = "HTS_REGISTRY")]
    registry: PathBuf,

    /// NDJSON input file, or "-" for stdin.
    #[arg(long, default_value = "-")]
    input: String,

    /// NDJSON output file. Defaults to stdout.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Version of the input resources, when it cannot be detected.
    #[arg(long)]
    hint: Option<FhirVersion>,

    /// Migrate the stored resources to this version before writing.
    #[arg(long)]
    migrate_to: Option<FhirVersion>,

    /// Version to write. Defaults to the migration target, then the
    /// canonical version.
    #[arg(long)]
    emit_version: Option<FhirVersion>,

    /// Resource types to migrate (comma separated, default all).
    #[arg(long, value_delimiter = ',')]
    types: Vec<String>,

    /// Run the migration without writing to the store.
    #[arg(long)]
    dry_run: bool,

    /// Write the finished migration job as JSON to this file.
    #[arg(long)]
    report: Option<PathBuf>,

    #[command(flatten)]
    engine: EngineConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.engine.log_level);

    if let Err(errors) = args.engine.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        std::process::exit(1);
    }

    let service = build_service(&args)?;
    let keys = ingest(&service, &args).await?;

    if let Some(target) = args.migrate_to {
        let job = migrate(&service, &args, target).await?;
        if let Some(path) = &args.report {
            let report = serde_json::to_string_pretty(&job)?;
            std::fs::write(path, report)
                .with_context(|| format!("writing report to {}", path.display()))?;
        }
        if job.state == MigrationState::Failed {
            bail!(
                "migration job {} failed: {}",
                job.id,
                job.error.as_deref().unwrap_or("unknown cause")
            );
        }
    }

    let version = args
        .emit_version
        .or(args.migrate_to)
        .unwrap_or(args.engine.canonical_version);
    emit(&service, &keys, version, args.output.as_deref()).await
}

fn build_service(args: &Args) -> anyhow::Result<TransformService> {
    let file = File::open(&args.registry)
        .with_context(|| format!("opening rule catalog {}", args.registry.display()))?;
    let mut document: RegistryDocument = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing rule catalog {}", args.registry.display()))?;

    if document.canonical != args.engine.canonical_version {
        info!(
            catalog = %document.canonical,
            configured = %args.engine.canonical_version,
            "Overriding catalog canonical version"
        );
        document.canonical = args.engine.canonical_version;
    }
    let registry = document.build().context("building registry")?;
    info!(
        canonical = %registry.canonical_version(),
        resource_types = registry.resource_types().count(),
        "Registry loaded"
    );

    let store = Arc::new(InMemoryStore::new());
    let service = TransformService::from_config(registry, store, &args.engine)
        .context("invalid engine configuration")?
        .with_sink(Arc::new(TracingSink));
    Ok(service)
}

/// Ingests every input line. Rejected lines are logged and skipped.
async fn ingest(service: &TransformService, args: &Args) -> anyhow::Result<Vec<ResourceKey>> {
    let reader: Box<dyn BufRead> = if args.input == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(&args.input).with_context(|| format!("opening {}", args.input))?;
        Box::new(BufReader::new(file))
    };

    let mut keys = Vec::new();
    let mut rejected = 0usize;
    for (number, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading line {}", number + 1))?;
        let Some(raw) = parse_line(&line).with_context(|| format!("line {}", number + 1))? else {
            continue;
        };
        match service.ingest(raw, args.hint).await {
            Ok(outcome) => {
                for note in outcome.notes.iter().filter(|n| n.is_warning()) {
                    warn!(
                        resource = %outcome.key,
                        operation = %note.operation,
                        path = %note.path,
                        message = note.message.as_deref().unwrap_or(""),
                        "Ingestion warning"
                    );
                }
                keys.push(outcome.key);
            }
            Err(e) => {
                warn!(line = number + 1, error = %e, "Rejected input resource");
                rejected += 1;
            }
        }
    }

    info!(ingested = keys.len(), rejected, "Input ingested");
    Ok(keys)
}

fn parse_line(line: &str) -> anyhow::Result<Option<Value>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(trimmed).context("invalid JSON")?;
    if !value.is_object() {
        bail!("expected a JSON object");
    }
    Ok(Some(value))
}

async fn migrate(
    service: &TransformService,
    args: &Args,
    target: FhirVersion,
) -> anyhow::Result<MigrationJob> {
    let options = args
        .engine
        .migration_options()
        .context("invalid migration configuration")?;
    let migrations = service.migrations(options);

    let mut request = MigrationRequest::new(args.engine.canonical_version, target)
        .with_filter(MigrationFilter::for_types(args.types.iter().cloned()))
        .with_batch_size(args.engine.batch_size);
    if args.dry_run {
        request = request.dry_run();
    }

    let job_id = migrations.create_job(request)?;
    migrations.start(job_id)?;
    let job = migrations.wait(job_id).await?;

    info!(
        job_id = %job.id,
        state = %job.state,
        succeeded = job.success_count,
        failed = job.failure_count,
        skipped = job.skipped_count,
        "Migration finished"
    );
    for failure in &job.failures {
        warn!(resource = %failure.key(), attempts = failure.attempts, "{}", failure.error);
    }
    Ok(job)
}

async fn emit(
    service: &TransformService,
    keys: &[ResourceKey],
    version: FhirVersion,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let mut writer: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let mut written = 0usize;
    for key in keys {
        let served = match service.retrieve(key, version).await {
            Ok(served) => served,
            Err(e) => {
                warn!(resource = %key, version = %version, error = %e, "Cannot serve resource");
                continue;
            }
        };
        if let Some(advisory) = &served.advisory {
            for note in &advisory.fields {
                warn!(
                    resource = %key,
                    path = %note.path,
                    reason = note.message.as_deref().unwrap_or(""),
                    "Lossy field in output"
                );
            }
        }
        serde_json::to_writer(&mut writer, served.resource.payload())?;
        writer.write_all(b"\n")?;
        written += 1;
    }
    writer.flush()?;

    info!(written, version = %version, "Output written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert!(parse_line("   ").unwrap().is_none());
        let value = parse_line(r#"{"resourceType":"Patient","id":"p1"}"#).unwrap().unwrap();
        assert_eq!(value["id"], "p1");
        assert!(parse_line("[1, 2]").is_err());
        assert!(parse_line("{not json").is_err());
    }

    #[test]
    fn test_args_flatten_engine_config() {
        let args = Args::try_parse_from([
            "hfs-migrate",
            "--registry",
            "rules.json",
            "--migrate-to",
            "R5",
            "--types",
            "Patient,Observation",
            "--batch-size",
            "250",
        ])
        .unwrap();
        assert_eq!(args.migrate_to, Some(FhirVersion::R5));
        assert_eq!(args.types, vec!["Patient", "Observation"]);
        assert_eq!(args.engine.batch_size, 250);
        assert_eq!(args.input, "-");
    }
}
