//! WSI Dicomizer - converts Whole Slide Images into DICOM studies.
//!
//! This binary wires the stores, converters and pipeline together behind a
//! small set of subcommands.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wsi_dicomizer::{
    asset::{delete_asset, describe_asset, ingest_upload},
    config::{resolve_executable, Cli, Command, Config, StoreName},
    error::{ErrorClass, PipelineError},
    metadata::StudyRequest,
    pipeline::fetch_study_archive,
};

/// Exit status for failures caused by the caller's input.
const EXIT_CLIENT_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.config.verbose);

    if let Err(e) = cli.config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let config = cli.config;
    match cli.command {
        Command::Ingest { path } => run_ingest(&config, &path).await,
        Command::Convert { request } => run_convert(&config, &request).await,
        Command::Fetch { study_uid, output } => run_fetch(&config, &study_uid, &output).await,
        Command::Inspect { wsi_id } => run_inspect(&config, &wsi_id).await,
        Command::List { store, dir } => run_list(&config, store, &dir).await,
        Command::Delete { wsi_id } => run_delete(&config, &wsi_id).await,
        Command::Check => run_check(&config),
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "wsi_dicomizer=debug"
    } else {
        "wsi_dicomizer=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to serialize output: {}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Asset Commands
// =============================================================================

async fn run_ingest(config: &Config, path: &Path) -> ExitCode {
    let stores = match config.stores() {
        Ok(stores) => stores,
        Err(e) => {
            error!("Failed to open stores: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match ingest_upload(stores.wsi.as_ref(), path).await {
        Ok(assets) => print_json(&assets),
        Err(e) => {
            error!("Ingest failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_inspect(config: &Config, wsi_id: &str) -> ExitCode {
    let stores = match config.stores() {
        Ok(stores) => stores,
        Err(e) => {
            error!("Failed to open stores: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match describe_asset(stores.wsi.as_ref(), wsi_id).await {
        Ok(description) => print_json(&description),
        Err(e) => {
            error!("Inspect failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_delete(config: &Config, wsi_id: &str) -> ExitCode {
    let stores = match config.stores() {
        Ok(stores) => stores,
        Err(e) => {
            error!("Failed to open stores: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match delete_asset(stores.wsi.as_ref(), wsi_id).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Delete failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_list(config: &Config, store: StoreName, dir: &str) -> ExitCode {
    let stores = match config.stores() {
        Ok(stores) => stores,
        Err(e) => {
            error!("Failed to open stores: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let Some(store) = stores.by_name(store.as_str()) else {
        error!("Unknown store {}", store.as_str());
        return ExitCode::FAILURE;
    };

    match store.list(dir).await {
        Ok(listing) => {
            for name in &listing.dirs {
                println!("{}/", name);
            }
            for name in &listing.files {
                println!("{}", name);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("List failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Study Commands
// =============================================================================

#[derive(Serialize)]
struct ErrorReport {
    error: &'static str,
    stage: String,
    message: String,
    class: &'static str,
}

async fn run_convert(config: &Config, request_path: &Path) -> ExitCode {
    let body = match read_request(request_path).await {
        Ok(body) => body,
        Err(e) => {
            error!("Cannot read request {}: {}", request_path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let request = match StudyRequest::from_json(&body) {
        Ok(request) => request,
        Err(e) => return report_failure("validating".to_string(), &e),
    };

    let pipeline = match config.pipeline() {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Failed to open stores: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(slides = request.slides.len(), "converting study");
    match pipeline.run(&request).await {
        Ok(result) => print_json(&result),
        Err(failure) => report_failure(failure.stage.to_string(), &failure.error),
    }
}

fn report_failure(stage: String, error: &PipelineError) -> ExitCode {
    error!("Conversion failed while {}: {}", stage, error);

    let class = error.class();
    let report = ErrorReport {
        error: error.kind(),
        stage,
        message: error.to_string(),
        class: match class {
            ErrorClass::Client => "client",
            ErrorClass::Server => "server",
        },
    };
    if let Ok(json) = serde_json::to_string_pretty(&report) {
        println!("{}", json);
    }

    match class {
        ErrorClass::Client => ExitCode::from(EXIT_CLIENT_ERROR),
        ErrorClass::Server => ExitCode::FAILURE,
    }
}

async fn read_request(path: &Path) -> std::io::Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut body = Vec::new();
        tokio::io::stdin().read_to_end(&mut body).await?;
        Ok(body)
    } else {
        tokio::fs::read(path).await
    }
}

async fn run_fetch(config: &Config, study_uid: &str, output: &Path) -> ExitCode {
    let stores = match config.stores() {
        Ok(stores) => stores,
        Err(e) => {
            error!("Failed to open stores: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let archive = match fetch_study_archive(&stores, study_uid).await {
        Ok(path) => path,
        Err(e) => {
            error!("Fetch failed: {}", e);
            return ExitCode::from(EXIT_CLIENT_ERROR);
        }
    };

    match tokio::fs::copy(&archive, output).await {
        Ok(bytes) => {
            info!("Wrote {} ({} bytes)", output.display(), bytes);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Cannot write {}: {}", output.display(), e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Check Command
// =============================================================================

fn run_check(config: &Config) -> ExitCode {
    println!("WSI Dicomizer Configuration Check");
    println!("═════════════════════════════════");
    println!();

    let mut ok = true;

    match config.stores() {
        Ok(_) => println!("✓ Storage root: {}", config.storage_root.display()),
        Err(e) => {
            println!("✗ Storage root: {}", e);
            ok = false;
        }
    }
    println!("✓ Scratch directory: {}", config.scratch_root().display());

    for (label, program) in [
        ("Converter", &config.converter),
        ("Library bridge", &config.library_bridge),
    ] {
        match resolve_executable(program) {
            Some(path) => println!("✓ {}: {}", label, path.display()),
            None => {
                println!("✗ {}: {} not found", label, program.display());
                ok = false;
            }
        }
    }

    if config.openslide.components().count() > 1 && !config.openslide.is_file() {
        println!("✗ OpenSlide library: {} not found", config.openslide.display());
        ok = false;
    } else {
        println!("✓ OpenSlide library: {}", config.openslide.display());
    }
    println!("✓ Timeout: {}s", config.timeout_secs);

    println!();
    println!("═════════════════════════════════");
    if ok {
        println!("✓ All checks passed!");
        ExitCode::SUCCESS
    } else {
        println!("✗ Some checks failed");
        ExitCode::FAILURE
    }
}
