//! walk-builder - build a Firecracker App disk from an OCI image.
//!
//! ## Usage
//!
//! ```sh
//! walk-builder <image-ref> [options]
//! ```
//!
//! The output directory is taken from `--output-dir`, then the
//! `WALKIO_OUT_DIR` environment variable, then `/var/lib/walkio/app`.
//!
//! ## Exit Codes
//!
//! - `0` - build published (or an equivalent artifact already existed)
//! - `3` - build superseded by a newer build of the same digest
//! - `1` - any other failure

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkio::disk::{
    AppConfigWriter, BuildOptions, Builder, DEFAULT_STATE_DIR, Ext4Builder, LayerFlattener,
    OUT_DIR_ENV, StateDiskOptions, build_state_device,
};
use walkio::image::{BlobStore, RegistrySource};

#[derive(Debug)]
struct Args {
    image_ref: String,
    output_dir: PathBuf,
    work_dir: PathBuf,
    /// When set, also provision a State disk of this many bytes.
    state_size: Option<u64>,
    state_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    std::env::var_os(OUT_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(walkio::disk::DEFAULT_APP_DIR))
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" || args[1] == "help" {
        return Err(String::new());
    }

    let mut parsed = Args {
        image_ref: args[1].clone(),
        output_dir: default_output_dir(),
        work_dir: std::env::temp_dir(),
        state_size: None,
        state_dir: PathBuf::from(DEFAULT_STATE_DIR),
    };

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--output-dir" | "-o" => {
                let value = args.get(i + 1).ok_or("--output-dir requires a path")?;
                parsed.output_dir = PathBuf::from(value);
                i += 2;
            }
            "--work-dir" | "-w" => {
                let value = args.get(i + 1).ok_or("--work-dir requires a path")?;
                parsed.work_dir = PathBuf::from(value);
                i += 2;
            }
            "--state-size" => {
                let value = args.get(i + 1).ok_or("--state-size requires a byte count")?;
                let bytes = value
                    .parse::<u64>()
                    .map_err(|e| format!("invalid --state-size: {}", e))?;
                parsed.state_size = Some(bytes);
                i += 2;
            }
            "--state-dir" => {
                let value = args.get(i + 1).ok_or("--state-dir requires a path")?;
                parsed.state_dir = PathBuf::from(value);
                i += 2;
            }
            unknown => return Err(format!("unknown option: {}", unknown)),
        }
    }

    Ok(parsed)
}

fn print_usage() {
    eprintln!(
        r#"walk-builder - build a Firecracker App disk from an OCI image

USAGE:
    walk-builder <image-ref> [options]

OPTIONS:
    --output-dir, -o <path>   Output directory (default: ${OUT_DIR_ENV} or /var/lib/walkio/app)
    --work-dir, -w <path>     Scratch directory (default: system temp dir)
    --state-size <bytes>      Also provision an empty State disk of this size
    --state-dir <path>        State disk directory (default: /var/lib/walkio/state)

EXAMPLES:
    walk-builder nginx:latest
    walk-builder ghcr.io/owner/app:v2 -o /var/lib/walkio/app --state-size 67108864
"#
    );
}

async fn run(args: Args) -> walkio::disk::Result<()> {
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling build");
            signal_cancel.cancel();
        }
    });

    let storage = Arc::new(BlobStore::new()?);
    let source = RegistrySource::new(&args.image_ref, storage)?;

    let builder = Builder::new(LayerFlattener::new(), AppConfigWriter::new(), Ext4Builder::new());

    let result = builder
        .build(
            &cancel,
            &source,
            &BuildOptions {
                output_dir: args.output_dir,
                work_dir: args.work_dir,
            },
        )
        .await?;

    info!(
        "app disk ready: path={} digest={} cached={} duration={:?}",
        result.block_device_path.display(),
        result.source_digest,
        result.cached,
        result.build_time
    );
    println!("{}", result.block_device_path.display());

    if let Some(state_size) = args.state_size {
        let state = build_state_device(
            &cancel,
            &Ext4Builder::new(),
            &StateDiskOptions {
                app_id: result.source_digest.hex().to_string(),
                size_bytes: state_size,
                output_dir: args.state_dir,
            },
        )
        .await?;
        println!("{}", state.path.display());
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_superseded() => {
            // Not a failure of the build's work, only of its right to publish.
            eprintln!("warning: {}", e);
            ExitCode::from(3)
        }
        Err(e) => {
            eprintln!("error: {}", e);
            let mut cause = std::error::Error::source(&e);
            while let Some(err) = cause {
                eprintln!("caused by: {}", err);
                cause = err.source();
            }
            ExitCode::FAILURE
        }
    }
}
