//! jsii-host: command-line supervisor for a jsii kernel process.
//!
//! Spawns the kernel, performs the handshake, and keeps it supervised until
//! interrupted. Exit codes: 0 on clean termination, 2 when the kernel
//! cannot be spawned, 3 on a protocol failure, 4 on a version mismatch.

use clap::Parser;
use jsii_rs::{JsiiError, JsiiRuntime, KernelSpec};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "jsii-host")]
#[command(about = "Spawns and supervises a jsii kernel process")]
struct Args {
    /// Path to the kernel executable (defaults to $JSII_RUNTIME, then
    /// `jsii-runtime` on PATH)
    #[arg(long)]
    kernel: Option<PathBuf>,

    /// Assemblies to load at startup, as name@version=tarball
    #[arg(long = "load", value_name = "SPEC")]
    load: Vec<String>,

    /// Enable debug logging and mirror kernel traces to stderr
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(args: Args) -> Result<(), JsiiError> {
    let mut spec = KernelSpec::from_env();
    if let Some(kernel) = args.kernel {
        spec = spec.with_executable(kernel);
    }
    if args.debug {
        spec = spec.with_debug(true);
    }

    let runtime = JsiiRuntime::with_spec(spec);
    runtime.start().await?;

    for load in &args.load {
        let (name_version, tarball) = parse_load(load)?;
        let (name, version) = name_version;
        let loaded = runtime.client().load(name, version, tarball).await?;
        info!("loaded {}@{}: {}", name, version, loaded);
    }

    let stats = runtime.client().stats().await?;
    let objects = stats
        .get("objectCount")
        .and_then(|count| count.as_u64())
        .unwrap_or(0);
    info!("kernel is up ({} live objects), press Ctrl-C to stop", objects);

    tokio::signal::ctrl_c().await.map_err(JsiiError::from)?;

    info!("shutting down");
    runtime.shutdown().await
}

/// Splits a `name@version=tarball` load spec.
fn parse_load(spec: &str) -> Result<((&str, &str), &str), JsiiError> {
    let malformed = || JsiiError::Marshal {
        message: format!("malformed load spec '{}', expected name@version=tarball", spec),
    };
    let (name_version, tarball) = spec.split_once('=').ok_or_else(malformed)?;
    let (name, version) = name_version.split_once('@').ok_or_else(malformed)?;
    Ok(((name, version), tarball))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_load() {
        let ((name, version), tarball) = parse_load("acme@1.0.0=/tmp/acme.tgz").unwrap();
        assert_eq!(name, "acme");
        assert_eq!(version, "1.0.0");
        assert_eq!(tarball, "/tmp/acme.tgz");

        assert!(parse_load("acme").is_err());
        assert!(parse_load("acme=/tmp/x.tgz").is_err());
    }
}
