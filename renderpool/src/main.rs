use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use renderpool::transport::{ServerConfig, serve};
use renderpool::{
    CodeSource, DispatcherConfig, LauncherConfig, ProcessLauncher, RenderService, VersionInfo,
};

#[derive(Debug, PartialEq)]
struct Args {
    code_file: PathBuf,
    workers: Option<usize>,
    host: Option<String>,
    port: Option<u16>,
    runtime: Option<String>,
}

fn usage() {
    eprintln!(
        "Usage: renderpool <code-file> [--workers N] [--host H] [--port P] [--runtime PROGRAM]"
    );
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <code-file>          Rendering code, re-read on every request");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --workers <n>        Number of worker slots [default: $RENDERPOOL_WORKERS or 1]");
    eprintln!("  --host <host>        Listen address [default: 127.0.0.1]");
    eprintln!("  --port <port>        Listen port [default: 3000]");
    eprintln!("  --runtime <program>  Script runtime [default: $RENDERPOOL_RUNTIME or node]");
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            usage();
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        tracing::error!("renderpool exited with error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut code_file: Option<PathBuf> = None;
    let mut workers = None;
    let mut host = None;
    let mut port = None;
    let mut runtime = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--workers" => {
                i += 1;
                let value = args.get(i).ok_or("--workers requires a value")?;
                workers = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid worker count: {value}"))?,
                );
            }
            "--host" => {
                i += 1;
                host = Some(args.get(i).ok_or("--host requires a value")?.clone());
            }
            "--port" => {
                i += 1;
                let value = args.get(i).ok_or("--port requires a value")?;
                port = Some(value.parse().map_err(|_| format!("invalid port: {value}"))?);
            }
            "--runtime" => {
                i += 1;
                runtime = Some(args.get(i).ok_or("--runtime requires a value")?.clone());
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if code_file.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                code_file = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    let code_file = code_file.ok_or("missing required argument: <code-file>")?;
    Ok(Args {
        code_file,
        workers,
        host,
        port,
        runtime,
    })
}

/// RUST_LOG wins; otherwise RENDERPOOL_LOG sets the level for this crate.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("RENDERPOOL_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("renderpool={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    // Fail at startup rather than on the first request.
    tokio::fs::metadata(&args.code_file)
        .await
        .with_context(|| format!("cannot read code file {}", args.code_file.display()))?;

    let launcher_config = match args.runtime {
        Some(program) => LauncherConfig::new(program),
        None => LauncherConfig::default(),
    };
    let launcher = ProcessLauncher::shared(launcher_config);

    let mut version = VersionInfo::new();
    match launcher.runtime_version().await {
        Some(v) => version = version.with_runtime(v),
        None => tracing::warn!("Could not determine script runtime version"),
    }

    let mut dispatcher = DispatcherConfig::new().with_launcher(launcher);
    if let Some(n) = args.workers {
        dispatcher = dispatcher.with_num_workers(n);
    }

    let service = Arc::new(
        RenderService::new(dispatcher, CodeSource::File(args.code_file)).with_version(version),
    );

    let defaults = ServerConfig::default();
    let config = ServerConfig {
        host: args.host.unwrap_or(defaults.host),
        port: args.port.unwrap_or(defaults.port),
        ..defaults
    };

    serve(config, service).await
}
