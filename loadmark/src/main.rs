use anyhow::Context;
use clap::Parser;
use loadmark::{
    config, load, process, system, CpuSampler, HarnessError, OhaDriver, RunSettings, Runner,
    ServerManager,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "loadmark", version, about = "Benchmark orchestration harness")]
struct Cli {
    /// Target server binary, spawned once per configuration. A missing
    /// workspace artifact is built once with `cargo build --release`.
    #[arg(long, default_value = "target/release/mock-target")]
    server_bin: PathBuf,

    /// Load generation tool (must emit a JSON summary).
    #[arg(long, default_value = "oha")]
    load_tool: PathBuf,

    /// Port the server binds; also swept during teardown.
    #[arg(long, default_value_t = 5001)]
    port: u16,

    /// Target URL. Defaults to the liveness endpoint on `--port`.
    #[arg(long)]
    url: Option<String>,

    #[arg(long, default_value_t = 20)]
    concurrency: u32,

    /// Load duration per configuration.
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Pause between configurations.
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pause: Duration,

    /// Result artifact path.
    #[arg(long, default_value = "benchmark-data.json")]
    output: PathBuf,

    /// Optional JSON matrix file overriding the built-in configurations.
    #[arg(long)]
    matrix: Option<PathBuf>,

    /// Directory for per-configuration server logs.
    #[arg(long, default_value = ".")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("loadmark=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = RunSettings {
        url: cli
            .url
            .clone()
            .unwrap_or_else(|| RunSettings::target_url(cli.port)),
        server_bin: cli.server_bin,
        load_tool: cli.load_tool,
        port: cli.port,
        concurrency: cli.concurrency,
        duration: cli.duration,
        pause: cli.pause,
        output: cli.output,
        log_dir: cli.log_dir,
    };

    // Global preconditions are the only process-fatal failures before the
    // matrix starts.
    let tool_version = load::tool_version(&settings.load_tool).await.ok_or_else(|| {
        HarnessError::MissingLoadTool {
            tool: settings.load_tool.display().to_string(),
        }
    })?;
    process::ensure_server_binary(&settings.server_bin).await?;

    let system_info = system::collect(&settings.load_tool).await;
    println!("OS: {}", system_info.os);
    println!(
        "CPU: {} ({} cores)",
        system_info.cpu_model, system_info.cpu_cores
    );
    println!(
        "Memory: {:.2}GB free / {:.2}GB total",
        system_info.free_memory_gb, system_info.total_memory_gb
    );
    println!("Load tool: {tool_version}");

    let matrix = match &cli.matrix {
        Some(path) => config::load_matrix(path)?,
        None => config::default_matrix(),
    };

    let runner = Runner::new(
        ServerManager::new(
            settings.server_bin.clone(),
            settings.url.clone(),
            settings.port,
        ),
        OhaDriver::new(
            settings.load_tool.clone(),
            settings.url.clone(),
            settings.concurrency,
            settings.duration,
        ),
        CpuSampler::new(),
    )
    .pause(settings.pause)
    .log_dir(settings.log_dir.clone());

    let report = runner
        .run(&matrix, system_info)
        .await
        .context("benchmark run failed")?;

    report
        .results
        .persist(&settings.output)
        .with_context(|| format!("could not persist {}", settings.output.display()))?;

    println!("\n--- Benchmark Summary ---");
    for result in &report.results.benchmarks {
        println!(
            "{}: {:.0} req/sec, {:.0}% CPU, {:.0} req/sec/core{}",
            result.config.name,
            result.throughput,
            result.cpu_usage,
            result.efficiency,
            if result.load_failed {
                " (load step failed)"
            } else {
                ""
            }
        );
    }
    if !report.skipped.is_empty() {
        println!("\n{} configuration(s) skipped:", report.skipped.len());
        for (name, reason) in &report.skipped {
            println!("  {name}: {reason}");
        }
    }
    println!("\nResults saved to {}", settings.output.display());

    Ok(())
}
