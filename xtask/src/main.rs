use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "forkjoin workspace automation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Benchmark the job system once per semaphore backend and compare
    Bench {
        /// Run quickly (lower sample size/time)
        #[arg(long, default_value_t = false)]
        quick: bool,

        /// Generate report only (skip running benchmarks)
        #[arg(long, default_value_t = false)]
        report_only: bool,
    },
}

/// Criterion baseline name and the cargo features selecting each backend.
const BACKENDS: &[(&str, &str)] = &[("futex", "tracing"), ("portable", "tracing,portable-semaphore")];

const BENCHES: &[&str] = &["job_system_benchmark", "semaphore_benchmark"];

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Bench { quick, report_only } => {
            if !report_only {
                run_benchmarks(quick)?;
            }
            generate_report()?;
        }
    }

    Ok(())
}

fn run_benchmarks(quick: bool) -> Result<()> {
    println!("Compiling benchmarks...");
    for (_, features) in BACKENDS {
        let status = Command::new("cargo")
            .args(["build", "--benches", "--release", "--no-default-features", "--features", features])
            .status()?;
        if !status.success() {
            anyhow::bail!("Failed to compile benchmarks with features {features}");
        }
    }

    for (baseline, features) in BACKENDS {
        for bench in BENCHES {
            println!("\n>>> {bench} with the {baseline} semaphore");
            let start = Instant::now();

            let mut cmd = Command::new("cargo");
            cmd.env("CARGO_INCREMENTAL", "0")
                .args(["bench", "--bench", bench, "--no-default-features", "--features", features])
                .arg("--")
                .arg("--save-baseline")
                .arg(baseline);

            if quick {
                cmd.args(["--measurement-time", "0.1", "--noplot", "--sample-size", "10"]);
            }

            let status = cmd
                .status()
                .with_context(|| format!("Failed to run {bench} for {baseline}"))?;

            if status.success() {
                println!("Finished {bench} ({baseline}) in {:.2?}", start.elapsed());
            } else {
                eprintln!("Warning: {bench} failed for {baseline}");
            }
        }
    }

    Ok(())
}

fn generate_report() -> Result<()> {
    println!("\n>>> Generating Report...");
    let criterion_dir = Path::new("target/criterion");
    if !criterion_dir.exists() {
        eprintln!("No criterion output found at {}", criterion_dir.display());
        return Ok(());
    }

    let mut results: BTreeMap<String, HashMap<String, f64>> = BTreeMap::new();
    collect_results(criterion_dir, criterion_dir, &mut results);

    let report_path = Path::new("benchmark_results/report.md");
    if let Some(parent) = report_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(report_path)
        .with_context(|| format!("Failed to create {}", report_path.display()))?;

    writeln!(file, "# Semaphore Backend Comparison")?;
    writeln!(file)?;
    write!(file, "| Benchmark |")?;
    for (baseline, _) in BACKENDS {
        write!(file, " {baseline} (ops/s) |")?;
    }
    writeln!(file, " portable vs futex |")?;
    write!(file, "|---|")?;
    for _ in BACKENDS {
        write!(file, "---|")?;
    }
    writeln!(file, "---|")?;

    for (benchmark, by_backend) in &results {
        write!(file, "| {benchmark} |")?;
        for (baseline, _) in BACKENDS {
            match by_backend.get(*baseline) {
                Some(ops) => write!(file, " {} |", format_ops(*ops))?,
                None => write!(file, " N/A |")?,
            }
        }
        match (by_backend.get("futex"), by_backend.get("portable")) {
            (Some(futex), Some(portable)) if *futex > 0.0 => {
                writeln!(file, " **{:.2}x** |", portable / futex)?;
            }
            _ => writeln!(file, " - |")?,
        }
    }

    println!("Report written to {}", report_path.display());
    Ok(())
}

fn format_ops(ops: f64) -> String {
    if ops > 1_000_000.0 {
        format!("{:.2}M", ops / 1_000_000.0)
    } else if ops > 1_000.0 {
        format!("{:.2}K", ops / 1_000.0)
    } else {
        format!("{ops:.0}")
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|name| name.to_str()).map(str::to_string)
}

/// Walks `target/criterion/<group>/<bench>/<baseline>/estimates.json`.
fn collect_results(root: &Path, dir: &Path, results: &mut BTreeMap<String, HashMap<String, f64>>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_results(root, &path, results);
            continue;
        }
        if file_name(&path).as_deref() != Some("estimates.json") {
            continue;
        }

        let Some(baseline_dir) = path.parent() else { continue };
        let Some(baseline) = file_name(baseline_dir) else { continue };
        if !BACKENDS.iter().any(|(name, _)| *name == baseline) {
            continue;
        }
        let Some(bench_dir) = baseline_dir.parent() else { continue };
        let Ok(relative) = bench_dir.strip_prefix(root) else { continue };
        let benchmark = relative.to_string_lossy().replace('\\', "/");

        let elements = fs::read_to_string(bench_dir.join(&baseline).join("benchmark.json"))
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|json| json.get("throughput")?.get("Elements")?.as_f64());

        let mean_ns = fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|json| json.get("mean")?.get("point_estimate")?.as_f64());

        if let Some(time_ns) = mean_ns.filter(|t| *t > 0.0) {
            let metric = elements.unwrap_or(1.0) * 1e9 / time_ns;
            results.entry(benchmark).or_default().insert(baseline, metric);
        }
    }
}
