use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use treehub_push::{Pusher, Report};

/// Default hub when neither `--server` nor `--creds` points elsewhere.
const DEFAULT_SERVER_URL: &str = "https://api.treehub.io/ota/ostreehub";

#[derive(Debug, Parser)]
#[command(
    name = "treehub-push",
    version,
    about = "Push an OSTree-style repo to a treehub instance"
)]
struct Cli {
    /// Path to the repo to push.
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// URL of the treehub instance.
    #[arg(long, default_value = DEFAULT_SERVER_URL)]
    server: String,

    /// Factory to push the repo for (unauthenticated flow).
    #[arg(long, default_value = "")]
    factory: String,

    /// Credential archive with auth material; switches to the
    /// authenticated flow and overrides --server/--factory.
    #[arg(long)]
    creds: Option<PathBuf>,

    /// Output the final report as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false)]
    trace: bool,
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("TREEHUB_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let mut pusher = match &cli.creds {
        Some(creds) => Pusher::with_credentials(&cli.repo, creds),
        None => Pusher::new(&cli.repo, &cli.server, &cli.factory),
    }
    .map_err(|e| e.to_string())?;

    pusher.run().map_err(|e| e.to_string())?;

    let pb = spinner(&format!(
        "pushing {} to {}…",
        cli.repo.display(),
        pusher.hub_url()
    ));
    let report = pusher.wait().map_err(|e| {
        spin_fail(&pb, "push failed");
        e.to_string()
    })?;
    spin_ok(&pb, "push complete");

    print_report(&report, cli.json)
}

fn print_report(report: &Report, json: bool) -> Result<(), String> {
    if json {
        let rendered = serde_json::to_string_pretty(report)
            .map_err(|e| format!("JSON serialization failed: {e}"))?;
        println!("{rendered}");
        return Ok(());
    }
    println!("checked {} files", report.checked);
    println!(
        "sent {} files ({} objects, {} bytes)",
        report.sent.files, report.sent.objects, report.sent.bytes
    );
    println!(
        "hub synced {} files, wrote {} to the bucket",
        report.synced.synced, report.synced.upload_synced
    );
    if report.synced.sync_failed > 0 {
        println!("failed to sync {} files", report.synced.sync_failed);
    }
    Ok(())
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}
