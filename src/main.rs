mod engine;
mod env;
mod loader;
mod report;
mod resolver;
mod schema;

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with checkmarks
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
    /// JUnit XML output for CI systems
    Junit,
}

#[derive(Parser)]
#[command(name = "smokerun")]
#[command(about = "A declarative smoke-test runner for scripts and CLI binaries")]
#[command(version)]
struct Cli {
    /// Log resolution and execution details to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct RepoArgs {
    /// Repository root that script paths are relative to
    #[arg(long, default_value = ".")]
    repo: PathBuf,
    /// Directory of script spec documents (overrides suite config)
    #[arg(long)]
    specs: Option<PathBuf>,
    /// Filter cases by script or case name (substring match)
    #[arg(short, long)]
    filter: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run every discovered smoke case
    Run {
        #[command(flatten)]
        repo: RepoArgs,
        /// Directory for logs and summary.json (overrides suite config)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Output format
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
    },
    /// Resolve every smoke case without running it
    Validate {
        #[command(flatten)]
        repo: RepoArgs,
    },
    /// Scaffold a new spec document
    Init {
        /// Output path for the new spec document
        #[arg(default_value = "tests/script_specs/example.sh.yaml")]
        path: PathBuf,
    },
    /// Output the spec document schema (for AI consumers)
    Schema,
}

/// Settings shared by `run` and `validate`.
struct Workspace {
    ctx: resolver::ResolveContext,
    specs_dir: PathBuf,
    output_dir: PathBuf,
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {message}");
    std::process::exit(1);
}

fn open_workspace(args: &RepoArgs, out: Option<&Path>) -> Workspace {
    let repo = std::path::absolute(&args.repo).unwrap_or_else(|_| args.repo.clone());
    let config = match loader::load_suite_config(&repo) {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => fail(format!("loading suite config: {e}")),
    };

    let default_timeout = config
        .default_timeout_sec
        .unwrap_or(schema::DEFAULT_TIMEOUT_SECS);
    if !default_timeout.is_finite() || default_timeout <= 0.0 {
        fail("default_timeout_sec must be a positive number");
    }

    let baseline = env::baseline_env(&env::patches_from_nullable(&config.env));
    let mut ctx = resolver::ResolveContext::new(&repo, baseline);
    ctx.default_timeout_secs = default_timeout;

    Workspace {
        specs_dir: args
            .specs
            .clone()
            .unwrap_or_else(|| repo.join(&config.specs_dir)),
        output_dir: out
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo.join(&config.output_dir)),
        ctx,
    }
}

fn discover(ws: &Workspace, filter: Option<&str>) -> Vec<loader::SmokeCase> {
    let cases = match loader::discover_cases(&ws.specs_dir) {
        Ok(cases) => cases,
        Err(e) => fail(format!("finding specs in {}: {e}", ws.specs_dir.display())),
    };
    let cases = loader::filter_cases(cases, filter);
    if cases.is_empty() {
        fail(format!("no smoke cases found at: {}", ws.specs_dir.display()));
    }
    cases
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("warning: failed to install logger: {e}");
    }

    match cli.command {
        Command::Run { repo, out, output } => {
            let ws = open_workspace(&repo, out.as_deref());
            let cases = discover(&ws, repo.filter.as_deref());
            tracing::info!(cases = cases.len(), "starting smoke run");

            let sink = report::ResultSink::new();
            sink.clear();
            let mut errors = Vec::new();
            for case in &cases {
                if let Err(e) = engine::run_case(
                    &case.script,
                    &case.case,
                    &case.spec,
                    &ws.ctx,
                    &ws.output_dir,
                    &sink,
                ) {
                    tracing::error!(
                        script = %case.script,
                        case = %case.case,
                        source = %case.source.display(),
                        "{e}"
                    );
                    errors.push(report::CaseFailure {
                        script: case.script.clone(),
                        case: case.case.clone(),
                        error: e.to_string(),
                    });
                }
            }

            let summary = report::Summary::new(sink.snapshot(), errors);
            match summary.write(&ws.output_dir) {
                Ok(path) => tracing::debug!(path = %path.display(), "wrote summary"),
                Err(e) => fail(format!("writing summary: {e}")),
            }

            match output {
                OutputFormat::Human => print!("{}", report::format_human(&summary)),
                OutputFormat::Json => match summary.to_json() {
                    Ok(json) => println!("{json}"),
                    Err(e) => fail(format!("serializing results: {e}")),
                },
                OutputFormat::Junit => print!("{}", report::format_junit_xml(&summary)),
            }

            if summary.failed > 0 {
                std::process::exit(1);
            }
        }
        Command::Validate { repo } => {
            let ws = open_workspace(&repo, None);
            let cases = discover(&ws, repo.filter.as_deref());

            let mut errors = 0;
            for case in &cases {
                match resolver::resolve(&case.script, &case.case, &case.spec, &ws.ctx) {
                    Ok((invocation, _)) => {
                        println!(
                            "✓ {} [{}]: {}",
                            case.script,
                            case.case,
                            invocation.argv.join(" ")
                        );
                    }
                    Err(e) => {
                        eprintln!("✗ {e}");
                        errors += 1;
                    }
                }
            }

            if errors > 0 {
                eprintln!("\n{errors} case(s) failed validation");
                std::process::exit(1);
            }
            println!("\nAll {} case(s) valid", cases.len());
        }
        Command::Init { path } => {
            let template = r#"# Smoke cases for the script named by this file's path
# (tests/script_specs/bin/tool.sh.yaml -> bin/tool.sh), or set it explicitly:
# script: bin/tool.sh

smoke:
  - name: help
    args: ["--help"]
    timeout_sec: 10
    env:
      # null removes an inherited variable
      FORCE_COLOR: null
    expect:
      exit_codes: [0]
      stdout_regex: "^Usage:"

  # - name: explicit-command
  #   command: ["bash", "-c", "echo READY"]
  #   expect:
  #     stdout_regex: "^READY$"
"#;
            if path.exists() {
                fail(format!("file already exists: {}", path.display()));
            }
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
                && let Err(e) = fs::create_dir_all(parent)
            {
                fail(format!("creating directory: {e}"));
            }
            if let Err(e) = fs::write(&path, template) {
                fail(format!("writing file: {e}"));
            }
            println!("Created: {}", path.display());
        }
        Command::Schema => {
            let schema = schema::generate_schema();
            match serde_json::to_string_pretty(&schema) {
                Ok(json) => println!("{json}"),
                Err(e) => fail(format!("serializing schema: {e}")),
            }
        }
    }
}
