use std::{path::PathBuf, process::ExitCode};

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};

use motionrun::{Driver, DriverConfig, NodeBridgeLauncher, browser::is_node_on_path, telemetry};

#[derive(Parser, Debug)]
#[command(name = "motionrun", version)]
struct Cli {
    /// Log output format (logs go to stderr).
    #[arg(long, value_enum, default_value_t = LogFormatChoice::Compact, global = true)]
    log_format: LogFormatChoice,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render the configured projects to video files.
    Render(RenderArgs),
    /// Validate a config file and print the resolved jobs.
    CheckConfig(CheckArgs),
    /// Write a starter config file.
    InitConfig(InitArgs),
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Driver config JSON.
    #[arg(long)]
    config: PathBuf,

    /// Only render this project (repeatable).
    #[arg(long = "project")]
    projects: Vec<String>,

    /// Override `max_parallel` from the config.
    #[arg(long)]
    jobs: Option<usize>,

    /// Skip the dependency install step.
    #[arg(long)]
    skip_install: bool,
}

#[derive(Parser, Debug)]
struct CheckArgs {
    /// Driver config JSON.
    #[arg(long)]
    config: PathBuf,

    /// Print the resolved jobs as JSON instead of a summary.
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct InitArgs {
    /// Output path; prints to stdout when omitted.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Overwrite an existing file.
    #[arg(long)]
    force: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatChoice {
    Compact,
    Json,
}

impl From<LogFormatChoice> for telemetry::LogFormat {
    fn from(choice: LogFormatChoice) -> Self {
        match choice {
            LogFormatChoice::Compact => Self::Compact,
            LogFormatChoice::Json => Self::Json,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = telemetry::init(cli.log_format.into()) {
        eprintln!("warning: {e}");
    }

    let result = match cli.cmd {
        Command::Render(args) => cmd_render(args),
        Command::CheckConfig(args) => cmd_check_config(args),
        Command::InitConfig(args) => cmd_init_config(args),
    };
    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<u8> {
    let mut config = DriverConfig::load(&args.config)?;
    if let Some(jobs) = args.jobs {
        config.max_parallel = jobs;
    }

    let launcher = NodeBridgeLauncher::from_config(&config);
    if !is_node_on_path(&launcher.node) {
        anyhow::bail!(
            "'{}' is required for the browser bridge, but was not found on PATH",
            launcher.node.display()
        );
    }

    let driver = Driver::new(config, &launcher)?.skip_install(args.skip_install);
    let report = driver.run(&args.projects)?;

    for job in &report.jobs {
        let secs = job.elapsed.as_secs_f64();
        match &job.outcome {
            Ok(dest) => println!("ok      {} -> {} ({secs:.1}s)", job.name, dest.display()),
            Err(e) => println!("FAILED  {} [{}] ({secs:.1}s): {e}", job.name, e.phase()),
        }
    }
    Ok(report.exit_code())
}

fn cmd_check_config(args: CheckArgs) -> anyhow::Result<u8> {
    let config = DriverConfig::load(&args.config)?;
    let jobs = config.jobs(&[])?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&jobs).context("serialize resolved jobs")?
        );
        return Ok(0);
    }

    for job in &jobs {
        println!("{}", job.name);
        println!("  project:     {}", job.project_dir.display());
        println!("  url:         {}", job.base_url());
        println!("  output:      {}", job.output_path.display());
        println!("  destination: {}", job.destination.display());
    }
    println!("viewport: {}", config.viewport);
    println!("max_parallel: {}", config.max_parallel);

    let node = &config.browser.node;
    if is_node_on_path(node) {
        println!("browser bridge: '{}' found", node.display());
    } else {
        println!("browser bridge: '{}' NOT found", node.display());
    }
    Ok(0)
}

fn cmd_init_config(args: InitArgs) -> anyhow::Result<u8> {
    let json = DriverConfig::example().to_json_pretty()?;
    let Some(out) = args.out else {
        println!("{json}");
        return Ok(0);
    };

    if out.exists() && !args.force {
        anyhow::bail!("'{}' already exists (use --force to overwrite)", out.display());
    }
    if let Some(parent) = out.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory '{}'", parent.display()))?;
    }
    std::fs::write(&out, format!("{json}\n"))
        .with_context(|| format!("write config '{}'", out.display()))?;

    eprintln!("wrote {}", out.display());
    Ok(0)
}
