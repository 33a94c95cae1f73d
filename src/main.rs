use anyhow::{Context, Result};
use clap::Parser;
use ltscope::cli::{Cli, Command};
use ltscope::config::InspectorConfig;
use ltscope::hooks::HookController;
use ltscope::host::ptrace::PtraceHost;
use ltscope::{commands, Session};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(args: &Cli) -> Result<InspectorConfig> {
    match &args.config {
        Some(path) => InspectorConfig::from_file(path),
        None => Ok(InspectorConfig::default()),
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);
    let config = load_config(&args)?;

    if let Command::Watch { command } = &args.command {
        if args.pid.is_some() {
            anyhow::bail!("Cannot specify both -p PID and watch. Choose one.");
        }
        let host = PtraceHost::spawn(command)
            .with_context(|| format!("Failed to start {}", command.join(" ")))?;
        let mut session = Session::new(host, config);
        let code = HookController::new().run(&mut session)?;
        drop(session);
        std::process::exit(code);
    }

    let Some(pid) = args.pid else {
        anyhow::bail!("Must specify -p PID. Usage: ltscope -p PID <COMMAND>");
    };
    let host = PtraceHost::attach(pid).with_context(|| format!("Failed to attach to PID {}", pid))?;
    let mut session = Session::new(host, config);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    commands::run(&mut session, &args.command, args.format, &mut out)
}
