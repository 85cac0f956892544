use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::signal;

use vsphere_ops::{
    cancel_pair, exit_code, init_logging, invocation_from_args, read_invocation, OpResult, VsphereService,
    OPERATIONS,
};

/// vsphere-ops: run one declarative vSphere operation and print its result
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Operation name (see --list).
    #[arg(required_unless_present_any = ["input", "list"], conflicts_with = "input")]
    operation: Option<String>,

    /// Parameters as key=value; values that parse as JSON are taken as JSON.
    #[arg(requires = "operation")]
    params: Vec<String>,

    /// Read the whole invocation as a JSON document (`-` for stdin).
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Report what would change without changing anything.
    #[arg(long, visible_alias = "dry-run", env = "VSOPS_CHECK_MODE")]
    check_mode: bool,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, env = "VSOPS_LOG_JSON")]
    log_json: bool,

    /// Pretty-print the result envelope.
    #[arg(long)]
    pretty: bool,

    /// List the known operations and exit.
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    if cli.list {
        for name in OPERATIONS {
            println!("{name}");
        }
        return ExitCode::SUCCESS;
    }

    let invocation = match (&cli.input, &cli.operation) {
        (Some(path), _) => read_invocation(path, cli.check_mode),
        (None, op) => invocation_from_args(op.as_deref().unwrap_or_default(), &cli.params, cli.check_mode),
    };
    let result = match invocation {
        Ok(invocation) => {
            let (handle, cancel) = cancel_pair();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling");
                    handle.cancel();
                }
            });
            VsphereService::new(cancel).run(&invocation).await
        }
        Err(e) => OpResult::from_error(&e),
    };

    let text = if cli.pretty {
        serde_json::to_string_pretty(&result)
    } else {
        serde_json::to_string(&result)
    };
    match text {
        Ok(text) => println!("{text}"),
        Err(e) => {
            tracing::error!(error = %e, "could not encode result");
            return ExitCode::FAILURE;
        }
    }
    ExitCode::from(exit_code(&result) as u8)
}
