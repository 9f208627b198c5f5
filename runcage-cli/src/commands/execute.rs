//! The `execute` subcommand: the supervisor path.

use std::io::{Read, Write};

use runcage::sandbox::{self, ExecuteRequest};
use runcage_shared::report::INTERNAL_ERROR;
use runcage_shared::{Report, RuncageError, RuncageResult};

use crate::cli::ExecuteArgs;

/// Run a supervised sandbox invocation. Emits exactly one line on stdout
/// — the report, or the folded error report — and returns the exit code
/// for the process.
pub fn execute(args: ExecuteArgs) -> i32 {
    match run(&args) {
        Ok(outcome) => {
            write_stdout(&outcome.output);
            outcome.exit_code
        }
        Err(err) => {
            tracing::error!(error = %err, "sandbox run failed");
            if let Ok(line) = Report::internal_error(err.to_string()).to_json_line() {
                write_stdout(&line);
            }
            INTERNAL_ERROR
        }
    }
}

fn run(args: &ExecuteArgs) -> RuncageResult<sandbox::ExecuteOutcome> {
    let config = match &args.config {
        Some(path) => std::fs::read(path).map_err(|e| {
            RuncageError::Config(format!("reading {}: {}", path.display(), e))
        })?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .map_err(|e| RuncageError::Config(format!("reading stdin: {}", e)))?;
            buf
        }
    };

    sandbox::execute(ExecuteRequest {
        root: args.root.clone(),
        rootfs: args.rootfs.clone(),
        config,
        forward_args: std::env::args().skip(1).collect(),
    })
}

fn write_stdout(payload: &str) {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    let _ = lock.write_all(payload.as_bytes());
    let _ = lock.flush();
}
