mod cli;
mod commands;

use clap::Parser;
use cli::Cli;
use runcage::reexec::{Registry, SETUP_SENTINEL};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    // Sentinel dispatch comes before everything else: when this process
    // is the re-exec'd jailer, argv[0] is "setup" and the regular CLI
    // never runs.
    let registry = Registry::new().register(SETUP_SENTINEL, jailer_entry);
    if let Some(code) = registry.dispatch() {
        std::process::exit(code);
    }

    let cli = Cli::parse();
    init_tracing(cli.global.debug);

    let code = match cli.command {
        cli::Commands::Execute(args) => commands::execute::execute(args),
    };
    std::process::exit(code);
}

/// Entry for the `setup` sentinel: same command line, jailed half.
fn jailer_entry() -> i32 {
    let cli = Cli::parse();
    init_tracing(cli.global.debug);

    match cli.command {
        cli::Commands::Execute(args) => runcage::jailer::run(&args.root, &args.args),
    }
}

/// Tracing goes to stderr; stdout carries only the report line.
fn init_tracing(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
