//! CLI definition and argument parsing for runcage.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "runcage", author, version, about = "Single-shot Linux sandbox executor")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
#[non_exhaustive]
pub enum Commands {
    /// Run a command inside a fresh sandbox and report on it
    Execute(ExecuteArgs),
}

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ExecuteArgs {
    /// Host path that becomes the sandbox root
    #[arg(long)]
    pub root: PathBuf,

    /// Configuration file (YAML or JSON); read from stdin when absent
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Host directory (or mountable image) to populate the root from
    #[arg(long)]
    pub rootfs: Option<PathBuf>,

    /// Target command and its arguments, after `--`
    #[arg(last = true, required = true)]
    pub args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_parses_passthrough_args() {
        let cli = Cli::try_parse_from([
            "runcage", "execute", "--root", "/srv/cage", "--", "/bin/sh", "-c", "echo hi",
        ])
        .unwrap();

        let Commands::Execute(args) = cli.command;
        assert_eq!(args.root, PathBuf::from("/srv/cage"));
        assert_eq!(args.args, vec!["/bin/sh", "-c", "echo hi"]);
        assert!(args.config.is_none());
        assert!(!cli.global.debug);
    }

    #[test]
    fn test_execute_requires_target() {
        assert!(Cli::try_parse_from(["runcage", "execute", "--root", "/srv/cage"]).is_err());
    }

    #[test]
    fn test_target_flags_are_not_ours() {
        // Everything after `--` belongs to the target, including flags.
        let cli = Cli::try_parse_from([
            "runcage", "execute", "--root", "/srv/cage", "--config", "cfg.yml", "--", "ls", "-la",
        ])
        .unwrap();

        let Commands::Execute(args) = cli.command;
        assert_eq!(args.config, Some(PathBuf::from("cfg.yml")));
        assert_eq!(args.args, vec!["ls", "-la"]);
    }

    #[test]
    fn test_sentinel_argv_reparses() {
        // The jailer re-parses the same command line under the sentinel
        // argv[0]; clap only cares about everything after it.
        let cli = Cli::try_parse_from([
            "setup", "execute", "--root", "/srv/cage", "--", "/bin/true",
        ])
        .unwrap();
        let Commands::Execute(args) = cli.command;
        assert_eq!(args.args, vec!["/bin/true"]);
    }
}
