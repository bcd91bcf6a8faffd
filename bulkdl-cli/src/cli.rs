//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Bulk download agent for platform manifests.
///
/// Downloads every file listed in a manifest, resumes interrupted runs
/// from the companion state database, and verifies content integrity.
#[derive(Parser, Debug)]
#[command(name = "bulkdl")]
#[command(author, version, about)]
#[command(
    after_help = "Exit codes:\n  0 = success\n  1 = fatal error, failed parts, or failed verification"
)]
pub struct Cli {
    /// Mirror the log to stderr and raise verbosity.
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Download all files listed in a manifest.
    Download(DownloadArgs),
    /// Report download progress for a manifest.
    Progress(ManifestArg),
    /// Verify downloaded content against the stored checksums.
    Inspect(DownloadArgs),
    /// Print the version.
    Version,
}

/// A bare manifest-path argument.
#[derive(ClapArgs, Debug, PartialEq, Eq)]
pub struct ManifestArg {
    /// Manifest file (bzip2-compressed JSON).
    pub manifest: PathBuf,
}

/// Arguments shared by `download` and `inspect`.
#[derive(ClapArgs, Debug, PartialEq, Eq)]
pub struct DownloadArgs {
    /// Manifest file (bzip2-compressed JSON).
    pub manifest: PathBuf,

    /// Worker count; 0 sizes the pool from the host.
    #[arg(long = "num-threads", value_name = "N", default_value_t = 0)]
    pub num_threads: usize,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn download_defaults_to_auto_threads() {
        let cli = Cli::parse_from(["bulkdl", "download", "manifest.json.bz2"]);
        match cli.command {
            Command::Download(args) => {
                assert_eq!(args.manifest, PathBuf::from("manifest.json.bz2"));
                assert_eq!(args.num_threads, 0);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(!cli.verbose);
    }

    #[test]
    fn num_threads_and_verbose_parse() {
        let cli = Cli::parse_from([
            "bulkdl",
            "download",
            "--num-threads",
            "8",
            "--verbose",
            "manifest.json.bz2",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Command::Download(args) => assert_eq!(args.num_threads, 8),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn version_subcommand_parses() {
        let cli = Cli::parse_from(["bulkdl", "version"]);
        assert_eq!(cli.command, Command::Version);
    }
}
