use std::path::PathBuf;

use clap::{Parser, Subcommand};
use vigil_analyzer::EffortLevel;

#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(about = "Drive a static-analysis engine from the command line")]
#[command(version)]
/// Command-line arguments.
pub struct Cli {
	/// Configuration file with `[analyzer]` and `[cache]` tables
	#[arg(short, long, value_name = "PATH", default_value = "vigil.toml", global = true)]
	pub config: PathBuf,

	/// Verbose logging
	#[arg(short, long, global = true)]
	pub verbose: bool,

	/// Subcommand to execute.
	#[command(subcommand)]
	pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
	/// Run one analysis and print the results as JSON
	Analyze {
		/// Only analyze these files (repeatable); the whole workspace if omitted
		#[arg(long = "path", value_name = "PATH")]
		paths: Vec<PathBuf>,

		/// Ask the analyzer to drop its incremental state first
		#[arg(long)]
		reset_cache: bool,
	},
	/// Request a fix for the incidents in a JSON file and print it as JSON
	Solve {
		/// JSON file holding `{"file_path": ..., "incidents": [...]}`
		#[arg(long, value_name = "FILE")]
		incidents: PathBuf,

		/// How hard the solver may work
		#[arg(long, default_value_t = EffortLevel::Medium)]
		effort: EffortLevel,
	},
	/// Forward file changes read as JSON lines from stdin until EOF
	Watch {
		/// Re-analyze on every change instead of only on saves
		#[arg(long)]
		hot_rerun: bool,
	},
}

#[cfg(test)]
mod tests {
	use clap::CommandFactory;

	use super::*;

	#[test]
	fn definition_is_consistent() {
		Cli::command().debug_assert();
	}

	#[test]
	fn parses_analyze_with_paths() {
		let cli = Cli::try_parse_from(["vigil", "analyze", "--path", "src/A.java", "--path", "src/B.java", "-v"]).unwrap();
		assert!(cli.verbose);
		assert_eq!(cli.config, PathBuf::from("vigil.toml"));
		match cli.command {
			Command::Analyze { paths, reset_cache } => {
				assert_eq!(paths, vec![PathBuf::from("src/A.java"), PathBuf::from("src/B.java")]);
				assert!(!reset_cache);
			}
			other => panic!("unexpected command {other:?}"),
		}
	}

	#[test]
	fn parses_solve_effort() {
		let cli = Cli::try_parse_from(["vigil", "--config", "ci.toml", "solve", "--incidents", "i.json", "--effort", "High"]).unwrap();
		assert_eq!(cli.config, PathBuf::from("ci.toml"));
		match cli.command {
			Command::Solve { incidents, effort } => {
				assert_eq!(incidents, PathBuf::from("i.json"));
				assert_eq!(effort, EffortLevel::High);
			}
			other => panic!("unexpected command {other:?}"),
		}

		assert!(Cli::try_parse_from(["vigil", "solve", "--incidents", "i.json", "--effort", "extreme"]).is_err());
	}
}
