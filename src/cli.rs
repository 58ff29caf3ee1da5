use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Terraform workspace workflow
///
/// tfws imports a Terraform source tree into a copy-on-write environment,
/// installs a verified Terraform binary, and runs init/fmt/validate/plan/apply
/// against it without touching the original directory unless asked to.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (defaults to $XDG_CONFIG_HOME/tfws/config.toml)
    #[arg(long, global = true, value_name = "FILE", env = "TFWS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Terraform source directory
    #[arg(short = 'C', long, global = true, value_name = "DIR", default_value = ".")]
    pub source: PathBuf,

    /// Terraform version (overrides .terraform-version)
    #[arg(long = "tf-version", global = true, value_name = "VERSION", env = "TFWS_TF_VERSION")]
    pub tf_version: Option<String>,

    /// Environment variable for Terraform commands
    #[arg(
        short,
        long = "env",
        global = true,
        value_name = "KEY=VALUE",
        value_parser = parse_binding
    )]
    pub env: Vec<(String, String)>,

    /// Secret variable read from a host variable, never printed
    #[arg(
        long = "secret",
        global = true,
        value_name = "NAME=HOST_VAR",
        value_parser = parse_binding
    )]
    pub secrets: Vec<(String, String)>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize without a backend, check formatting and validate
    Check,

    /// Format configuration files
    Fmt {
        /// Write formatted files back to the source directory
        #[arg(long)]
        export: bool,

        /// Extra arguments passed to `terraform fmt`
        #[arg(last = true, value_name = "ARGS")]
        args: Vec<String>,
    },

    /// Validate the configuration
    Validate {
        /// Extra arguments passed to `terraform validate`
        #[arg(last = true, value_name = "ARGS")]
        args: Vec<String>,
    },

    /// Create a plan and print it
    Plan {
        /// Copy the plan file to this path
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,

        /// Extra arguments passed to `terraform plan`
        #[arg(last = true, value_name = "ARGS")]
        args: Vec<String>,
    },

    /// Plan, apply that exact plan, then print outputs
    Apply {
        /// Write changed files (such as the lock file) back to the source directory
        #[arg(long)]
        export: bool,

        /// Extra arguments passed to `terraform plan`
        #[arg(last = true, value_name = "ARGS")]
        args: Vec<String>,
    },

    /// Show the current state
    Show {
        /// Extra arguments passed to `terraform show`
        #[arg(last = true, value_name = "ARGS")]
        args: Vec<String>,
    },

    /// Print outputs
    Output {
        /// Output name (all outputs if not specified)
        #[arg(value_name = "NAME")]
        name: Option<String>,

        /// Extra arguments passed to `terraform output`
        #[arg(last = true, value_name = "ARGS")]
        args: Vec<String>,
    },

    /// Download and verify the Terraform binary
    Binary {
        /// Target platform, e.g. linux/amd64 (defaults to the host)
        #[arg(long, value_name = "OS/ARCH")]
        platform: Option<String>,

        /// Directory to place the binary in
        #[arg(long, value_name = "DIR")]
        dest: PathBuf,
    },

    /// Print the resolved Terraform version
    Version,
}

fn parse_binding(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{value}'")),
    }
}
