//! refeval cli interface

use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Formatter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Change the work directory
    ///
    /// Can be specified multiple times. Note that all
    /// paths on the way to the final path must exist.
    ///
    /// This is equivalent to running { cd <directory>; refeval ... }
    #[clap(short = 'C', long = "directory", global(true))]
    pub directory: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve an expression against a resource
    ///
    /// Reads a manifest from stdin unless any other source is provided (via --input-*)
    #[command(alias = "eval")]
    Evaluate(EvaluateCommand),

    /// Resolve every attribute, apply changes and print the difference
    Diff(DiffCommand),

    /// Print debug information for development
    Dev(DevCommand),
}

#[derive(Parser, Debug)]
pub struct EvaluateCommand {
    #[clap(flatten)]
    pub input: InputArgs,

    #[clap(flatten)]
    pub output: OutputArgs,

    /// Resource the expression is resolved against (first root by default)
    #[clap(short = 'r', long = "resource")]
    pub resource: Option<String>,

    /// Bind a variable, the value is parsed as YAML
    #[clap(long = "var", value_name = "NAME=VALUE", value_parser = parse_assignment)]
    pub vars: Vec<(String, String)>,

    /// Print every match as a list instead of collapsing single matches
    #[clap(long = "all")]
    pub all: bool,

    /// Log every path segment step at debug level (set REFEVAL_LOG=debug to see them)
    #[clap(short = 't', long = "trace", action = clap::ArgAction::Count)]
    pub trace: u8,

    /// Write back references and external markers instead of resolved values
    #[clap(long = "serialize")]
    pub serialize: bool,

    /// Path expression, or a YAML reference document
    pub expression: String,
}

#[derive(Parser, Debug)]
pub struct DiffCommand {
    #[clap(flatten)]
    pub input: InputArgs,

    #[clap(flatten)]
    pub output: OutputArgs,

    /// Resource whose attributes are changed (first root by default)
    #[clap(short = 'r', long = "resource")]
    pub resource: Option<String>,

    /// Set an attribute, `a::b=value` descends into nested attributes. The value is parsed as YAML
    #[clap(long = "set", value_name = "PATH=VALUE", value_parser = parse_assignment)]
    pub set: Vec<(String, String)>,

    /// Delete an attribute, `a::b` descends into nested attributes
    #[clap(long = "delete", value_name = "PATH")]
    pub delete: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct InputArgs {
    /// Load manifests from work directory
    #[clap(short = 'w', long = "input-workdir")]
    pub workdir: bool,

    /// Load a manifest
    #[clap(short = 'f', long = "input-file")]
    pub files: Vec<PathBuf>,

    /// Load manifests from given directory
    #[clap(short = 'd', long = "input-dir")]
    pub directories: Vec<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct OutputArgs {
    #[arg(short = 'F', long = "output-format", default_value_t)]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Clone, Default, Debug)]
pub enum OutputFormat {
    Json,
    #[default]
    Yaml,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => f.write_str("json"),
            OutputFormat::Yaml => f.write_str("yaml"),
        }
    }
}

#[derive(Parser, Debug)]
pub struct DevCommand {
    #[command(subcommand)]
    pub command: DevSubCommand,
}

#[derive(Subcommand, Debug)]
pub enum DevSubCommand {
    /// Print the parsed path expression
    Parse { expression: String },
    /// Print the loaded resource tree
    Tree {
        #[clap(flatten)]
        input: InputArgs,
    },
}

fn parse_assignment(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got `{input}`")),
    }
}
