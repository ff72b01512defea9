//! graphstrip CLI: prune frozen TensorFlow graphs, convert them and check the
//! converted model against the original.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// graphstrip: frozen graph pruning, conversion and validation
#[derive(Parser, Debug)]
#[command(name = "graphstrip", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Download and extract the model archive
    Fetch {
        /// Archive URL (defaults to the configured one)
        #[arg(long)]
        url: Option<String>,
        /// Destination directory (defaults to the model directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Download even if the archive is already present
        #[arg(long)]
        force: bool,
    },
    /// Summarize a frozen graph: ops, placeholders, terminal nodes
    Inspect {
        /// Graph file (.pb)
        graph: PathBuf,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Strip a graph down to the nodes between inputs and outputs
    Prune {
        /// Graph file (defaults to the extracted archive's graph)
        #[arg(short, long)]
        graph: Option<PathBuf>,
        /// Input node name (repeatable)
        #[arg(short, long = "input")]
        inputs: Vec<String>,
        /// Output node name (repeatable)
        #[arg(long = "output")]
        outputs: Vec<String>,
        /// Where to write the pruned graph
        #[arg(short = 'o', long = "out")]
        out: Option<PathBuf>,
        /// Placeholder dtype for the rewritten inputs (e.g. float, uint8)
        #[arg(long)]
        dtype: Option<String>,
    },
    /// Convert the pruned graph with the external converter
    Convert {
        /// Pruned graph file
        #[arg(short, long)]
        graph: Option<PathBuf>,
        /// Converted model path
        #[arg(short = 'o', long = "out")]
        out: Option<PathBuf>,
        /// Input tensor shape as NAME=D1,D2,... (repeatable)
        #[arg(long = "input-shape", value_parser = parse_input_shape)]
        input_shapes: Vec<(String, Vec<usize>)>,
        /// Output tensor name (repeatable)
        #[arg(long = "output-tensor")]
        output_tensors: Vec<String>,
    },
    /// Run one input through both models and compare outputs
    Validate {
        /// Source graph file
        #[arg(short, long)]
        graph: Option<PathBuf>,
        /// Converted model file
        #[arg(short, long)]
        model: Option<PathBuf>,
        /// JSON tensor to use as input instead of a generated one
        #[arg(long)]
        input: Option<PathBuf>,
        /// Maximum accepted relative error
        #[arg(long)]
        tolerance: Option<f32>,
        /// Seed for the generated input
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Fetch, prune, convert and validate in one go
    Run {
        /// Start from this graph instead of downloading the archive
        #[arg(short, long)]
        graph: Option<PathBuf>,
    },
    /// Check the Python environment the converter and runtimes need
    Doctor,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write the default configuration to the workspace
    Init,
    /// Print the merged configuration
    Show,
}

/// Parse `NAME=D1,D2,...`. The name may itself contain `:` and `/`.
fn parse_input_shape(value: &str) -> Result<(String, Vec<usize>), String> {
    let (name, dims) = value
        .rsplit_once('=')
        .ok_or_else(|| format!("expected NAME=D1,D2,..., got '{value}'"))?;
    if name.is_empty() {
        return Err(format!("missing tensor name in '{value}'"));
    }
    let dims = dims
        .split(',')
        .map(|d| {
            d.trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid dimension '{d}' in '{value}'"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((name.to_string(), dims))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "graphstrip", "graphstrip")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "graphstrip.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}
