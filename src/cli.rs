use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "bsl-engine",
    version,
    about = "Real-time biosignal stream engine",
    long_about = "Replay recorded streams through the acquisition engine and cut\n\
                  event-locked epochs, or check an engine configuration file."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Stream a recording through the engine and print epochs as JSON
    Replay(ReplayArgs),
    /// Validate a configuration file and print the effective configuration
    CheckConfig(CheckConfigArgs),
}

#[derive(Args)]
pub struct ReplayArgs {
    /// NDJSON recording (layout line first, then chunks)
    #[arg(long)]
    pub file: String,

    /// Software-trigger event file; marker times are on the recording clock
    #[arg(long)]
    pub markers: Option<String>,

    /// Only cut epochs around markers with this code
    #[arg(long)]
    pub code: Option<u32>,

    /// Additional anchors on the recording clock, in seconds
    #[arg(long, num_args = 1..)]
    pub at: Vec<f64>,

    /// Seconds before each anchor
    #[arg(long, default_value_t = 0.2)]
    pub pre: f64,

    /// Seconds after each anchor
    #[arg(long, default_value_t = 0.8)]
    pub post: f64,

    /// Release samples at their recorded pace
    #[arg(long, default_value_t = false)]
    pub realtime: bool,

    /// Seconds to wait for each epoch to be recorded
    #[arg(long, default_value_t = 10.0)]
    pub wait: f64,

    /// Engine configuration file (JSON)
    #[arg(long, env = "BSL_CONFIG")]
    pub config: Option<String>,

    /// Output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,
}

#[derive(Args)]
pub struct CheckConfigArgs {
    /// Engine configuration file (JSON); defaults are checked when omitted
    #[arg(long, env = "BSL_CONFIG")]
    pub config: Option<String>,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}
