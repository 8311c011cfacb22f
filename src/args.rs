use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to accept the debug client on.
    #[clap(long, default_value = "127.0.0.1:2077")]
    pub listen: String,

    /// Address of the game's Papyrus debug server.
    #[clap(long, default_value = "127.0.0.1:20548")]
    pub remote: String,

    /// Project root containing the workspace's .psc sources.
    #[clap(long, env = "PAPYRUS_WORKSPACE")]
    pub workspace: PathBuf,

    /// Optional root with the base-game scripts, probed after the workspace.
    #[clap(long)]
    pub base_scripts: Option<PathBuf>,

    /// Exit after the first debug session ends (single-client mode).
    #[clap(long)]
    pub oneshot: bool,

    /// Optional log file for proxy diagnostics (no output to stdout).
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Trace DAP traffic on both connections into the log file.
    /// Requires --log-file.
    #[clap(long)]
    pub trace_dap: bool,
}
