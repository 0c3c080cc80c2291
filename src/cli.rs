use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "nlgate",
    about = "Natural-language query gateway over schema.org content in vector stores"
)]
pub struct Cli {
    /// Directory holding llm.yaml, retrieval.yaml, nlgate.yaml, tools.xml
    /// and friends.
    #[arg(long, default_value = "config", global = true)]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the HTTP gateway (the default).
    Serve {
        /// Listen address override, e.g. 127.0.0.1:8080.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Load and validate the configuration, then exit.
    CheckConfig,
    /// Probe the LLM, embedding provider and every enabled retrieval
    /// endpoint, then exit non-zero if anything failed.
    CheckConnectivity,
}
