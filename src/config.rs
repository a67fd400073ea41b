//! Runtime configuration, derived once from the command line.
//!
//! Deliberately not persisted to disk: spec.md's non-goals rule out policy
//! surviving a daemon restart, and there is nothing else here worth saving.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "tcmmd")]
#[command(version)]
#[command(about = "Adaptive ingress bandwidth shaping for a media stream", long_about = None)]
pub struct Config {
    /// Primary Ethernet interface to shape; auto-detected when omitted.
    #[arg(short = 'i', long = "interface", value_name = "IFACE")]
    pub interface: Option<String>,

    /// Append qdisc byte counters to FILE once a second.
    #[arg(short = 's', long = "save-stats", value_name = "FILE")]
    pub save_stats: Option<PathBuf>,
}
