use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "wess", about = "Weighted-ensemble simulation driver")]
pub struct Cli {
    /// Path to a TOML config file; defaults < this file < environment < flags.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the archive-owning master: dispatch fabric + simulation loop.
    Master {
        #[arg(long, short = 'H')]
        host: Option<IpAddr>,
        #[arg(long)]
        announce_port: Option<u16>,
        #[arg(long)]
        task_port: Option<u16>,
        #[arg(long)]
        archive: Option<PathBuf>,
        #[arg(long)]
        iterations: u32,
        #[arg(long)]
        blocksize: Option<usize>,
    },
    /// Connects to a running master and propagates the work it hands out.
    Worker {
        #[arg(long, short = 'H')]
        host: Option<IpAddr>,
        #[arg(long)]
        announce_port: Option<u16>,
        #[arg(long)]
        task_port: Option<u16>,
        #[arg(long, short = 'n')]
        workers: Option<usize>,
    },
    /// Single-process in-memory demo/test driver: no network, no separate workers.
    Run {
        #[arg(long)]
        iterations: u32,
        #[arg(long)]
        archive: Option<PathBuf>,
        #[arg(long)]
        blocksize: Option<usize>,
    },
}
