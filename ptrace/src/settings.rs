//! Command-line surface. One positional argument: a script path, or (with `-c`) inline text.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "ptrace", about = "A dynamic kernel tracer")]
pub struct Settings {
    /// Limit trace_printk output to ASCII.
    #[arg(short = 'A', long = "ascii")]
    pub ascii: bool,

    /// Treat PROGRAM as inline program text rather than a file path.
    #[arg(short = 'c', long = "command")]
    pub command: bool,

    /// Verbose compilation/attachment logging.
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Print the disassembly of every compiled probe and exit without attaching.
    #[arg(short = 'D', long = "dump")]
    pub dump: bool,

    /// Run for a bounded duration, in seconds, then detach and exit.
    #[arg(short = 't', long = "timeout")]
    pub timeout: Option<u64>,

    /// A script file path, or (with `-c`) inline program text.
    pub program: String,
}

impl Settings {
    pub fn parse_args() -> Self {
        Settings::parse()
    }
}
