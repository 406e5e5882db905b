use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use rtc_helper::config;

/// Which side of the loopback starts the negotiation
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Pusher offers, puller answers
    PushStart,
    /// Puller offers, pusher answers
    PullStart,
}

#[derive(Parser, Debug)]
#[command(name = "rtc-helper")]
#[command(author = "Selkies Team")]
#[command(version)]
#[command(about = "WebRTC push/pull session loopback", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/rtc-helper.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Loopback negotiation to run
    #[arg(short, long, value_enum, default_value_t = Mode::PushStart)]
    pub mode: Mode,

    /// Seconds to stream before releasing the sessions
    #[arg(short, long, default_value = "10")]
    pub duration: u64,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }
}
