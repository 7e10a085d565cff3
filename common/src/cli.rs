use clap::{Args, ValueEnum, ArgAction};

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn filter_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Args)]
#[clap(name = "dsp-mu", version, disable_help_flag = true, disable_version_flag = true)]
#[clap(next_help_heading = "Global Options")]
pub struct GlobalOpts {
    /// Overrides RUST_LOG
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    /// Run everything through the interpreter
    #[arg(long, global = true)]
    pub interpreter: bool,

    #[arg(long, short, action = ArgAction::Help)]
    help: (),

    #[arg(long, short('V'), action = ArgAction::Version)]
    version: (),
}
