use structopt::StructOpt;

/// Options shared by every subcommand
#[derive(Debug, StructOpt)]
pub struct SharedOptions {
    /// Log level, scopable to different modules
    ///
    /// Levels: trace, debug, info, warn, error
    #[structopt(
        short,
        long,
        global = true,
        default_value = "info",
        env = "RUST_LOG",
        value_name = "level"
    )]
    pub log: String,
}
