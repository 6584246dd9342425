use anyhow::Result;
use structopt::StructOpt;

use envgrid::{server, SharedOptions};

#[derive(Debug, StructOpt)]
#[structopt(about = "On-demand, self-expiring preview environments for Kubernetes.")]
struct MainOptions {
    #[structopt(flatten)]
    shared_options: SharedOptions,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Run the environment orchestration server
    Server(server::Options),
}

#[tokio::main]
async fn main() -> Result<()> {
    let main_options = MainOptions::from_args();
    let shared_options = main_options.shared_options;

    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&shared_options.log)
        .init();

    match main_options.cmd {
        Command::Server(options) => server::run(options).await,
    }
}
