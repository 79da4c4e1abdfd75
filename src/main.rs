use anyhow::Result;
use pulsar_resolver::cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse cli and handle clap errors
    let options = cli::parse_from_args();

    // Override the default log_level if there is a greater verbosity flag
    pulsar_resolver::init_logger(options.override_log_level());

    match pulsar_resolver::run(&options).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            cli::report_error(&e);
            std::process::exit(1);
        }
    }
}
