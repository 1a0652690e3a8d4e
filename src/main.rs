use clap::Parser;

use layerforge::cli::{self, CliArgs};
use layerforge::config::EngineSettings;
use layerforge::logger;

fn main() -> std::process::ExitCode {
    let args = CliArgs::parse();

    // --verbose logs to stderr at debug level; otherwise the session log
    // file takes the configured level.
    let level = if args.verbose {
        "debug".to_string()
    } else {
        EngineSettings::load().log_level
    };
    logger::init(&level, args.verbose);

    cli::run(args)
}
