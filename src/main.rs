#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::process::ExitCode;

use clap::Parser;

use radius_proxy::config::{Cli, Config, LogLevel};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&cli.config) {
        Ok(it) => it,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    if cli.pretend {
        return match config.build() {
            Ok(_) => {
                println!("configuration ok");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{e:#}");
                ExitCode::FAILURE
            }
        };
    }

    let level = cli
        .debug
        .map(LogLevel::from_debug)
        .unwrap_or(config.log.level)
        .as_filter();
    let file = match cli.foreground {
        true => None,
        false => config.log.file.clone(),
    };

    if let Err(e) = radius_proxy::logger::init(level, file.as_deref()) {
        eprintln!("unable to set up logging: {e:#}");
        return ExitCode::FAILURE;
    }

    if let Some(path) = cli.pid_file.as_ref().or(config.pid_file.as_ref()) {
        if let Err(e) = std::fs::write(path, format!("{}\n", std::process::id())) {
            log::error!("unable to write the pid file: {}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    }

    match radius_proxy::startup(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
