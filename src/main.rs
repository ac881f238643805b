use std::process::ExitCode;

use clap::{crate_authors, crate_version};
use tracing::{error, info};

use sinkhole::config::Config;
use sinkhole::engine::Engine;
use sinkhole::store::Store;
use sinkhole::units;

fn main() -> ExitCode {
    // Settle on one TLS crypto provider for the process; reqwest and
    // tokio-rustls would otherwise each bring their own.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    // Initialize the logger in fallback mode.
    let logger = match sinkhole::log::Logger::launch(&Default::default()) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("The logger couldn't be set up: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Set up the command-line interface.
    let cmd = clap::Command::new("sinkholed")
        .version(crate_version!())
        .author(crate_authors!())
        .next_line_help(true)
        .arg(
            clap::Arg::new("check_config")
                .long("check-config")
                .action(clap::ArgAction::SetTrue)
                .help("Check the configuration and exit"),
        );
    let cmd = Config::setup_cli(cmd);

    // Process command-line arguments.
    let matches = cmd.get_matches();

    // Construct the configuration.
    let mut config = match Config::init(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("The resolver couldn't be configured: {e}");
            return ExitCode::FAILURE;
        }
    };

    if matches.get_flag("check_config") {
        match config.init_from_file() {
            Ok(()) => return ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("The resolver couldn't be configured: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    if let Err(e) = config.init_from_file() {
        error!("The resolver couldn't be configured: {e}");
        return ExitCode::FAILURE;
    }

    // Activate the configured logging setup.
    if let Err(e) = logger.apply(&config.daemon.logging) {
        error!("Could not apply logging configuration: {e}");
        return ExitCode::FAILURE;
    }

    // Open the persistent store.
    let store = match Store::open(config.daemon.store_file.clone()) {
        Ok(store) => store,
        Err(e) => {
            error!(
                "Could not open the store '{}': {e}",
                config.daemon.store_file
            );
            return ExitCode::FAILURE;
        }
    };

    // Set up an async runtime.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Couldn't start Tokio: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Enter the runtime.
    runtime.block_on(async {
        let engine = Engine::new(config, store);

        // Spawn the listeners and background maintenance.
        let handles = units::spawn(&engine);
        engine.spawn_maintenance();

        // The first blocklist build runs in the background so startup
        // isn't gated on feed downloads.
        {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.refresh_blocklist().await;
            });
        }

        info!("sinkholed {} running", crate_version!());

        // Watch for CTRL-C (SIGINT).
        let result = match tokio::signal::ctrl_c().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Listening for CTRL-C (SIGINT) failed: {e}");
                ExitCode::FAILURE
            }
        };

        // Shut down: stop the listeners, persist the cache and the store.
        for handle in handles {
            handle.abort();
        }
        engine.persist_cache();

        result
    })
}
