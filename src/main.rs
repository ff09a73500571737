use clap::Parser;
use log::{error, info};
use tollgate::configuration::config::{CliArgs, Config};
use tollgate::controller::controller_handler::Controller;

#[tokio::main]
async fn main() {
    // RUST_LOG still wins over the default level
    // https://docs.rs/env_logger/latest/env_logger/
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .init();

    println!(
        "
==============================================================================
   tollgate v{} - admission-controlled TCP ingestion endpoint
==============================================================================
",
        env!("CARGO_PKG_VERSION")
    );

    info!("Importing configuration");

    let args = CliArgs::parse();

    let config = Config::load(&args).unwrap_or_else(|e| {
        error!("Unable to import configuration: {}", e);
        std::process::exit(1);
    });

    info!(
        "Configuration imported: {}:{}, max {} connection(s), log {}",
        config.bind_address,
        config.port,
        config.max_connections,
        config.log_file.display()
    );

    let mut controller = Controller::new(config).await.unwrap_or_else(|e| {
        error!("Unable to create a controller instance: {}, exiting...", e);
        std::process::exit(1);
    });

    if let Err(e) = controller.run().await {
        error!("Error occured in the controller process: {}, exiting...", e);
        std::process::exit(1);
    }

    info!(
        "Exiting, {} byte(s) received in total",
        controller.total_bytes()
    );
}
