use clap::Parser;
use log::{error, info};
use std::path::Path;

use balise::configuration::config::Config;
use balise::controller::controller_handler::Controller;

#[derive(Parser)]
#[command(name = "balise")]
#[command(version = "0.1.0")]
#[command(about = "Remote command execution control plane with security gating")]
struct Args {
    config_file: String,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();

    info!("importing configuration from {}", args.config_file);
    let config = match Config::from_file(Path::new(args.config_file.as_str())) {
        Ok(config) => config,
        Err(err) => {
            error!("unable to import configuration: {}", err);
            std::process::exit(1);
        }
    };

    let controller = match Controller::new(config).await {
        Ok(controller) => controller,
        Err(err) => {
            error!("unable to assemble the control plane: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = controller.run().await {
        error!("control plane stopped: {}", err);
        std::process::exit(1);
    }
}
