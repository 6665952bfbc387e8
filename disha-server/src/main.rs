//! Disha relay server daemon.

use clap::Parser;
use disha_server::config::ServerConfig;
use disha_server::runtime::ServerRuntime;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const USAGE: &str = "Usage: disha-server -s <storage directory> [-p <port number>]";

#[derive(Parser)]
#[command(name = "disha-server", disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    /// Storage directory for device markers and tracking logs
    #[arg(short = 's', value_name = "DIR")]
    storage: PathBuf,

    /// Listen port for TCP and UDP
    #[arg(short = 'p', value_name = "PORT")]
    port: Option<u16>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(_) => {
            println!("{}", USAGE);
            std::process::exit(1);
        }
    };

    if !cli.storage.exists() {
        println!("'{}' does not exist", cli.storage.display());
        std::process::exit(1);
    }
    if !cli.storage.is_dir() {
        println!("'{}' is not a directory", cli.storage.display());
        std::process::exit(1);
    }

    let mut config = ServerConfig::new(cli.storage);
    if let Some(port) = cli.port {
        config.port = port;
    }

    log::info!("disha-server starting at port {}", config.port);
    let runtime = match ServerRuntime::start(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("received shutdown signal");
        r.store(false, Ordering::Relaxed);
    }) {
        log::warn!("failed to set signal handler: {}", e);
    }

    while running.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    runtime.stop();
    log::info!("done");
}
