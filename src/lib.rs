pub mod cli;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod pairing;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::ChatConfig;
pub use error::{Error, Result};
pub use pairing::{ChatClient, ChatCommand, ChatHandle, ChatStatus, ChatView};

use clap::Parser;
use tracing::error;

pub fn run() {
    logger::init();
    let cli = cli::Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(cli::run(cli)) {
        error!(class = e.class(), "{e}");
        std::process::exit(if e.is_fatal() { 2 } else { 1 });
    }
}
