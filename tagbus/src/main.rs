use std::path::Path;

use tagbus::bus::BusServer;
use tagbus::config::Settings;
use tagbus::logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging(None);

    let settings = match std::env::args().nth(1) {
        Some(path) => match Settings::load(Path::new(&path)) {
            Ok(settings) => settings,
            Err(error) => {
                eprintln!("FATAL: failed to load configuration from {}: {}", path, error);
                std::process::exit(1);
            }
        },
        // The server itself needs no tag declarations; defaults bind
        // the loopback bus port.
        None => Settings::default(),
    };

    let addr = settings.bus.socket_addr()?;
    let server = BusServer::bind(addr, settings.bus.tus).await?;
    server.serve().await?;

    Ok(())
}
