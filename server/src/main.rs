use clap::Parser;
use log::{error, info};
use server::config::SessionConfig;
use server::network::Server;
use shared::DEFAULT_PORT;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Name reported to clients in every snapshot
    #[arg(short, long, default_value = "SnekBox")]
    name: String,

    /// Game version reported to clients in every snapshot
    #[arg(short = 'g', long, default_value_t = 0)]
    game_version: u32,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value_t = 15)]
    tick_rate: u32,

    /// Play field width in cells, walls included
    #[arg(long, default_value_t = 128)]
    width: i32,

    /// Play field height in cells, walls included
    #[arg(long, default_value_t = 32)]
    height: i32,

    /// Players per session before a new one is opened
    #[arg(short, long, default_value_t = 5)]
    max_players: usize,
}

impl Args {
    fn session_config(self) -> SessionConfig {
        SessionConfig {
            name: self.name,
            version: self.game_version,
            tick_rate: self.tick_rate,
            width: self.width,
            height: self.height,
            max_players: self.max_players,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Tip: Set RUST_LOG=info to see server logs");
    }

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);
    let config = args.session_config();

    let mut server = match Server::bind(&address, config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {}", e);
            return Err(e.into());
        }
    };

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            shutdown.shutdown();
        }
    });

    server.run().await?;
    info!("Server stopped");
    Ok(())
}
