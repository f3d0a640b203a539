//! Headless bot: joins a server, wanders randomly and logs what it sees
//! until it dies.

use clap::Parser;
use log::{debug, info, warn};
use rand::Rng;
use shared::{encode, Direction, Event, FrameDecoder, Packet, DEFAULT_PORT};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short, long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
    server: String,

    /// Nickname to play under
    #[arg(short, long, default_value = "bot")]
    nick: String,

    /// Pick a new heading every this many snapshots
    #[arg(short, long, default_value_t = 5)]
    turn_every: u64,
}

const HEADINGS: [Direction; 4] = [Direction::UP, Direction::DOWN, Direction::LEFT, Direction::RIGHT];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut stream = TcpStream::connect(&args.server).await?;
    stream.set_nodelay(true)?;
    info!("Connected to {} as {}", args.server, args.nick);

    stream
        .write_all(&encode(&Packet::Event(Event::Nick(args.nick.clone())))?)
        .await?;

    let mut decoder = FrameDecoder::new();
    let mut buffer = [0u8; 8192];
    let mut snapshots = 0u64;

    loop {
        let n = stream.read(&mut buffer).await?;
        if n == 0 {
            info!("Server closed the connection");
            break;
        }

        for frame in decoder.decode(&buffer[..n]) {
            match frame {
                Ok(Packet::Snapshot(snapshot)) => {
                    snapshots += 1;
                    debug!(
                        "Snapshot {}: {} players, {} entities",
                        snapshots,
                        snapshot.players.len(),
                        snapshot.entities.len()
                    );

                    if snapshots % args.turn_every.max(1) == 0 {
                        let heading = HEADINGS[rand::thread_rng().gen_range(0..HEADINGS.len())];
                        stream.write_all(&encode(&Packet::Event(Event::Dir(heading)))?).await?;
                    }
                }
                Ok(Packet::Event(Event::Dead(score))) => {
                    info!("Died after {} snapshots with score {}", snapshots, score);
                    return Ok(());
                }
                Ok(other) => warn!("Unexpected packet from server: {:?}", other),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => warn!("Dropping frame: {}", e),
            }
        }
    }

    Ok(())
}
