mod board;
mod sim;

use anyhow::{Context, Result};
use std::env;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use board::{Board, BANNER};
use sim::{Calibration, ClimateSim, Scenario, SoilSim};

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let addr = env::var("SIM_ADDR").unwrap_or_else(|_| "127.0.0.1:7878".to_string());
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let speed: f64 = env_parse("SIM_SPEED", 1.0);
    let stock = Calibration::default();
    let calibration = Calibration {
        raw_dry: env_parse("SIM_RAW_DRY", stock.raw_dry),
        raw_wet: env_parse("SIM_RAW_WET", stock.raw_wet),
    };

    let mut board = Board::new(
        ClimateSim::new(scenario),
        SoilSim::new(scenario, 4, calibration),
        calibration,
        speed,
    );

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, %scenario, speed, "board simulator listening");

    // Like the real serial port, the board has one owner at a time: a new
    // connection is only accepted once the previous one closes.
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "hub connected");
        match serve(stream, &mut board).await {
            Ok(()) => info!(%peer, "hub disconnected"),
            Err(e) => warn!(%peer, "connection error: {e:#}"),
        }
    }
}

async fn serve(stream: TcpStream, board: &mut Board) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    writer.write_all(format!("{BANNER}\n").as_bytes()).await?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = board.handle_line(line);
        tracing::debug!(request = line, %reply, "handled");
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}
