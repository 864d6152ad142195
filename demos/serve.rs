//! Standalone Server Example
//!
//! Serves a register table over Modbus TCP until Ctrl-C. Input registers
//! count up once per second so a client has something changing to read.
//!
//! # Running this example
//!
//! ```bash
//! RUST_LOG=debug cargo run --example serve -- 0.0.0.0:1502
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use modbus_node::{ModbusResult, ServerConfig, TcpServer, WordSpace};

#[tokio::main]
async fn main() -> ModbusResult<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = ServerConfig::new().with_unit_id(1);
    if let Some(arg) = std::env::args().nth(1) {
        match arg.parse::<SocketAddr>() {
            Ok(address) => config = config.with_bind_address(address),
            Err(e) => warn!("Ignoring bind address {:?}: {}", arg, e),
        }
    }

    let server = TcpServer::bind(&config).await?.spawn()?;
    let table = server.table().clone();

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut counter: u16 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                counter = counter.wrapping_add(1);
                match table.write() {
                    Ok(mut table) => table.set_register(WordSpace::InputRegisters, 0, counter)?,
                    Err(_) => warn!("Register table lock poisoned"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
        }
    }

    server.stop().await
}
