//! Modbus Node Demo
//!
//! Runs a server and a client in one process and walks through every
//! supported function code:
//! - Register and coil reads/writes with function code naming (read_03, write_06, etc.)
//! - An exception response for an out-of-range read
//! - Several requests in flight at once on the client engine
//!
//! Usage: cargo run --bin demo [bind_address]
//! Example: cargo run --bin demo 127.0.0.1:1502

use std::error::Error;
use std::net::SocketAddr;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use modbus_node::{
    ClientConfig, ClientEvent, ModbusError, ServerConfig, TableLayout, TcpClient, TcpServer,
    WordSpace,
};

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging();

    let bind_address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1502".to_string())
        .parse::<SocketAddr>()?;

    println!("{}", modbus_node::info());
    println!("=============================\n");

    // =========================================================================
    // Part 1: Server
    // =========================================================================
    let server_config = ServerConfig::new()
        .with_bind_address(bind_address)
        .with_layout(TableLayout::uniform(64));
    let server = TcpServer::bind(&server_config).await?.spawn()?;

    {
        let mut table = server
            .table()
            .write()
            .map_err(|_| "register table lock poisoned")?;
        table.set_registers(WordSpace::InputRegisters, 0, &[230, 231, 229, 50])?;
    }
    println!("Server listening on {}", server.local_addr());

    // =========================================================================
    // Part 2: Function-code API
    // =========================================================================
    let client_config = ClientConfig::new().with_server_address(server.local_addr());
    let mut client = TcpClient::connect(&client_config).await?;

    let setpoints: Vec<u16> = (0x30..=0x39).collect();
    client.write_10(0, &setpoints).await?;
    println!("FC10 wrote {} holding registers", setpoints.len());

    client.write_06(20, 0x1234).await?;
    println!("FC06 wrote 0x1234 to register 20");

    let registers = client.read_03(0, 10).await?;
    println!("FC03 holding registers 0-9: {:04X?}", registers);

    let inputs = client.read_04(0, 4).await?;
    println!("FC04 input registers 0-3: {:?}", inputs);

    client
        .write_0f(0, &[true, false, true, false, true, false, true, false])
        .await?;
    client.write_05(9, true).await?;
    let coils = client.read_01(0, 10).await?;
    println!("FC01 coils 0-9: {:?}", coils);

    let discrete = client.read_02(0, 8).await?;
    println!("FC02 discrete inputs 0-7: {:?}", discrete);

    // =========================================================================
    // Part 3: Exception response
    // =========================================================================
    match client.read_03(60, 10).await {
        Err(ModbusError::Exception { function, code }) => {
            println!("FC03 beyond the table -> exception 0x{:02X}: {}", function, code)
        }
        other => println!("Unexpected result: {:?}", other),
    }

    // =========================================================================
    // Part 4: Pipelined requests
    // =========================================================================
    let engine = client.engine_mut();
    let first = engine.read_holding_registers(0, 5)?;
    let second = engine.read_input_registers(0, 2)?;
    let third = engine.read_coils(0, 3)?;
    println!("Queued transactions {:04X}, {:04X}, {:04X}", first, second, third);

    for tid in [first, second, third] {
        match client.execute(tid).await? {
            ClientEvent::ReadApplied {
                function, start, count, ..
            } => println!("  {:04X}: {} [{}..{}) applied", tid, function, start, start + count),
            event => println!("  {:04X}: {:?}", tid, event),
        }
    }

    let stats = client.get_stats();
    println!(
        "\nClient stats: {} requests, {} responses, {} errors",
        stats.requests_sent, stats.responses_received, stats.errors
    );

    client.close().await?;
    server.stop().await?;
    Ok(())
}
