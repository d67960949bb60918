//! `bankshot watch`

use std::time::Duration;

use bankshot_core::protocol::{Command, ListData, Request, StatusData};
use bankshot_core::{DaemonRpc, Result};

use crate::commands::Context;

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

pub async fn run(ctx: &Context, interval: u64) -> Result<()> {
    let client = ctx.client();
    let interval = Duration::from_secs(interval.max(1));

    loop {
        print!("{}", CLEAR_SCREEN);
        println!("bankshot watch - {}", chrono::Local::now().format("%H:%M:%S"));
        println!("========================================");

        match client.call(Request::bare(Command::Status)).await {
            Ok(response) if response.ok => {
                if let Ok(status) = response.typed_data::<StatusData>() {
                    println!(
                        "Uptime: {} | Active forwards: {}",
                        status.uptime, status.active_forwards
                    );
                    if !status.connections.is_empty() {
                        println!("\nConnections:");
                        for connection in &status.connections {
                            println!(
                                "  * {}: {} forward(s)",
                                connection.connection, connection.forward_count
                            );
                        }
                    }
                }
            }
            Ok(response) => {
                println!("daemon error: {}", response.error.unwrap_or_default());
            }
            Err(e) => {
                println!("daemon unreachable: {}", e);
            }
        }

        if let Ok(response) = client.call(Request::bare(Command::List)).await {
            if let Ok(list) = response.typed_data::<ListData>() {
                if !list.forwards.is_empty() {
                    println!("\nForwards:");
                    for forward in &list.forwards {
                        println!(
                            "  * [{}] {}:{} -> localhost:{}",
                            forward.connection,
                            forward.host,
                            forward.remote_port,
                            forward.local_port
                        );
                    }
                }
            }
        }

        println!("\nPress Ctrl+C to exit");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
