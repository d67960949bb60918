//! `bankshot forward <remote-port> [local-port]`

use bankshot_core::protocol::{Command, ForwardPayload, Request};
use bankshot_core::Result;

use crate::commands::{default_connection, Context};

pub async fn run(
    ctx: &Context,
    remote_port: u16,
    local_port: Option<u16>,
    connection: Option<String>,
    host: String,
) -> Result<()> {
    let connection = match connection {
        Some(c) => c,
        None => default_connection()?,
    };

    let request = Request::new(
        Command::Forward,
        &ForwardPayload {
            remote_port,
            local_port,
            host: Some(host.clone()),
            connection: connection.clone(),
            socket_path: None,
        },
    )?;
    ctx.client().call_ok(request).await?;

    ctx.say(format!(
        "Forwarded {}:{} to localhost:{} ({})",
        host,
        remote_port,
        local_port.unwrap_or(remote_port),
        connection,
    ));
    Ok(())
}
