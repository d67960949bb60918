//! `bankshot status`

use bankshot_core::protocol::{Command, Request, StatusData};
use bankshot_core::{DaemonRpc, Result};

use crate::commands::Context;

pub async fn run(ctx: &Context) -> Result<()> {
    let response = ctx.client().call(Request::bare(Command::Status)).await?;
    let status: StatusData = response.typed_data()?;

    ctx.say(format!("Daemon version:  {}", status.version));
    ctx.say(format!("Uptime:          {}", status.uptime));
    ctx.say(format!("Active forwards: {}", status.active_forwards));

    if !status.connections.is_empty() {
        ctx.say("Connections:");
        for connection in &status.connections {
            ctx.say(format!(
                "  {} ({} forward(s), last activity {})",
                connection.connection, connection.forward_count, connection.last_activity,
            ));
        }
    }
    Ok(())
}
