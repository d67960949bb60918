//! `bankshot list`

use bankshot_core::protocol::{Command, ListData, Request};
use bankshot_core::{DaemonRpc, Result};

use crate::commands::Context;

pub async fn run(ctx: &Context) -> Result<()> {
    let response = ctx.client().call(Request::bare(Command::List)).await?;
    let list: ListData = response.typed_data()?;

    if list.forwards.is_empty() {
        ctx.say("No active forwards");
        return Ok(());
    }

    ctx.say(format!("{} active forward(s):", list.forwards.len()));
    for forward in &list.forwards {
        ctx.say(format!(
            "  [{}] {}:{} -> localhost:{} (since {})",
            forward.connection,
            forward.host,
            forward.remote_port,
            forward.local_port,
            forward.created_at,
        ));
    }
    Ok(())
}
