//! `bankshot unforward <remote-port>`

use bankshot_core::protocol::{Command, Request, UnforwardPayload};
use bankshot_core::Result;

use crate::commands::{default_connection, Context};

pub async fn run(
    ctx: &Context,
    remote_port: u16,
    connection: Option<String>,
    host: String,
) -> Result<()> {
    let connection = match connection {
        Some(c) => c,
        None => default_connection()?,
    };

    let request = Request::new(
        Command::Unforward,
        &UnforwardPayload {
            remote_port,
            host: Some(host.clone()),
            connection,
        },
    )?;
    ctx.client().call_ok(request).await?;

    ctx.say(format!("Removed forward for {}:{}", host, remote_port));
    Ok(())
}
