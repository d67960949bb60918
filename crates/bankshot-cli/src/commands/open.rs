//! `bankshot open <url>`

use bankshot_core::protocol::{Command, OpenPayload, Request};
use bankshot_core::Result;

use crate::commands::Context;

pub async fn run(ctx: &Context, url: &str) -> Result<()> {
    let request = Request::new(Command::Open, &OpenPayload { url: url.into() })?;
    ctx.client().call_ok(request).await?;
    ctx.say(format!("Opened {}", url));
    Ok(())
}
