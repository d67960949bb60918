//! `bankshot reconcile` — one-shot remote-side reconciliation.

use bankshot_core::Result;
use bankshot_monitor::reconcile;

use crate::commands::{default_connection, Context};

pub async fn run(ctx: &Context, connection: Option<String>) -> Result<()> {
    let session_id = match connection {
        Some(c) => c,
        None => default_connection()?,
    };

    let client = ctx.client();
    let policy = ctx.config.monitor.policy();
    let outcome = reconcile::run(&client, &session_id, &policy).await?;

    ctx.say(format!(
        "Reconciled: {} forwarded, {} removed, {} failed",
        outcome.forwarded.len(),
        outcome.unforwarded.len(),
        outcome.failures,
    ));
    Ok(())
}
