//! `bankshot config show`

use bankshot_core::{Error, Result};

use crate::commands::Context;

pub fn run(ctx: &Context) -> Result<()> {
    let rendered = toml::to_string_pretty(&ctx.config).map_err(|e| Error::Internal {
        message: format!("failed to render config: {}", e),
    })?;
    print!("{}", rendered);
    Ok(())
}
