//! `fleet serve`: run the REST API in the foreground.

use crate::cli::commands::CommandContext;
use crate::error::Result;
use crate::server;

/// Open the database once (migrations, legacy import), then serve on `bind`.
///
/// # Errors
///
/// Returns `NotInitialized`, or an I/O error if the runtime cannot start or
/// the address cannot be bound.
pub fn execute(ctx: &CommandContext<'_>, bind: &str) -> Result<()> {
    let db_path = ctx.db_path()?;
    drop(ctx.open()?);

    if !ctx.quiet {
        eprintln!("Serving {} on http://{bind}", db_path.display());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(server::serve(db_path, bind))
}
