//! Fleet CLI entry point.

use clap::Parser;
use fleet::cli::commands::{self, CommandContext};
use fleet::cli::{Cli, Commands};
use fleet::error::Error;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    // Set up tracing based on verbosity
    init_tracing(cli.verbose, cli.quiet);

    // Resolve effective JSON mode: --json OR non-TTY stdout
    let json = cli.json || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    let ctx = CommandContext {
        db: cli.db.as_deref(),
        actor: cli.actor.as_deref(),
        json,
        quiet: cli.quiet,
    };

    match run(&cli, &ctx) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                eprintln!("{}", e.to_structured_json());
            } else if let Some(hint) = e.hint() {
                eprintln!("Error: {e}\n  Hint: {hint}");
            } else {
                eprintln!("Error: {e}");
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // Honor RUST_LOG if set, otherwise use verbosity flag
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,rusqlite=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn run(cli: &Cli, ctx: &CommandContext<'_>) -> Result<(), Error> {
    match &cli.command {
        Commands::Init { force } => commands::init::execute(ctx, *force),
        Commands::Version => commands::version::execute(ctx),

        // Missions and sorties
        Commands::Mission { command } => commands::mission::execute(command, ctx),
        Commands::Sortie { command } => commands::mission::execute_sortie(command, ctx),

        // Event log
        Commands::Events { command } => commands::events::execute(command, ctx),
        Commands::Cursor { command } => commands::events::execute_cursor(command, ctx),

        // Coordination
        Commands::Lock { command } => commands::lock::execute(command, ctx),
        Commands::Mail { command } => commands::mail::execute(command, ctx),

        // Checkpoints and recovery
        Commands::Checkpoint(args) => commands::checkpoint::execute_create(args, ctx),
        Commands::Checkpoints { command } => commands::checkpoint::execute(command, ctx),
        Commands::Resume(args) => commands::checkpoint::execute_resume(args, ctx),
        Commands::Recover { command } => commands::recover::execute(command, ctx),

        // Dispatch
        Commands::Agent { command } => commands::agent::execute(command, ctx),
        Commands::Dispatch(args) => commands::dispatch::execute(args, ctx),

        Commands::Completions { shell } => commands::completions::execute(shell),

        #[cfg(feature = "server")]
        Commands::Serve { bind } => commands::serve::execute(ctx, bind),
    }
}
