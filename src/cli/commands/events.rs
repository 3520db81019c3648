//! Event log and cursor command implementations.

use crate::cli::commands::{format_ts, now_ms, print_json, CommandContext};
use crate::cli::{CursorCommands, EventCommands};
use crate::error::{Error, Result};
use crate::storage::events::{Event, NewEvent};
use colored::Colorize;
use serde::Serialize;

#[derive(Serialize)]
struct AppendOutput<'a> {
    stream_type: &'a str,
    stream_id: &'a str,
    positions: Vec<i64>,
}

#[derive(Serialize)]
struct EventListOutput {
    events: Vec<Event>,
    count: usize,
}

#[derive(Serialize)]
struct CursorOutput<'a> {
    consumer_id: &'a str,
    stream_id: &'a str,
    position: i64,
}

/// Execute event commands.
///
/// # Errors
///
/// Returns an error if the payload is not JSON or the operation fails.
pub fn execute(command: &EventCommands, ctx: &CommandContext<'_>) -> Result<()> {
    match command {
        EventCommands::Append {
            stream_type,
            stream_id,
            event_type,
            data,
            expect_head,
        } => {
            let data: serde_json::Value = serde_json::from_str(data)
                .map_err(|e| Error::InvalidArgument(format!("--data is not valid JSON: {e}")))?;
            let batch = [NewEvent::new(event_type.as_str(), data)];
            let mut storage = ctx.open()?;
            let positions = match expect_head {
                Some(head) => {
                    storage.append_expecting(stream_type, stream_id, *head, &batch, now_ms())?
                }
                None => storage.append(stream_type, stream_id, &batch, now_ms())?,
            };

            if ctx.json {
                return print_json(&AppendOutput {
                    stream_type,
                    stream_id,
                    positions,
                });
            }
            if !ctx.quiet {
                let pos = positions.first().copied().unwrap_or_default();
                println!("Appended {event_type} to {stream_type}/{stream_id} at position {pos}");
            }
            Ok(())
        }
        EventCommands::List {
            stream_type,
            stream_id,
            from,
        } => {
            let storage = ctx.open()?;
            let events = storage.query_by_stream(stream_type, stream_id, *from)?;

            if ctx.json {
                let count = events.len();
                return print_json(&EventListOutput { events, count });
            }
            if events.is_empty() {
                println!("No events.");
            }
            for e in &events {
                println!(
                    "{:>5} {} {} {}",
                    e.position,
                    format_ts(e.occurred_at).dimmed(),
                    e.event_type.bold(),
                    e.data
                );
            }
            Ok(())
        }
    }
}

/// Execute cursor commands.
///
/// # Errors
///
/// Returns `CursorOutOfRange` past the stream head, or a database error.
pub fn execute_cursor(command: &CursorCommands, ctx: &CommandContext<'_>) -> Result<()> {
    let (consumer, stream, position) = match command {
        CursorCommands::Advance {
            consumer,
            stream,
            position,
        } => {
            let mut storage = ctx.open()?;
            let cursor = storage.cursor_advance(consumer, stream, *position, now_ms())?;
            (consumer, stream, cursor.position)
        }
        CursorCommands::Get { consumer, stream } => {
            let storage = ctx.open()?;
            (consumer, stream, storage.cursor_get(consumer, stream)?)
        }
    };

    if ctx.json {
        return print_json(&CursorOutput {
            consumer_id: consumer,
            stream_id: stream,
            position,
        });
    }
    if !ctx.quiet {
        println!("{consumer} @ {stream}: {position}");
    }
    Ok(())
}
