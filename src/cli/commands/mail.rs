//! Mailbox command implementations.

use crate::cli::commands::{format_ts, now_ms, print_json, CommandContext};
use crate::cli::MailCommands;
use crate::error::Result;
use crate::model::{Message, SendMessage};
use crate::storage::mailbox;
use colored::Colorize;
use serde::Serialize;

#[derive(Serialize)]
struct InboxOutput<'a> {
    agent_id: &'a str,
    messages: Vec<Message>,
    count: usize,
}

/// Execute mail commands. The acting agent is the sender or the reader.
///
/// # Errors
///
/// Returns `MessageNotFound` on ack of a message not addressed to the
/// actor, or a database error.
pub fn execute(command: &MailCommands, ctx: &CommandContext<'_>) -> Result<()> {
    let agent = ctx.actor();
    match command {
        MailCommands::Send {
            to,
            subject,
            body,
            mission,
        } => {
            let msg = SendMessage {
                mission_id: mission.clone(),
                from: agent.clone(),
                to: to.clone(),
                subject: subject.clone(),
                body: body.clone(),
            };
            let mut storage = ctx.open()?;
            let sent = storage.mutate("mail_send", &agent, |tx, mctx| {
                mailbox::send(tx, mctx, &msg)
            })?;
            if ctx.json {
                return print_json(&sent);
            }
            if !ctx.quiet {
                println!("Sent {} to {}", sent.id.bold(), sent.to.join(", "));
            }
            Ok(())
        }
        MailCommands::Inbox => {
            let storage = ctx.open()?;
            let messages = mailbox::inbox(storage.conn(), &agent)?;
            if ctx.json {
                let count = messages.len();
                return print_json(&InboxOutput {
                    agent_id: &agent,
                    messages,
                    count,
                });
            }
            if messages.is_empty() {
                println!("Inbox empty.");
            }
            for m in &messages {
                println!(
                    "{} {} from {}: {}",
                    m.id.dimmed(),
                    format_ts(m.sent_at).dimmed(),
                    m.from,
                    m.subject.bold()
                );
                if !m.body.is_empty() {
                    println!("    {}", m.body);
                }
            }
            Ok(())
        }
        MailCommands::Ack { id } => {
            let mut storage = ctx.open()?;
            let now = now_ms();
            let msg = storage.mutate_at("mail_ack", &agent, now, |tx, _mctx| {
                mailbox::ack(tx, &agent, id, now)
            })?;
            if ctx.json {
                return print_json(&msg);
            }
            if !ctx.quiet {
                println!("Acknowledged {}", msg.id);
            }
            Ok(())
        }
    }
}
