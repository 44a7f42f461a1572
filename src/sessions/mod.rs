//! Sessions: conversation rows, the append-only message log, the processing
//! lock token pair, and the coordination audit trail.

pub mod sqlite;
pub mod traits;

pub use sqlite::SqliteStore;
pub use traits::{
    Appended, AuditEntry, AuditLog, InboundRecord, LockAttempt, Message, MessageKind, MessageLog,
    Sender, Session, SessionId, SessionStatus, SessionStore, Store,
};

use crate::config::StorageConfig;
use anyhow::Result;
use std::sync::Arc;

/// Open the configured persistent store.
pub fn create_store(config: &StorageConfig) -> Result<Arc<dyn Store>> {
    let store = SqliteStore::open(&config.db_path)?;
    tracing::info!(backend = store.name(), path = %config.db_path.display(), "Store ready");
    Ok(Arc::new(store))
}

fn preview(content: &str) -> String {
    let line = content.lines().next().unwrap_or(content);
    if line.chars().count() <= 80 {
        line.to_string()
    } else {
        let truncated: String = line.chars().take(77).collect();
        format!("{truncated}...")
    }
}

fn print_session_line(session: &Session) {
    println!(
        "- {} client={} status={} ai={} updated={}",
        session.id,
        session.client_id,
        session.status.as_str(),
        if session.ai_enabled { "on" } else { "off" },
        session.updated_at.format("%Y-%m-%d %H:%M:%S"),
    );
}

/// Run a `session` CLI subcommand directly against the configured store.
pub async fn handle_command(
    command: crate::SessionCommands,
    config: &crate::config::Config,
) -> Result<()> {
    let store = create_store(&config.storage)?;
    match command {
        crate::SessionCommands::Start { client_id } => {
            if let Some(session) = store.find_active_session(&client_id).await? {
                println!("Client already has an active session:");
                print_session_line(&session);
                return Ok(());
            }
            let session = store.create_session(&client_id).await?;
            println!("Started session:");
            print_session_line(&session);
        }
        crate::SessionCommands::Show { id, limit } => {
            let id = SessionId::from_string(id);
            let Some(session) = store.get_session(&id).await? else {
                println!("No session found with id: {id}");
                return Ok(());
            };
            print_session_line(&session);
            let now = chrono::Utc::now();
            match (&session.lock_owner, session.lock_expires_at) {
                (Some(owner), Some(expires_at)) if session.lock_held_at(now) => {
                    println!("  Lock: held by {owner} until {expires_at}");
                }
                (Some(owner), _) => println!("  Lock: stale (last owner {owner})"),
                _ => println!("  Lock: free"),
            }

            let transcript = store.transcript(&id, limit).await?;
            println!("\nTranscript ({} messages):", transcript.len());
            for message in &transcript {
                println!(
                    "  #{} {} [{}] {}",
                    message.id,
                    message.sender.as_str(),
                    message.kind.as_str(),
                    preview(&message.content)
                );
            }

            let audit = store.audit_trail(&id, limit).await?;
            if !audit.is_empty() {
                println!("\nAudit trail:");
                for entry in &audit {
                    println!(
                        "  {} {} {}{}",
                        entry.created_at.format("%H:%M:%S"),
                        entry.invocation,
                        entry.outcome,
                        entry
                            .detail
                            .as_deref()
                            .map(|d| format!(" ({d})"))
                            .unwrap_or_default()
                    );
                }
            }
        }
        crate::SessionCommands::List { limit } => {
            let sessions = store.list_sessions(limit).await?;
            if sessions.is_empty() {
                println!("No sessions found.");
                return Ok(());
            }
            println!("Sessions ({} shown):\n", sessions.len());
            for session in &sessions {
                print_session_line(session);
            }
        }
        crate::SessionCommands::Ai { id, off } => {
            let id = SessionId::from_string(id);
            if store.set_ai_enabled(&id, !off).await? {
                println!(
                    "Automatic replies {} for session {id}.",
                    if off { "disabled" } else { "enabled" }
                );
            } else {
                println!("No session found with id: {id}");
            }
        }
    }
    Ok(())
}
