#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_wraps,
    dead_code
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod auto_reply;
pub mod burst;
pub mod channels;
pub mod config;
pub mod gateway;
pub mod providers;
pub mod sessions;

pub use config::Config;

/// Session management subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionCommands {
    /// Start a conversation with a client (or show the active one)
    #[command(long_about = "\
Start a conversation with a client.

Inbound webhook messages are only logged and answered for clients \
with an active session. If the client already has one, it is shown \
instead of creating a second.

Examples:
  prospect-relay session start 5511999990000")]
    Start {
        /// Client chat id (phone number in international format)
        client_id: String,
    },
    /// Show a session with its lock state, recent transcript and audit trail
    Show {
        /// Session id
        id: String,
        /// Maximum number of transcript and audit rows to display
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// List the most recently updated sessions
    List {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Enable or disable automatic replies for a session
    Ai {
        /// Session id
        id: String,
        /// Turn automatic replies off instead of on
        #[arg(long)]
        off: bool,
    },
}
