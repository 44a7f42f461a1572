//! Per-message invocation pipeline: settle the burst, win the session lock,
//! answer the pending turn once.

pub mod dispatcher;
pub mod reply;
pub mod traits;

pub use dispatcher::BurstDispatcher;
pub use reply::{GeneratingReplyDispatcher, ReplyPolicy};
pub use traits::{
    DispatchContext, DispatchResult, Dispatcher, InboundMessage, ReplyContext, ReplyDispatcher,
};

use crate::burst::{BurstTimings, LockManager};
use crate::channels::MessageSender;
use crate::config::Config;
use crate::providers::Responder;
use crate::sessions::Store;
use std::sync::Arc;

pub fn create_reply_dispatcher(
    config: &Config,
    store: Arc<dyn Store>,
    responder: Arc<dyn Responder>,
    sender: Arc<dyn MessageSender>,
) -> Arc<dyn ReplyDispatcher> {
    let policy = ReplyPolicy {
        system_prompt: config.responder.system_prompt.clone(),
        history_limit: config.burst.history_limit,
        response_timeout: config.burst.response_timeout(),
        max_regenerations: config.burst.max_regenerations,
    };
    Arc::new(GeneratingReplyDispatcher::new(store, responder, sender, policy))
}

pub fn create_dispatcher(
    config: &Config,
    store: Arc<dyn Store>,
    replies: Arc<dyn ReplyDispatcher>,
) -> Arc<dyn Dispatcher> {
    Arc::new(BurstDispatcher::new(
        store,
        BurstTimings::from_config(&config.burst),
        replies,
    ))
}

/// A fresh invocation context; its token doubles as the lock owner.
pub fn new_invocation() -> DispatchContext {
    DispatchContext {
        invocation: LockManager::new_token(),
    }
}
