//! Typed observer registry, replacing an arbitrary event emitter with a
//! small set of named hooks (C5).

use crate::common::error::Error;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct OutboundConnectEvent {
    pub connection_id: String,
    pub host: String,
    pub upstream: Option<String>,
    pub attempt: usize,
    pub succeeded: bool,
}

pub type OutboundConnectHook = Arc<dyn Fn(&OutboundConnectEvent) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Default, Clone)]
pub struct EventHooks {
    pub on_outbound_connect: Option<OutboundConnectHook>,
    pub on_error: Option<ErrorHook>,
}

impl EventHooks {
    pub fn emit_outbound_connect(&self, event: OutboundConnectEvent) {
        if let Some(hook) = &self.on_outbound_connect {
            hook(&event);
        }
    }

    pub fn emit_error(&self, err: &Error) {
        if let Some(hook) = &self.on_error {
            hook(err);
        }
    }
}
