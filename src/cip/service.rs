//! Service dispatch for the target role.
//!
//! Applications register one handler per CIP service code. A handler returns
//! the reply data, or `None` when it cannot serve the request.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use super::message_router::{self, general_status, CipPacket, REPLY_MASK};
use crate::core::{Error, Result};

/// Handles requests for one CIP service code
pub trait ServiceHandler: Send + Sync {
    fn handle(&self, request: &CipPacket) -> Option<Vec<u8>>;
}

impl<F> ServiceHandler for F
where
    F: Fn(&CipPacket) -> Option<Vec<u8>> + Send + Sync,
{
    fn handle(&self, request: &CipPacket) -> Option<Vec<u8>> {
        self(request)
    }
}

/// Service code to handler mapping, fixed once the server starts
#[derive(Clone, Default)]
pub struct ServiceTable {
    handlers: HashMap<u8, Arc<dyn ServiceHandler>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        ServiceTable::default()
    }

    /// Registers `handler` for `service`, replacing any previous one
    pub fn with_handler(mut self, service: u8, handler: impl ServiceHandler + 'static) -> Self {
        self.insert(service, handler);
        self
    }

    pub fn insert(&mut self, service: u8, handler: impl ServiceHandler + 'static) {
        self.handlers.insert(service, Arc::new(handler));
    }

    pub fn contains(&self, service: u8) -> bool {
        self.handlers.contains_key(&service)
    }

    /// Runs the handler for `request` and builds the Message Router reply
    ///
    /// Fails with [`Error::NoServiceHandler`] when no handler is registered. A
    /// handler returning `None` yields a reply with general status 0x04 and no
    /// data.
    pub fn dispatch(&self, request: &CipPacket) -> Result<Bytes> {
        let handler = self
            .handlers
            .get(&request.service)
            .ok_or(Error::NoServiceHandler(request.service))?;

        Ok(match handler.handle(request) {
            Some(data) => message_router::build_reply(
                request.service | REPLY_MASK,
                general_status::SUCCESS,
                &data,
            ),
            None => message_router::build_error_reply(request.service, general_status::PATH_SEGMENT_ERROR),
        })
    }
}

impl std::fmt::Debug for ServiceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut services: Vec<_> = self.handlers.keys().copied().collect();
        services.sort_unstable();
        f.debug_struct("ServiceTable").field("services", &services).finish()
    }
}
