// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reacting to infrastructure changes that make cached sessions stale

use crate::backend::Endpoint;
use crate::session::SessionCache;
use slog::debug;
use slog::info;
use slog::o;
use slog::Logger;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Something changed underneath the cached backend sessions
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InvalidationEvent {
    /// the credentials for one tenant were rotated
    TenantCredentialsRotated { tenant: String },
    /// the credentials the controller itself connects with were rotated
    ServiceCredentialsRotated,
    /// the backend endpoint now resolves to a (possibly) different identity
    EndpointChanged { endpoint: Endpoint },
}

/// Invalidates cached sessions in response to [`InvalidationEvent`]s
pub struct InvalidationWatcher {
    log: Logger,
    sessions: Arc<SessionCache>,
    rx: mpsc::Receiver<InvalidationEvent>,
}

impl InvalidationWatcher {
    pub fn new(
        log: &Logger,
        sessions: Arc<SessionCache>,
        rx: mpsc::Receiver<InvalidationEvent>,
    ) -> InvalidationWatcher {
        InvalidationWatcher {
            log: log.new(o!("component" => "InvalidationWatcher")),
            sessions,
            rx,
        }
    }

    /// Apply one event to the session cache.
    pub async fn handle(&self, event: InvalidationEvent) {
        match event {
            InvalidationEvent::TenantCredentialsRotated { tenant } => {
                info!(self.log, "tenant credentials rotated";
                    "tenant" => &tenant,
                );
                self.sessions.invalidate(&tenant).await;
            }
            InvalidationEvent::ServiceCredentialsRotated => {
                info!(self.log, "service credentials rotated");
                self.sessions.invalidate_all().await;
            }
            InvalidationEvent::EndpointChanged { endpoint } => {
                // Observing the same identity again is a no-op.
                if !self.sessions.update_endpoint(endpoint).await {
                    debug!(self.log, "endpoint unchanged");
                }
            }
        }
    }

    /// Handle events until every sender is dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            self.handle(event).await;
        }
        info!(self.log, "event source closed");
    }
}
