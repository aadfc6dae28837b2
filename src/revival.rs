use std::sync::Arc;

use rand::seq::IndexedRandom;
use tracing::{info, warn};

use crate::markers::{SessionDescriptor, NO_TARGET};
use crate::tmux::TerminalGateway;

/// Pick one message uniformly from the pool.
pub fn choose_message(pool: &[String]) -> Option<&String> {
    pool.choose(&mut rand::rng())
}

/// Delivers continuation prompts through the gateway.
pub struct RevivalActuator<G: TerminalGateway> {
    gateway: Arc<G>,
}

impl<G: TerminalGateway> RevivalActuator<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self { gateway }
    }

    /// Revive a stale session with a random message from `pool`.
    ///
    /// Failures are logged and reported as `false`, never raised.
    pub async fn revive(&self, session: &SessionDescriptor, pool: &[String]) -> bool {
        let Some(message) = choose_message(pool) else {
            warn!(session_id = %session.session_id, "no continuation messages configured");
            return false;
        };
        if !session.has_target() {
            warn!(session_id = %session.session_id, "cannot revive: no valid tmux target");
            return false;
        }

        info!(
            session_id = %session.session_id,
            target = %session.routing_token,
            "sending continuation"
        );
        let sent = self.deliver(&session.routing_token, message).await;
        if sent {
            info!(session_id = %session.session_id, "continuation sent");
        } else {
            warn!(session_id = %session.session_id, "failed to send continuation");
        }
        sent
    }

    /// Validate `target`, then type `message` and submit it.
    pub async fn deliver(&self, target: &str, message: &str) -> bool {
        if target.is_empty() || target == NO_TARGET {
            return false;
        }
        if !self.gateway.validate_target(target).await {
            warn!(target, "cannot send prompt: target is gone or has no live process");
            return false;
        }
        self.gateway.send_keys(target, message).await
    }
}
