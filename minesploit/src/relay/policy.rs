//! What a relay does to the traffic passing through it.
//!
//! All relay variants share one bridge; they differ only in the
//! [`RelayPolicy`] they run with:
//!
//! | Policy | Upstream authorize | Submits rewritten | Verdict to miner |
//! |---|---|---|---|
//! | [`RelayPolicy::sniffer`] | no | none | pool's |
//! | [`RelayPolicy::credential_theft`] | yes | all | always accepted |
//! | [`RelayPolicy::share_stealing`] | yes | a fraction | accepted if stolen, else pool's |
//!
//! Hooks see every decoded message in each direction and may return it
//! changed; the bridge re-encodes only what actually changed.

use std::fmt;
use std::sync::Arc;

use crate::append_log::{CaptureEntry, CaptureLog, Source};
use crate::stratum_v1::Message;
use crate::tracing::prelude::*;

/// Transform applied to each decoded message.
pub type MessageHook = Arc<dyn Fn(Message) -> Message + Send + Sync>;

/// Per-direction message hooks. Both default to the identity.
#[derive(Clone)]
pub struct Hooks {
    /// Applied to miner → pool traffic, before any submit rewriting
    pub on_miner_message: MessageHook,
    /// Applied to pool → miner traffic, after id restoration
    pub on_pool_message: MessageHook,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            on_miner_message: Arc::new(|msg| msg),
            on_pool_message: Arc::new(|msg| msg),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}

/// Worker identity the relay uses upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: "proxy_worker".to_string(),
            password: "x".to_string(),
        }
    }
}

/// Submit rewriting.
#[derive(Debug, Clone)]
pub struct Interception {
    /// Identity substituted into intercepted submits
    pub credentials: Credentials,
    /// Probability in [0, 1] that a given submit is intercepted, drawn
    /// independently per share
    pub steal_ratio: f64,
    /// Report intercepted shares as accepted regardless of the pool's verdict
    pub force_accept: bool,
}

/// Full behaviour of a relay.
#[derive(Debug, Clone, Default)]
pub struct RelayPolicy {
    pub hooks: Hooks,
    /// `None` for pure pass-through
    pub interception: Option<Interception>,
    /// Drop undecodable frames instead of forwarding them unchanged
    pub strict: bool,
}

impl RelayPolicy {
    /// Forward everything unchanged.
    pub fn transparent() -> Self {
        Self::default()
    }

    /// Forward everything unchanged, logging every message and recording
    /// it to `capture`.
    pub fn sniffer(capture: CaptureLog) -> Self {
        Self::transparent()
            .on_miner_message(|msg| {
                log_message(Source::Miner, &msg);
                msg
            })
            .on_pool_message(|msg| {
                log_message(Source::Pool, &msg);
                msg
            })
            .with_capture(capture)
    }

    /// Rewrite every submit to `credentials` and always report acceptance.
    pub fn credential_theft(credentials: Credentials) -> Self {
        Self::share_stealing(credentials, 1.0)
    }

    /// Rewrite a `ratio` fraction of submits to `credentials`. Stolen shares
    /// are reported accepted; the rest pass through untouched.
    pub fn share_stealing(credentials: Credentials, ratio: f64) -> Self {
        Self {
            interception: Some(Interception {
                credentials,
                steal_ratio: ratio.clamp(0.0, 1.0),
                force_accept: true,
            }),
            ..Self::default()
        }
    }

    /// Forward the pool's real verdict for intercepted shares instead of
    /// forcing acceptance.
    pub fn with_honest_verdicts(mut self) -> Self {
        if let Some(interception) = &mut self.interception {
            interception.force_accept = false;
        }
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Wrap the current hooks so every message they produce is also
    /// appended to `capture`.
    pub fn with_capture(mut self, capture: CaptureLog) -> Self {
        let Hooks {
            on_miner_message,
            on_pool_message,
        } = self.hooks;

        let miner_log = capture.clone();
        let pool_log = capture;
        self.hooks = Hooks {
            on_miner_message: Arc::new(move |msg| {
                let msg = on_miner_message(msg);
                debug!(method = ?msg.method(), id = ?msg.id(), "miner -> pool");
                miner_log.append(CaptureEntry::new(Source::Miner, &msg));
                msg
            }),
            on_pool_message: Arc::new(move |msg| {
                let msg = on_pool_message(msg);
                debug!(method = ?msg.method(), id = ?msg.id(), "pool -> miner");
                pool_log.append(CaptureEntry::new(Source::Pool, &msg));
                msg
            }),
        };
        self
    }

    /// Replace the miner → pool hook.
    pub fn on_miner_message(
        mut self,
        hook: impl Fn(Message) -> Message + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_miner_message = Arc::new(hook);
        self
    }

    /// Replace the pool → miner hook.
    pub fn on_pool_message(
        mut self,
        hook: impl Fn(Message) -> Message + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_pool_message = Arc::new(hook);
        self
    }
}

fn log_message(source: Source, msg: &Message) {
    let text = serde_json::to_string(msg).unwrap_or_default();
    info!(from = ?source, method = ?msg.method(), id = ?msg.id(), "{}", text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append_log::LogConfig;
    use serde_json::json;

    #[test]
    fn test_presets() {
        assert!(RelayPolicy::transparent().interception.is_none());

        let theft = RelayPolicy::credential_theft(Credentials::default());
        let i = theft.interception.unwrap();
        assert_eq!(i.steal_ratio, 1.0);
        assert!(i.force_accept);

        let stealing = RelayPolicy::share_stealing(Credentials::default(), 7.0).with_honest_verdicts();
        let i = stealing.interception.unwrap();
        assert_eq!(i.steal_ratio, 1.0);
        assert!(!i.force_accept);
    }

    #[tokio::test]
    async fn test_sniffer_records_both_directions_unchanged() {
        let capture = CaptureLog::spawn(LogConfig::in_memory()).await.unwrap();
        let policy = RelayPolicy::sniffer(capture.clone());
        assert!(policy.interception.is_none());

        let submit = Message::request(4, "mining.submit", json!(["rig.1", "1", "00", "504e86b9", "deadbeef"]));
        assert_eq!((policy.hooks.on_miner_message)(submit.clone()), submit);
        let reply = Message::response(Some(4), json!(true));
        assert_eq!((policy.hooks.on_pool_message)(reply.clone()), reply);

        let entries = capture.snapshot().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].source, Source::Miner);
        assert_eq!(entries[0].message["method"], "mining.submit");
        assert_eq!(entries[1].source, Source::Pool);
        assert_eq!(entries[1].message["result"], true);
    }

    #[tokio::test]
    async fn test_capture_wraps_existing_hook() {
        let capture = CaptureLog::spawn(LogConfig::in_memory()).await.unwrap();
        let policy = RelayPolicy::transparent()
            .on_miner_message(|mut msg| {
                msg.set_id(Some(99));
                msg
            })
            .with_capture(capture.clone());

        let out = (policy.hooks.on_miner_message)(Message::request(1, "mining.subscribe", json!([])));
        assert_eq!(out.id(), Some(99));
        let back = (policy.hooks.on_pool_message)(Message::response(Some(99), json!(true)));
        assert_eq!(back.id(), Some(99));

        let entries = capture.snapshot().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].source, Source::Miner);
        assert_eq!(entries[0].message["id"], 99);
        assert_eq!(entries[1].source, Source::Pool);
    }
}
