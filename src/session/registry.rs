use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{Error, Result};

use super::event::LegEvent;
use super::leg::Leg;

/// Postbox directory for the legs of all calls.
pub trait Registry: Send + Sync + 'static {
    /// Delivers `event` to the leg registered as `target`.
    fn post_event(&self, target: &str, event: LegEvent) -> Result<()>;

    /// Registers `leg` under its local tag and starts processing its events.
    fn add_session(&self, leg: Leg) -> Result<()>;

    /// Fresh identifier, usable as local tag or Call-ID.
    fn new_id(&self) -> String;

    /// Tags of every registered leg.
    fn sessions(&self) -> Vec<String>;
}

pub(crate) fn md5_hex(bytes: &[u8]) -> String {
    format!("{:032x}", md5::compute(bytes))
}

/// Tokio based [`Registry`]: each leg runs as one task draining an unbounded
/// postbox, so a leg's state is only ever touched by its own task.
#[derive(Debug, Clone, Default)]
pub struct SessionContainer {
    inner: Arc<ContainerInner>,
}

#[derive(Debug, Default)]
struct ContainerInner {
    counter: AtomicU64,
    postboxes: Mutex<HashMap<String, mpsc::UnboundedSender<LegEvent>>>,
}

impl ContainerInner {
    fn postboxes(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<LegEvent>>> {
        self.postboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.postboxes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.inner.postboxes().contains_key(tag)
    }
}

impl Registry for SessionContainer {
    fn post_event(&self, target: &str, event: LegEvent) -> Result<()> {
        let tx = self
            .inner
            .postboxes()
            .get(target)
            .cloned()
            .ok_or_else(|| Error::PeerGone(target.to_string()))?;
        tx.send(event)
            .map_err(|_| Error::PeerGone(target.to_string()))
    }

    fn add_session(&self, leg: Leg) -> Result<()> {
        let tag = leg.local_tag().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut postboxes = self.inner.postboxes();
            if postboxes.contains_key(&tag) {
                return Err(Error::configuration(format!(
                    "session {tag} is already registered"
                )));
            }
            postboxes.insert(tag.clone(), tx);
        }

        info!(local_tag = %tag, "session registered");
        tokio::spawn(run_leg(leg, rx, self.inner.clone()));
        Ok(())
    }

    fn new_id(&self) -> String {
        let seq = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        let raw = format!("{}:{}:{}", seq, now.as_nanos(), std::process::id());
        md5_hex(raw.as_bytes())
    }

    fn sessions(&self) -> Vec<String> {
        self.inner.postboxes().keys().cloned().collect()
    }
}

async fn run_leg(
    mut leg: Leg,
    mut rx: mpsc::UnboundedReceiver<LegEvent>,
    inner: Arc<ContainerInner>,
) {
    let tag = leg.local_tag().to_string();
    while let Some(event) = rx.recv().await {
        leg.process(event).await;
        if leg.is_finished() {
            break;
        }
    }

    inner.postboxes().remove(&tag);
    let dropped = {
        rx.close();
        let mut count = 0usize;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    };
    if dropped > 0 {
        warn!(local_tag = %tag, dropped, "events left in postbox of finished session");
    }
    leg.teardown();
    info!(local_tag = %tag, "session finished");
}
