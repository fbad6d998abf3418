//! In-process transport, mostly for testing purposes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{ChannelTransport, RemoteMessageId, TransportError};
use crate::config::TierConfig;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport that keeps messages in memory.
///
/// Enforces per-tier ceilings like the real platform and can be told to fail
/// upcoming calls, which is how retry and resume paths are exercised.
pub struct MemoryTransport {
    ceilings: HashMap<String, u64>,
    messages: Mutex<HashMap<RemoteMessageId, Vec<u8>>>,
    next_id: AtomicU64,
    send_failures: Mutex<VecDeque<TransportError>>,
    fetch_failures: Mutex<HashMap<RemoteMessageId, (u32, TransportError)>>,
    send_log: Mutex<Vec<(String, usize)>>,
    fetch_log: Mutex<Vec<RemoteMessageId>>,
    deleted: Mutex<Vec<RemoteMessageId>>,
}

impl MemoryTransport {
    /// Create a transport accepting the given tiers.
    pub fn new(tiers: &[TierConfig]) -> Self {
        Self {
            ceilings: tiers
                .iter()
                .map(|t| (t.name.clone(), t.ceiling_bytes))
                .collect(),
            messages: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            send_failures: Mutex::new(VecDeque::new()),
            fetch_failures: Mutex::new(HashMap::new()),
            send_log: Mutex::new(Vec::new()),
            fetch_log: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `count` sends fail with `error`.
    pub fn fail_next_sends(&self, count: usize, error: TransportError) {
        let mut failures = lock(&self.send_failures);
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    /// Make the next `times` fetches of `id` fail with `error`.
    pub fn fail_fetches(&self, id: &RemoteMessageId, times: u32, error: TransportError) {
        lock(&self.fetch_failures).insert(id.clone(), (times, error));
    }

    /// Stop injecting fetch failures.
    pub fn clear_fetch_failures(&self) {
        lock(&self.fetch_failures).clear();
    }

    /// Number of messages currently stored.
    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    /// Check if no messages are stored.
    pub fn is_empty(&self) -> bool {
        lock(&self.messages).is_empty()
    }

    /// Check if a message exists.
    pub fn contains(&self, id: &RemoteMessageId) -> bool {
        lock(&self.messages).contains_key(id)
    }

    /// Every send attempt so far as `(tier, payload length)`, failed ones included.
    pub fn sends(&self) -> Vec<(String, usize)> {
        lock(&self.send_log).clone()
    }

    /// Every fetch attempt so far, in call order.
    pub fn fetches(&self) -> Vec<RemoteMessageId> {
        lock(&self.fetch_log).clone()
    }

    /// Messages removed through [`ChannelTransport::delete`].
    pub fn deleted(&self) -> Vec<RemoteMessageId> {
        lock(&self.deleted).clone()
    }
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
    async fn send(&self, tier: &str, data: &[u8]) -> Result<RemoteMessageId, TransportError> {
        lock(&self.send_log).push((tier.to_string(), data.len()));

        if let Some(error) = lock(&self.send_failures).pop_front() {
            return Err(error);
        }

        let ceiling = self
            .ceilings
            .get(tier)
            .ok_or_else(|| TransportError::Rejected(format!("unknown tier {tier}")))?;
        if data.len() as u64 > *ceiling {
            return Err(TransportError::Rejected(format!(
                "{} bytes exceeds {tier} ceiling of {ceiling}",
                data.len()
            )));
        }

        let id = RemoteMessageId::new(self.next_id.fetch_add(1, Ordering::SeqCst).to_string());
        lock(&self.messages).insert(id.clone(), data.to_vec());
        Ok(id)
    }

    async fn fetch(&self, id: &RemoteMessageId) -> Result<Vec<u8>, TransportError> {
        lock(&self.fetch_log).push(id.clone());

        {
            let mut failures = lock(&self.fetch_failures);
            if let Some((remaining, error)) = failures.get_mut(id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(error.clone());
                }
            }
        }

        lock(&self.messages)
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(id.to_string()))
    }

    async fn delete(&self, id: &RemoteMessageId) -> Result<(), TransportError> {
        lock(&self.deleted).push(id.clone());
        lock(&self.messages).remove(id);
        Ok(())
    }
}
