//! In-process registry backend

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use rand::seq::IteratorRandom;
use tracing::debug;

use super::{Registry, Subscription};
use crate::{Error, Result};

/// Registry held entirely in memory.
///
/// Fields and sets sit behind one mutex; channels fan out over unbounded
/// `flume` queues, one per subscriber. Subscribers that were dropped are pruned
/// on the next publish.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    fields: BTreeMap<String, String>,
    sets: HashMap<String, BTreeSet<String>>,
    channels: HashMap<String, Vec<Sender<String>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Registry("registry mutex poisoned".into()))
    }
}

impl Registry for MemoryRegistry {
    fn register(&self, set: &str, member: &str) -> Result<()> {
        self.lock()?
            .sets
            .entry(set.to_owned())
            .or_default()
            .insert(member.to_owned());
        Ok(())
    }

    fn unregister(&self, set: &str, member: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(members) = inner.sets.get_mut(set) {
            members.remove(member);
            if members.is_empty() {
                inner.sets.remove(set);
            }
        }
        Ok(())
    }

    fn list_members(&self, set: &str) -> Result<HashSet<String>> {
        Ok(self
            .lock()?
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn is_registered(&self, set: &str, member: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .sets
            .get(set)
            .is_some_and(|members| members.contains(member)))
    }

    fn random_member(&self, set: &str) -> Result<Option<String>> {
        let inner = self.lock()?;
        Ok(inner
            .sets
            .get(set)
            .and_then(|members| members.iter().choose(&mut rand::thread_rng()).cloned()))
    }

    fn delete_set(&self, set: &str) -> Result<()> {
        self.lock()?.sets.remove(set);
        Ok(())
    }

    fn set_field(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.fields.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn get_field(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.fields.get(key).cloned())
    }

    fn delete_field(&self, key: &str) -> Result<()> {
        self.lock()?.fields.remove(key);
        Ok(())
    }

    fn scan_fields(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let inner = self.lock()?;
        Ok(inner
            .fields
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(subscribers) = inner.channels.get_mut(channel) {
            subscribers.retain(|tx| tx.send(payload.to_owned()).is_ok());
            debug!(channel, receivers = subscribers.len(), "published");
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        let (tx, rx) = flume::unbounded();
        self.lock()?
            .channels
            .entry(channel.to_owned())
            .or_default()
            .push(tx);
        Ok(Box::new(MemorySubscription {
            channel: channel.to_owned(),
            rx,
        }))
    }
}

struct MemorySubscription {
    channel: String,
    rx: Receiver<String>,
}

impl Subscription for MemorySubscription {
    fn poll(&mut self, timeout: Duration) -> Result<Option<String>> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Registry(format!(
                "channel '{}' closed",
                self.channel
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sets_and_random_member() {
        let registry = MemoryRegistry::new();
        assert_eq!(registry.random_member("cameras").unwrap(), None);

        registry.register("cameras", "a.0").unwrap();
        registry.register("cameras", "b.1").unwrap();
        assert!(registry.is_registered("cameras", "a.0").unwrap());
        for _ in 0..20 {
            let picked = registry.random_member("cameras").unwrap().unwrap();
            assert!(picked == "a.0" || picked == "b.1");
        }

        registry.unregister("cameras", "a.0").unwrap();
        registry.unregister("cameras", "b.1").unwrap();
        assert!(registry.list_members("cameras").unwrap().is_empty());
    }

    #[test]
    fn test_scan_fields_stays_within_prefix() {
        let registry = MemoryRegistry::new();
        registry.set_field("configurations/x.0/Gain", "2").unwrap();
        registry.set_field("configurations/x.0/Exposure", "100").unwrap();
        registry.set_field("configurations/x.1/Gain", "3").unwrap();

        let scanned = registry.scan_fields("configurations/x.0/").unwrap();
        assert_eq!(scanned.len(), 2);
        assert!(scanned.iter().all(|(k, _)| k.starts_with("configurations/x.0/")));
    }

    #[test]
    fn test_publish_reaches_current_subscribers_only() {
        let registry = MemoryRegistry::new();
        registry.publish("chan", "lost").unwrap();

        let mut first = registry.subscribe("chan").unwrap();
        let mut second = registry.subscribe("chan").unwrap();
        registry.publish("chan", "hello").unwrap();

        let wait = Duration::from_millis(50);
        assert_eq!(first.poll(wait).unwrap().as_deref(), Some("hello"));
        assert_eq!(second.poll(wait).unwrap().as_deref(), Some("hello"));
        assert_eq!(first.poll(Duration::from_millis(5)).unwrap(), None);

        drop(second);
        registry.publish("chan", "again").unwrap();
        assert_eq!(first.poll(wait).unwrap().as_deref(), Some("again"));
    }
}
