//! Registry backed by a Redis-compatible server
//!
//! Commands share one connection behind a mutex, reopened when the server
//! drops it. Every subscription gets its own connection on a forwarding
//! thread, so `poll` reads from a local `flume` queue.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use redis::{Client, Commands, Connection, ConnectionLike, PubSub, RedisError, RedisResult};
use tracing::{debug, info, warn};

use super::{Registry, Subscription};
use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const IO_TIMEOUT: Duration = Duration::from_secs(2);
/// How often a forwarding thread checks whether its subscriber is gone.
const LISTEN_TIMEOUT: Duration = Duration::from_millis(100);

fn store_error(e: RedisError) -> Error {
    Error::Registry(e.to_string())
}

/// `redis://host:port/` for a store endpoint.
pub fn endpoint_url(host: &str, port: u16) -> String {
    format!("redis://{}:{}/", host, port)
}

/// Glob pattern matching every key that starts with `prefix`.
fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

pub struct RedisRegistry {
    client: Client,
    endpoint: String,
    connection: Mutex<Connection>,
}

impl RedisRegistry {
    /// Connect to the store at `host:port`.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let endpoint = endpoint_url(host, port);
        let client = Client::open(endpoint.as_str()).map_err(store_error)?;
        let connection = Self::open_connection(&client)?;
        info!("Connected to key-value store at {}:{}", host, port);
        Ok(Self {
            client,
            endpoint,
            connection: Mutex::new(connection),
        })
    }

    fn open_connection(client: &Client) -> Result<Connection> {
        let connection = client
            .get_connection_with_timeout(CONNECT_TIMEOUT)
            .map_err(store_error)?;
        connection
            .set_read_timeout(Some(IO_TIMEOUT))
            .and_then(|_| connection.set_write_timeout(Some(IO_TIMEOUT)))
            .map_err(store_error)?;
        Ok(connection)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        let mut connection = self
            .connection
            .lock()
            .map_err(|_| Error::Registry("registry connection mutex poisoned".into()))?;
        if !connection.is_open() {
            debug!("Reconnecting to {}", self.endpoint);
            *connection = Self::open_connection(&self.client)?;
        }
        Ok(connection)
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> RedisResult<T>) -> Result<T> {
        let mut connection = self.lock()?;
        op(&mut *connection).map_err(store_error)
    }
}

impl Registry for RedisRegistry {
    fn register(&self, set: &str, member: &str) -> Result<()> {
        self.with_connection(|c| c.sadd::<_, _, ()>(set, member))
    }

    fn unregister(&self, set: &str, member: &str) -> Result<()> {
        self.with_connection(|c| c.srem::<_, _, ()>(set, member))
    }

    fn list_members(&self, set: &str) -> Result<HashSet<String>> {
        self.with_connection(|c| c.smembers::<_, HashSet<String>>(set))
    }

    fn is_registered(&self, set: &str, member: &str) -> Result<bool> {
        self.with_connection(|c| c.sismember::<_, _, bool>(set, member))
    }

    fn random_member(&self, set: &str) -> Result<Option<String>> {
        self.with_connection(|c| c.srandmember::<_, Option<String>>(set))
    }

    fn delete_set(&self, set: &str) -> Result<()> {
        self.with_connection(|c| c.del::<_, ()>(set))
    }

    fn set_field(&self, key: &str, value: &str) -> Result<()> {
        self.with_connection(|c| c.set::<_, _, ()>(key, value))
    }

    fn get_field(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|c| c.get::<_, Option<String>>(key))
    }

    fn delete_field(&self, key: &str) -> Result<()> {
        self.with_connection(|c| c.del::<_, ()>(key))
    }

    fn scan_fields(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let pattern = prefix_pattern(prefix);
        self.with_connection(|c| {
            let keys: Vec<String> = c.scan_match::<_, String>(pattern.as_str())?.collect();
            let mut fields = Vec::with_capacity(keys.len());
            for key in keys {
                // The key may have been deleted between the scan and the read.
                if let Some(value) = c.get::<_, Option<String>>(key.as_str())? {
                    fields.push((key, value));
                }
            }
            fields.sort();
            Ok(fields)
        })
    }

    fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.with_connection(|c| c.publish::<_, _, ()>(channel, payload))
    }

    fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        let (tx, rx) = flume::unbounded();
        let (ready_tx, ready_rx) = flume::bounded(1);
        let client = self.client.clone();
        let name = channel.to_owned();
        thread::Builder::new()
            .name(format!("subscribe-{}", channel))
            .spawn(move || forward(client, name, ready_tx, tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(RedisSubscription {
                channel: channel.to_owned(),
                rx,
            })),
            Ok(Err(e)) => Err(store_error(e)),
            Err(_) => Err(Error::Registry(format!(
                "subscriber thread for '{}' exited",
                channel
            ))),
        }
    }
}

fn listen(pubsub: &mut PubSub<'_>, channel: &str) -> RedisResult<()> {
    pubsub.subscribe(channel)?;
    pubsub.set_read_timeout(Some(LISTEN_TIMEOUT))
}

/// Body of a subscription thread: relay every message of `channel` to `tx`
/// until the subscriber is dropped or the connection fails.
fn forward(
    client: Client,
    channel: String,
    ready: Sender<RedisResult<()>>,
    tx: Sender<String>,
) {
    let mut connection = match client.get_connection_with_timeout(CONNECT_TIMEOUT) {
        Ok(connection) => connection,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut pubsub = connection.as_pubsub();
    if let Err(e) = listen(&mut pubsub, &channel) {
        let _ = ready.send(Err(e));
        return;
    }
    if ready.send(Ok(())).is_err() {
        return;
    }

    while !tx.is_disconnected() {
        match pubsub.get_message() {
            Ok(message) => match message.get_payload::<String>() {
                Ok(payload) => {
                    if tx.send(payload).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(channel, "dropping undecodable message: {}", e),
            },
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!(channel, "subscription lost: {}", e);
                break;
            }
        }
    }
    debug!(channel, "subscription closed");
}

struct RedisSubscription {
    channel: String,
    rx: Receiver<String>,
}

impl Subscription for RedisSubscription {
    fn poll(&mut self, timeout: Duration) -> Result<Option<String>> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Registry(format!(
                "subscription to '{}' lost",
                self.channel
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_pattern_escapes_globs() {
        assert_eq!(prefix_pattern("configurations/zed.0/"), "configurations/zed.0/*");
        assert_eq!(prefix_pattern("a*b?[c]"), "a\\*b\\?\\[c\\]*");
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(endpoint_url("127.0.0.1", 6379), "redis://127.0.0.1:6379/");
    }

    #[test]
    fn test_unreachable_store_is_a_registry_error() {
        // Port 1 (tcpmux) is not served on test hosts.
        let result = RedisRegistry::connect("127.0.0.1", 1);
        assert!(matches!(result, Err(Error::Registry(_))));
    }
}
