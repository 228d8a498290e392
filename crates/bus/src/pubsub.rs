/*
The fanout fabric: topic-based pub/sub shared by every gateway instance.

This file exposes the same public API regardless of feature flags:

- Bus
  - bind(addr: &str) -> Result<Self>
  - publish(&self, topic: &str, payload: &[u8]) -> Result<()>
  - subscribe(&self, topic: &str) -> Result<Subscription>

- Subscription
  - into_receiver(self) -> mpsc::Receiver<(String, Vec<u8>)>
  - dropping the receiver leaves the topic

Current state:
- Default (no feature): in-memory tokio::broadcast-based implementation
  (suitable for dev/tests and single-instance deployments). The registry is
  per-Bus instance so tests can run isolated fabrics side by side.
- feature = "with-nng": NNG pub/sub sockets. The publisher listens on `addr`
  and every subscription dials it, so instances sharing the address share the
  fabric. Frames are `topic\x00payload`; the subscription prefix includes the
  separator byte so `status:7` never matches `status:72`.

Delivery is at-most-once and best-effort. A subscriber that falls behind has
its backlog dropped (broadcast lag / socket buffer overflow) rather than
blocking publishers; consumers must tolerate drops.
*/

use anyhow::Result;
use tokio::sync::mpsc;

#[cfg(not(feature = "with-nng"))]
mod mem {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::broadcast;

    const TOPIC_BUFFER: usize = 1024;

    /// In-memory fabric: one broadcast channel per topic.
    #[derive(Clone)]
    pub struct Bus {
        topics: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
    }

    impl Bus {
        /// `addr` is ignored for the in-memory fallback.
        pub fn bind(_addr: &str) -> Result<Self> {
            Ok(Self {
                topics: Arc::new(Mutex::new(HashMap::new())),
            })
        }

        fn sender_for(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
            let mut map = self.topics.lock();
            map.entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
                .clone()
        }

        /// Publish a payload to `topic`. "No subscribers" is not an error;
        /// publishers don't care whether anyone is listening.
        pub fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
            tracing::debug!(topic = %topic, len = payload.len(), "mem bus: publish");
            let tx = self.sender_for(topic);
            let _ = tx.send(payload.to_vec());
            Ok(())
        }

        /// Join `topic`. The returned subscription feeds an mpsc receiver; a
        /// forward task bridges the broadcast side and stops when the
        /// receiver is dropped.
        pub fn subscribe(&self, topic: &str) -> Result<Subscription> {
            let (tx, rx) = mpsc::channel(256);
            let mut brx = self.sender_for(topic).subscribe();
            let topic_owned = topic.to_string();
            tokio::spawn(async move {
                loop {
                    match brx.recv().await {
                        Ok(payload) => {
                            if tx.send((topic_owned.clone(), payload)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Slow subscriber: older envelopes are dropped in
                            // favor of keeping up with current state.
                            tracing::debug!(topic = %topic_owned, skipped, "mem bus: lagged, dropping backlog");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            Ok(Subscription { receiver: rx })
        }
    }
}

#[cfg(feature = "with-nng")]
mod nng_impl {
    use super::*;
    use nng::options::protocol::pubsub::Subscribe;
    use nng::options::Options;
    use nng::{Message, Protocol, Socket};
    use std::thread;
    use tokio::runtime::Handle;

    /// NNG-backed fabric. One Pub0 socket per Bus; one Sub0 socket per
    /// subscription, dialed at the shared address.
    #[derive(Clone)]
    pub struct Bus {
        sock: Socket,
        addr: String,
    }

    impl Bus {
        /// Bind the publisher (listen) on `addr`.
        pub fn bind(addr: &str) -> Result<Self> {
            let sock = Socket::new(Protocol::Pub0)?;
            sock.listen(addr)?;
            Ok(Self {
                sock,
                addr: addr.to_string(),
            })
        }

        /// Publish a topic + payload as: topic\x00payload
        pub fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
            let mut buf = Vec::with_capacity(topic.len() + 1 + payload.len());
            buf.extend_from_slice(topic.as_bytes());
            buf.push(0);
            buf.extend_from_slice(payload);
            let msg = Message::from(buf.as_slice());
            self.sock.send(msg).map_err(|(_m, e)| anyhow::anyhow!(e))?;
            Ok(())
        }

        /// Join `topic` by dialing the fabric address with a Sub0 socket.
        /// A blocking thread receives from the native socket and forwards
        /// into a tokio mpsc channel via the current runtime handle.
        pub fn subscribe(&self, topic: &str) -> Result<Subscription> {
            let sub_sock = Socket::new(Protocol::Sub0)?;
            sub_sock.dial(&self.addr)?;
            // Subscribe to the exact topic: prefix + separator byte, so a
            // topic is never a prefix of another.
            let mut prefix = topic.as_bytes().to_vec();
            prefix.push(0);
            sub_sock.set_opt::<Subscribe>(prefix)?;

            let (tx, rx) = mpsc::channel(256);
            let handle = Handle::current();

            thread::spawn(move || loop {
                match sub_sock.recv() {
                    Ok(msg) => {
                        let bytes = msg.as_slice().to_vec();
                        let Some(pos) = bytes.iter().position(|&b| b == 0) else {
                            continue;
                        };
                        let topic_str = String::from_utf8_lossy(&bytes[..pos]).to_string();
                        let payload = bytes[pos + 1..].to_vec();
                        let tx_async = tx.clone();
                        let _ = handle.spawn(async move {
                            let _ = tx_async.send((topic_str, payload)).await;
                        });
                    }
                    Err(_) => {
                        // socket closed or error; stop thread
                        break;
                    }
                }
            });

            Ok(Subscription { receiver: rx })
        }
    }
}

/// A joined topic. Dropping the receiver (or the whole subscription) leaves
/// the topic; there is no explicit leave call.
pub struct Subscription {
    receiver: mpsc::Receiver<(String, Vec<u8>)>,
}

impl Subscription {
    /// Consume the Subscription and return the owned receiver for moving
    /// into tasks.
    pub fn into_receiver(self) -> mpsc::Receiver<(String, Vec<u8>)> {
        self.receiver
    }

    /// Await the next envelope on this topic.
    pub async fn recv(&mut self) -> Option<(String, Vec<u8>)> {
        self.receiver.recv().await
    }
}

#[cfg(not(feature = "with-nng"))]
pub use mem::Bus;

#[cfg(feature = "with-nng")]
pub use nng_impl::Bus;

#[cfg(all(test, not(feature = "with-nng")))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_topic_subscribers_only() {
        let bus = Bus::bind("").unwrap();
        let mut seven = bus.subscribe("status:7").unwrap();
        let mut nine = bus.subscribe("status:9").unwrap();

        bus.publish("status:7", b"hello").unwrap();
        let (topic, payload) = seven.recv().await.unwrap();
        assert_eq!(topic, "status:7");
        assert_eq!(payload, b"hello");

        // The other topic sees nothing.
        bus.publish("status:7", b"again").unwrap();
        tokio::select! {
            _ = nine.recv() => panic!("envelope leaked across topics"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = Bus::bind("").unwrap();
        bus.publish("status:404", b"anyone?").unwrap();
    }

    #[tokio::test]
    async fn every_subscriber_of_a_topic_receives() {
        let bus = Bus::bind("").unwrap();
        let mut a = bus.subscribe("status:7").unwrap();
        let mut b = bus.subscribe("status:7").unwrap();
        bus.publish("status:7", b"x").unwrap();
        assert_eq!(a.recv().await.unwrap().1, b"x");
        assert_eq!(b.recv().await.unwrap().1, b"x");
    }

    #[tokio::test]
    async fn instances_are_isolated_fabrics() {
        let one = Bus::bind("").unwrap();
        let two = Bus::bind("").unwrap();
        let mut sub = two.subscribe("status:7").unwrap();
        one.publish("status:7", b"x").unwrap();
        tokio::select! {
            _ = sub.recv() => panic!("fabrics must not share state"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
        }
    }
}
