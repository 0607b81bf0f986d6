//! Environment side of the telemetry channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use agentbridge_envelope::{Map, TelemetryMessage};
use agentbridge_frame::{FrameConfig, FrameError, FrameReader, FrameWriter, CONTROL, TELEMETRY};
use agentbridge_transport::{BridgeStream, Endpoint, ShutdownHandle, TcpEndpoint};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::control::ControlMessage;
use crate::error::Result;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Messages queued per subscriber before new ones are dropped for it.
pub const SEND_HIGH_WATER_MARK: usize = 10;

/// Fans telemetry out to every connected subscriber.
///
/// Subscribers are accepted on a background thread. Each one announces
/// topic prefixes over CONTROL frames; a message goes only to subscribers
/// with a prefix of the raw `"<topic> <payload>"` text, and a subscriber
/// that has announced nothing receives nothing.
///
/// Every subscriber has its own writer thread fed by a queue of
/// [`SEND_HIGH_WATER_MARK`] messages. Publishing never waits on a socket:
/// when a subscriber's queue is full the message is dropped for that
/// subscriber only.
pub struct TelemetryPublisher {
    shared: Arc<Shared>,
    endpoint: Endpoint,
    acceptor: Option<JoinHandle<()>>,
    next_seqno: AtomicU64,
    dropped: AtomicU64,
}

struct Shared {
    subscribers: Mutex<Vec<Subscriber>>,
    stop: AtomicBool,
    frame: FrameConfig,
}

struct Subscriber {
    peer: String,
    queue: Option<SyncSender<Bytes>>,
    prefixes: Arc<Mutex<Vec<String>>>,
    shutdown: ShutdownHandle,
    threads: Vec<JoinHandle<()>>,
}

enum Offer {
    Queued,
    Full,
    Gone,
}

impl Subscriber {
    fn wants(&self, raw: &[u8]) -> bool {
        lock(&self.prefixes)
            .iter()
            .any(|prefix| raw.starts_with(prefix.as_bytes()))
    }

    fn is_subscribed(&self) -> bool {
        !lock(&self.prefixes).is_empty()
    }

    fn offer(&self, message: &Bytes) -> Offer {
        let Some(queue) = &self.queue else {
            return Offer::Gone;
        };
        match queue.try_send(message.clone()) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(_)) => Offer::Full,
            Err(TrySendError::Disconnected(_)) => Offer::Gone,
        }
    }

    fn close(mut self) {
        self.shutdown.shutdown();
        self.queue.take();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl TelemetryPublisher {
    /// Bind the publish endpoint and start accepting subscribers.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        Self::bind_with_config(endpoint, FrameConfig::default())
    }

    pub fn bind_with_config(endpoint: &Endpoint, frame: FrameConfig) -> Result<Self> {
        let listener = TcpEndpoint::bind(endpoint)?;
        listener.set_nonblocking(true)?;
        let endpoint = listener.endpoint();
        info!(%endpoint, "telemetry publisher listening");

        let shared = Arc::new(Shared {
            subscribers: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            frame,
        });
        let acceptor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("telemetry-acceptor".to_string())
                .spawn(move || accept_loop(listener, shared))
                .map_err(agentbridge_transport::TransportError::Io)?
        };

        Ok(Self {
            shared,
            endpoint,
            acceptor: Some(acceptor),
            next_seqno: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        })
    }

    /// Publish `data` on `topic` with a fresh header sequence number.
    ///
    /// Returns how many subscribers the message was queued for.
    pub fn publish<D: Serialize + ?Sized>(&self, topic: &str, data: &D) -> Result<usize> {
        let seqno = self.next_seqno.fetch_add(1, Ordering::SeqCst);
        let mut header = Map::new();
        header.insert("seqno".to_string(), Value::from(seqno));
        let raw = TelemetryMessage::encode(topic, &header, data)?;
        trace!(topic, seqno, "publishing");
        self.publish_raw(&raw)
    }

    /// Publish pre-encoded `"<topic> <payload>"` bytes as-is.
    ///
    /// Returns how many subscriber queues accepted the message.
    pub fn publish_raw(&self, raw: &[u8]) -> Result<usize> {
        let message = Bytes::copy_from_slice(raw);
        let mut subscribers = lock(&self.shared.subscribers);
        let mut queued = 0;
        let mut ndx = 0;
        while ndx < subscribers.len() {
            if !subscribers[ndx].wants(raw) {
                ndx += 1;
                continue;
            }
            match subscribers[ndx].offer(&message) {
                Offer::Queued => {
                    queued += 1;
                    ndx += 1;
                }
                Offer::Full => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(peer = %subscribers[ndx].peer, "subscriber queue full, message dropped");
                    ndx += 1;
                }
                Offer::Gone => {
                    let dead = subscribers.swap_remove(ndx);
                    debug!(peer = %dead.peer, "dropping subscriber");
                    dead.close();
                }
            }
        }
        Ok(queued)
    }

    /// Messages dropped so far because a subscriber's queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Connected subscribers, whether or not they have subscribed to anything.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.subscribers).len()
    }

    /// Wait until at least `count` subscribers have announced a prefix.
    pub fn wait_for_subscribers(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let ready = lock(&self.shared.subscribers)
                .iter()
                .filter(|subscriber| subscriber.is_subscribed())
                .count();
            if ready >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for TelemetryPublisher {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        let subscribers = std::mem::take(&mut *lock(&self.shared.subscribers));
        for subscriber in subscribers {
            subscriber.close();
        }
        debug!(endpoint = %self.endpoint, "telemetry publisher closed");
    }
}

fn accept_loop(listener: TcpEndpoint, shared: Arc<Shared>) {
    while !shared.stop.load(Ordering::SeqCst) {
        match listener.try_accept() {
            Ok(Some(stream)) => match register(stream, &shared.frame) {
                Ok(subscriber) => {
                    info!(peer = %subscriber.peer, "subscriber connected");
                    lock(&shared.subscribers).push(subscriber);
                }
                Err(err) => warn!(error = %err, "failed to set up subscriber"),
            },
            Ok(None) => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(err) => {
                warn!(error = %err, "accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

fn register(stream: BridgeStream, frame: &FrameConfig) -> Result<Subscriber> {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let shutdown = stream.shutdown_handle()?;
    let reader = FrameReader::with_config_stream(stream.try_clone()?, frame.clone())?;
    let writer = FrameWriter::with_config_stream(stream, frame.clone())?;

    let prefixes = Arc::new(Mutex::new(Vec::new()));
    let control = {
        let prefixes = Arc::clone(&prefixes);
        let peer = peer.clone();
        thread::Builder::new()
            .name("telemetry-control".to_string())
            .spawn(move || control_loop(reader, prefixes, peer))
            .map_err(agentbridge_transport::TransportError::Io)?
    };

    let (queue, pending) = mpsc::sync_channel(SEND_HIGH_WATER_MARK);
    let sender = {
        let shutdown = shutdown.clone();
        let peer = peer.clone();
        thread::Builder::new()
            .name("telemetry-writer".to_string())
            .spawn(move || write_loop(writer, pending, shutdown, peer))
    };
    let sender = match sender {
        Ok(sender) => sender,
        Err(err) => {
            shutdown.shutdown();
            let _ = control.join();
            return Err(agentbridge_transport::TransportError::Io(err).into());
        }
    };

    Ok(Subscriber {
        peer,
        queue: Some(queue),
        prefixes,
        shutdown,
        threads: vec![control, sender],
    })
}

fn write_loop(
    mut writer: FrameWriter<BridgeStream>,
    pending: Receiver<Bytes>,
    shutdown: ShutdownHandle,
    peer: String,
) {
    for message in pending {
        if let Err(err) = writer.send(TELEMETRY, &message) {
            debug!(%peer, error = %err, "subscriber write failed");
            // A partial frame may be on the wire; the stream is unusable.
            shutdown.shutdown();
            break;
        }
    }
}

fn control_loop(
    mut reader: FrameReader<BridgeStream>,
    prefixes: Arc<Mutex<Vec<String>>>,
    peer: String,
) {
    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => break,
            Err(err) if err.is_timeout() => continue,
            Err(err) => {
                debug!(%peer, error = %err, "control reader stopped");
                break;
            }
        };
        if frame.channel != CONTROL {
            debug!(%peer, channel = frame.channel, "ignoring non-control frame from subscriber");
            continue;
        }
        let message = match ControlMessage::from_slice(&frame.payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(%peer, error = %err, "malformed control message");
                continue;
            }
        };

        let mut prefixes = lock(&prefixes);
        if message.is_subscribe() {
            if !prefixes.contains(&message.topic) {
                prefixes.push(message.topic.clone());
            }
            debug!(%peer, prefix = %message.topic, "subscription added");
        } else if message.is_unsubscribe() {
            prefixes.retain(|prefix| prefix != &message.topic);
            debug!(%peer, prefix = %message.topic, "subscription removed");
        } else {
            warn!(%peer, msg_type = %message.msg_type, "unknown control message type");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::BridgeError;
    use crate::telemetry::{Subscription, TelemetryChannel, TelemetryConfig};

    fn publisher() -> TelemetryPublisher {
        TelemetryPublisher::bind(&Endpoint::new("127.0.0.1", 0)).unwrap()
    }

    fn subscribe(publisher: &TelemetryPublisher, prefix: &str) -> Subscription {
        let config = TelemetryConfig {
            timeout: Duration::from_secs(2),
            ..TelemetryConfig::default()
        };
        TelemetryChannel::connect(publisher.endpoint(), config)
            .unwrap()
            .subscribe(prefix)
            .unwrap()
    }

    #[test]
    fn delivers_to_matching_subscriber_with_seqno() {
        let publisher = publisher();
        let mut sub = subscribe(&publisher, "/agents/1");
        assert!(publisher.wait_for_subscribers(1, Duration::from_secs(2)));

        assert_eq!(publisher.publish("/agents/2/state", &json!({"x": 2})).unwrap(), 0);
        assert_eq!(publisher.publish("/agents/1/state", &json!({"x": 1})).unwrap(), 1);

        let message = sub.receive().unwrap().expect("matching message");
        assert_eq!(message.topic, "/agents/1/state");
        assert_eq!(message.data.get("x"), Some(&json!(1)));
        assert_eq!(message.seqno(), Some(2));
    }

    #[test]
    fn empty_prefix_receives_every_topic() {
        let publisher = publisher();
        let mut sub = subscribe(&publisher, "");
        assert!(publisher.wait_for_subscribers(1, Duration::from_secs(2)));

        publisher.publish("/agents/1/state", &json!({})).unwrap();
        publisher.publish("/agents/2/state", &json!({})).unwrap();

        assert_eq!(sub.receive().unwrap().unwrap().topic, "/agents/1/state");
        assert_eq!(sub.receive().unwrap().unwrap().topic, "/agents/2/state");
    }

    #[test]
    fn subscriber_without_subscription_gets_nothing() {
        let publisher = publisher();
        let channel = TelemetryChannel::connect(
            publisher.endpoint(),
            TelemetryConfig::default(),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while publisher.subscriber_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(publisher.subscriber_count(), 1);
        assert!(!publisher.wait_for_subscribers(1, Duration::from_millis(50)));
        assert_eq!(publisher.publish("/agents/1/state", &json!({})).unwrap(), 0);
        drop(channel);
    }

    #[test]
    fn dead_subscribers_are_pruned() {
        let publisher = publisher();
        let sub = subscribe(&publisher, "");
        assert!(publisher.wait_for_subscribers(1, Duration::from_secs(2)));
        drop(sub);

        let deadline = Instant::now() + Duration::from_secs(2);
        while publisher.subscriber_count() > 0 && Instant::now() < deadline {
            let _ = publisher.publish("/agents/1/state", &json!({}));
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn publish_rejects_brace_in_topic() {
        let publisher = publisher();
        let err = publisher.publish("/bad{", &json!({})).unwrap_err();
        assert!(matches!(err, BridgeError::Envelope(_)));
    }

    #[test]
    fn shutdown_handle_unblocks_subscription() {
        let publisher = publisher();
        let mut sub = subscribe(&publisher, "");
        let handle = sub.shutdown_handle();
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            handle.shutdown();
        });
        assert!(matches!(sub.receive(), Err(BridgeError::Disconnected(_))));
        closer.join().unwrap();
    }

    #[test]
    fn stalled_subscriber_does_not_block_publish() {
        use crate::connection::{FramedConnection, TelemetryTransport};

        let publisher = publisher();
        let mut stalled = FramedConnection::connect(
            publisher.endpoint(),
            Duration::from_secs(2),
            FrameConfig::default(),
        )
        .unwrap();
        stalled.subscribe_hint("").unwrap();
        let mut healthy = subscribe(&publisher, "/agents");
        assert!(publisher.wait_for_subscribers(2, Duration::from_secs(2)));

        let blob = "x".repeat(256 * 1024);
        let started = Instant::now();
        let mut slowest = Duration::ZERO;
        for _ in 0..200 {
            let one = Instant::now();
            publisher.publish("/agents/1/state", &json!({ "blob": blob })).unwrap();
            slowest = slowest.max(one.elapsed());
        }

        assert!(slowest < Duration::from_millis(500), "publish stalled for {slowest:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(publisher.dropped() > 0);

        let first = healthy.receive().unwrap().expect("healthy subscriber still served");
        assert_eq!(first.topic, "/agents/1/state");
        drop(stalled);
    }
}
