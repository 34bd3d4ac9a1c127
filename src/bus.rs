//! ==============================================================================
//! bus.rs - mqtt session manager
//! ==============================================================================
//!
//! purpose:
//!     owns the only connection to the broker. it connects, subscribes to the
//!     telemetry topic, reconnects with backoff when the transport fails, and
//!     feeds every delivered message to the decoder.
//!
//! state machine:
//!
//!     Disconnected ──poll──> Connecting ──CONNACK──> Connected
//!          ^                     │                       │
//!          └──── transport error ┴───────────────────────┘
//!
//!     after a failure the session sleeps for the backoff delay and polls
//!     again (rumqttc reconnects on the next poll). if `max_attempts`
//!     consecutive attempts fail the loop returns and the bridge keeps
//!     serving stale/default data.
//!
//! threading:
//!     - BusSession owns the rumqttc EventLoop and runs on its own tokio task.
//!     - BusHandle is a cheap clone handed to http handlers. publishing goes
//!       through the client's request queue and never waits on the network.
//!
//! relationships:
//!     - used by: main.rs (spawns run(), keeps the handle)
//!     - calls: decoder.rs (ingest)
//!     - implements: publisher.rs CommandSink
//!
//! ==============================================================================

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::ReadingCache;
use crate::config::{BridgeConfig, BrokerConfig, ReconnectConfig};
use crate::decoder;
use crate::error::PublishError;
use crate::publisher::CommandSink;

/// capacity of the client -> event loop request queue
const REQUEST_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

// ==============================================================================
// reconnect policy
// ==============================================================================

/// bounded exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
    max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn new(initial: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        Self { initial, max, max_attempts }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }

    /// delay before retrying after the `attempt`-th consecutive failure
    /// (1-based), or None once the attempts are used up
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        Some(self.initial.saturating_mul(1 << exponent).min(self.max))
    }
}

// ==============================================================================
// session
// ==============================================================================

/// what one poll of the event loop amounted to
enum SessionEvent {
    Connected,
    Message(Publish),
    Idle,
    Failed(ConnectionError),
}

pub struct BusSession {
    client: AsyncClient,
    eventloop: EventLoop,
    telemetry_topic: String,
    policy: ReconnectPolicy,
    state: watch::Sender<SessionState>,
    show_sensor_data: bool,
}

/// thread-safe publish entry point into the session
#[derive(Clone)]
pub struct BusHandle {
    client: AsyncClient,
    state: watch::Receiver<SessionState>,
}

/// mqtt options for the broker section; nothing touches the network yet
pub fn mqtt_options(broker: &BrokerConfig) -> MqttOptions {
    let client_id = broker.client_id.clone().unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("bloom-bridge-{}", &id[..8])
    });
    let mut options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
    options.set_keep_alive(Duration::from_secs(broker.keep_alive_seconds));
    options.set_clean_session(true);
    // larger frames fail the whole connection inside rumqttc, not just the message
    options.set_max_packet_size(broker.max_packet_bytes, broker.max_packet_bytes);
    options
}

impl BusSession {
    /// set up the session in the Disconnected state; the first poll in
    /// `run` opens the connection
    pub fn new(config: &BridgeConfig) -> (Self, BusHandle) {
        let options = mqtt_options(&config.broker);
        info!(
            client_id = %options.client_id(),
            broker = %format!("{}:{}", config.broker.host, config.broker.port),
            "mqtt session created"
        );
        let (client, eventloop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);
        let (state, state_rx) = watch::channel(SessionState::Disconnected);

        let handle = BusHandle { client: client.clone(), state: state_rx };
        let session = Self {
            client,
            eventloop,
            telemetry_topic: config.topics.telemetry.clone(),
            policy: ReconnectPolicy::from_config(&config.reconnect),
            state,
            show_sensor_data: config.logging.show_sensor_data,
        };
        (session, handle)
    }

    /// receive loop; only returns once the reconnect policy gives up
    pub async fn run(mut self, cache: ReadingCache) {
        let mut failures: u32 = 0;

        loop {
            if *self.state.borrow() == SessionState::Disconnected {
                self.set_state(SessionState::Connecting);
            }

            match self.next_event().await {
                SessionEvent::Connected => {
                    failures = 0;
                    self.set_state(SessionState::Connected);
                    self.subscribe();
                }
                SessionEvent::Message(publish) => {
                    apply_telemetry(&cache, publish, self.show_sensor_data).await
                }
                SessionEvent::Idle => {}
                SessionEvent::Failed(e) => {
                    self.set_state(SessionState::Disconnected);
                    failures += 1;
                    match self.policy.delay_for(failures) {
                        Some(delay) => {
                            warn!(
                                error = %e,
                                attempt = failures,
                                retry_in_ms = delay.as_millis() as u64,
                                "mqtt connection failed"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            error!(error = %e, attempts = failures, "mqtt connection failed, giving up");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn next_event(&mut self) -> SessionEvent {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => SessionEvent::Connected,
            Ok(Event::Incoming(Packet::Publish(publish))) => SessionEvent::Message(publish),
            Ok(_) => SessionEvent::Idle,
            Err(e) => SessionEvent::Failed(e),
        }
    }

    /// clean sessions drop subscriptions, so this runs after every CONNACK.
    /// try_subscribe: awaiting here would stall the loop that drains the queue
    fn subscribe(&self) {
        match self.client.try_subscribe(self.telemetry_topic.as_str(), QoS::AtMostOnce) {
            Ok(()) => info!(topic = %self.telemetry_topic, "subscribed to telemetry"),
            Err(e) => error!(topic = %self.telemetry_topic, error = %e, "subscribe failed"),
        }
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(from = ?*current, to = ?next, "mqtt session state");
            *current = next;
            true
        });
    }
}

/// one delivered publish; holds no reference to the session so the
/// `run` future stays `Send` across the cache write
async fn apply_telemetry(cache: &ReadingCache, publish: Publish, show_sensor_data: bool) {
    match decoder::ingest(cache, &publish.payload).await {
        Ok(s) if show_sensor_data => info!(
            humidity = s.humidity,
            temperature = s.temperature,
            light = s.light_level,
            valve = s.valve.as_str(),
            "telemetry update"
        ),
        Ok(s) => debug!(topic = %publish.topic, ?s, "telemetry update"),
        Err(e) => warn!(
            topic = %publish.topic,
            bytes = publish.payload.len(),
            error = %e,
            "dropping telemetry message"
        ),
    }
}

impl BusHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// watch the session state (used by GET /status)
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// queue an mqtt DISCONNECT; best effort during shutdown
    pub fn shutdown(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "disconnect not queued");
        }
    }
}

impl CommandSink for BusHandle {
    /// fails fast unless connected; otherwise only enqueues, never waits
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        if self.state() != SessionState::Connected {
            return Err(PublishError::NotConnected);
        }
        self.client.try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())?;
        Ok(())
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const TOPIC: &str = "HackViolet/AdamW/sensors";
    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    /// qos 0 PUBLISH frame
    fn publish_frame(payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(TOPIC.len() as u16).to_be_bytes());
        body.extend_from_slice(TOPIC.as_bytes());
        body.extend_from_slice(payload);

        let mut frame = vec![0x30];
        let mut remaining = body.len();
        loop {
            let mut byte = (remaining % 128) as u8;
            remaining /= 128;
            if remaining > 0 {
                byte |= 0x80;
            }
            frame.push(byte);
            if remaining == 0 {
                break;
            }
        }
        frame.extend(body);
        frame
    }

    /// loopback broker: answers the n-th connection's CONNECT with a CONNACK
    /// and then writes `scripts[n]`; returns the port and an accept counter
    async fn loopback_broker(scripts: Vec<Vec<Vec<u8>>>) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            let mut scripts = scripts.into_iter();
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let frames = scripts.next().unwrap_or_default();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    if stream.read(&mut buf).await.unwrap_or(0) == 0 {
                        return;
                    }
                    stream.write_all(&CONNACK).await.ok();
                    for frame in frames {
                        if stream.write_all(&frame).await.is_err() {
                            return;
                        }
                    }
                    // keep the socket open until the client hangs up
                    while stream.read(&mut buf).await.map(|n| n > 0).unwrap_or(false) {}
                });
            }
        });

        (port, accepted)
    }

    fn local_config(port: u16, max_attempts: Option<u32>) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.broker.host = "127.0.0.1".to_string();
        config.broker.port = port;
        config.broker.client_id = Some("bloom-test".to_string());
        config.reconnect =
            ReconnectConfig { initial_delay_ms: 10, max_delay_ms: 50, max_attempts };
        config
    }

    async fn wait_for_humidity(cache: &ReadingCache, expected: f64) -> bool {
        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.get().await.humidity != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    fn handle_in(state: SessionState) -> (BusHandle, EventLoop, watch::Sender<SessionState>) {
        let (client, eventloop) =
            AsyncClient::new(MqttOptions::new("bloom-test", "localhost", 1883), 4);
        let (tx, rx) = watch::channel(state);
        (BusHandle { client, state: rx }, eventloop, tx)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy =
            ReconnectPolicy::new(Duration::from_millis(500), Duration::from_secs(4), None);
        let delays: Vec<_> = (1..=6).map(|n| policy.delay_for(n).unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
        // no overflow far down the schedule
        assert_eq!(policy.delay_for(u32::MAX), Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_backoff_gives_up_after_max_attempts() {
        let policy =
            ReconnectPolicy::new(Duration::from_millis(100), Duration::from_secs(1), Some(3));
        assert!(policy.delay_for(1).is_some());
        assert!(policy.delay_for(2).is_some());
        assert_eq!(policy.delay_for(3), None);
        assert_eq!(policy.delay_for(4), None);
    }

    #[test]
    fn test_policy_from_config() {
        let policy = ReconnectPolicy::from_config(&ReconnectConfig::default());
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(10), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_mqtt_options() {
        let broker = BrokerConfig {
            client_id: Some("greenhouse-1".to_string()),
            keep_alive_seconds: 45,
            ..BrokerConfig::default()
        };
        let options = mqtt_options(&broker);
        assert_eq!(options.client_id(), "greenhouse-1");
        assert_eq!(options.broker_address(), ("test.mosquitto.org".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(45));

        let generated = mqtt_options(&BrokerConfig::default()).client_id();
        assert!(generated.starts_with("bloom-bridge-"));
        assert_eq!(generated.len(), "bloom-bridge-".len() + 8);
    }

    #[tokio::test]
    async fn test_new_session_starts_disconnected() {
        let (_session, handle) = BusSession::new(&BridgeConfig::default());
        assert_eq!(handle.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_fails_fast_when_not_connected() {
        for state in [SessionState::Disconnected, SessionState::Connecting] {
            let (handle, _eventloop, _tx) = handle_in(state);
            let result = handle.publish("garden/commands", b"WATER_NOW");
            assert!(matches!(result, Err(PublishError::NotConnected)));
        }
    }

    #[tokio::test]
    async fn test_publish_queues_when_connected() {
        let (handle, _eventloop, tx) = handle_in(SessionState::Connected);
        handle.publish("garden/commands", b"WATER_NOW").unwrap();

        tx.send_replace(SessionState::Disconnected);
        assert!(matches!(
            handle.publish("garden/commands", b"WATER_NOW"),
            Err(PublishError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_publish_reports_transport_error_when_loop_is_gone() {
        let (handle, eventloop, _tx) = handle_in(SessionState::Connected);
        drop(eventloop);
        assert!(matches!(
            handle.publish("garden/commands", b"WATER_NOW"),
            Err(PublishError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_receive_loop_skips_bad_messages() {
        let oversized_object = format!(r#"{{"humidity":22,"note":"{}"}}"#, "x".repeat(20_000));
        let (port, accepted) = loopback_broker(vec![vec![
            publish_frame(br#"{"humidity":11}"#),
            publish_frame(b"garbage"),
            publish_frame(&vec![b'#'; 20_000]),
            publish_frame(oversized_object.as_bytes()),
            publish_frame(br#"{"humidity":33,"temp":20,"valve":"open"}"#),
        ]])
        .await;

        let cache = ReadingCache::new();
        let (session, handle) = BusSession::new(&local_config(port, None));
        let task = tokio::spawn(session.run(cache.clone()));

        assert!(wait_for_humidity(&cache, 33.0).await);
        let current = cache.get().await;
        assert_eq!(current.temperature, 20.0);
        assert_eq!(current.valve, crate::domain::ValveState::Open);
        assert_eq!(handle.state(), SessionState::Connected);
        assert_eq!(accepted.load(Ordering::SeqCst), 1, "session should not reconnect");

        // the live session accepts commands
        handle.publish("HackViolet/AdamW/commands", b"WATER_NOW").unwrap();
        task.abort();
    }

    #[tokio::test]
    async fn test_frame_over_limit_reconnects() {
        let (port, accepted) = loopback_broker(vec![
            vec![publish_frame(&vec![b'#'; 4096]), publish_frame(br#"{"humidity":11}"#)],
            vec![publish_frame(br#"{"humidity":44}"#)],
        ])
        .await;

        let mut config = local_config(port, None);
        config.broker.max_packet_bytes = 1024;
        let cache = ReadingCache::new();
        let (session, handle) = BusSession::new(&config);
        let task = tokio::spawn(session.run(cache.clone()));

        assert!(wait_for_humidity(&cache, 44.0).await);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(handle.state(), SessionState::Connected);
        task.abort();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        // grab a free port, then close it so every connect is refused
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (session, handle) = BusSession::new(&local_config(port, Some(3)));
        let task = tokio::spawn(session.run(ReadingCache::new()));

        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("run() should return once attempts are used up")
            .unwrap();
        assert_eq!(handle.state(), SessionState::Disconnected);
        assert!(matches!(
            handle.publish("HackViolet/AdamW/commands", b"WATER_NOW"),
            Err(PublishError::NotConnected)
        ));
    }
}
