//! End-to-end negotiation tests.
//!
//! Two fully wired engines talk to each other over an in-memory signaling
//! channel, with a scripted connector standing in for the network. The
//! tests drive complete flows: session initiate/accept, candidate racing
//! with tie-break arbitration, one-sided connectivity failure, fallback to
//! the in-band transport, transport-kind exhaustion, content add/accept/
//! reject and termination reasons.
//!
//! Each test builds its own engine pair. No shared state, no ordering
//! dependencies.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use parley::signaling::channel::{
    ByteStream, RelayDiscovery, RelayHost, SignalingChannel, SignalingError, SocketConnector,
};
use parley::signaling::message::{
    DescriptionElement, SecurityElement, TransportElement, TransportInfoElement,
};
use parley::transport::candidate::CandidateSet;
use parley::{
    Action, ActionResponse, ContentSpec, Creator, Description, DescriptionAdapter, Direction,
    EndpointId, Engine, EngineConfig, EngineError, EngineEvent, Envelope, FileDescription,
    FileMetadata, Reason, Security, SecurityAdapter, Senders, TransferFailure, TransportKind,
};

// ---------------------------------------------------------------------------
// Test Doubles
// ---------------------------------------------------------------------------

/// Loopback signaling: requests are fed straight into the peer engine and
/// its synchronous response becomes ours.
struct TestChannel {
    peer: OnceLock<Engine>,
    owner: OnceLock<Engine>,
    /// When set, the next outgoing transport-replace first injects this
    /// envelope back into the owner, simulating the peer proposing a
    /// replacement at the same moment.
    counter_replace: StdMutex<Option<Envelope>>,
    counter_result: StdMutex<Option<ActionResponse>>,
}

impl TestChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            peer: OnceLock::new(),
            owner: OnceLock::new(),
            counter_replace: StdMutex::new(None),
            counter_result: StdMutex::new(None),
        })
    }

    fn wire(&self, owner: Engine, peer: Engine) {
        let _ = self.owner.set(owner);
        let _ = self.peer.set(peer);
    }

    fn arm_counter_replace(&self, envelope: Envelope) {
        *self.counter_replace.lock().unwrap() = Some(envelope);
    }

    fn counter_result(&self) -> Option<ActionResponse> {
        self.counter_result.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalingChannel for TestChannel {
    async fn send_request(
        &self,
        _to: &EndpointId,
        envelope: Envelope,
    ) -> Result<ActionResponse, SignalingError> {
        if envelope.action == Action::TransportReplace {
            let counter = self.counter_replace.lock().unwrap().take();
            if let Some(counter) = counter {
                let owner = self.owner.get().expect("channel wired");
                let result = owner
                    .handle_incoming(counter)
                    .await
                    .unwrap_or(ActionResponse::MalformedRequest);
                *self.counter_result.lock().unwrap() = Some(result);
            }
        }
        let peer = self.peer.get().expect("channel wired");
        Ok(peer
            .handle_incoming(envelope)
            .await
            .unwrap_or(ActionResponse::MalformedRequest))
    }

    async fn send_notify(&self, _to: &EndpointId, envelope: Envelope) -> Result<(), SignalingError> {
        let peer = self.peer.get().expect("channel wired");
        let _ = peer.handle_incoming(envelope).await;
        Ok(())
    }
}

type Fabric = Arc<StdMutex<HashMap<(String, u16), mpsc::UnboundedSender<ByteStream>>>>;

/// Scripted connector. Outbound connections succeed only towards addresses
/// this side was allowed to reach; each success creates an in-memory pipe
/// whose far end lands in the target's inbound queue, where `claim_inbound`
/// picks it up.
struct TestConnector {
    fabric: Fabric,
    reachable: StdMutex<HashSet<(String, u16)>>,
    inbound_tx: mpsc::UnboundedSender<ByteStream>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ByteStream>>,
}

impl TestConnector {
    fn new(fabric: Fabric) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            fabric,
            reachable: StdMutex::new(HashSet::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        })
    }

    /// Registers an address this side listens on.
    fn advertise(&self, host: &str, port: u16) {
        self.fabric
            .lock()
            .unwrap()
            .insert((host.to_string(), port), self.inbound_tx.clone());
    }

    /// Allows outbound connections to an address.
    fn allow(&self, host: &str, port: u16) {
        self.reachable.lock().unwrap().insert((host.to_string(), port));
    }
}

#[async_trait]
impl SocketConnector for TestConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        _timeout: Duration,
    ) -> std::io::Result<ByteStream> {
        let key = (host.to_string(), port);
        if !self.reachable.lock().unwrap().contains(&key) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "unreachable in this test",
            ));
        }
        let target = self.fabric.lock().unwrap().get(&key).cloned();
        let (near, far) = tokio::io::duplex(64 * 1024);
        if let Some(target) = target {
            let _ = target.send(Box::new(far));
        }
        Ok(Box::new(near))
    }

    async fn claim_inbound(&self, _stream_id: &str, timeout: Duration) -> std::io::Result<ByteStream> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv())
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no inbound connection"))?
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "fabric closed"))
    }
}

/// Relay discovery that knows no relays and counts activation attempts.
struct NoRelays {
    activations: AtomicUsize,
}

impl NoRelays {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            activations: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RelayDiscovery for NoRelays {
    async fn list_relay_hosts(&self) -> Result<Vec<RelayHost>, SignalingError> {
        Ok(Vec::new())
    }

    async fn activate(
        &self,
        _relay: &EndpointId,
        _stream_id: &str,
        _peer: &EndpointId,
    ) -> Result<(), SignalingError> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        Err(SignalingError::Delivery("no relays in this test".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Peer {
    engine: Engine,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    connector: Arc<TestConnector>,
    channel: Arc<TestChannel>,
    relays: Arc<NoRelays>,
}

/// Opt-in log output for debugging a failing scenario, e.g.
/// `RUST_LOG=parley=debug cargo test`.
fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Builds two wired engines, `a` initiating towards `b`.
fn wire_pair(config_a: EngineConfig, config_b: EngineConfig) -> (Peer, Peer) {
    init_tracing();
    let fabric: Fabric = Arc::new(StdMutex::new(HashMap::new()));

    let channel_a = TestChannel::new();
    let channel_b = TestChannel::new();
    let connector_a = TestConnector::new(Arc::clone(&fabric));
    let connector_b = TestConnector::new(Arc::clone(&fabric));
    let relays_a = NoRelays::new();
    let relays_b = NoRelays::new();

    for (host, port) in &config_a.local_hosts {
        connector_a.advertise(host, *port);
    }
    for (host, port) in &config_b.local_hosts {
        connector_b.advertise(host, *port);
    }

    let (engine_a, events_a) = Engine::new(
        config_a,
        channel_a.clone(),
        connector_a.clone(),
        relays_a.clone(),
    );
    let (engine_b, events_b) = Engine::new(
        config_b,
        channel_b.clone(),
        connector_b.clone(),
        relays_b.clone(),
    );

    channel_a.wire(engine_a.clone(), engine_b.clone());
    channel_b.wire(engine_b.clone(), engine_a.clone());

    (
        Peer {
            engine: engine_a,
            events: events_a,
            connector: connector_a,
            channel: channel_a,
            relays: relays_a,
        },
        Peer {
            engine: engine_b,
            events: events_b,
            connector: connector_b,
            channel: channel_b,
            relays: relays_b,
        },
    )
}

fn config(name: &str, hosts: &[(&str, u16)]) -> EngineConfig {
    let mut config = EngineConfig::new(EndpointId::new(name));
    config.local_hosts = hosts
        .iter()
        .map(|(host, port)| (host.to_string(), *port))
        .collect();
    config
}

fn file_spec(name: &str) -> ContentSpec {
    ContentSpec {
        name: Some(name.to_string()),
        senders: Senders::Both,
        description: Arc::new(FileDescription::new(FileMetadata {
            name: "report.pdf".to_string(),
            size: Some(2048),
            media_type: Some("application/pdf".to_string()),
            hash: None,
        })),
        security: None,
    }
}

/// Waits for the next event matching `pred`, skipping unrelated ones.
async fn wait_for<F, T>(events: &mut mpsc::UnboundedReceiver<EngineEvent>, mut pred: F) -> T
where
    F: FnMut(EngineEvent) -> Option<T>,
{
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        if let Some(value) = pred(event) {
            return value;
        }
    }
}

async fn wait_stream_ready(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    content: &str,
) -> (Direction, ByteStream) {
    let content = content.to_string();
    wait_for(events, move |event| match event {
        EngineEvent::StreamReady {
            content_name,
            direction,
            stream,
            ..
        } if content_name == content => Some((direction, stream)),
        _ => None,
    })
    .await
}

/// Accepts the next offered session at `peer` and returns its id.
async fn accept_offered_session(peer: &mut Peer) -> String {
    let session_id = wait_for(&mut peer.events, |event| match event {
        EngineEvent::SessionOffer { session_id, .. } => Some(session_id),
        _ => None,
    })
    .await;
    peer.engine
        .accept_session(&session_id)
        .await
        .expect("accept session");
    session_id
}

/// Pushes bytes one way and checks they arrive intact.
async fn assert_bytes_flow(from: &mut ByteStream, to: &mut ByteStream, payload: &[u8]) {
    from.write_all(payload).await.expect("write");
    from.flush().await.expect("flush");
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), to.read_exact(&mut buf))
        .await
        .expect("timed out reading")
        .expect("read");
    assert_eq!(buf, payload);
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn direct_race_tie_break_favours_initiator() {
    let (mut a, mut b) = wire_pair(
        config("alice@test/a", &[("10.0.0.1", 7001)]),
        config("bob@test/b", &[("10.0.0.2", 7002)]),
    );
    // Both sides can reach each other: a genuine tie.
    a.connector.allow("10.0.0.2", 7002);
    b.connector.allow("10.0.0.1", 7001);

    a.engine
        .start_session(EndpointId::new("bob@test/b"), vec![file_spec("doc")])
        .await
        .expect("start session");
    accept_offered_session(&mut b).await;

    let (_, mut stream_a) = wait_stream_ready(&mut a.events, "doc").await;
    let (_, mut stream_b) = wait_stream_ready(&mut b.events, "doc").await;

    // Both nominations carry the fixed direct priority; the initiator's
    // choice (bob's candidate) wins and the same pipe backs both ends.
    assert_bytes_flow(&mut stream_a, &mut stream_b, b"hello from alice").await;
    assert_bytes_flow(&mut stream_b, &mut stream_a, b"hello from bob").await;

    // A direct winner never touches a relay.
    assert_eq!(a.relays.activations.load(Ordering::SeqCst), 0);
    assert_eq!(b.relays.activations.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_sided_failure_resolves_to_the_reachable_candidate() {
    let (mut a, mut b) = wire_pair(
        config("alice@test/a", &[("10.0.0.1", 7001)]),
        config("bob@test/b", &[("10.0.0.2", 7002)]),
    );
    // Only alice can connect out; bob's probe of alice's candidate fails.
    a.connector.allow("10.0.0.2", 7002);

    a.engine
        .start_session(EndpointId::new("bob@test/b"), vec![file_spec("doc")])
        .await
        .expect("start session");
    accept_offered_session(&mut b).await;

    let (_, mut stream_a) = wait_stream_ready(&mut a.events, "doc").await;
    let (_, mut stream_b) = wait_stream_ready(&mut b.events, "doc").await;

    assert_bytes_flow(&mut stream_a, &mut stream_b, b"one way in").await;
    assert_bytes_flow(&mut stream_b, &mut stream_a, b"and back out").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_transports_terminate_with_failed_transport() {
    // No reachable candidates anywhere and no fallback registered.
    let mut config_a = config("alice@test/a", &[]);
    config_a.inband_fallback = false;
    let mut config_b = config("bob@test/b", &[]);
    config_b.inband_fallback = false;
    let (mut a, mut b) = wire_pair(config_a, config_b);

    a.engine
        .start_session(EndpointId::new("bob@test/b"), vec![file_spec("doc")])
        .await
        .expect("start session");
    accept_offered_session(&mut b).await;

    let failure = wait_for(&mut a.events, |event| match event {
        EngineEvent::TransferFailed { failure, .. } => Some(failure),
        _ => None,
    })
    .await;
    assert!(matches!(failure, TransferFailure::NoTransportAvailable));

    let reason_a = wait_for(&mut a.events, |event| match event {
        EngineEvent::SessionEnded { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason_a, Reason::FailedTransport);

    // The in-flight transfer on the receiving side fails with the peer's
    // reason, then the session ends.
    let failure_b = wait_for(&mut b.events, |event| match event {
        EngineEvent::TransferFailed { failure, .. } => Some(failure),
        _ => None,
    })
    .await;
    assert!(matches!(
        failure_b,
        TransferFailure::PeerTerminated(Reason::FailedTransport)
    ));

    let reason_b = wait_for(&mut b.events, |event| match event {
        EngineEvent::SessionEnded { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason_b, Reason::FailedTransport);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socket_failure_falls_back_to_in_band() {
    // No reachable candidates, but the in-band fallback stays registered.
    let (mut a, mut b) = wire_pair(config("alice@test/a", &[]), config("bob@test/b", &[]));

    a.engine
        .start_session(EndpointId::new("bob@test/b"), vec![file_spec("doc")])
        .await
        .expect("start session");
    accept_offered_session(&mut b).await;

    let (_, mut stream_a) = wait_stream_ready(&mut a.events, "doc").await;
    let (_, mut stream_b) = wait_stream_ready(&mut b.events, "doc").await;

    // The payload rides the signaling channel as sequenced chunks.
    assert_bytes_flow(&mut stream_a, &mut stream_b, b"tunneled through signaling").await;
    assert_bytes_flow(&mut stream_b, &mut stream_a, b"and acknowledged back").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simultaneous_transport_replace_loses_the_tie_break() {
    let (mut a, mut b) = wire_pair(config("alice@test/a", &[]), config("bob@test/b", &[]));

    a.engine
        .start_session(EndpointId::new("bob@test/b"), vec![file_spec("doc")])
        .await
        .expect("start session");
    let session_id = accept_offered_session(&mut b).await;

    // While alice's own transport-replace is in flight, a replace from the
    // peer arrives. Alice already has a replacement pending, so she answers
    // tie-break and her proposal stands.
    let counter = Envelope::transport_replace(
        &session_id,
        Creator::Initiator,
        "doc",
        TransportElement {
            kind: TransportKind::in_band(),
            stream_id: "peer-proposal".to_string(),
            candidates: CandidateSet::new(),
            info: None,
            block_size: Some(4096),
        },
    );
    a.channel.arm_counter_replace(counter);

    // The sockets fail immediately (no candidates), so alice proposes the
    // in-band replacement, which triggers the armed counter-proposal.
    let (_, mut stream_a) = wait_stream_ready(&mut a.events, "doc").await;
    let (_, mut stream_b) = wait_stream_ready(&mut b.events, "doc").await;

    assert_eq!(a.channel.counter_result(), Some(ActionResponse::TieBreak));
    assert_bytes_flow(&mut stream_a, &mut stream_b, b"winner takes the stream").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn content_add_accept_and_reject() {
    let (mut a, mut b) = wire_pair(config("alice@test/a", &[]), config("bob@test/b", &[]));

    a.engine
        .start_session(EndpointId::new("bob@test/b"), vec![file_spec("doc")])
        .await
        .expect("start session");
    let session_id = accept_offered_session(&mut b).await;

    // Drain the first content's establishment on both sides.
    let _ = wait_stream_ready(&mut a.events, "doc").await;
    let _ = wait_stream_ready(&mut b.events, "doc").await;

    // A second content, offered mid-session and accepted.
    let name = a
        .engine
        .add_content(&session_id, file_spec("extra"))
        .await
        .expect("add content");
    assert_eq!(name, "extra");

    let offered = wait_for(&mut b.events, |event| match event {
        EngineEvent::ContentOffer {
            content_name,
            description_kind,
            ..
        } => Some((content_name, description_kind)),
        _ => None,
    })
    .await;
    assert_eq!(offered, ("extra".to_string(), "file".to_string()));

    b.engine
        .accept_content(&session_id, "extra")
        .await
        .expect("accept content");
    let (_, mut stream_a) = wait_stream_ready(&mut a.events, "extra").await;
    let (_, mut stream_b) = wait_stream_ready(&mut b.events, "extra").await;
    assert_bytes_flow(&mut stream_a, &mut stream_b, b"second content").await;

    // A third content, offered and declined.
    a.engine
        .add_content(&session_id, file_spec("unwanted"))
        .await
        .expect("add content");
    wait_for(&mut b.events, |event| match event {
        EngineEvent::ContentOffer { content_name, .. } if content_name == "unwanted" => Some(()),
        _ => None,
    })
    .await;
    b.engine
        .reject_content(&session_id, "unwanted")
        .await
        .expect("reject content");

    let removed = wait_for(&mut a.events, |event| match event {
        EngineEvent::ContentRemoved { content_name, .. } => Some(content_name),
        _ => None,
    })
    .await;
    assert_eq!(removed, "unwanted");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_terminate_reaches_the_peer_with_its_reason() {
    let (mut a, mut b) = wire_pair(config("alice@test/a", &[]), config("bob@test/b", &[]));

    a.engine
        .start_session(EndpointId::new("bob@test/b"), vec![file_spec("doc")])
        .await
        .expect("start session");
    let session_id = accept_offered_session(&mut b).await;

    let _ = wait_stream_ready(&mut a.events, "doc").await;
    let _ = wait_stream_ready(&mut b.events, "doc").await;

    a.engine
        .terminate_session(&session_id, Reason::Success)
        .await
        .expect("terminate");

    // A success terminate completes the in-flight transfer on both sides
    // before the session-ended report.
    let completed_a = wait_for(&mut a.events, |event| match event {
        EngineEvent::TransferCompleted { content_name, .. } => Some(content_name),
        _ => None,
    })
    .await;
    assert_eq!(completed_a, "doc");

    let completed_b = wait_for(&mut b.events, |event| match event {
        EngineEvent::TransferCompleted { content_name, .. } => Some(content_name),
        _ => None,
    })
    .await;
    assert_eq!(completed_b, "doc");

    let reason_b = wait_for(&mut b.events, |event| match event {
        EngineEvent::SessionEnded { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason_b, Reason::Success);

    let reason_a = wait_for(&mut a.events, |event| match event {
        EngineEvent::SessionEnded { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason_a, Reason::Success);

    // The session is gone on both sides.
    assert!(matches!(
        a.engine.terminate_session(&session_id, Reason::Cancel).await,
        Err(parley::EngineError::UnknownSession(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_description_declines_the_session() {
    struct BlobDescription;

    #[async_trait]
    impl Description for BlobDescription {
        fn kind(&self) -> String {
            "blob".to_string()
        }

        fn element(&self) -> parley::signaling::message::DescriptionElement {
            parley::signaling::message::DescriptionElement {
                kind: "blob".to_string(),
                payload: serde_json::Value::Null,
            }
        }

        async fn on_stream_ready(
            &self,
            _direction: Direction,
            _stream: ByteStream,
            _ctx: parley::transport::NegotiationCtx,
        ) {
        }
    }

    let (mut a, mut b) = wire_pair(config("alice@test/a", &[]), config("bob@test/b", &[]));

    // Bob has no adapter for "blob", so the offer is declined with
    // unsupported-applications rather than torn down as a violation.
    a.engine
        .start_session(
            EndpointId::new("bob@test/b"),
            vec![ContentSpec {
                name: Some("mystery".to_string()),
                senders: Senders::Both,
                description: Arc::new(BlobDescription),
                security: None,
            }],
        )
        .await
        .expect("start session");

    let reason = wait_for(&mut a.events, |event| match event {
        EngineEvent::SessionEnded { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, Reason::UnsupportedApplications);

    // Bob never saw a session offer.
    assert!(b.events.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_security_layer_fails_the_transfer() {
    /// Refuses every handshake, on either side of the stream.
    struct RefusingSecurity;

    #[async_trait]
    impl Security for RefusingSecurity {
        fn kind(&self) -> String {
            "refuse".to_string()
        }

        fn element(&self) -> SecurityElement {
            SecurityElement {
                kind: "refuse".to_string(),
                payload: serde_json::Value::Null,
            }
        }

        async fn protect_outgoing(&self, _stream: ByteStream) -> Result<ByteStream, EngineError> {
            Err(EngineError::SecurityFailed("handshake refused".to_string()))
        }

        async fn protect_incoming(&self, _stream: ByteStream) -> Result<ByteStream, EngineError> {
            Err(EngineError::SecurityFailed("handshake refused".to_string()))
        }
    }

    struct RefusingAdapter;

    impl SecurityAdapter for RefusingAdapter {
        fn kind(&self) -> String {
            "refuse".to_string()
        }

        fn from_element(&self, _element: &SecurityElement) -> Result<Arc<dyn Security>, EngineError> {
            Ok(Arc::new(RefusingSecurity))
        }
    }

    let (mut a, mut b) = wire_pair(config("alice@test/a", &[]), config("bob@test/b", &[]));
    a.engine.register_security(Arc::new(RefusingAdapter));
    b.engine.register_security(Arc::new(RefusingAdapter));

    let mut spec = file_spec("doc");
    spec.security = Some(Arc::new(RefusingSecurity));
    a.engine
        .start_session(EndpointId::new("bob@test/b"), vec![spec])
        .await
        .expect("start session");
    accept_offered_session(&mut b).await;

    // The stream itself establishes (in-band fallback), but the protection
    // handshake fails on both sides. The session stays up.
    let failure_a = wait_for(&mut a.events, |event| match event {
        EngineEvent::TransferFailed { failure, .. } => Some(failure),
        _ => None,
    })
    .await;
    assert!(matches!(
        failure_a,
        TransferFailure::Security(detail) if detail.contains("handshake refused")
    ));

    let failure_b = wait_for(&mut b.events, |event| match event {
        EngineEvent::TransferFailed { failure, .. } => Some(failure),
        _ => None,
    })
    .await;
    assert!(matches!(failure_b, TransferFailure::Security(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn descriptions_report_transfer_progress() {
    /// Reports a fixed byte count instead of surfacing the stream.
    struct MeterDescription;

    #[async_trait]
    impl Description for MeterDescription {
        fn kind(&self) -> String {
            "meter".to_string()
        }

        fn element(&self) -> DescriptionElement {
            DescriptionElement {
                kind: "meter".to_string(),
                payload: serde_json::Value::Null,
            }
        }

        async fn on_stream_ready(
            &self,
            _direction: Direction,
            _stream: ByteStream,
            ctx: parley::transport::NegotiationCtx,
        ) {
            ctx.report_progress(2048);
        }
    }

    struct MeterAdapter;

    impl DescriptionAdapter for MeterAdapter {
        fn kind(&self) -> String {
            "meter".to_string()
        }

        fn from_element(
            &self,
            _element: &DescriptionElement,
        ) -> Result<Arc<dyn Description>, EngineError> {
            Ok(Arc::new(MeterDescription))
        }
    }

    let (mut a, mut b) = wire_pair(config("alice@test/a", &[]), config("bob@test/b", &[]));
    a.engine.register_description(Arc::new(MeterAdapter));
    b.engine.register_description(Arc::new(MeterAdapter));

    a.engine
        .start_session(
            EndpointId::new("bob@test/b"),
            vec![ContentSpec {
                name: Some("metered".to_string()),
                senders: Senders::Both,
                description: Arc::new(MeterDescription),
                security: None,
            }],
        )
        .await
        .expect("start session");
    accept_offered_session(&mut b).await;

    let progress_a = wait_for(&mut a.events, |event| match event {
        EngineEvent::TransferProgress {
            content_name,
            bytes_transferred,
            ..
        } => Some((content_name, bytes_transferred)),
        _ => None,
    })
    .await;
    assert_eq!(progress_a, ("metered".to_string(), 2048));

    let progress_b = wait_for(&mut b.events, |event| match event {
        EngineEvent::TransferProgress { bytes_transferred, .. } => Some(bytes_transferred),
        _ => None,
    })
    .await;
    assert_eq!(progress_b, 2048);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn actions_for_unaccepted_contents_report_item_not_found() {
    let (mut a, mut b) = wire_pair(config("alice@test/a", &[]), config("bob@test/b", &[]));

    a.engine
        .start_session(EndpointId::new("bob@test/b"), vec![file_spec("doc")])
        .await
        .expect("start session");
    let session_id = accept_offered_session(&mut b).await;

    let _ = wait_stream_ready(&mut a.events, "doc").await;
    let _ = wait_stream_ready(&mut b.events, "doc").await;

    // "later" sits in bob's proposed set, offered but not yet accepted.
    a.engine
        .add_content(&session_id, file_spec("later"))
        .await
        .expect("add content");
    wait_for(&mut b.events, |event| match event {
        EngineEvent::ContentOffer { content_name, .. } if content_name == "later" => Some(()),
        _ => None,
    })
    .await;

    // A content-scoped action for it has no negotiation to route to. That is
    // item-not-found, not a violation and not a session teardown.
    let info = Envelope::transport_info(
        &session_id,
        Creator::Initiator,
        "later",
        TransportElement::info(
            TransportKind::socket(),
            "stray-stream",
            TransportInfoElement::CandidateError,
        ),
    );
    let response = b.engine.handle_incoming(info).await.expect("handle");
    assert_eq!(response, ActionResponse::ItemNotFound);

    // The session survived and the offer is still acceptable.
    b.engine
        .accept_content(&session_id, "later")
        .await
        .expect("accept content");
    let _ = wait_stream_ready(&mut a.events, "later").await;
    let _ = wait_stream_ready(&mut b.events, "later").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn messages_for_unknown_sessions_are_answered_not_dropped() -> anyhow::Result<()> {
    let (a, _b) = wire_pair(config("alice@test/a", &[]), config("bob@test/b", &[]));

    let envelope = Envelope::session_terminate("no-such-session", Reason::Cancel);
    let response = a.engine.handle_incoming(envelope).await?;
    assert_eq!(response, ActionResponse::UnknownSession);

    let info = Envelope::session_terminate("another-ghost", Reason::Success);
    assert_eq!(a.engine.handle_incoming(info).await?, ActionResponse::UnknownSession);
    Ok(())
}
