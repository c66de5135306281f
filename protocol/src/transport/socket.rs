//! Candidate-racing socket transport.
//!
//! Both sides advertise connection candidates (direct hosts first, relays
//! last), probe each other's offers concurrently and nominate the candidate
//! they reached. Arbitration then picks a single winner:
//!
//! - only one side connected anywhere: its nomination wins;
//! - both connected: the higher-priority nomination wins;
//! - equal priority: the initiator's nomination wins;
//! - neither connected: the transport has failed (reported exactly once).
//!
//! When the winner is a relay candidate, the side that advertised the relay
//! activates it and confirms with a `candidate-activated` notification; the
//! other side holds its outbound socket until that confirmation arrives.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config;
use crate::error::EngineError;
use crate::signaling::channel::{ByteStream, RelayDiscovery};
use crate::signaling::message::{ActionResponse, TransportElement, TransportInfoElement};
use crate::transport::candidate::{Candidate, CandidateKind, CandidateSet};
use crate::transport::{Direction, NegotiationCtx, Transport, TransportKind, TransportManager};

// ---------------------------------------------------------------------------
// Arbitration
// ---------------------------------------------------------------------------

/// The winning nomination of one racing round.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Winner {
    /// Our nomination won: the peer-offered candidate we connected to.
    Ours(Candidate),
    /// The peer's nomination won: our advertised candidate it connected to.
    Theirs(Candidate),
}

/// Picks the winning nomination once both sides' outcomes are known.
///
/// `ours` is the peer candidate we reached (if any), `theirs` is our
/// candidate the peer reached (if any). Returns `None` when both sides
/// failed everywhere.
fn arbitrate(ours: Option<&Candidate>, theirs: Option<&Candidate>, is_initiator: bool) -> Option<Winner> {
    match (ours, theirs) {
        (None, None) => None,
        (Some(c), None) => Some(Winner::Ours(c.clone())),
        (None, Some(c)) => Some(Winner::Theirs(c.clone())),
        (Some(our), Some(their)) => {
            if our.priority > their.priority {
                Some(Winner::Ours(our.clone()))
            } else if their.priority > our.priority {
                Some(Winner::Theirs(their.clone()))
            } else if is_initiator {
                // Equal priority: the initiator's nomination prevails, so
                // both sides converge on the same candidate.
                Some(Winner::Ours(our.clone()))
            } else {
                Some(Winner::Theirs(their.clone()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Race State
// ---------------------------------------------------------------------------

/// Mutable state of one racing round. Guarded by the transport's mutex;
/// never held across an await.
#[derive(Default)]
struct RaceState {
    /// Our advertised candidates.
    local: CandidateSet,
    /// The peer's advertised candidates, in its preference order.
    remote: CandidateSet,
    /// The peer candidate we connected to (our nomination).
    connected: Option<Candidate>,
    /// Our candidate the peer connected to (its nomination).
    peer_used: Option<Candidate>,
    /// We exhausted the peer's candidates without connecting.
    our_failed: bool,
    /// The peer reported exhausting our candidates.
    peer_failed: bool,
    /// The outbound socket backing `connected`, held until arbitration.
    socket: Option<ByteStream>,
    started: bool,
    resolved: bool,
    delivered: bool,
    failed: bool,
}

impl RaceState {
    fn our_outcome_known(&self) -> bool {
        self.connected.is_some() || self.our_failed
    }

    fn peer_outcome_known(&self) -> bool {
        self.peer_used.is_some() || self.peer_failed
    }

    /// Runs arbitration once both outcomes are known. Resolves at most
    /// once: repeated outcome notifications after resolution (a duplicate
    /// candidate-error, a late nomination) return `NotYet`.
    fn resolve(&mut self, is_initiator: bool) -> Resolution {
        if self.resolved || !self.our_outcome_known() || !self.peer_outcome_known() {
            return Resolution::NotYet;
        }
        self.resolved = true;
        match arbitrate(self.connected.as_ref(), self.peer_used.as_ref(), is_initiator) {
            None => Resolution::BothFailed,
            Some(Winner::Ours(candidate)) => {
                if candidate.kind == CandidateKind::Proxy {
                    Resolution::AwaitActivation
                } else {
                    match self.socket.take() {
                        Some(stream) => Resolution::DeliverOutbound(stream),
                        None => Resolution::BothFailed,
                    }
                }
            }
            Some(Winner::Theirs(candidate)) => {
                if candidate.kind == CandidateKind::Proxy {
                    Resolution::ActivateOurRelay(candidate)
                } else {
                    Resolution::ClaimInbound
                }
            }
        }
    }
}

/// What `try_resolve` decided, computed under the lock and acted on after
/// releasing it.
enum Resolution {
    /// One side's outcome is still unknown.
    NotYet,
    /// Both sides failed everywhere.
    BothFailed,
    /// Our outbound socket is the stream; hand it over now.
    DeliverOutbound(ByteStream),
    /// We connected to the peer's relay; wait for its candidate-activated.
    AwaitActivation,
    /// Our relay candidate won; activate it and confirm to the peer.
    ActivateOurRelay(Candidate),
    /// Our direct candidate won; claim the peer's inbound connection.
    ClaimInbound,
}

// ---------------------------------------------------------------------------
// Socket Transport
// ---------------------------------------------------------------------------

struct Race {
    stream_id: String,
    state: Mutex<RaceState>,
    abandon_tx: watch::Sender<bool>,
}

/// One live socket negotiation for one content.
pub struct SocketTransport {
    race: Arc<Race>,
}

impl SocketTransport {
    fn new(stream_id: String, local: CandidateSet) -> Self {
        let (abandon_tx, _) = watch::channel(false);
        Self {
            race: Arc::new(Race {
                stream_id,
                state: Mutex::new(RaceState {
                    local,
                    ..RaceState::default()
                }),
                abandon_tx,
            }),
        }
    }
}

impl Race {
    /// Probes the peer's candidates sequentially, in the peer's order, then
    /// nominates or reports exhaustion.
    async fn run_race(self: Arc<Self>, ctx: NegotiationCtx) {
        let remote: Vec<Candidate> = {
            let state = self.state.lock();
            state.remote.iter().cloned().collect()
        };
        let mut abandon_rx = self.abandon_tx.subscribe();

        for candidate in remote {
            if *abandon_rx.borrow() {
                return;
            }
            debug!(
                stream_id = %self.stream_id,
                candidate = %candidate.id,
                host = %candidate.host,
                port = candidate.port,
                "probing peer candidate"
            );
            let attempt = ctx.core.connector.connect(
                &candidate.host,
                candidate.port,
                config::CANDIDATE_CONNECT_TIMEOUT,
            );
            let stream = tokio::select! {
                _ = abandon_rx.changed() => return,
                result = attempt => match result {
                    Ok(stream) => stream,
                    Err(error) => {
                        debug!(
                            stream_id = %self.stream_id,
                            candidate = %candidate.id,
                            %error,
                            "candidate probe failed"
                        );
                        continue;
                    }
                },
            };

            {
                let mut state = self.state.lock();
                if state.resolved || state.delivered {
                    return;
                }
                state.connected = Some(candidate.clone());
                state.socket = Some(stream);
            }
            ctx.send_info_notify(TransportInfoElement::CandidateUsed {
                candidate_id: candidate.id.clone(),
            })
            .await;
            self.try_resolve(&ctx).await;
            return;
        }

        {
            let mut state = self.state.lock();
            if state.resolved {
                return;
            }
            state.our_failed = true;
        }
        debug!(stream_id = %self.stream_id, "exhausted peer candidates");
        ctx.send_info_notify(TransportInfoElement::CandidateError).await;
        self.try_resolve(&ctx).await;
    }

    /// Runs arbitration if both outcomes are known, then performs the
    /// winner's follow-up outside the lock.
    async fn try_resolve(self: &Arc<Self>, ctx: &NegotiationCtx) {
        let resolution = self.state.lock().resolve(ctx.is_initiator());

        match resolution {
            Resolution::NotYet => {}
            Resolution::BothFailed => self.fail(ctx).await,
            Resolution::DeliverOutbound(stream) => self.deliver(stream, ctx).await,
            Resolution::AwaitActivation => {
                debug!(stream_id = %self.stream_id, "winner is peer relay, awaiting activation");
            }
            Resolution::ActivateOurRelay(candidate) => self.activate_relay(candidate, ctx).await,
            Resolution::ClaimInbound => self.claim_inbound(ctx).await,
        }
    }

    /// Connects to our own winning relay, asks it to forward, confirms to
    /// the peer and delivers the relayed stream.
    async fn activate_relay(self: &Arc<Self>, candidate: Candidate, ctx: &NegotiationCtx) {
        let relay = match candidate.relay.clone() {
            Some(relay) => relay,
            None => {
                warn!(stream_id = %self.stream_id, "winning relay candidate names no operator");
                self.report_proxy_error(ctx).await;
                return;
            }
        };
        let stream = match ctx
            .core
            .connector
            .connect(&candidate.host, candidate.port, config::CANDIDATE_CONNECT_TIMEOUT)
            .await
        {
            Ok(stream) => stream,
            Err(error) => {
                warn!(stream_id = %self.stream_id, %error, "relay connection failed");
                self.report_proxy_error(ctx).await;
                return;
            }
        };
        if let Err(error) = ctx
            .core
            .relays
            .activate(&relay, &self.stream_id, ctx.peer())
            .await
        {
            warn!(stream_id = %self.stream_id, %error, "relay activation failed");
            self.report_proxy_error(ctx).await;
            return;
        }
        ctx.send_info_notify(TransportInfoElement::CandidateActivated {
            candidate_id: candidate.id,
        })
        .await;
        self.deliver(stream, ctx).await;
    }

    /// Claims the inbound connection the peer opened against our winning
    /// direct candidate.
    async fn claim_inbound(self: &Arc<Self>, ctx: &NegotiationCtx) {
        match ctx
            .core
            .connector
            .claim_inbound(&self.stream_id, config::INBOUND_CLAIM_TIMEOUT)
            .await
        {
            Ok(stream) => self.deliver(stream, ctx).await,
            Err(error) => {
                warn!(stream_id = %self.stream_id, %error, "inbound claim failed");
                self.fail(ctx).await;
            }
        }
    }

    async fn report_proxy_error(self: &Arc<Self>, ctx: &NegotiationCtx) {
        ctx.send_info_notify(TransportInfoElement::ProxyError).await;
        self.fail(ctx).await;
    }

    /// Claims the delivery report. Returns `false` when the race already
    /// settled either way.
    fn mark_delivered(&self) -> bool {
        let mut state = self.state.lock();
        if state.delivered || state.failed {
            return false;
        }
        state.delivered = true;
        true
    }

    /// Claims the failure report. Returns `false` when the race already
    /// settled either way.
    fn mark_failed(&self) -> bool {
        let mut state = self.state.lock();
        if state.failed || state.delivered {
            return false;
        }
        state.failed = true;
        state.resolved = true;
        true
    }

    /// Hands the established stream to the content. Runs at most once.
    async fn deliver(self: &Arc<Self>, stream: ByteStream, ctx: &NegotiationCtx) {
        if !self.mark_delivered() {
            return;
        }
        let _ = self.abandon_tx.send(true);
        ctx.content.on_transport_ready(ctx.clone(), stream).await;
    }

    /// Reports transport failure to the content. Runs at most once.
    async fn fail(self: &Arc<Self>, ctx: &NegotiationCtx) {
        if !self.mark_failed() {
            return;
        }
        let _ = self.abandon_tx.send(true);
        ctx.content.on_transport_failed(ctx.clone()).await;
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::socket()
    }

    fn element(&self) -> TransportElement {
        let state = self.race.state.lock();
        TransportElement {
            kind: TransportKind::socket(),
            stream_id: self.race.stream_id.clone(),
            candidates: state.local.clone(),
            info: None,
            block_size: None,
        }
    }

    fn merge_peer_offer(&self, element: &TransportElement) {
        let mut state = self.race.state.lock();
        for candidate in element.candidates.iter() {
            if state.remote.find(&candidate.id).is_none() {
                state.remote.add(candidate.clone());
            }
        }
    }

    async fn establish(&self, _direction: Direction, ctx: NegotiationCtx) {
        {
            let mut state = self.race.state.lock();
            if state.started {
                return;
            }
            state.started = true;
        }
        let race = Arc::clone(&self.race);
        tokio::spawn(race.run_race(ctx));
    }

    fn handle_info(&self, info: &TransportInfoElement, ctx: &NegotiationCtx) -> ActionResponse {
        match info {
            TransportInfoElement::CandidateUsed { candidate_id } => {
                let candidate = {
                    let state = self.race.state.lock();
                    state.local.find(candidate_id).cloned()
                };
                let candidate = match candidate {
                    Some(candidate) => candidate,
                    None => return ActionResponse::MalformedRequest,
                };
                self.race.state.lock().peer_used = Some(candidate);
                let race = Arc::clone(&self.race);
                let ctx = ctx.clone();
                tokio::spawn(async move { race.try_resolve(&ctx).await });
                ActionResponse::Ack
            }
            TransportInfoElement::CandidateError => {
                self.race.state.lock().peer_failed = true;
                let race = Arc::clone(&self.race);
                let ctx = ctx.clone();
                tokio::spawn(async move { race.try_resolve(&ctx).await });
                ActionResponse::Ack
            }
            TransportInfoElement::CandidateActivated { candidate_id } => {
                let stream = {
                    let mut state = self.race.state.lock();
                    let nominated = state
                        .connected
                        .as_ref()
                        .is_some_and(|connected| &connected.id == candidate_id);
                    if !nominated {
                        return ActionResponse::MalformedRequest;
                    }
                    state.socket.take()
                };
                match stream {
                    Some(stream) => {
                        let race = Arc::clone(&self.race);
                        let ctx = ctx.clone();
                        tokio::spawn(async move { race.deliver(stream, &ctx).await });
                        ActionResponse::Ack
                    }
                    None => ActionResponse::OutOfOrder,
                }
            }
            TransportInfoElement::ProxyError => {
                let race = Arc::clone(&self.race);
                let ctx = ctx.clone();
                tokio::spawn(async move { race.fail(&ctx).await });
                ActionResponse::Ack
            }
            TransportInfoElement::Data { .. } => {
                debug!(stream_id = %self.race.stream_id, "ignoring data chunk on socket transport");
                ActionResponse::Ack
            }
        }
    }

    fn abandon(&self) {
        let _ = self.race.abandon_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Socket Transport Manager
// ---------------------------------------------------------------------------

/// Mints [`SocketTransport`] negotiators, assembling each offer from the
/// application's advertised hosts plus the discovered relay hosts.
pub struct SocketTransportManager {
    relays: Arc<dyn RelayDiscovery>,
    local_hosts: Vec<(String, u16)>,
}

impl SocketTransportManager {
    /// Creates a manager advertising `local_hosts` as direct candidates.
    pub fn new(relays: Arc<dyn RelayDiscovery>, local_hosts: Vec<(String, u16)>) -> Self {
        Self { relays, local_hosts }
    }

    async fn build_offer(&self) -> CandidateSet {
        let mut offer = CandidateSet::new();
        for (host, port) in &self.local_hosts {
            offer.add(Candidate::direct(host.clone(), *port));
        }
        match self.relays.list_relay_hosts().await {
            Ok(hosts) => {
                for relay in hosts {
                    offer.add(Candidate::proxy(relay.host, relay.port, relay.identity));
                }
            }
            // A failed lookup degrades the offer, it does not block it.
            Err(error) => warn!(%error, "relay discovery failed, offering direct candidates only"),
        }
        offer
    }
}

#[async_trait]
impl TransportManager for SocketTransportManager {
    fn kind(&self) -> TransportKind {
        TransportKind::socket()
    }

    fn rank(&self) -> u32 {
        config::SOCKET_TRANSPORT_RANK
    }

    async fn create_for_initiator(&self) -> Result<Arc<dyn Transport>, EngineError> {
        let offer = self.build_offer().await;
        let stream_id = Uuid::new_v4().to_string();
        Ok(Arc::new(SocketTransport::new(stream_id, offer)))
    }

    async fn create_for_responder(
        &self,
        offer: &TransportElement,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        let local = self.build_offer().await;
        let transport = SocketTransport::new(offer.stream_id.clone(), local);
        transport.merge_peer_offer(offer);
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A socket transport that has not been started, for state-machine
    /// tests that never touch the network.
    pub(crate) fn idle_socket_transport(
        stream_id: &str,
        local: CandidateSet,
    ) -> Arc<dyn Transport> {
        Arc::new(SocketTransport::new(stream_id.to_string(), local))
    }
}
