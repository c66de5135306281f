//! Connection candidates for transport negotiation.
//!
//! A candidate is one concrete way to reach a peer's data plane: a directly
//! reachable socket, a tunneled or assisted endpoint, or a relay host that
//! forwards bytes on behalf of the peer. Each side of a negotiation offers a
//! ranked set of candidates; the racing protocol in
//! [`socket`](crate::transport::socket) probes the peer's set and arbitrates
//! a single winner.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config;
use crate::signaling::message::EndpointId;

// ---------------------------------------------------------------------------
// Candidate Kind
// ---------------------------------------------------------------------------

/// The type of network path a candidate represents.
///
/// Kinds are ordered by the fixed weight table in [`config`]: direct
/// sockets are preferred, relays are the last resort. The exact weights are
/// a wire convention; only their ordering is load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateKind {
    /// Socket directly reachable on one of the advertising side's interfaces.
    Direct,
    /// Port-forwarded or NAT-punched endpoint.
    Tunnel,
    /// Endpoint reachable with third-party assistance.
    Assisted,
    /// Relay host forwarding bytes on the advertising side's behalf.
    Proxy,
}

impl CandidateKind {
    /// The fixed priority weight for this kind.
    pub fn weight(self) -> u32 {
        match self {
            CandidateKind::Direct => config::CANDIDATE_WEIGHT_DIRECT,
            CandidateKind::Tunnel => config::CANDIDATE_WEIGHT_TUNNEL,
            CandidateKind::Assisted => config::CANDIDATE_WEIGHT_ASSISTED,
            CandidateKind::Proxy => config::CANDIDATE_WEIGHT_PROXY,
        }
    }
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// One concrete network endpoint offered as a way to realize a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Unique candidate identifier, referenced by `candidate-used` and
    /// `candidate-activated` notifications.
    pub id: String,
    /// Host address to connect to.
    pub host: String,
    /// TCP port to connect to.
    pub port: u16,
    /// The kind of path this candidate represents.
    pub kind: CandidateKind,
    /// Declared priority. Used by arbitration when both sides connected.
    pub priority: u32,
    /// Identity of the relay operator, present for [`CandidateKind::Proxy`]
    /// candidates. Activation requests are addressed to this identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<EndpointId>,
}

impl Candidate {
    /// Creates a candidate with an explicit kind; priority defaults to the
    /// kind's fixed weight.
    pub fn new(host: impl Into<String>, port: u16, kind: CandidateKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            host: host.into(),
            port,
            kind,
            priority: kind.weight(),
            relay: None,
        }
    }

    /// Creates a directly reachable candidate at the fixed high priority.
    pub fn direct(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, CandidateKind::Direct)
    }

    /// Creates a relay candidate at the fixed low priority.
    pub fn proxy(host: impl Into<String>, port: u16, relay: EndpointId) -> Self {
        let mut candidate = Self::new(host, port, CandidateKind::Proxy);
        candidate.relay = Some(relay);
        candidate
    }
}

// ---------------------------------------------------------------------------
// Candidate Set
// ---------------------------------------------------------------------------

/// A ranked collection of candidates.
///
/// Insertion order is preserved: a peer's offered ordering is the order in
/// which its candidates are probed (peers are trusted to rank their own
/// offers; the local side never re-sorts a received set).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSet {
    candidates: Vec<Candidate>,
}

impl CandidateSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a candidate, keeping insertion order.
    pub fn add(&mut self, candidate: Candidate) {
        self.candidates.push(candidate);
    }

    /// Looks a candidate up by its identifier.
    pub fn find(&self, id: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == id)
    }

    /// Iterates candidates in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter()
    }

    /// Number of candidates in the set.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Returns `true` if the set holds no candidates.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

impl From<Vec<Candidate>> for CandidateSet {
    fn from(candidates: Vec<Candidate>) -> Self {
        Self { candidates }
    }
}

impl IntoIterator for CandidateSet {
    type Item = Candidate;
    type IntoIter = std::vec::IntoIter<Candidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_candidates_outweigh_proxies() {
        let direct = Candidate::direct("192.0.2.1", 7777);
        let proxy = Candidate::proxy("relay.example", 7778, EndpointId::new("relay@example"));

        assert!(direct.priority > proxy.priority);
        assert_eq!(direct.kind, CandidateKind::Direct);
        assert_eq!(proxy.kind, CandidateKind::Proxy);
        assert!(proxy.relay.is_some());
    }

    #[test]
    fn set_preserves_insertion_order() {
        let mut set = CandidateSet::new();
        let low = Candidate::proxy("relay.example", 1, EndpointId::new("relay@example"));
        let high = Candidate::direct("192.0.2.1", 2);
        // Deliberately insert the low-priority candidate first: the set must
        // not reorder it.
        set.add(low.clone());
        set.add(high.clone());

        let order: Vec<&str> = set.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(order, vec![low.id.as_str(), high.id.as_str()]);
    }

    #[test]
    fn find_by_id() {
        let mut set = CandidateSet::new();
        let c = Candidate::direct("192.0.2.1", 4000);
        let id = c.id.clone();
        set.add(c);

        assert!(set.find(&id).is_some());
        assert!(set.find("nope").is_none());
    }

    #[test]
    fn candidate_serde_roundtrip() {
        let c = Candidate::proxy("relay.example", 7, EndpointId::new("relay@example"));
        let json = serde_json::to_string(&c).expect("serialize");
        let back: Candidate = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, c);
    }
}
