//! # Protocol Configuration & Constants
//!
//! Every magic number in Parley lives here. Timeouts, candidate weights and
//! transport ranks are negotiated conventions: both peers must agree on the
//! ordering they induce, so changing them after deployment affects
//! interoperability with older peers.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Major version. Bump on breaking changes to the negotiation flow.
pub const PROTOCOL_VERSION_MAJOR: u16 = 0;

/// Minor version. Bump on backward-compatible additions.
pub const PROTOCOL_VERSION_MINOR: u16 = 1;

/// The full version string, assembled once so we never drift from the parts.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Timing Constants
// ---------------------------------------------------------------------------

/// Upper bound on every signaling request that expects a response. Expiry is
/// a delivery failure, not a protocol-level rejection; the caller decides
/// whether to retry.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-candidate connection attempt timeout during candidate racing.
/// Candidates are probed sequentially, so the worst case for one racing
/// round is `candidate_count * CANDIDATE_CONNECT_TIMEOUT`.
pub const CANDIDATE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the winner of an arbitration round waits for the inbound
/// connection on one of its own advertised candidates.
pub const INBOUND_CLAIM_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Candidate Weights
// ---------------------------------------------------------------------------
//
// Fixed weight table for candidate types. Exact values are a convention;
// only the ordering is load-bearing: direct sockets beat tunnels beat
// assisted connections beat relays. Offers advertise locally reachable
// direct candidates at `CANDIDATE_WEIGHT_DIRECT` and externally discovered
// relay candidates at `CANDIDATE_WEIGHT_PROXY`, so direct connections are
// always attempted first without a renegotiation round when relaying turns
// out to be unnecessary.

/// Directly reachable socket on one of our own interfaces.
pub const CANDIDATE_WEIGHT_DIRECT: u32 = 100;

/// Tunneled endpoint (port-forwarded or NAT-punched).
pub const CANDIDATE_WEIGHT_TUNNEL: u32 = 75;

/// Endpoint reachable with assistance (e.g. a NAT traversal helper).
pub const CANDIDATE_WEIGHT_ASSISTED: u32 = 50;

/// Relay / proxy host. Last resort: costs a third party bandwidth.
pub const CANDIDATE_WEIGHT_PROXY: u32 = 0;

// ---------------------------------------------------------------------------
// Transport Ranks
// ---------------------------------------------------------------------------

/// Registry rank of the candidate-racing socket transport. Highest: a real
/// socket always beats tunneling bytes through the signaling channel.
pub const SOCKET_TRANSPORT_RANK: u32 = 100;

/// Registry rank of the reliable in-band fallback transport.
pub const INBAND_TRANSPORT_RANK: u32 = 0;

// ---------------------------------------------------------------------------
// In-Band Transport
// ---------------------------------------------------------------------------

/// Default chunk size for the in-band fallback transport. Each chunk rides
/// in one signaling request, so this bounds per-message overhead.
pub const INBAND_BLOCK_SIZE: usize = 4096;

/// Buffer capacity of the in-memory pipe between the in-band transport and
/// the description layer consuming it.
pub const INBAND_PIPE_CAPACITY: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Prefix for auto-generated content names.
pub const CONTENT_NAME_PREFIX: &str = "cont-";

/// Length of the random suffix of auto-generated content names.
pub const CONTENT_NAME_RANDOM_LEN: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_weights_are_strictly_ordered() {
        // Only the ordering is load-bearing, so pin it down.
        assert!(CANDIDATE_WEIGHT_DIRECT > CANDIDATE_WEIGHT_TUNNEL);
        assert!(CANDIDATE_WEIGHT_TUNNEL > CANDIDATE_WEIGHT_ASSISTED);
        assert!(CANDIDATE_WEIGHT_ASSISTED > CANDIDATE_WEIGHT_PROXY);
    }

    #[test]
    fn socket_transport_outranks_inband_fallback() {
        assert!(SOCKET_TRANSPORT_RANK > INBAND_TRANSPORT_RANK);
    }

    #[test]
    fn version_string_matches_parts() {
        assert!(PROTOCOL_VERSION
            .starts_with(&format!("{PROTOCOL_VERSION_MAJOR}.{PROTOCOL_VERSION_MINOR}")));
    }

    #[test]
    fn timeouts_are_positive() {
        assert!(REQUEST_TIMEOUT > Duration::ZERO);
        assert!(CANDIDATE_CONNECT_TIMEOUT > Duration::ZERO);
    }
}
