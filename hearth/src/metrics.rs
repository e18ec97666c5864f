//! Daemon metrics.
//!
//! Counters for connection and request lifecycle plus byte totals,
//! exposed through the metriken registry for Prometheus exposition by the
//! host. The active-connections gauge is observational only: under the
//! threaded models it may lag list transitions by design.

use metriken::{metric, Counter, Gauge};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "hearth/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "hearth/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "hearth/connections/refused",
    description = "Connections refused by policy or limits"
)]
pub static CONNECTIONS_REFUSED: Counter = Counter::new();

#[metric(
    name = "hearth/connections/active",
    description = "Currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "hearth/connections/timed_out",
    description = "Connections evicted by the idle timeout"
)]
pub static CONNECTIONS_TIMED_OUT: Counter = Counter::new();

// ── Requests ─────────────────────────────────────────────────────

#[metric(
    name = "hearth/requests/served",
    description = "Requests for which a response was fully sent"
)]
pub static REQUESTS_SERVED: Counter = Counter::new();

#[metric(
    name = "hearth/requests/protocol_errors",
    description = "Requests rejected with a 4xx protocol error"
)]
pub static REQUESTS_PROTOCOL_ERRORS: Counter = Counter::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "hearth/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "hearth/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();
