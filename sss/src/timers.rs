//! The timer abstraction (spec.md §2/§5, expanded in SPEC_FULL.md §4.8): no
//! bespoke scheduler, just the same plain, explicit-`Instant` methods the
//! channel/peer layers already expose for testing, driven by whatever reactor
//! the embedding application runs.
//!
//! `channel::Channel::on_retransmit_timer` and `peer::Peer::on_timer` take an
//! `Instant` and return what changed; neither schedules anything itself.
//! [`crate::host::Host::poll`] is the only place that actually calls them
//! against wall-clock time, on every tick rather than against a per-peer
//! deadline — see DESIGN.md for why this departs from the teacher's
//! `stakker`-scheduled `tunnel::timers::Timers`. This module holds only the
//! shared interval constants both sides of that seam agree on.

use std::time::Duration;

/// How often a host checks every peer's retransmission/reconnect state (spec.md
/// §4.2's minimum retry backoff is 500ms; ticking faster than that would just spin
/// without anything new to do).
pub const TICK_INTERVAL: Duration = Duration::from_millis(250);
