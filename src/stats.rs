//! Process-wide tunnel counters.

use std::{
    fmt::Write,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use serde::Serialize;

/// The direction bytes travel through the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Toward the real service: public socket to stream on the server, stream to local socket on
    /// the client.
    Inbound,

    /// Back toward the end user.
    Outbound,
}

#[derive(Debug, Default)]
struct Counters {
    active_streams: u64,
    total_bytes_in: u64,
    total_bytes_out: u64,
    connected: bool,
}

/// Counters shared by every pump and lifecycle task of the process.
///
/// Every mutation takes the same lock, held only for the duration of the field update.
#[derive(Debug)]
pub struct TunnelStats {
    counters: Mutex<Counters>,
    started_at: Instant,
}

/// A point-in-time copy of [`TunnelStats`], as served to the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub active_connections: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub uptime: String,
    pub uptime_secs: u64,
    pub connected: bool,
}

impl TunnelStats {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            started_at: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        // The counters hold plain integers, so a panic mid-update can't leave them torn.
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_bytes(&self, direction: Direction, count: u64) {
        let mut counters = self.lock();
        match direction {
            Direction::Inbound => counters.total_bytes_in = counters.total_bytes_in.saturating_add(count),
            Direction::Outbound => counters.total_bytes_out = counters.total_bytes_out.saturating_add(count),
        }
    }

    pub fn stream_opened(&self) {
        self.lock().active_streams += 1;
    }

    pub fn stream_closed(&self) {
        let mut counters = self.lock();
        counters.active_streams = counters.active_streams.saturating_sub(1);
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn active_streams(&self) -> u64 {
        self.lock().active_streams
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let uptime = self.uptime();
        let counters = self.lock();
        StatsSnapshot {
            active_connections: counters.active_streams,
            total_bytes_in: counters.total_bytes_in,
            total_bytes_out: counters.total_bytes_out,
            uptime: format_uptime(uptime),
            uptime_secs: uptime.as_secs(),
            connected: counters.connected,
        }
    }

    /// Counts a newly bound stream pair, returning a guard that uncounts it when dropped.
    pub fn track_stream(self: &Arc<Self>) -> StreamGuard {
        self.stream_opened();
        StreamGuard { stats: Arc::clone(self) }
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps one stream pair counted in [`TunnelStats`] for as long as it lives.
#[derive(Debug)]
pub struct StreamGuard {
    stats: Arc<TunnelStats>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.stats.stream_closed();
    }
}

/// Formats a duration as hours, minutes and seconds, e.g. `1h2m3s`, omitting leading zero units.
pub fn format_uptime(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total / 60) % 60, total % 60);

    let mut s = String::with_capacity(16);
    if hours != 0 {
        let _ = write!(s, "{hours}h");
    }
    if hours != 0 || minutes != 0 {
        let _ = write!(s, "{minutes}m");
    }
    let _ = write!(s, "{seconds}s");
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_bytes_by_direction() {
        let stats = TunnelStats::new();
        stats.record_bytes(Direction::Inbound, 10);
        stats.record_bytes(Direction::Outbound, 3);
        stats.record_bytes(Direction::Inbound, 5);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_bytes_in, 15);
        assert_eq!(snapshot.total_bytes_out, 3);
    }

    #[test]
    fn test_stream_guard_counts() {
        let stats = Arc::new(TunnelStats::new());
        let first = stats.track_stream();
        let second = stats.track_stream();
        assert_eq!(stats.active_streams(), 2);

        drop(first);
        assert_eq!(stats.active_streams(), 1);
        drop(second);
        assert_eq!(stats.active_streams(), 0);
    }

    #[test]
    fn test_active_streams_never_negative() {
        let stats = TunnelStats::new();
        stats.stream_closed();
        assert_eq!(stats.active_streams(), 0);
    }

    #[test]
    fn test_connected_flag() {
        let stats = TunnelStats::new();
        assert!(!stats.is_connected());
        stats.set_connected(true);
        assert!(stats.snapshot().connected);
        stats.set_connected(false);
        assert!(!stats.is_connected());
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0s");
        assert_eq!(format_uptime(Duration::from_secs(59)), "59s");
        assert_eq!(format_uptime(Duration::from_secs(60)), "1m0s");
        assert_eq!(format_uptime(Duration::from_secs(3723)), "1h2m3s");
        assert_eq!(format_uptime(Duration::from_secs(7200)), "2h0m0s");
    }

    #[test]
    fn test_snapshot_serializes_dashboard_fields() {
        let stats = TunnelStats::new();
        stats.stream_opened();
        let json = serde_json::to_value(stats.snapshot()).unwrap();

        assert_eq!(json["active_connections"], 1);
        assert_eq!(json["total_bytes_in"], 0);
        assert_eq!(json["total_bytes_out"], 0);
        assert_eq!(json["connected"], false);
        assert!(json["uptime"].is_string());
        assert!(json["uptime_secs"].is_u64());
    }
}
