#![forbid(unsafe_code)]

// Server metrics - lock-free counters and a latency histogram in Prometheus text format

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

const BUCKET_COUNT: usize = 10;
/// Histogram bucket upper bounds in microseconds, with their `le` labels
const BUCKETS: [(u64, &str); BUCKET_COUNT] = [
    (1_000, "0.001"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (25_000, "0.025"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (250_000, "0.25"),
    (500_000, "0.5"),
    (1_000_000, "1"),
    (5_000_000, "5"),
];

/// Monotonic counters exported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Connections,
    MessagesReceived,
    MessagesSent,
    Errors,
    RoomsCreated,
    Joins,
    Leaves,
    WaitingRequests,
    HostMigrations,
    PlaylistEdits,
    ProducersCreated,
    ConsumersCreated,
}

impl Counter {
    const COUNT: usize = 12;
    const ALL: [Counter; Counter::COUNT] = [
        Counter::Connections,
        Counter::MessagesReceived,
        Counter::MessagesSent,
        Counter::Errors,
        Counter::RoomsCreated,
        Counter::Joins,
        Counter::Leaves,
        Counter::WaitingRequests,
        Counter::HostMigrations,
        Counter::PlaylistEdits,
        Counter::ProducersCreated,
        Counter::ConsumersCreated,
    ];

    fn name(self) -> &'static str {
        match self {
            Counter::Connections => "watchparty_connections_total",
            Counter::MessagesReceived => "watchparty_messages_received_total",
            Counter::MessagesSent => "watchparty_messages_sent_total",
            Counter::Errors => "watchparty_errors_total",
            Counter::RoomsCreated => "watchparty_rooms_created_total",
            Counter::Joins => "watchparty_joins_total",
            Counter::Leaves => "watchparty_leaves_total",
            Counter::WaitingRequests => "watchparty_waiting_requests_total",
            Counter::HostMigrations => "watchparty_host_migrations_total",
            Counter::PlaylistEdits => "watchparty_playlist_edits_total",
            Counter::ProducersCreated => "watchparty_producers_created_total",
            Counter::ConsumersCreated => "watchparty_consumers_created_total",
        }
    }

    fn help(self) -> &'static str {
        match self {
            Counter::Connections => "Total WebSocket connections",
            Counter::MessagesReceived => "Total messages received from clients",
            Counter::MessagesSent => "Total messages sent to clients",
            Counter::Errors => "Total error replies",
            Counter::RoomsCreated => "Total rooms created",
            Counter::Joins => "Total room joins",
            Counter::Leaves => "Total room leaves",
            Counter::WaitingRequests => "Total connections parked on a waiting list",
            Counter::HostMigrations => "Total host hand-overs",
            Counter::PlaylistEdits => "Total playlist additions, removals and moves",
            Counter::ProducersCreated => "Total producers created",
            Counter::ConsumersCreated => "Total consumers created",
        }
    }
}

/// Prometheus-compatible cumulative histogram with fixed buckets.
struct Histogram {
    /// bucket[i] counts observations <= BUCKETS[i]
    buckets: [AtomicU64; BUCKET_COUNT],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, (bound, _)) in self.buckets.iter().zip(BUCKETS) {
            if us <= bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bucket, (_, label)) in self.buckets.iter().zip(BUCKETS) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Server-wide metrics using lock-free atomics. Cheap to clone.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    counters: [AtomicU64; Counter::COUNT],
    connections_active: AtomicU64,
    message_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: std::array::from_fn(|_| AtomicU64::new(0)),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc(&self, counter: Counter) {
        self.inner.counters[counter as usize].fetch_add(1, Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.inner.counters[counter as usize].load(Relaxed)
    }

    /// Increments the active-connection gauge until the guard is dropped
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// Render all metrics in Prometheus text exposition format.
    /// `rooms_active` counts media sessions hosted by this process.
    pub fn render_prometheus(&self, rooms_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        for counter in Counter::ALL {
            render_sample(&mut out, counter.name(), counter.help(), "counter", self.get(counter));
        }

        render_sample(
            &mut out,
            "watchparty_connections_active",
            "Currently open WebSocket connections",
            "gauge",
            self.inner.connections_active.load(Relaxed),
        );
        render_sample(
            &mut out,
            "watchparty_rooms_active",
            "Rooms with media on this process",
            "gauge",
            rooms_active as u64,
        );

        self.inner.message_handling.render(
            "watchparty_message_handling_seconds",
            "Message handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// Decrements `connections_active` on drop, including on panic unwinds
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_sample(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let metrics = ServerMetrics::new();
        metrics.inc(Counter::Joins);
        metrics.inc(Counter::Joins);
        metrics.clone().inc(Counter::HostMigrations);

        assert_eq!(metrics.get(Counter::Joins), 2);
        assert_eq!(metrics.get(Counter::HostMigrations), 1);
        assert_eq!(metrics.get(Counter::Leaves), 0);
    }

    #[test]
    fn guard_tracks_active_connections() {
        let metrics = ServerMetrics::new();
        let guard = metrics.connection_active_guard();
        assert!(metrics.render_prometheus(0).contains("watchparty_connections_active 1\n"));
        drop(guard);
        assert!(metrics.render_prometheus(0).contains("watchparty_connections_active 0\n"));
    }

    #[test]
    fn renders_histogram_buckets_cumulatively() {
        let metrics = ServerMetrics::new();
        metrics.observe_message_handling(Duration::from_millis(3));
        metrics.observe_message_handling(Duration::from_secs(2));

        let text = metrics.render_prometheus(3);
        assert!(text.contains("watchparty_rooms_active 3\n"));
        assert!(text.contains("watchparty_message_handling_seconds_bucket{le=\"0.001\"} 0\n"));
        assert!(text.contains("watchparty_message_handling_seconds_bucket{le=\"0.005\"} 1\n"));
        assert!(text.contains("watchparty_message_handling_seconds_bucket{le=\"5\"} 2\n"));
        assert!(text.contains("watchparty_message_handling_seconds_count 2\n"));
        assert!(text.contains("watchparty_message_handling_seconds_sum 2.003000\n"));
    }
}
