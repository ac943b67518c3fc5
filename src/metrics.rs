#![forbid(unsafe_code)]

// Server metrics for /metrics: room and peer lifecycle counters, live gauges
// and per-request signaling latency, all lock-free and rendered in the
// Prometheus text exposition format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

const PREFIX: &str = "roomcast";

/// Upper bounds of the request latency buckets. Join and connect are capped
/// by the handshake timeout, whose default is the last bound.
const LATENCY_BOUNDS: [Duration; 8] = [
    Duration::from_millis(1),
    Duration::from_millis(5),
    Duration::from_millis(25),
    Duration::from_millis(100),
    Duration::from_millis(250),
    Duration::from_secs(1),
    Duration::from_millis(2_500),
    Duration::from_secs(10),
];

/// Request types with their own latency series. The last slot takes
/// anything unlisted.
const REQUEST_TYPES: [&str; 9] = [
    "join-room",
    "connect-transport",
    "produce",
    "consume",
    "resume-consumer",
    "pause-consumer",
    "close-producer",
    "leave-room",
    "other",
];

/// Monotonic counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Connections,
    MessagesReceived,
    MessagesSent,
    Errors,
    RoomsCreated,
    RoomsReleased,
    Joins,
    Leaves,
    ProducersCreated,
    ProducersReplaced,
    ConsumersCreated,
    ConsumersResumed,
    HandshakeTimeouts,
    EngineFailures,
}

impl Counter {
    /// Declaration order; `counter as usize` indexes into it
    const ALL: [Counter; 14] = [
        Counter::Connections,
        Counter::MessagesReceived,
        Counter::MessagesSent,
        Counter::Errors,
        Counter::RoomsCreated,
        Counter::RoomsReleased,
        Counter::Joins,
        Counter::Leaves,
        Counter::ProducersCreated,
        Counter::ProducersReplaced,
        Counter::ConsumersCreated,
        Counter::ConsumersResumed,
        Counter::HandshakeTimeouts,
        Counter::EngineFailures,
    ];

    fn describe(self) -> (&'static str, &'static str) {
        match self {
            Counter::Connections => ("connections_total", "WebSocket connections accepted"),
            Counter::MessagesReceived => ("messages_received_total", "Signaling frames received from peers"),
            Counter::MessagesSent => ("messages_sent_total", "Signaling messages written to peers"),
            Counter::Errors => ("errors_total", "Requests answered with an error"),
            Counter::RoomsCreated => ("rooms_created_total", "Rooms created, one router each"),
            Counter::RoomsReleased => ("rooms_released_total", "Rooms retired and dropped from the registry"),
            Counter::Joins => ("joins_total", "Successful room joins"),
            Counter::Leaves => ("leaves_total", "Transports closed by leave, disconnect or teardown"),
            Counter::ProducersCreated => ("producers_created_total", "Producers installed in a room"),
            Counter::ProducersReplaced => ("producers_replaced_total", "Producers replaced by a newer one of the same kind"),
            Counter::ConsumersCreated => ("consumers_created_total", "Consumers installed in a room"),
            Counter::ConsumersResumed => ("consumers_resumed_total", "Consumers moved from paused to active"),
            Counter::HandshakeTimeouts => ("handshake_timeouts_total", "Joins or transport handshakes that ran out of time"),
            Counter::EngineFailures => ("engine_failures_total", "Media engine failures that took down every room"),
        }
    }
}

/// Cumulative latency histogram of one request type
struct LatencySeries {
    /// buckets[i] counts observations <= LATENCY_BOUNDS[i]
    buckets: [AtomicU64; LATENCY_BOUNDS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl LatencySeries {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, elapsed: Duration) {
        self.sum_us.fetch_add(elapsed.as_micros() as u64, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, bound) in self.buckets.iter().zip(LATENCY_BOUNDS) {
            if elapsed <= bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, request: &str, out: &mut String) {
        for (bucket, bound) in self.buckets.iter().zip(LATENCY_BOUNDS) {
            let _ = writeln!(
                out,
                "{name}_bucket{{request=\"{request}\",le=\"{}\"}} {}",
                bound.as_secs_f64(),
                bucket.load(Relaxed)
            );
        }
        let count = self.count.load(Relaxed);
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{request=\"{request}\",le=\"+Inf\"}} {count}");
        let _ = writeln!(
            out,
            "{name}_sum{{request=\"{request}\"}} {}.{:06}",
            sum_us / 1_000_000,
            sum_us % 1_000_000
        );
        let _ = writeln!(out, "{name}_count{{request=\"{request}\"}} {count}");
    }
}

/// Server-wide metrics, cheap to clone
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    counters: [AtomicU64; Counter::ALL.len()],
    connections_active: AtomicU64,
    latency: [LatencySeries; REQUEST_TYPES.len()],
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
                latency: std::array::from_fn(|_| LatencySeries::new()),
            }),
        }
    }

    pub fn inc(&self, counter: Counter) {
        self.inner.counters[counter as usize].fetch_add(1, Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.inner.counters[counter as usize].load(Relaxed)
    }

    /// Counts the connection as active until the guard drops, panics included
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    /// Records how long the gateway took to answer one request
    pub fn observe_request(&self, request: &str, elapsed: Duration) {
        let slot = REQUEST_TYPES
            .iter()
            .position(|known| *known == request)
            .unwrap_or(REQUEST_TYPES.len() - 1);
        self.inner.latency[slot].observe(elapsed);
    }

    /// Renders everything. Room and peer gauges come from the registry at
    /// scrape time.
    pub fn render_prometheus(&self, rooms_active: usize, peers_active: usize) -> String {
        let mut out = String::with_capacity(8192);

        for counter in Counter::ALL {
            let (name, help) = counter.describe();
            write_header(&mut out, name, help, "counter");
            let _ = writeln!(out, "{PREFIX}_{name} {}", self.get(counter));
        }

        let gauges = [
            (
                "connections_active",
                "Open WebSocket connections",
                self.inner.connections_active.load(Relaxed),
            ),
            ("rooms_active", "Rooms in the registry", rooms_active as u64),
            ("peers_active", "Peers joined to a room", peers_active as u64),
        ];
        for (name, help, value) in gauges {
            write_header(&mut out, name, help, "gauge");
            let _ = writeln!(out, "{PREFIX}_{name} {value}");
        }

        let histogram = "request_duration_seconds";
        write_header(&mut out, histogram, "Signaling request handling latency", "histogram");
        let name = format!("{PREFIX}_{histogram}");
        for (request, series) in REQUEST_TYPES.iter().zip(&self.inner.latency) {
            series.render(&name, request, &mut out);
        }

        out
    }
}

fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {PREFIX}_{name} {help}");
    let _ = writeln!(out, "# TYPE {PREFIX}_{name} {kind}");
}

/// Decrements the active connection gauge on drop
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}
