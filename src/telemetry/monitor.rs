use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use colored::Colorize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::diag::{ConnectionRecord, ConnectionSource};
use crate::error::DiagError;

/// Default delay between two diagnostic polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

const HUMAN_READABLE_UNITS: [(&str, f64); 4] = [("G", 1e9), ("M", 1e6), ("k", 1e3), ("", 1.0)];

/// Format a counter with a decimal SI prefix, e.g. `1.50 M`.
pub fn human_readable(value: f64) -> String {
    let value = value.trunc();
    for (unit, scale) in HUMAN_READABLE_UNITS {
        if value / scale >= 1.0 {
            return format!("{:.2} {unit}", value / scale);
        }
    }
    format!("{value:.2} ")
}

/// Byte counters and bitrates for one tracked destination.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerTelemetry {
    pub name: String,
    pub address: IpAddr,
    pub bytes_acked: u64,
    pub bytes_received: u64,
    /// bits per second
    pub bitrate_sent: f64,
    pub bitrate_received: f64,
    pub last_sample: Instant,
}

/// Tracked destinations in the order they were first seen.
#[derive(Debug, Clone, Default)]
pub struct TelemetryTable {
    servers: Vec<ServerTelemetry>,
}

impl TelemetryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `address`. The first name registered for an address wins.
    pub fn track(&mut self, name: impl Into<String>, address: IpAddr, now: Instant) {
        if self.get(&address).is_some() {
            return;
        }
        self.servers.push(ServerTelemetry {
            name: name.into(),
            address,
            bytes_acked: 0,
            bytes_received: 0,
            bitrate_sent: 0.0,
            bitrate_received: 0.0,
            last_sample: now,
        });
    }

    pub fn get(&self, address: &IpAddr) -> Option<&ServerTelemetry> {
        self.servers.iter().find(|s| s.address == *address)
    }

    pub fn servers(&self) -> &[ServerTelemetry] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Fold one poll into the table and return how many servers were updated.
    ///
    /// Connections from `excluded` source ports are ignored. Several connections to the
    /// same server are summed. A counter that went backwards (a connection closed) gives
    /// a zero delta.
    pub fn apply_sample(
        &mut self,
        records: &[ConnectionRecord],
        excluded: &HashSet<u16>,
        now: Instant,
    ) -> usize {
        let mut totals: HashMap<IpAddr, (u64, u64)> = HashMap::new();
        for r in records.iter().filter(|r| !excluded.contains(&r.source_port)) {
            let t = totals.entry(r.destination).or_default();
            t.0 = t.0.saturating_add(r.bytes_acked);
            t.1 = t.1.saturating_add(r.bytes_received);
        }

        let mut updated = 0;
        for server in &mut self.servers {
            let Some(&(acked, received)) = totals.get(&server.address) else {
                continue;
            };
            let elapsed = now.saturating_duration_since(server.last_sample).as_secs_f64();
            if elapsed > 0.0 {
                let sent_delta = acked.saturating_sub(server.bytes_acked);
                let received_delta = received.saturating_sub(server.bytes_received);
                server.bitrate_sent = 8.0 * sent_delta as f64 / elapsed;
                server.bitrate_received = 8.0 * received_delta as f64 / elapsed;
            }
            server.bytes_acked = acked;
            server.bytes_received = received;
            server.last_sample = now;
            updated += 1;
        }
        updated
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for s in &self.servers {
            out.push_str(&format!(
                "{} : Bytes acked : {} ({}) Bytes received : {} ({})\n",
                s.name.blue(),
                format!("{}B", human_readable(s.bytes_acked as f64)).red(),
                format!("{}bps", human_readable(s.bitrate_sent)).red(),
                format!("{}B", human_readable(s.bytes_received as f64)).green(),
                format!("{}bps", human_readable(s.bitrate_received)).green(),
            ));
        }
        out
    }
}

/// Count of transfer commands still running; fires `done` when it reaches zero.
#[derive(Debug, Clone)]
pub struct TransferTracker {
    remaining: Arc<AtomicUsize>,
    done: CancellationToken,
}

impl TransferTracker {
    pub fn new(total: usize) -> Self {
        let done = CancellationToken::new();
        if total == 0 {
            done.cancel();
        }
        Self {
            remaining: Arc::new(AtomicUsize::new(total)),
            done,
        }
    }

    /// Mark one transfer command finished.
    pub fn complete_one(&self) {
        let prev = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if prev <= 1 {
            self.done.cancel();
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    pub async fn finished(&self) {
        self.done.cancelled().await
    }
}

/// Polls the diagnostic source until every tracked transfer has completed.
pub struct TelemetryMonitor {
    table: Arc<Mutex<TelemetryTable>>,
    source: Arc<dyn ConnectionSource>,
    port: u16,
    excluded: HashSet<u16>,
    interval: Duration,
    tracker: TransferTracker,
    render: bool,
}

impl TelemetryMonitor {
    pub fn new(
        table: TelemetryTable,
        source: Arc<dyn ConnectionSource>,
        port: u16,
        excluded: HashSet<u16>,
        tracker: TransferTracker,
    ) -> Self {
        Self {
            table: Arc::new(Mutex::new(table)),
            source,
            port,
            excluded,
            interval: DEFAULT_POLL_INTERVAL,
            tracker,
            render: true,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_render(mut self, render: bool) -> Self {
        self.render = render;
        self
    }

    /// Shared handle on the table, readable while and after the monitor runs.
    pub fn table(&self) -> Arc<Mutex<TelemetryTable>> {
        self.table.clone()
    }

    /// Poll, render, sleep; stop once the tracker reaches zero.
    ///
    /// A failing poll ends the monitor with that error.
    pub async fn run(self) -> Result<(), DiagError> {
        let mut ticks = 0u64;
        while self.tracker.remaining() > 0 {
            let updated = self.tick().await?;
            ticks += 1;
            debug!(tick = ticks, updated, "telemetry poll");
            if self.render {
                self.draw();
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.tracker.finished() => break,
            }
        }
        debug!(ticks, "telemetry monitor finished");
        Ok(())
    }

    async fn tick(&self) -> Result<usize, DiagError> {
        let source = self.source.clone();
        let port = self.port;
        let records = tokio::task::spawn_blocking(move || source.query(port))
            .await
            .map_err(|e| DiagError::Io(std::io::Error::other(e)))??;
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        Ok(table.apply_sample(&records, &self.excluded, Instant::now()))
    }

    fn draw(&self) {
        let rendered = self
            .table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .render();
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\x1b[2J\x1b[H{rendered}");
        let _ = err.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn rec(sport: u16, last: u8, acked: u64, received: u64) -> ConnectionRecord {
        ConnectionRecord {
            source_port: sport,
            destination: ip(last),
            bytes_acked: acked,
            bytes_received: received,
        }
    }

    #[test]
    fn human_readable_units() {
        assert_eq!(human_readable(0.0), "0.00 ");
        assert_eq!(human_readable(999.0), "999.00 ");
        assert_eq!(human_readable(1500.0), "1.50 k");
        assert_eq!(human_readable(2_500_000.0), "2.50 M");
        assert_eq!(human_readable(3e9), "3.00 G");
    }

    #[test]
    fn bitrate_is_eight_times_delta_over_elapsed() {
        let t0 = Instant::now();
        let mut table = TelemetryTable::new();
        table.track("a", ip(1), t0);
        let none = HashSet::new();

        table.apply_sample(&[rec(5000, 1, 1_000, 100)], &none, t0 + Duration::from_secs(2));
        let s = table.get(&ip(1)).unwrap();
        assert_eq!(s.bitrate_sent, 4_000.0);
        assert_eq!(s.bitrate_received, 400.0);

        table.apply_sample(&[rec(5000, 1, 4_000, 100)], &none, t0 + Duration::from_secs(5));
        let s = table.get(&ip(1)).unwrap();
        assert_eq!(s.bytes_acked, 4_000);
        assert_eq!(s.bitrate_sent, 8_000.0);
        assert_eq!(s.bitrate_received, 0.0);
    }

    #[test]
    fn excluded_ports_and_untracked_servers_ignored() {
        let t0 = Instant::now();
        let mut table = TelemetryTable::new();
        table.track("a", ip(1), t0);
        let excluded: HashSet<u16> = [6000].into_iter().collect();
        let n = table.apply_sample(
            &[rec(6000, 1, 9_999, 9_999), rec(5000, 1, 10, 20), rec(5001, 9, 1, 1)],
            &excluded,
            t0 + Duration::from_secs(1),
        );
        assert_eq!(n, 1);
        assert_eq!(table.get(&ip(1)).unwrap().bytes_acked, 10);
        assert!(table.get(&ip(9)).is_none());
    }

    #[test]
    fn closed_connection_never_goes_negative() {
        let t0 = Instant::now();
        let mut table = TelemetryTable::new();
        table.track("a", ip(1), t0);
        let none = HashSet::new();
        table.apply_sample(
            &[rec(1, 1, 500, 0), rec(2, 1, 500, 0)],
            &none,
            t0 + Duration::from_secs(1),
        );
        assert_eq!(table.get(&ip(1)).unwrap().bytes_acked, 1_000);
        table.apply_sample(&[rec(2, 1, 600, 0)], &none, t0 + Duration::from_secs(2));
        assert_eq!(table.get(&ip(1)).unwrap().bitrate_sent, 0.0);
    }

    #[test]
    fn duplicate_track_keeps_first_name() {
        let t0 = Instant::now();
        let mut table = TelemetryTable::new();
        table.track("first", ip(1), t0);
        table.track("second", ip(1), t0);
        assert_eq!(table.len(), 1);
        assert_eq!(table.servers()[0].name, "first");
    }

    #[test]
    fn tracker_fires_once_at_zero() {
        let t = TransferTracker::new(2);
        t.complete_one();
        assert!(!t.done.is_cancelled());
        t.complete_one();
        assert!(t.done.is_cancelled());
        t.complete_one();
        assert_eq!(t.remaining(), 0);
        assert!(TransferTracker::new(0).done.is_cancelled());
    }

    struct Failing;

    impl ConnectionSource for Failing {
        fn query(&self, _port: u16) -> Result<Vec<ConnectionRecord>, DiagError> {
            Err(DiagError::Netlink { errno: 1 })
        }
    }

    #[tokio::test]
    async fn poll_failure_ends_monitor() {
        let monitor = TelemetryMonitor::new(
            TelemetryTable::new(),
            Arc::new(Failing),
            22,
            HashSet::new(),
            TransferTracker::new(1),
        )
        .with_render(false);
        assert!(matches!(monitor.run().await, Err(DiagError::Netlink { errno: 1 })));
    }
}
