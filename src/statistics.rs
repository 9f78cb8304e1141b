use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use service::peers::Transport;

/// A single traffic event, batched into `Reporter::send` so the hot
/// paths make one call per packet.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(usize),
    ReceivedPkts(usize),
    SendBytes(usize),
    SendPkts(usize),
    DroppedPkts(usize),
}

#[derive(Default)]
pub struct Counts {
    pub received_bytes: AtomicUsize,
    pub received_pkts: AtomicUsize,
    pub send_bytes: AtomicUsize,
    pub send_pkts: AtomicUsize,
    pub dropped_pkts: AtomicUsize,
}

impl Counts {
    fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(value) => self.received_bytes.fetch_add(*value, Ordering::Relaxed),
            Stats::ReceivedPkts(value) => self.received_pkts.fetch_add(*value, Ordering::Relaxed),
            Stats::SendBytes(value) => self.send_bytes.fetch_add(*value, Ordering::Relaxed),
            Stats::SendPkts(value) => self.send_pkts.fetch_add(*value, Ordering::Relaxed),
            Stats::DroppedPkts(value) => self.dropped_pkts.fetch_add(*value, Ordering::Relaxed),
        };
    }
}

#[derive(Default)]
struct Totals {
    total: Counts,
    udp: Counts,
    tls: Counts,
}

/// Summarized traffic counters for Global/UDP/TLS.
#[derive(Clone, Default)]
pub struct Statistics(Arc<Totals>);

impl Statistics {
    /// Get a cheap handle the transports report through.
    pub fn get_reporter(&self, transport: Transport) -> Reporter {
        Reporter {
            totals: self.0.clone(),
            transport,
        }
    }

    pub fn counts(&self, transport: Transport) -> &Counts {
        match transport {
            Transport::Udp => &self.0.udp,
            Transport::Tls => &self.0.tls,
        }
    }

    pub fn total(&self) -> &Counts {
        &self.0.total
    }
}

pub struct Reporter {
    totals: Arc<Totals>,
    transport: Transport,
}

impl Reporter {
    pub fn send(&self, payload: &[Stats]) {
        for item in payload {
            self.totals.total.add(item);
            match self.transport {
                Transport::Udp => self.totals.udp.add(item),
                Transport::Tls => self.totals.tls.add(item),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_feeds_both_buckets() {
        let statistics = Statistics::default();
        let reporter = statistics.get_reporter(Transport::Udp);

        reporter.send(&[Stats::ReceivedBytes(64), Stats::ReceivedPkts(1)]);

        assert_eq!(statistics.total().received_bytes.load(Ordering::Relaxed), 64);
        assert_eq!(
            statistics
                .counts(Transport::Udp)
                .received_pkts
                .load(Ordering::Relaxed),
            1
        );
        assert_eq!(
            statistics
                .counts(Transport::Tls)
                .received_pkts
                .load(Ordering::Relaxed),
            0
        );
    }
}
