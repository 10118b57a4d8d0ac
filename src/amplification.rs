//! Anti-amplification accounting at the datagram boundary
//!
//! Until a client's address is validated, RFC 9000 §8.1 caps what a server may send to it at
//! three times the bytes received from it, counting every inbound byte regardless of whether the
//! packets inside later validate. [`TrackingFilter`] does the counting at ingress;
//! [`AntiAmplification`] holds the shared ledger the send path must check before emitting
//! anything.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use thiserror::Error;

/// Ratio of outbound budget to validated inbound bytes before address validation
pub const AMPLIFICATION_FACTOR: u64 = 3;

/// Addressing metadata accompanying a datagram through the ingress pipeline
#[derive(Debug, Copy, Clone)]
pub struct DatagramMeta {
    /// The claimed source address
    pub remote: SocketAddr,
}

/// A stage in the datagram ingress pipeline
pub trait DatagramSink {
    /// Consume one datagram
    fn on_datagram(&mut self, datagram: Bytes, meta: &DatagramMeta);
}

/// Counts every inbound byte through a caller-supplied hook, then forwards the datagram untouched
pub struct TrackingFilter<F, S> {
    count: F,
    next: S,
}

impl<F: FnMut(usize), S: DatagramSink> TrackingFilter<F, S> {
    /// Wrap `next`, reporting each datagram's size to `count` exactly once
    pub fn new(count: F, next: S) -> Self {
        Self { count, next }
    }
}

impl<F: FnMut(usize), S: DatagramSink> DatagramSink for TrackingFilter<F, S> {
    fn on_datagram(&mut self, datagram: Bytes, meta: &DatagramMeta) {
        (self.count)(datagram.len());
        self.next.on_datagram(datagram, meta);
    }
}

/// Refusal to transmit because the anti-amplification budget is exhausted
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("anti-amplification limit reached")]
pub struct Blocked;

/// The send-budget ledger for one unvalidated peer address
///
/// Receive workers credit it, the send path debits it, and [`validate`](Self::validate) retires
/// it once the peer proves it owns its address. All operations are atomic so the ledger can be
/// shared across threads without a lock.
#[derive(Debug, Default)]
pub struct AntiAmplification {
    received: AtomicU64,
    sent: AtomicU64,
    validated: AtomicBool,
}

impl AntiAmplification {
    /// A fresh ledger with nothing received and nothing sent
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit bytes received from the peer's claimed address
    pub fn on_datagram_received(&self, bytes: usize) {
        self.received.fetch_add(bytes as u64, Ordering::AcqRel);
    }

    /// Reserve budget to transmit `bytes`, refusing rather than overshooting the cap
    pub fn try_send(&self, bytes: usize) -> Result<(), Blocked> {
        let bytes = bytes as u64;
        if self.validated.load(Ordering::Acquire) {
            self.sent.fetch_add(bytes, Ordering::AcqRel);
            return Ok(());
        }
        let mut sent = self.sent.load(Ordering::Acquire);
        loop {
            // `received` may grow concurrently, which only ever raises the limit
            let limit = AMPLIFICATION_FACTOR * self.received.load(Ordering::Acquire);
            if sent + bytes > limit {
                return Err(Blocked);
            }
            match self.sent.compare_exchange_weak(
                sent,
                sent + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => sent = actual,
            }
        }
    }

    /// The peer has proven ownership of its address; retire the cap
    pub fn validate(&self) {
        self.validated.store(true, Ordering::Release);
    }

    /// Whether the address has been validated
    pub fn is_validated(&self) -> bool {
        self.validated.load(Ordering::Acquire)
    }

    /// Total bytes credited so far
    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    /// Total bytes debited so far
    pub fn bytes_sent(&self) -> u64 {
        self.sent.load(Ordering::Acquire)
    }

    /// Bytes that may still be sent, or `None` once the address is validated
    pub fn budget(&self) -> Option<u64> {
        if self.is_validated() {
            return None;
        }
        let limit = AMPLIFICATION_FACTOR * self.bytes_received();
        Some(limit.saturating_sub(self.bytes_sent()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn meta() -> DatagramMeta {
        DatagramMeta {
            remote: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4433)),
        }
    }

    struct Recorder(Vec<Bytes>);

    impl DatagramSink for Recorder {
        fn on_datagram(&mut self, datagram: Bytes, _: &DatagramMeta) {
            self.0.push(datagram);
        }
    }

    #[test]
    fn filter_counts_once_and_forwards_unmodified() {
        let mut counted = 0;
        let datagram = Bytes::from_static(&[0x5a; 1200]);
        let recorded = {
            let mut filter = TrackingFilter::new(|n| counted += n, Recorder(Vec::new()));
            filter.on_datagram(datagram.clone(), &meta());
            filter.on_datagram(Bytes::from_static(&[0x5b; 37]), &meta());
            filter.next.0
        };
        assert_eq!(counted, 1237);
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0], datagram);
        assert_eq!(recorded[1].len(), 37);
    }

    #[test]
    fn budget_is_three_times_received() {
        let ledger = AntiAmplification::new();
        assert_eq!(ledger.budget(), Some(0));
        assert_eq!(ledger.try_send(1), Err(Blocked));

        ledger.on_datagram_received(1200);
        assert_eq!(ledger.budget(), Some(3600));
        ledger.try_send(1500).unwrap();
        ledger.try_send(2100).unwrap();
        assert_eq!(ledger.budget(), Some(0));
        assert_eq!(ledger.try_send(1), Err(Blocked));

        // More inbound bytes reopen the window
        ledger.on_datagram_received(100);
        ledger.try_send(300).unwrap();
        assert_eq!(ledger.try_send(1), Err(Blocked));
    }

    #[test]
    fn validation_lifts_the_cap() {
        let ledger = AntiAmplification::new();
        ledger.on_datagram_received(10);
        assert_eq!(ledger.try_send(1_000_000), Err(Blocked));
        ledger.validate();
        assert_eq!(ledger.budget(), None);
        ledger.try_send(1_000_000).unwrap();
        assert_eq!(ledger.bytes_sent(), 1_000_000);
    }
}
