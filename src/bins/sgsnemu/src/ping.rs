//! ICMP echo generation, reply accounting and latency statistics
//!
//! Packets are built raw (IPv4 header plus ICMP echo) and pushed through
//! the tunnel as user payload; replies come back the same way. Pacing is
//! absolute: the k-th packet is due at `first_send + k/rate`, so a slow
//! iteration catches up with a burst instead of drifting.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// IPv4 header length (no options)
pub const PING_IP_HDR: usize = 20;

/// ICMP echo header length
pub const PING_ICMP_HDR: usize = 8;

/// Maximum echo payload
pub const PING_MAX_DATA: usize = 2048;

/// Embedded send timestamp length (secs u64 BE + micros u64 BE)
pub const TIMESTAMP_LEN: usize = 16;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const IP_PROTO_ICMP: u8 = 1;

/// Ones-complement checksum over big-endian 16-bit words, an odd
/// trailing byte padded as the high byte of a final word
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [odd] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*odd, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn proto_name(proto: u8) -> &'static str {
    match proto {
        1 => "ICMP",
        6 => "TCP",
        17 => "UDP",
        _ => "Unknown",
    }
}

fn icmp_type_name(t: u8) -> &'static str {
    match t {
        0 => "Echo Reply",
        3 => "Dest Unreachable",
        4 => "Source Quench",
        5 => "Redirect",
        8 => "Echo",
        11 => "Time Exceeded",
        12 => "Parameter Problem",
        13 => "Timestamp",
        14 => "Timestamp Reply",
        15 => "Info Request",
        16 => "Info Reply",
        _ => "OUT-OF-RANGE",
    }
}

/// Paced echo sender with reply statistics
pub struct PingEngine {
    host: Ipv4Addr,
    rate: u32,
    size: usize,
    count: u32,
    quiet: bool,
    /// Next sequence number to send
    seq: u32,
    /// Send time of the first packet, pacing anchor
    first: Option<Instant>,
    transmitted: u32,
    /// Valid echo replies
    received: u32,
    /// Everything that came back, echo reply or not
    total_received: u32,
    /// Round-trip accumulators, microseconds
    tmin: u64,
    tmax: u64,
    tsum: u64,
    timed: u32,
    /// Statistics already flushed
    finished: bool,
}

impl PingEngine {
    pub fn new(host: Ipv4Addr, rate: u32, size: usize, count: u32, quiet: bool) -> Self {
        PingEngine {
            host,
            rate: rate.max(1),
            size,
            count,
            quiet,
            seq: 0,
            first: None,
            transmitted: 0,
            received: 0,
            total_received: 0,
            tmin: u64::MAX,
            tmax: 0,
            tsum: 0,
            timed: 0,
            finished: false,
        }
    }

    pub fn host(&self) -> Ipv4Addr {
        self.host
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn transmitted(&self) -> u32 {
        self.transmitted
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    /// Whether the configured packet count still allows sending
    pub fn sending(&self) -> bool {
        self.count == 0 || self.seq < self.count
    }

    /// All expected replies in, statistics not yet reported
    pub fn complete(&self) -> bool {
        self.transmitted > 0
            && self.count != 0
            && self.received >= self.count
            && !self.finished
    }

    /// Time until the next packet is due, `None` when sending is over.
    /// Zero both before the first send and when behind schedule.
    pub fn next_due(&self, now: Instant) -> Option<Duration> {
        if !self.sending() {
            return None;
        }
        let first = match self.first {
            Some(first) => first,
            None => return Some(Duration::ZERO),
        };
        let target =
            first + Duration::from_micros(1_000_000 / u64::from(self.rate) * u64::from(self.seq));
        Some(target.saturating_duration_since(now))
    }

    /// Build the next echo request from `src` to the ping host.
    ///
    /// Payload is an ascending byte pattern; when it is wide enough the
    /// first 16 bytes carry the send timestamp used for round-trip
    /// measurement.
    pub fn build_echo_request(&mut self, src: Ipv4Addr, now: Instant) -> Vec<u8> {
        if self.first.is_none() {
            self.first = Some(now);
        }
        let total = PING_IP_HDR + PING_ICMP_HDR + self.size;
        let mut pack = vec![0u8; total];

        pack[0] = 0x45; // version 4, header length 5 words
        pack[1] = 0x00; // type of service
        pack[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        // identification zero, don't-fragment set
        pack[6] = 0x40;
        pack[8] = 0x40; // TTL
        pack[9] = IP_PROTO_ICMP;
        pack[12..16].copy_from_slice(&src.octets());
        pack[16..20].copy_from_slice(&self.host.octets());

        pack[20] = ICMP_ECHO_REQUEST;
        pack[24..26].copy_from_slice(&0u16.to_be_bytes()); // identifier
        pack[26..28].copy_from_slice(&(self.seq as u16).to_be_bytes());

        let data = &mut pack[PING_IP_HDR + PING_ICMP_HDR..];
        for (n, b) in data.iter_mut().enumerate() {
            *b = n as u8;
        }
        if self.size >= TIMESTAMP_LEN {
            encode_timestamp(&mut data[..TIMESTAMP_LEN]);
        }

        let ipcheck = checksum(&pack[..PING_IP_HDR]);
        pack[10..12].copy_from_slice(&ipcheck.to_be_bytes());
        let icmpcheck = checksum(&pack[PING_IP_HDR..]);
        pack[22..24].copy_from_slice(&icmpcheck.to_be_bytes());

        self.seq += 1;
        self.transmitted += 1;
        pack
    }

    /// Account for one packet that came back through the tunnel
    pub fn handle_reply(&mut self, pack: &[u8]) {
        if pack.len() < PING_IP_HDR + PING_ICMP_HDR {
            println!("packet too short ({} bytes)", pack.len());
            return;
        }
        let src = Ipv4Addr::new(pack[12], pack[13], pack[14], pack[15]);
        self.total_received += 1;

        let proto = pack[9];
        if proto != IP_PROTO_ICMP {
            if !self.quiet {
                println!(
                    "{} bytes from {src}: ip_protocol={proto} ({})",
                    pack.len(),
                    proto_name(proto)
                );
            }
            return;
        }
        let icmp_type = pack[20];
        if icmp_type != ICMP_ECHO_REPLY {
            if !self.quiet {
                println!(
                    "{} bytes from {src}: icmp_type={icmp_type} ({}) icmp_code={}",
                    pack.len(),
                    icmp_type_name(icmp_type),
                    pack[21]
                );
            }
            return;
        }

        self.received += 1;
        let seq = u16::from_be_bytes([pack[26], pack[27]]);
        if pack.len() >= PING_IP_HDR + PING_ICMP_HDR + TIMESTAMP_LEN {
            let data = &pack[PING_IP_HDR + PING_ICMP_HDR..];
            let trip = decode_rtt(&data[..TIMESTAMP_LEN]);
            self.tsum += trip;
            self.tmin = self.tmin.min(trip);
            self.tmax = self.tmax.max(trip);
            self.timed += 1;
            if !self.quiet {
                println!(
                    "{} bytes from {src}: icmp_seq={seq} time={:.3} ms",
                    pack.len(),
                    trip as f64 / 1000.0
                );
            }
        } else if !self.quiet {
            println!("{} bytes from {src}: icmp_seq={seq}", pack.len());
        }
    }

    /// Print the statistics block and reset the transmit counter so a
    /// second flush at teardown stays silent about the same run
    pub fn finish(&mut self, now: Instant) {
        let elapsed = self
            .first
            .map(|first| now.saturating_duration_since(first))
            .unwrap_or(Duration::ZERO);
        println!();
        println!("----{} PING Statistics----", self.host);
        print!(
            "{} packets transmitted in {:.3} seconds, {} packets received, ",
            self.transmitted,
            elapsed.as_secs_f64(),
            self.received
        );
        if self.transmitted > 0 {
            if self.received > self.transmitted {
                print!("-- somebody's printing up packets!");
            } else {
                print!(
                    "{}% packet loss",
                    (self.transmitted - self.received) * 100 / self.transmitted
                );
            }
        }
        println!();
        if self.timed > 0 {
            println!(
                "round-trip (ms)  min/avg/max = {:.3}/{:.3}/{:.3}",
                self.tmin as f64 / 1000.0,
                self.tsum as f64 / 1000.0 / f64::from(self.timed),
                self.tmax as f64 / 1000.0
            );
        }
        self.transmitted = 0;
        self.finished = true;
    }
}

fn encode_timestamp(buf: &mut [u8]) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    buf[..8].copy_from_slice(&now.as_secs().to_be_bytes());
    buf[8..16].copy_from_slice(&u64::from(now.subsec_micros()).to_be_bytes());
}

/// Round-trip time in microseconds from an embedded send timestamp;
/// clock skew yielding a negative trip clamps to zero
fn decode_rtt(data: &[u8]) -> u64 {
    let mut secs = [0u8; 8];
    let mut micros = [0u8; 8];
    secs.copy_from_slice(&data[..8]);
    micros.copy_from_slice(&data[8..16]);
    let sent = u64::from_be_bytes(secs)
        .saturating_mul(1_000_000)
        .saturating_add(u64::from_be_bytes(micros));
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let now_us = now.as_secs() * 1_000_000 + u64::from(now.subsec_micros());
    now_us.saturating_sub(sent)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(rate: u32, size: usize, count: u32) -> PingEngine {
        PingEngine::new(Ipv4Addr::new(8, 8, 8, 8), rate, size, count, true)
    }

    // A buffer containing its own checksum checksums to zero
    fn verify(data: &[u8]) -> u16 {
        checksum(data)
    }

    #[test]
    fn test_checksum_known_vector() {
        // RFC 1071 example words 0x0001 0xf203 0xf4f5 0xf6f7
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2u16);
    }

    #[test]
    fn test_checksum_odd_length() {
        assert_eq!(checksum(&[0xff]), !0xff00u16);
    }

    #[test]
    fn test_packet_layout() {
        let mut eng = engine(1, 56, 0);
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let pack = eng.build_echo_request(src, Instant::now());
        assert_eq!(pack.len(), 28 + 56);
        assert_eq!(pack[0], 0x45);
        assert_eq!(u16::from_be_bytes([pack[2], pack[3]]), 84);
        assert_eq!((pack[6], pack[7]), (0x40, 0x00)); // don't fragment
        assert_eq!(pack[8], 0x40);
        assert_eq!(pack[9], 1);
        assert_eq!(&pack[12..16], &src.octets());
        assert_eq!(&pack[16..20], &[8, 8, 8, 8]);
        assert_eq!(pack[20], 8);
        assert_eq!(pack[21], 0);
        assert_eq!(u16::from_be_bytes([pack[26], pack[27]]), 0);
        // Both checksums self-verify
        assert_eq!(verify(&pack[..PING_IP_HDR]), 0);
        assert_eq!(verify(&pack[PING_IP_HDR..]), 0);
    }

    #[test]
    fn test_sequence_increments() {
        let mut eng = engine(1, 0, 0);
        let src = Ipv4Addr::new(10, 0, 0, 1);
        for expect in 0..3u16 {
            let pack = eng.build_echo_request(src, Instant::now());
            assert_eq!(u16::from_be_bytes([pack[26], pack[27]]), expect);
        }
        assert_eq!(eng.transmitted(), 3);
    }

    #[test]
    fn test_small_payload_has_no_timestamp() {
        let mut eng = engine(1, 8, 0);
        let pack = eng.build_echo_request(Ipv4Addr::new(10, 0, 0, 1), Instant::now());
        // Ascending pattern untouched
        assert_eq!(&pack[28..], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(verify(&pack[PING_IP_HDR..]), 0);
    }

    #[test]
    fn test_pacing_absolute_schedule() {
        let mut eng = engine(10, 0, 0);
        let t0 = Instant::now();
        // Before the first send everything is due immediately
        assert_eq!(eng.next_due(t0), Some(Duration::ZERO));
        eng.build_echo_request(Ipv4Addr::new(10, 0, 0, 1), t0);
        // Second packet due 100 ms after the first, regardless of when
        // we ask
        assert_eq!(eng.next_due(t0), Some(Duration::from_millis(100)));
        assert_eq!(
            eng.next_due(t0 + Duration::from_millis(40)),
            Some(Duration::from_millis(60))
        );
        // Behind schedule clamps to zero
        assert_eq!(
            eng.next_due(t0 + Duration::from_millis(250)),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_count_limits_sending() {
        let mut eng = engine(1, 0, 2);
        let t0 = Instant::now();
        assert!(eng.sending());
        eng.build_echo_request(Ipv4Addr::new(10, 0, 0, 1), t0);
        eng.build_echo_request(Ipv4Addr::new(10, 0, 0, 1), t0);
        assert!(!eng.sending());
        assert_eq!(eng.next_due(t0), None);
    }

    fn reply_for(pack: &[u8]) -> Vec<u8> {
        let mut reply = pack.to_vec();
        reply[20] = 0; // echo reply
        let (src, dst) = (reply[12..16].to_vec(), reply[16..20].to_vec());
        reply[12..16].copy_from_slice(&dst);
        reply[16..20].copy_from_slice(&src);
        reply
    }

    #[test]
    fn test_reply_counters() {
        let mut eng = engine(1, 56, 0);
        let pack = eng.build_echo_request(Ipv4Addr::new(10, 0, 0, 1), Instant::now());
        eng.handle_reply(&reply_for(&pack));
        assert_eq!(eng.received(), 1);
        assert_eq!(eng.total_received, 1);
        assert_eq!(eng.timed, 1);
        assert!(eng.tmax >= eng.tmin);
    }

    #[test]
    fn test_reply_wrong_protocol_counts_total_only() {
        let mut eng = engine(1, 56, 0);
        let pack = eng.build_echo_request(Ipv4Addr::new(10, 0, 0, 1), Instant::now());
        let mut reply = reply_for(&pack);
        reply[9] = 6; // TCP
        eng.handle_reply(&reply);
        assert_eq!(eng.received(), 0);
        assert_eq!(eng.total_received, 1);
    }

    #[test]
    fn test_reply_non_echo_counts_total_only() {
        let mut eng = engine(1, 56, 0);
        let pack = eng.build_echo_request(Ipv4Addr::new(10, 0, 0, 1), Instant::now());
        let mut reply = reply_for(&pack);
        reply[20] = 3; // destination unreachable
        eng.handle_reply(&reply);
        assert_eq!(eng.received(), 0);
        assert_eq!(eng.total_received, 1);
    }

    #[test]
    fn test_reply_too_short_counts_nothing() {
        let mut eng = engine(1, 56, 0);
        eng.handle_reply(&[0u8; 27]);
        assert_eq!(eng.total_received, 0);
        assert_eq!(eng.received(), 0);
    }

    #[test]
    fn test_untimed_reply_skips_rtt() {
        let mut eng = engine(1, 8, 0);
        let pack = eng.build_echo_request(Ipv4Addr::new(10, 0, 0, 1), Instant::now());
        eng.handle_reply(&reply_for(&pack));
        assert_eq!(eng.received(), 1);
        assert_eq!(eng.timed, 0);
    }

    #[test]
    fn test_complete_and_finish_reset() {
        let mut eng = engine(1, 56, 1);
        let t0 = Instant::now();
        let pack = eng.build_echo_request(Ipv4Addr::new(10, 0, 0, 1), t0);
        assert!(!eng.complete());
        eng.handle_reply(&reply_for(&pack));
        assert!(eng.complete());
        eng.finish(t0 + Duration::from_secs(1));
        assert_eq!(eng.transmitted(), 0);
        assert!(!eng.complete());
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_checksum_self_verifies(data in proptest::collection::vec(any::<u8>(), 8..128)) {
                // Insert the checksum at a fixed even offset and the
                // whole buffer must sum to zero
                let mut buf = data;
                buf[2] = 0;
                buf[3] = 0;
                let ck = checksum(&buf);
                buf[2..4].copy_from_slice(&ck.to_be_bytes());
                prop_assert_eq!(checksum(&buf), 0);
            }

            #[test]
            fn prop_built_packets_verify(size in 0usize..256) {
                let mut eng = PingEngine::new(
                    Ipv4Addr::new(8, 8, 8, 8), 1, size, 0, true);
                let pack = eng.build_echo_request(
                    Ipv4Addr::new(10, 0, 0, 1), Instant::now());
                prop_assert_eq!(pack.len(), PING_IP_HDR + PING_ICMP_HDR + size);
                prop_assert_eq!(checksum(&pack[..PING_IP_HDR]), 0);
                prop_assert_eq!(checksum(&pack[PING_IP_HDR..]), 0);
            }

            #[test]
            fn prop_pacing_monotone(rate in 1u32..1000, k in 1u32..100) {
                let mut eng = PingEngine::new(
                    Ipv4Addr::new(8, 8, 8, 8), rate, 0, 0, true);
                let t0 = Instant::now();
                eng.build_echo_request(Ipv4Addr::new(10, 0, 0, 1), t0);
                let mut last = Duration::ZERO;
                for _ in 0..k {
                    let due = eng.next_due(t0).unwrap();
                    prop_assert!(due >= last);
                    last = due;
                    eng.build_echo_request(Ipv4Addr::new(10, 0, 0, 1), t0);
                }
            }
        }
    }
}
