//! Command line configuration and protocol parameter encoding
//!
//! Options are validated once at startup and then encoded into the wire
//! blobs the create-context request carries (BCD identity, TBCD
//! subscriber number, length-prefixed access point name, PAP
//! authentication block).

use std::net::Ipv4Addr;

use anyhow::{bail, Result};
use clap::Parser;
use sgsn_gtp::SessionRequest;

/// Upper bound on simultaneous contexts
pub const MAX_CONTEXTS: usize = 16;

/// SGSN emulator
#[derive(Parser, Debug, Clone)]
#[command(name = "sgsnemu")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "SGSN emulator: establishes PDP contexts against a GTP gateway")]
pub struct Config {
    /// Gateway address to signal to
    #[arg(short = 'r', long)]
    pub remote: Ipv4Addr,

    /// Local address to bind the signalling socket to
    #[arg(short = 'l', long, default_value = "0.0.0.0")]
    pub listen: Ipv4Addr,

    /// Number of contexts to establish
    #[arg(short = 'c', long, default_value_t = 1)]
    pub contexts: usize,

    /// Exit after this many seconds (0 runs until interrupted)
    #[arg(long, default_value_t = 0)]
    pub timelimit: u64,

    /// Subscriber identity, 15 digits
    #[arg(long, default_value = "240010123456789")]
    pub imsi: String,

    /// Subscriber number, international format digits
    #[arg(long, default_value = "46702123456")]
    pub msisdn: String,

    /// Quality of service profile, lower 24 bits used
    #[arg(long, default_value = "0x0b921f", value_parser = parse_qos)]
    pub qos: u32,

    /// Access point name
    #[arg(long, default_value = "internet")]
    pub apn: String,

    /// APN selection mode
    #[arg(long, default_value_t = 0x01)]
    pub selmode: u8,

    /// Authentication user id
    #[arg(long, default_value = "mig")]
    pub uid: String,

    /// Authentication password
    #[arg(long, default_value = "hemligt")]
    pub pwd: String,

    /// Create a local tunnel interface and move payload through it
    #[arg(long)]
    pub createif: bool,

    /// Point the default route at the created interface
    #[arg(long)]
    pub defaultroute: bool,

    /// Script to run after an address comes up
    #[arg(long)]
    pub ipup: Option<String>,

    /// Script to run after an address goes down
    #[arg(long)]
    pub ipdown: Option<String>,

    /// Address ranges the gateway is expected to assign from,
    /// whitespace-separated CIDR blocks
    #[arg(long, default_value = "10.0.0.0/16")]
    pub pool: String,

    /// Host to ping through the established contexts
    #[arg(long)]
    pub pinghost: Option<Ipv4Addr>,

    /// Echo requests per second
    #[arg(long, default_value_t = 1)]
    pub pingrate: u32,

    /// Echo payload size in bytes
    #[arg(long, default_value_t = 56)]
    pub pingsize: usize,

    /// Number of echo requests to send (0 means unlimited)
    #[arg(long, default_value_t = 0)]
    pub pingcount: u32,

    /// Suppress per-reply ping output
    #[arg(long)]
    pub pingquiet: bool,

    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,
}

/// QoS accepts both decimal and 0x-prefixed hex
fn parse_qos(s: &str) -> Result<u32, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("invalid QoS value '{s}': {e}"))
}

impl Config {
    /// Check option combinations that clap cannot express
    pub fn validate(&self) -> Result<()> {
        if self.imsi.len() != 15 || !self.imsi.bytes().all(|b| b.is_ascii_digit()) {
            bail!("invalid IMSI '{}': must be 15 digits", self.imsi);
        }
        if self.msisdn.is_empty()
            || self.msisdn.len() > 15
            || !self.msisdn.bytes().all(|b| b.is_ascii_digit())
        {
            bail!("invalid MSISDN '{}': must be 1-15 digits", self.msisdn);
        }
        if self.contexts == 0 || self.contexts > MAX_CONTEXTS {
            bail!(
                "invalid context count {}: must be 1-{}",
                self.contexts,
                MAX_CONTEXTS
            );
        }
        if self.apn.is_empty() || self.apn.len() > 255 {
            bail!("invalid APN: must be 1-255 characters");
        }
        if self.pingsize > crate::ping::PING_MAX_DATA {
            bail!(
                "ping payload {} exceeds maximum {}",
                self.pingsize,
                crate::ping::PING_MAX_DATA
            );
        }
        if self.defaultroute && !self.createif {
            bail!("--defaultroute requires --createif");
        }
        Ok(())
    }

    /// Identity digits packed as BCD, first digit in the lowest nibble
    pub fn imsi_bcd(&self) -> u64 {
        let mut imsi = 0u64;
        for (n, b) in self.imsi.bytes().enumerate() {
            imsi |= u64::from(b - b'0') << (4 * n);
        }
        imsi
    }

    /// Access point name with a single length-prefixed label
    pub fn apn_encoded(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.apn.len() + 1);
        v.push(self.apn.len() as u8);
        v.extend_from_slice(self.apn.as_bytes());
        v
    }

    /// Subscriber number as TBCD with an international type-of-number
    /// octet, odd digit counts padded with 0xf
    pub fn msisdn_encoded(&self) -> Vec<u8> {
        let mut v = vec![0x91];
        for (n, b) in self.msisdn.bytes().enumerate() {
            let digit = b - b'0';
            if n % 2 == 0 {
                v.push(0xf0 | digit);
            } else {
                let last = v.len() - 1;
                v[last] = (v[last] & 0x0f) | (digit << 4);
            }
        }
        v
    }

    /// Three-octet QoS profile, most significant octet first
    pub fn qos_encoded(&self) -> Vec<u8> {
        vec![
            ((self.qos >> 16) & 0xff) as u8,
            ((self.qos >> 8) & 0xff) as u8,
            (self.qos & 0xff) as u8,
        ]
    }

    /// Protocol configuration options carrying a PAP authenticate
    /// request with the configured credentials
    pub fn pco_encoded(&self) -> Vec<u8> {
        let uid = self.uid.as_bytes();
        let pwd = self.pwd.as_bytes();
        let mut v = Vec::with_capacity(uid.len() + pwd.len() + 10);
        v.push(0x80); // extension bit, configuration protocol PPP
        v.push(0xc0); // PAP protocol id
        v.push(0x23);
        v.push(0x12); // length of protocol contents
        v.push(0x01); // authenticate request
        v.push(0x01); // identifier
        v.push(0x00); // length MSB
        v.push((uid.len() + pwd.len() + 6) as u8);
        v.push(uid.len() as u8);
        v.extend_from_slice(uid);
        v.push(pwd.len() as u8);
        v.extend_from_slice(pwd);
        v
    }

    /// Parameter block for the context at `index`; contexts share the
    /// subscriber identity and differ by access point number
    pub fn session_request(&self, index: usize) -> SessionRequest {
        SessionRequest {
            imsi: self.imsi_bcd(),
            nsapi: index as u8,
            apn: self.apn_encoded(),
            msisdn: self.msisdn_encoded(),
            qos: self.qos_encoded(),
            pco: self.pco_encoded(),
            selection_mode: self.selmode,
            eua: None,
        }
    }
}
