//! SGSN emulator
//!
//! Establishes PDP contexts against a GTP gateway, then either moves
//! packets between a local tunnel interface and the gateway or pushes
//! paced ICMP echo requests through the contexts and reports latency.

pub mod config;
pub mod context;
pub mod event;
pub mod gtp_path;
pub mod ping;
pub mod sm;
pub mod tun_path;

#[cfg(test)]
mod testutil;

use std::net::SocketAddrV4;

use anyhow::{Context as _, Result};
use clap::Parser;
use sgsn_gtp::wire::GTPC_PORT;
use sgsn_gtp::GtpEngine;
use sgsn_pool::{AddressPool, POOL_NO_BROADCAST, POOL_NO_NETWORK};

use crate::context::EmuContext;
use crate::ping::PingEngine;
use crate::tun_path::NetTun;

fn main() -> Result<()> {
    env_logger::init();
    let cfg = config::Config::parse();
    cfg.validate()?;

    log::debug!(
        "remote {} listen {} contexts {} apn {} imsi {} timelimit {}",
        cfg.remote,
        cfg.listen,
        cfg.contexts,
        cfg.apn,
        cfg.imsi,
        cfg.timelimit
    );

    log::info!("Initialising GTP engine");
    let mut engine = gtp_path::GtpPath::new(
        SocketAddrV4::new(cfg.listen, GTPC_PORT),
        SocketAddrV4::new(cfg.remote, GTPC_PORT),
    )
    .context("failed to bind signalling socket")?;

    let pool = AddressPool::new(&cfg.pool, POOL_NO_NETWORK | POOL_NO_BROADCAST)
        .context("invalid address pool")?;
    let mut ctx = EmuContext::new(pool, cfg.contexts);

    let tun = if cfg.createif {
        log::info!("Setting up interface");
        Some(NetTun::open("").context("failed to create tunnel device")?)
    } else {
        None
    };
    let ping = cfg
        .pinghost
        .map(|host| PingEngine::new(host, cfg.pingrate, cfg.pingsize, cfg.pingcount, cfg.pingquiet));

    // See if anybody is there
    log::info!("Sending off echo request");
    engine.echo_request(cfg.remote)?;

    sm::start_contexts(&mut ctx, &cfg, &mut engine)?;
    event::run(&mut ctx, &cfg, &mut engine, tun, ping)?;

    log::info!("Shutdown complete");
    Ok(())
}
