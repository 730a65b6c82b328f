//! Lifecycle transition handlers
//!
//! The process as a whole moves Idle -> WaitConnect -> Connected ->
//! WaitDisconnect -> Idle, driven by protocol confirmations and the run
//! time limit. Any rejected or unusable create confirmation drops the
//! process straight back to Idle; retransmission of requests that never
//! got a confirmation at all is the protocol engine's business.

use std::time::Instant;

use anyhow::Result;
use sgsn_gtp::{CauseCode, Eua, GtpEngine, GtpEvent, SessionHandle};

use crate::config::Config;
use crate::context::{EmuContext, EmuState};
use crate::ping::PingEngine;
use crate::tun_path::TunDevice;

/// Issue create requests for every configured context
pub fn start_contexts<G: GtpEngine>(
    ctx: &mut EmuContext,
    cfg: &Config,
    engine: &mut G,
) -> Result<()> {
    for n in 0..ctx.sessions.len() {
        log::info!("Setting up PDP context #{n}");
        let handle = engine.create_context(&cfg.session_request(n))?;
        if let Some(session) = ctx.sessions.get_mut(n) {
            session.handle = Some(handle);
        }
    }
    ctx.state = EmuState::WaitConnect;
    log::info!("Waiting for response from ggsn........");
    Ok(())
}

/// Take every established context down; flushes ping statistics first
/// since no replies will be routed afterwards
pub fn start_disconnect<G: GtpEngine>(
    ctx: &mut EmuContext,
    engine: &mut G,
    ping: Option<&mut PingEngine>,
    now: Instant,
) {
    ctx.state = EmuState::WaitDisconnect;
    if let Some(ping) = ping {
        if ping.transmitted() > 0 {
            ping.finish(now);
        }
    }
    for n in 0..ctx.sessions.len() {
        let handle = match ctx.sessions.get(n).and_then(|s| s.handle) {
            Some(handle) => handle,
            None => continue,
        };
        log::info!("Disconnecting PDP context #{n}");
        if let Err(e) = engine.delete_context(handle) {
            log::error!("Failed to send delete request for context #{n}: {e}");
        }
    }
}

/// Dispatch one engine event
pub fn handle_event<T: TunDevice>(
    ctx: &mut EmuContext,
    cfg: &Config,
    tun: Option<&mut T>,
    ping: Option<&mut PingEngine>,
    event: GtpEvent,
) {
    match event {
        GtpEvent::EchoConfirm { cause: Some(cause) } => {
            log::info!("Received echo response. Cause value: {cause}");
        }
        GtpEvent::EchoConfirm { cause: None } => {
            log::warn!("Echo request timed out");
        }
        GtpEvent::CreateConfirm {
            handle,
            cause,
            eua,
        } => create_confirm(ctx, cfg, tun, handle, cause, eua),
        GtpEvent::DeleteConfirm { handle, cause } => {
            delete_confirm(ctx, cfg, tun, handle, cause)
        }
        GtpEvent::Payload { handle, data } => payload(ctx, tun, ping, handle, data),
    }
}

fn create_confirm<T: TunDevice>(
    ctx: &mut EmuContext,
    cfg: &Config,
    tun: Option<&mut T>,
    handle: SessionHandle,
    cause: CauseCode,
    eua: Option<Eua>,
) {
    let index = match ctx.sessions.by_handle(handle) {
        Some(index) => index,
        None => {
            log::warn!("Create confirmation for unknown session {handle}");
            return;
        }
    };
    if !cause.is_accepted() {
        log::error!("Received create PDP context response. Cause value: {cause}");
        ctx.state = EmuState::Idle;
        return;
    }
    let addr = match eua.and_then(|eua| eua.to_ipv4()) {
        Some(addr) => addr,
        None => {
            log::error!(
                "Received create PDP context response without a usable end user address"
            );
            ctx.state = EmuState::Idle;
            return;
        }
    };
    log::info!("Received create PDP context response. IP address: {addr}");

    if let Some(tun) = tun {
        if let Err(e) = tun.add_addr(addr) {
            log::error!("Failed to add address {addr}: {e}");
        }
        if cfg.defaultroute {
            if let Err(e) = tun.set_default_route(addr) {
                log::error!("Failed to set default route: {e}");
            }
        }
        if let Some(script) = &cfg.ipup {
            if let Err(e) = tun.run_script(script, addr) {
                log::error!("Up-script {script} failed: {e}");
            }
        }
    }

    // The assigned address is expected to fall inside the configured
    // pool; one that does not is logged and tracked without a claim
    let member = match ctx.pool.allocate(addr) {
        Ok(member) => Some(member),
        Err(e) => {
            log::warn!("Assigned address {addr} not claimable: {e}");
            None
        }
    };
    ctx.sessions.bind_addr(index, addr, member);
    ctx.state = EmuState::Connected;
}

fn delete_confirm<T: TunDevice>(
    ctx: &mut EmuContext,
    cfg: &Config,
    tun: Option<&mut T>,
    handle: SessionHandle,
    cause: CauseCode,
) {
    let index = match ctx.sessions.by_handle(handle) {
        Some(index) => index,
        None => {
            log::warn!("Delete confirmation for unknown session {handle}");
            return;
        }
    };
    log::info!("Received delete PDP context response. Cause value: {cause}");

    if let (Some(tun), Some(script), Some(addr)) = (
        tun,
        cfg.ipdown.as_ref(),
        ctx.sessions.get(index).and_then(|s| s.addr),
    ) {
        if let Err(e) = tun.run_script(script, addr) {
            log::error!("Down-script {script} failed: {e}");
        }
    }

    if let Some(member) = ctx.sessions.unbind_addr(index) {
        if let Err(e) = ctx.pool.release(member) {
            log::warn!("Failed to release address claim: {e}");
        }
    }
    if let Some(session) = ctx.sessions.get_mut(index) {
        session.handle = None;
    }
    ctx.state = EmuState::Idle;
}

/// Tunnelled payload: toward the host stack in interface mode, into the
/// reply accounting in diagnostic mode
fn payload<T: TunDevice>(
    ctx: &mut EmuContext,
    tun: Option<&mut T>,
    ping: Option<&mut PingEngine>,
    handle: SessionHandle,
    data: Vec<u8>,
) {
    if ctx.sessions.by_handle(handle).is_none() {
        log::warn!("Payload for unknown session {handle}, dropped");
        return;
    }
    if let Some(tun) = tun {
        if let Err(e) = tun.encaps(&data) {
            log::error!("Failed to write payload to tunnel device: {e}");
        }
    } else if let Some(ping) = ping {
        ping.handle_reply(&data);
    }
}

// ============================================================================
// Tests
// ============================================================================
