//! Single-threaded event loop
//!
//! Two I/O sources (protocol socket, tunnel device) and two timer
//! sources (retransmission deadline, ping pacing) multiplexed over one
//! poll call. Both descriptors are nonblocking and drained
//! opportunistically every iteration; poll only decides how long to
//! sleep. Handlers run to completion, so all state is single-writer.

use std::time::{Duration, Instant};

use anyhow::Result;
use sgsn_gtp::GtpEngine;

use crate::config::Config;
use crate::context::{EmuContext, EmuState};
use crate::ping::PingEngine;
use crate::sm;
use crate::tun_path::{ipv4_source, TunDevice};

/// Teardown allowance past the run time limit
const GRACE: Duration = Duration::from_secs(10);

/// Drive the loop until the process is back in `Idle` or the time limit
/// plus grace runs out
pub fn run<G: GtpEngine, T: TunDevice>(
    ctx: &mut EmuContext,
    cfg: &Config,
    engine: &mut G,
    mut tun: Option<T>,
    mut ping: Option<PingEngine>,
) -> Result<()> {
    while tick(ctx, cfg, engine, &mut tun, &mut ping)? {}
    Ok(())
}

/// One loop iteration; false means the loop is done
fn tick<G: GtpEngine, T: TunDevice>(
    ctx: &mut EmuContext,
    cfg: &Config,
    engine: &mut G,
    tun: &mut Option<T>,
    ping: &mut Option<PingEngine>,
) -> Result<bool> {
    let now = Instant::now();
    if ctx.state == EmuState::Idle {
        return Ok(false);
    }
    let timelimit = Duration::from_secs(cfg.timelimit);
    if cfg.timelimit != 0 && now >= ctx.start + timelimit + GRACE {
        log::warn!("Time limit grace period expired, giving up");
        return Ok(false);
    }

    // Run time limit reached: take everything down
    if cfg.timelimit != 0 && ctx.state == EmuState::Connected && now >= ctx.start + timelimit {
        sm::start_disconnect(ctx, engine, ping.as_mut(), now);
    }

    // Send every overdue ping, catching up after a slow iteration
    let mut ping_blocked = false;
    if ctx.state == EmuState::Connected {
        if let Some(ping) = ping.as_mut() {
            while ping.next_due(Instant::now()) == Some(Duration::ZERO) {
                // Round-robin over the contexts, skipping any whose
                // address never came up
                let start = ping.seq() as usize % ctx.sessions.len();
                let target = (0..ctx.sessions.len()).find_map(|k| {
                    let s = ctx.sessions.get((start + k) % ctx.sessions.len())?;
                    Some((s.handle?, s.addr?))
                });
                let (handle, addr) = match target {
                    Some(target) => target,
                    None => {
                        // Nothing can carry the ping; leave it due but
                        // keep it out of the wake computation so poll
                        // still sleeps
                        ping_blocked = true;
                        break;
                    }
                };
                let pack = ping.build_echo_request(addr, Instant::now());
                if let Err(e) = engine.send_gpdu(handle, &pack) {
                    log::error!("Failed to send ping through context: {e}");
                }
            }
            if ping.complete() {
                ping.finish(Instant::now());
            }
        }
    }

    // Wake for whichever deadline comes first
    let now = Instant::now();
    let mut timeout = engine.retrans_timeout(now);
    if ctx.state == EmuState::Connected && !ping_blocked {
        if let Some(due) = ping.as_ref().and_then(|p| p.next_due(now)) {
            timeout = Some(timeout.map_or(due, |t| t.min(due)));
        }
    }
    let timeout_ms: libc::c_int = match timeout {
        // Round up so a sub-millisecond wait does not spin
        Some(t) => t.as_micros().div_ceil(1000).min(i32::MAX as u128) as libc::c_int,
        None => -1,
    };

    let mut fds = [
        libc::pollfd {
            fd: engine.fd(),
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            // Negative descriptors are ignored by poll
            fd: tun.as_ref().map_or(-1, |t| t.fd()),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            log::error!("poll failed: {err}");
        }
        return Ok(true);
    }
    if rc == 0 {
        // Nothing readable, let the engine retransmit
        for event in engine.retrans(Instant::now()) {
            sm::handle_event(ctx, cfg, tun.as_mut(), ping.as_mut(), event);
        }
    }

    // Host traffic toward the tunnel
    if let Some(t) = tun.as_mut() {
        match t.decaps() {
            Ok(Some(pack)) => forward_to_tunnel(ctx, engine, &pack),
            Ok(None) => {}
            Err(e) => log::error!("Tunnel device read failed: {e}"),
        }
    }

    // Engine confirmations and tunnelled payload
    match engine.decaps() {
        Ok(events) => {
            for event in events {
                sm::handle_event(ctx, cfg, tun.as_mut(), ping.as_mut(), event);
            }
        }
        Err(e) => log::error!("Failed to read from engine: {e}"),
    }

    Ok(true)
}

/// Route one host packet onto the session owning its source address
fn forward_to_tunnel<G: GtpEngine>(ctx: &EmuContext, engine: &mut G, pack: &[u8]) {
    let src = match ipv4_source(pack) {
        Some(src) => src,
        None => {
            log::debug!("Non-IPv4 packet from tunnel device, dropped");
            return;
        }
    };
    let handle = ctx
        .sessions
        .by_addr(src)
        .and_then(|index| ctx.sessions.get(index))
        .and_then(|s| s.handle);
    match handle {
        Some(handle) => {
            if let Err(e) = engine.send_gpdu(handle, pack) {
                log::error!("Failed to encapsulate packet from {src}: {e}");
            }
        }
        None => log::debug!("Packet from unbound source {src}, dropped"),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeTun, ScriptedEngine};
    use clap::Parser;
    use sgsn_gtp::{CauseCode, Eua, GtpEvent, SessionHandle};
    use sgsn_pool::AddressPool;
    use std::net::Ipv4Addr;

    fn config(args: &[&str]) -> Config {
        let mut argv = vec!["sgsnemu", "--remote", "192.168.0.1"];
        argv.extend_from_slice(args);
        Config::parse_from(argv)
    }

    fn context(contexts: usize) -> EmuContext {
        let pool = AddressPool::new("10.0.0.0/24", 0).unwrap();
        EmuContext::new(pool, contexts)
    }

    // Poll must never block against fakes
    fn engine() -> ScriptedEngine {
        let mut engine = ScriptedEngine::new();
        engine.retrans_due = Some(Duration::ZERO);
        engine
    }

    fn accepted(handle: u32, addr: Ipv4Addr) -> GtpEvent {
        GtpEvent::CreateConfirm {
            handle: SessionHandle(handle),
            cause: CauseCode(128),
            eua: Some(Eua::from_ipv4(addr)),
        }
    }

    #[test]
    fn test_run_exits_when_idle() {
        let mut ctx = context(1);
        let mut eng = engine();
        run::<_, FakeTun>(&mut ctx, &config(&[]), &mut eng, None, None).unwrap();
        assert!(eng.created.is_empty());
    }

    #[test]
    fn test_run_full_lifecycle() {
        let mut ctx = context(1);
        let cfg = config(&[]);
        let mut eng = engine();
        sm::start_contexts(&mut ctx, &cfg, &mut eng).unwrap();

        let addr = Ipv4Addr::new(10, 0, 0, 3);
        eng.push_event(accepted(0, addr));
        eng.push_event(GtpEvent::DeleteConfirm {
            handle: SessionHandle(0),
            cause: CauseCode(128),
        });
        run::<_, FakeTun>(&mut ctx, &cfg, &mut eng, None, None).unwrap();
        assert_eq!(ctx.state, EmuState::Idle);
        assert_eq!(ctx.sessions.by_addr(addr), None);
        assert_eq!(ctx.pool.free_count(), ctx.pool.capacity());
    }

    #[test]
    fn test_rejected_confirm_stops_loop() {
        let mut ctx = context(1);
        let cfg = config(&[]);
        let mut eng = engine();
        sm::start_contexts(&mut ctx, &cfg, &mut eng).unwrap();
        eng.push_event(GtpEvent::CreateConfirm {
            handle: SessionHandle(0),
            cause: CauseCode(199),
            eua: None,
        });
        run::<_, FakeTun>(&mut ctx, &cfg, &mut eng, None, None).unwrap();
        assert_eq!(ctx.state, EmuState::Idle);
    }

    #[test]
    fn test_time_limit_triggers_disconnect() {
        let mut ctx = context(1);
        let cfg = config(&["--timelimit", "1"]);
        let mut eng = engine();
        sm::start_contexts(&mut ctx, &cfg, &mut eng).unwrap();
        sm::handle_event::<FakeTun>(
            &mut ctx,
            &cfg,
            None,
            None,
            accepted(0, Ipv4Addr::new(10, 0, 0, 3)),
        );
        // Pretend the limit passed a while ago
        ctx.start = Instant::now() - Duration::from_secs(2);

        let mut tun: Option<FakeTun> = None;
        let mut ping = None;
        assert!(tick(&mut ctx, &cfg, &mut eng, &mut tun, &mut ping).unwrap());
        assert_eq!(ctx.state, EmuState::WaitDisconnect);
        assert_eq!(eng.deleted, vec![SessionHandle(0)]);
    }

    #[test]
    fn test_grace_expiry_stops_loop() {
        let mut ctx = context(1);
        let cfg = config(&["--timelimit", "1"]);
        let mut eng = engine();
        sm::start_contexts(&mut ctx, &cfg, &mut eng).unwrap();
        ctx.start = Instant::now() - Duration::from_secs(12);

        let mut tun: Option<FakeTun> = None;
        let mut ping = None;
        assert!(!tick(&mut ctx, &cfg, &mut eng, &mut tun, &mut ping).unwrap());
    }

    #[test]
    fn test_pings_sent_round_robin_when_connected() {
        let mut ctx = context(2);
        let cfg = config(&["--contexts", "2"]);
        let mut eng = engine();
        sm::start_contexts(&mut ctx, &cfg, &mut eng).unwrap();
        sm::handle_event::<FakeTun>(&mut ctx, &cfg, None, None, accepted(0, [10, 0, 0, 1].into()));
        sm::handle_event::<FakeTun>(&mut ctx, &cfg, None, None, accepted(1, [10, 0, 0, 2].into()));

        let mut tun: Option<FakeTun> = None;
        // Interval rounds to zero, so both packets are due at once
        let mut ping = Some(PingEngine::new([8, 8, 8, 8].into(), 2_000_000, 0, 2, true));
        assert!(tick(&mut ctx, &cfg, &mut eng, &mut tun, &mut ping).unwrap());
        assert_eq!(eng.gpdus.len(), 2);
        assert_eq!(eng.gpdus[0].0, SessionHandle(0));
        assert_eq!(eng.gpdus[1].0, SessionHandle(1));
        // Sources match each context's own address
        assert_eq!(&eng.gpdus[0].1[12..16], &[10, 0, 0, 1]);
        assert_eq!(&eng.gpdus[1].1[12..16], &[10, 0, 0, 2]);
        // Count exhausted, no more sends on the next turn
        assert!(tick(&mut ctx, &cfg, &mut eng, &mut tun, &mut ping).unwrap());
        assert_eq!(eng.gpdus.len(), 2);
    }

    #[test]
    fn test_ping_skips_unbound_context() {
        let mut ctx = context(2);
        let cfg = config(&["--contexts", "2"]);
        let mut eng = engine();
        sm::start_contexts(&mut ctx, &cfg, &mut eng).unwrap();
        // Context #1 never gets a confirm; its slot stays unbound
        sm::handle_event::<FakeTun>(&mut ctx, &cfg, None, None, accepted(0, [10, 0, 0, 1].into()));

        let mut tun: Option<FakeTun> = None;
        let mut ping = Some(PingEngine::new([8, 8, 8, 8].into(), 2_000_000, 0, 2, true));
        assert!(tick(&mut ctx, &cfg, &mut eng, &mut tun, &mut ping).unwrap());
        // Both pings fall through to the bound context
        assert_eq!(eng.gpdus.len(), 2);
        assert_eq!(eng.gpdus[0].0, SessionHandle(0));
        assert_eq!(eng.gpdus[1].0, SessionHandle(0));
    }

    #[test]
    fn test_unbound_ping_target_suppresses_ping_deadline() {
        let mut ctx = context(1);
        let cfg = config(&[]);
        let mut eng = engine();
        sm::start_contexts(&mut ctx, &cfg, &mut eng).unwrap();
        ctx.state = EmuState::Connected;
        eng.retrans_due = Some(Duration::from_millis(50));

        let mut tun: Option<FakeTun> = None;
        let mut ping = Some(PingEngine::new([8, 8, 8, 8].into(), 1, 0, 0, true));
        let before = Instant::now();
        assert!(tick(&mut ctx, &cfg, &mut eng, &mut tun, &mut ping).unwrap());
        assert!(eng.gpdus.is_empty());
        // The undeliverable due ping must not shrink the poll timeout
        // to zero; the retransmission deadline still governs the sleep
        assert!(before.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_no_pings_before_connected() {
        let mut ctx = context(1);
        let cfg = config(&[]);
        let mut eng = engine();
        sm::start_contexts(&mut ctx, &cfg, &mut eng).unwrap();

        let mut tun: Option<FakeTun> = None;
        let mut ping = Some(PingEngine::new([8, 8, 8, 8].into(), 1000, 0, 0, true));
        assert!(tick(&mut ctx, &cfg, &mut eng, &mut tun, &mut ping).unwrap());
        assert!(eng.gpdus.is_empty());
    }

    #[test]
    fn test_tun_traffic_forwarded_by_source() {
        let mut ctx = context(1);
        let cfg = config(&["--createif"]);
        let mut eng = engine();
        let mut tun_dev = FakeTun::new();
        sm::start_contexts(&mut ctx, &cfg, &mut eng).unwrap();
        let addr = Ipv4Addr::new(10, 0, 0, 3);
        sm::handle_event(&mut ctx, &cfg, Some(&mut tun_dev), None, accepted(0, addr));

        let mut pack = vec![0u8; 20];
        pack[0] = 0x45;
        pack[12..16].copy_from_slice(&addr.octets());
        tun_dev.readable.push_back(pack.clone());
        // Unbound source gets dropped silently
        let mut stray = pack.clone();
        stray[12..16].copy_from_slice(&[10, 0, 0, 200]);
        tun_dev.readable.push_back(stray);

        let mut tun = Some(tun_dev);
        let mut ping = None;
        assert!(tick(&mut ctx, &cfg, &mut eng, &mut tun, &mut ping).unwrap());
        assert!(tick(&mut ctx, &cfg, &mut eng, &mut tun, &mut ping).unwrap());
        assert_eq!(eng.gpdus.len(), 1);
        assert_eq!(eng.gpdus[0].1, pack);
    }

    #[test]
    fn test_payload_reaches_tun_in_interface_mode() {
        let mut ctx = context(1);
        let cfg = config(&["--createif"]);
        let mut eng = engine();
        let mut tun_dev = FakeTun::new();
        sm::start_contexts(&mut ctx, &cfg, &mut eng).unwrap();
        sm::handle_event(
            &mut ctx,
            &cfg,
            Some(&mut tun_dev),
            None,
            accepted(0, [10, 0, 0, 3].into()),
        );

        eng.push_event(GtpEvent::Payload {
            handle: SessionHandle(0),
            data: vec![0x45, 1, 2, 3],
        });
        let mut tun = Some(tun_dev);
        let mut ping = None;
        assert!(tick(&mut ctx, &cfg, &mut eng, &mut tun, &mut ping).unwrap());
        assert_eq!(tun.as_ref().unwrap().written, vec![vec![0x45, 1, 2, 3]]);
    }
}
