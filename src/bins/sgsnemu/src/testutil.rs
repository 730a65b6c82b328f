//! Shared fakes for state machine and event loop tests

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use sgsn_gtp::{GtpEngine, GtpEvent, GtpResult, SessionHandle, SessionRequest};

use crate::tun_path::{TunDevice, TunResult};

/// Engine fake that records calls and replays scripted events
#[derive(Default)]
pub struct ScriptedEngine {
    next_handle: u32,
    pub created: Vec<SessionRequest>,
    pub deleted: Vec<SessionHandle>,
    pub echoes: Vec<Ipv4Addr>,
    pub gpdus: Vec<(SessionHandle, Vec<u8>)>,
    pub events: VecDeque<GtpEvent>,
    pub retrans_due: Option<Duration>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&mut self, event: GtpEvent) {
        self.events.push_back(event);
    }
}

impl GtpEngine for ScriptedEngine {
    fn fd(&self) -> RawFd {
        -1
    }

    fn create_context(&mut self, req: &SessionRequest) -> GtpResult<SessionHandle> {
        self.created.push(req.clone());
        let handle = SessionHandle(self.next_handle);
        self.next_handle += 1;
        Ok(handle)
    }

    fn delete_context(&mut self, handle: SessionHandle) -> GtpResult<()> {
        self.deleted.push(handle);
        Ok(())
    }

    fn echo_request(&mut self, peer: Ipv4Addr) -> GtpResult<()> {
        self.echoes.push(peer);
        Ok(())
    }

    fn send_gpdu(&mut self, handle: SessionHandle, data: &[u8]) -> GtpResult<()> {
        self.gpdus.push((handle, data.to_vec()));
        Ok(())
    }

    fn retrans_timeout(&self, _now: Instant) -> Option<Duration> {
        self.retrans_due
    }

    fn retrans(&mut self, _now: Instant) -> Vec<GtpEvent> {
        Vec::new()
    }

    fn decaps(&mut self) -> std::io::Result<Vec<GtpEvent>> {
        Ok(self.events.drain(..).collect())
    }
}

/// Tun fake that records configuration calls and swallows packets
#[derive(Default)]
pub struct FakeTun {
    pub addrs: Vec<Ipv4Addr>,
    pub routes: Vec<Ipv4Addr>,
    pub scripts: Vec<(String, Ipv4Addr)>,
    pub written: Vec<Vec<u8>>,
    pub readable: VecDeque<Vec<u8>>,
}

impl FakeTun {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TunDevice for FakeTun {
    fn fd(&self) -> RawFd {
        -1
    }

    fn decaps(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.readable.pop_front())
    }

    fn encaps(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.written.push(data.to_vec());
        Ok(())
    }

    fn add_addr(&mut self, addr: Ipv4Addr) -> TunResult<()> {
        self.addrs.push(addr);
        Ok(())
    }

    fn set_default_route(&mut self, gw: Ipv4Addr) -> TunResult<()> {
        self.routes.push(gw);
        Ok(())
    }

    fn run_script(&mut self, path: &str, addr: Ipv4Addr) -> TunResult<()> {
        self.scripts.push((path.to_string(), addr));
        Ok(())
    }
}
