//! Tunnel-device boundary
//!
//! The event loop talks to a layer-3 device through [`TunDevice`];
//! [`NetTun`] is the Linux implementation over /dev/net/tun. Address
//! and route configuration go through the `ip` tool rather than raw
//! netlink.

use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::process::Command;

use thiserror::Error;

/// Maximum packet length read from the device
pub const MAX_PKT_LEN: usize = 65535;

const IFNAMSIZ: usize = 16;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// Tunnel device error type
#[derive(Error, Debug)]
pub enum TunError {
    /// Device node or ioctl failure
    #[error("Syscall failed: errno {0}: {1}")]
    Syscall(i32, String),

    /// Helper command failed
    #[error("Command failed: {0}")]
    Command(String),

    /// Read/write failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel device result type
pub type TunResult<T> = Result<T, TunError>;

/// Layer-3 tunnel device as the event loop sees it
pub trait TunDevice {
    /// Pollable descriptor
    fn fd(&self) -> RawFd;

    /// Read one packet; `None` when nothing is pending
    fn decaps(&mut self) -> std::io::Result<Option<Vec<u8>>>;

    /// Write one packet toward the host stack
    fn encaps(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Attach an address with a host netmask
    fn add_addr(&mut self, addr: Ipv4Addr) -> TunResult<()>;

    /// Point the default route at the device
    fn set_default_route(&mut self, gw: Ipv4Addr) -> TunResult<()>;

    /// Run a user hook with the device name and address as arguments
    fn run_script(&mut self, path: &str, addr: Ipv4Addr) -> TunResult<()>;
}

/// Source address of an IPv4 packet, used to route tunnel traffic back
/// to its session
pub fn ipv4_source(pack: &[u8]) -> Option<Ipv4Addr> {
    if pack.len() < 20 || pack[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(pack[12], pack[13], pack[14], pack[15]))
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[repr(C)]
struct Ifreq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

/// Linux TUN device
pub struct NetTun {
    fd: RawFd,
    name: String,
}

impl NetTun {
    /// Open /dev/net/tun and create a layer-3 device without packet
    /// information framing
    pub fn open(ifname: &str) -> TunResult<NetTun> {
        let fd =
            unsafe { libc::open(b"/dev/net/tun\0".as_ptr().cast(), libc::O_RDWR | libc::O_NONBLOCK) };
        if fd < 0 {
            return Err(TunError::Syscall(
                errno(),
                "failed to open /dev/net/tun".into(),
            ));
        }

        let mut ifr = Ifreq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _padding: [0; 22],
        };
        for (i, &b) in ifname.as_bytes().iter().take(IFNAMSIZ - 1).enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }

        let rc = unsafe { libc::ioctl(fd, TUNSETIFF, &ifr as *const Ifreq) };
        if rc < 0 {
            let e = errno();
            unsafe { libc::close(fd) };
            return Err(TunError::Syscall(e, "ioctl TUNSETIFF failed".into()));
        }

        let name: String = ifr
            .ifr_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8 as char)
            .collect();
        log::info!("Created tunnel device {name}");
        Ok(NetTun { fd, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ip_cmd(&self, args: &[&str]) -> TunResult<()> {
        let status = Command::new("ip").args(args).status()?;
        if !status.success() {
            return Err(TunError::Command(format!("ip {}", args.join(" "))));
        }
        Ok(())
    }
}

impl Drop for NetTun {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

impl TunDevice for NetTun {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn decaps(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let mut buffer = vec![0u8; MAX_PKT_LEN];
        let n = unsafe { libc::read(self.fd, buffer.as_mut_ptr().cast(), buffer.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(None);
        }
        buffer.truncate(n as usize);
        Ok(Some(buffer))
    }

    fn encaps(&mut self, data: &[u8]) -> std::io::Result<()> {
        let n = unsafe { libc::write(self.fd, data.as_ptr().cast(), data.len()) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn add_addr(&mut self, addr: Ipv4Addr) -> TunResult<()> {
        self.ip_cmd(&["addr", "add", &format!("{addr}/32"), "dev", &self.name])?;
        self.ip_cmd(&["link", "set", &self.name, "up"])
    }

    fn set_default_route(&mut self, gw: Ipv4Addr) -> TunResult<()> {
        self.ip_cmd(&[
            "route",
            "add",
            "default",
            "via",
            &gw.to_string(),
            "dev",
            &self.name,
        ])
    }

    fn run_script(&mut self, path: &str, addr: Ipv4Addr) -> TunResult<()> {
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(format!("{path} {} {addr}", self.name))
            .status()?;
        if !status.success() {
            return Err(TunError::Command(path.to_string()));
        }
        Ok(())
    }
}
