//! Linux TAP device backing a [`crate::channel::GuestChannel`].
//!
//! This is the router binary's stand-in for the real shared-memory guest
//! transport (vhost-user, virtqueues) that sits outside this crate's scope
//! per spec §1 — a TAP device hands us the same contract, one Ethernet
//! frame per read/write, so the router can run end-to-end against a real
//! guest NIC (or a `veth` pair in a test network namespace) without any
//! VMM plumbing. The device creation ioctl is the same one the teacher's
//! TUN device uses, swapped from `IFF_TUN` to `IFF_TAP` since this router
//! operates on full Ethernet frames rather than raw IP packets.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use async_trait::async_trait;
use nix::libc::{self, IFF_NO_PI, IFNAMSIZ, c_char, c_short};
use tokio::io::unix::AsyncFd;

use crate::channel::{GuestChannel, tokio_impl::MAX_FRAME_LEN};

const IFF_TAP: c_short = 0x0002;
const TUNSETIFF: nix::libc::Ioctl = 0x400454ca as nix::libc::Ioctl;

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _padding: [u8; 22],
}

/// A `/dev/net/tun`-backed TAP interface, opened non-blocking and driven
/// through `tokio`'s reactor via [`AsyncFd`].
pub struct TapDevice {
    name: String,
    file: AsyncFd<File>,
}

impl TapDevice {
    /// Open (creating if necessary) the TAP interface `name`. Requires
    /// `CAP_NET_ADMIN` — the caller is expected to run as root or with
    /// the capability granted, same as the teacher's TUN device.
    pub fn create(name: &str) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI as c_short,
            _padding: [0; 22],
        };
        if name.len() >= IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TAP device name too long",
            ));
        }
        for (i, byte) in name.bytes().enumerate() {
            ifr.ifr_name[i] = byte as c_char;
        }

        let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(TapDevice {
            name: name.to_string(),
            file: AsyncFd::new(file)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl GuestChannel for TapDevice {
    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        loop {
            let mut guard = self.file.readable().await?;
            let mut buf = vec![0u8; MAX_FRAME_LEN];
            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe {
                    libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.file.writable().await?;
            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe {
                    libc::write(fd, frame.as_ptr() as *const libc::c_void, frame.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsRawFd for TapDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.get_ref().as_raw_fd()
    }
}
