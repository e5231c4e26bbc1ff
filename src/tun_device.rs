//! The platform TUN device. Non-blocking fd, one IP datagram per `read`/
//! `write`, opened and configured through raw `ioctl` calls issuing
//! `TUNSETIFF`/`TUNSETPERSIST`/`SIOCSIFMTU` against `/dev/net/tun`,
//! matching `hev_tunnel_open`/`hev_tunnel_set_mtu`'s sequencing.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

const IFNAMSIZ: usize = 16;
const TUN_DEV_PATH: &str = "/dev/net/tun";

// From <linux/if_tun.h>: IFF_TUN | IFF_NO_PI.
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

#[repr(C)]
struct IfReqMtu {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_mtu: libc::c_int,
    _pad: [u8; 18],
}

const TUNSETIFF: libc::c_ulong = 0x400454ca;
const TUNSETPERSIST: libc::c_ulong = 0x400454cb;
const SIOCSIFMTU: libc::c_ulong = 0x8922;

/// Abstraction over a TUN file descriptor, letting `tunnel_io` run against
/// either the real kernel device or an in-memory double in tests.
pub trait TunDevice {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
}

/// A real `/dev/net/tun` device, opened non-blocking.
pub struct LinuxTunDevice {
    file: File,
}

impl LinuxTunDevice {
    /// Open (creating if absent) the named TUN interface and set its MTU.
    pub fn open(name: &str, mtu: u16) -> io::Result<Self> {
        if name.len() >= IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name too long",
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(TUN_DEV_PATH)?;

        let mut ifr = IfReqFlags {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        let cname = CString::new(name).expect("interface name has no interior NUL");
        for (dst, src) in ifr.ifr_name.iter_mut().zip(cname.as_bytes_with_nul()) {
            *dst = *src as libc::c_char;
        }

        // Safety: `ifr` is a valid, fully initialized `ifreq`-shaped struct
        // and `file`'s fd stays open for the duration of the call.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        // Safety: same `ifr` layout contract as above; `1` means "persist".
        unsafe { libc::ioctl(file.as_raw_fd(), TUNSETPERSIST as _, &ifr) };

        let device = LinuxTunDevice { file };
        device.set_mtu(name, mtu)?;
        Ok(device)
    }

    fn set_mtu(&self, name: &str, mtu: u16) -> io::Result<()> {
        // Safety: a short-lived AF_INET socket used only to issue the MTU
        // ioctl; closed via `File::from_raw_fd`'s drop at the end of scope.
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock_file = unsafe { File::from_raw_fd(sock) };

        let mut ifr = IfReqMtu {
            ifr_name: [0; IFNAMSIZ],
            ifr_mtu: mtu as libc::c_int,
            _pad: [0; 18],
        };
        let cname = CString::new(name).expect("interface name has no interior NUL");
        for (dst, src) in ifr.ifr_name.iter_mut().zip(cname.as_bytes_with_nul()) {
            *dst = *src as libc::c_char;
        }

        // Safety: `ifr` is valid for the duration of the ioctl call.
        let ret = unsafe { libc::ioctl(sock_file.as_raw_fd(), SIOCSIFMTU as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl TunDevice for LinuxTunDevice {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlong_interface_names() {
        let name = "a".repeat(IFNAMSIZ);
        let err = LinuxTunDevice::open(&name, 1500).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
