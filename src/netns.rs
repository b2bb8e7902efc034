//! Network-namespace entry and link resolution.
//!
//! Lease acquisition must run its socket I/O inside the container's network
//! namespace. [`with_netns`] joins the calling thread to a namespace for the
//! duration of a closure; the original namespace is restored on success,
//! error, and panic. Callers must own the thread they run on (the lease
//! workers and the blocking pool do).

use std::fs::File;
use std::io::ErrorKind;
use std::os::fd::AsFd;

use nix::sched::{CloneFlags, setns};
use tracing::error;

use crate::error::{Error, Result};

/// The calling thread's own network namespace.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

struct NetnsGuard {
    original: File,
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(restore_error) = setns(self.original.as_fd(), CloneFlags::CLONE_NEWNET) {
            // The thread is stuck in a foreign namespace and must not be
            // reused for anything else.
            error!("failed to restore network namespace: {}", restore_error);
        }
    }
}

/// Runs `f` with the calling thread joined to the network namespace at
/// `path`, restoring the previous namespace on every exit path.
pub fn with_netns<T>(path: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let target = File::open(path).map_err(|open_error| {
        if open_error.kind() == ErrorKind::NotFound {
            Error::NamespaceUnavailable(path.to_string())
        } else {
            Error::Io(open_error)
        }
    })?;
    let original = File::open(THREAD_NETNS)?;

    setns(target.as_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|error| Error::NamespaceUnavailable(format!("{}: {}", path, error)))?;
    let _guard = NetnsGuard { original };

    f()
}

/// A resolved network interface inside some namespace.
#[derive(Debug, Clone)]
pub struct LinkRef {
    pub name: String,
    pub index: u32,
    pub mac: [u8; 6],
}

/// Looks up an interface by name in the calling thread's current namespace.
pub fn resolve_link(name: &str) -> Result<LinkRef> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|error| Error::Socket(format!("getifaddrs failed: {}", error)))?;

    for entry in addrs {
        if entry.interface_name != name {
            continue;
        }
        if let Some(storage) = entry.address
            && let Some(link) = storage.as_link_addr()
            && let Some(mac) = link.addr()
        {
            return Ok(LinkRef {
                name: name.to_string(),
                index: link.ifindex() as u32,
                mac,
            });
        }
    }

    Err(Error::LinkNotFound(name.to_string()))
}

/// Raises IFF_UP on the interface if it is down. The DHCP exchange cannot
/// complete on a downed link.
pub fn ensure_link_up(name: &str) -> Result<()> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(Error::LinkNotFound(name.to_string()));
    }

    let socket = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if socket < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let socket = OwnedSocket(socket);

    let mut request: libc::ifreq = unsafe { std::mem::zeroed() };
    for (slot, byte) in request.ifr_name.iter_mut().zip(name.as_bytes()) {
        *slot = *byte as libc::c_char;
    }

    if unsafe { libc::ioctl(socket.0, libc::SIOCGIFFLAGS, &mut request) } < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    let flags = unsafe { request.ifr_ifru.ifru_flags };
    if flags & libc::IFF_UP as libc::c_short != 0 {
        return Ok(());
    }

    request.ifr_ifru.ifru_flags = flags | libc::IFF_UP as libc::c_short;
    if unsafe { libc::ioctl(socket.0, libc::SIOCSIFFLAGS, &request) } < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    Ok(())
}

struct OwnedSocket(libc::c_int);

impl Drop for OwnedSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_namespace_is_reported() {
        let result = with_netns("/no/such/netns", || Ok(()));
        assert!(matches!(result, Err(Error::NamespaceUnavailable(_))));
    }

    #[test]
    fn test_resolve_loopback() {
        // Loopback exists in every namespace, including the test's own.
        let link = resolve_link("lo").unwrap();
        assert_eq!(link.name, "lo");
        assert!(link.index > 0);
    }

    #[test]
    fn test_resolve_missing_link() {
        let result = resolve_link("does-not-exist0");
        assert!(matches!(result, Err(Error::LinkNotFound(_))));
    }

    #[test]
    fn test_overlong_link_name_rejected() {
        let result = ensure_link_up("an-interface-name-way-past-ifnamsiz");
        assert!(matches!(result, Err(Error::LinkNotFound(_))));
    }
}
