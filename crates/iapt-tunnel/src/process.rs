//! Peer process lookup
//!
//! Resolves which OS process owns the client side of a loopback TCP
//! connection. On Linux this walks procfs: the socket row in
//! `/proc/net/tcp{,6}` gives an inode, and the inode is matched against the
//! `socket:[inode]` links under `/proc/<pid>/fd`. Other platforms report the
//! owner as unknown, which the same-process policy treats as a rejection.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Resolves the process owning the peer end of a local connection
pub trait PeerProcessLookup: Send + Sync {
    /// PID owning the socket bound to `peer` and connected to `local`
    fn owner_of(&self, peer: SocketAddr, local: SocketAddr) -> Option<u32>;
}

/// procfs-backed lookup
#[derive(Debug, Clone)]
pub struct ProcfsLookup {
    root: PathBuf,
}

impl ProcfsLookup {
    /// Lookup against the system `/proc`
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Lookup against an alternative procfs mount
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcfsLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl PeerProcessLookup for ProcfsLookup {
    fn owner_of(&self, peer: SocketAddr, local: SocketAddr) -> Option<u32> {
        let inode = self.socket_inode(peer, local)?;
        let owner = self.find_inode_owner(inode);
        tracing::trace!("Socket {} (inode {}) owned by {:?}", peer, inode, owner);
        owner
    }
}

#[cfg(not(target_os = "linux"))]
impl PeerProcessLookup for ProcfsLookup {
    fn owner_of(&self, _peer: SocketAddr, _local: SocketAddr) -> Option<u32> {
        None
    }
}

#[cfg(target_os = "linux")]
impl ProcfsLookup {
    fn socket_inode(&self, peer: SocketAddr, local: SocketAddr) -> Option<u64> {
        let table = match peer {
            SocketAddr::V4(_) => "tcp",
            SocketAddr::V6(_) => "tcp6",
        };
        let content = std::fs::read_to_string(self.root.join("net").join(table)).ok()?;
        find_socket_inode(&content, &encode_addr(peer), &encode_addr(local))
    }

    fn find_inode_owner(&self, inode: u64) -> Option<u32> {
        let target = format!("socket:[{}]", inode);

        // Most peers are in this process, so check it before scanning the rest.
        if fd_dir_has_link(&self.root.join("self").join("fd"), &target) {
            return Some(std::process::id());
        }

        let entries = std::fs::read_dir(&self.root).ok()?;
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            if fd_dir_has_link(&entry.path().join("fd"), &target) {
                return Some(pid);
            }
        }
        None
    }
}

#[cfg(target_os = "linux")]
fn fd_dir_has_link(dir: &std::path::Path, target: &str) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        std::fs::read_link(entry.path())
            .map(|link| link.as_os_str() == target)
            .unwrap_or(false)
    })
}

/// Find the inode of the row whose local address is `local_hex` and remote
/// address is `remote_hex`
#[cfg(target_os = "linux")]
fn find_socket_inode(table: &str, local_hex: &str, remote_hex: &str) -> Option<u64> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            return None;
        }
        if fields[1].eq_ignore_ascii_case(local_hex) && fields[2].eq_ignore_ascii_case(remote_hex) {
            fields[9].parse().ok()
        } else {
            None
        }
    })
}

/// Encode an address the way the kernel prints it in `/proc/net/tcp{,6}`
#[cfg(target_os = "linux")]
fn encode_addr(addr: SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => {
            format!("{:08X}:{:04X}", u32::from_ne_bytes(v4.ip().octets()), v4.port())
        }
        SocketAddr::V6(v6) => {
            let octets = v6.ip().octets();
            let mut out = String::with_capacity(38);
            for chunk in octets.chunks_exact(4) {
                let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                out.push_str(&format!("{:08X}", word));
            }
            out.push_str(&format!(":{:04X}", v6.port()));
            out
        }
    }
}
