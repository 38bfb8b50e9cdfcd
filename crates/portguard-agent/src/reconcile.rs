use std::{io::ErrorKind, net::TcpListener, time::Duration};

/// Portable contract for port-owner discovery and termination. Socket
/// enumeration and process kill differ per OS; every platform backend
/// satisfies this seam so the reconciliation logic stays testable.
pub trait PortBackend {
    /// Pid of the process listening on `port`, or `None` when nothing
    /// listens. Transient tool failures (unreadable or garbled tables) are
    /// reported as `None`, never as an error.
    fn find_owner(&self, port: u16) -> Option<u32>;

    /// Request forceful termination. `true` means the request was accepted,
    /// not that the process has fully exited.
    fn terminate(&self, pid: u32) -> bool;
}

/// Clear `port` of any conflicting listener.
///
/// Returns `false` when no owner was found (nothing to do is not a failure).
/// Termination is asynchronous: after the settle delay callers still need to
/// re-verify availability before relying on the port being free.
pub async fn reconcile<B: PortBackend>(backend: &B, port: u16, settle_delay: Duration) -> bool {
    let Some(pid) = backend.find_owner(port) else {
        return false;
    };

    let accepted = backend.terminate(pid);
    tracing::info!(port, pid, accepted, "terminated conflicting listener");
    tokio::time::sleep(settle_delay).await;
    true
}

/// First bindable port in `[base, base + window)`, probing upward.
pub fn find_free_port(base: u16, window: u16) -> Option<u16> {
    for offset in 0..window {
        let port = base.checked_add(offset)?;
        match TcpListener::bind(("0.0.0.0", port)) {
            Ok(l) => {
                l.set_nonblocking(true).ok();
                return Some(port);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => continue,
            Err(_) => continue,
        }
    }
    None
}

/// Linux backend reading the procfs socket tables directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsBackend;

impl PortBackend for ProcfsBackend {
    fn find_owner(&self, port: u16) -> Option<u32> {
        find_owner_procfs(port)
    }

    fn terminate(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            let rc = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
            rc == 0
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            false
        }
    }
}

#[cfg(target_os = "linux")]
fn find_owner_procfs(port: u16) -> Option<u32> {
    let mut inodes = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(table) {
            inodes.extend(listener_inodes(&content, port));
        }
    }
    if inodes.is_empty() {
        return None;
    }

    let own_pid = std::process::id();
    let entries = std::fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Never report ourselves as the conflicting owner.
        if pid == own_pid {
            continue;
        }
        if pid_holds_socket(pid, &inodes) {
            return Some(pid);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn find_owner_procfs(_port: u16) -> Option<u32> {
    None
}

#[cfg(target_os = "linux")]
fn pid_holds_socket(pid: u32, inodes: &[u64]) -> bool {
    let fd_dir = format!("/proc/{pid}/fd");
    let Ok(entries) = std::fs::read_dir(fd_dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let Ok(target) = std::fs::read_link(entry.path()) else {
            continue;
        };
        let target = target.to_string_lossy();
        if let Some(rest) = target.strip_prefix("socket:[")
            && let Some(num) = rest.strip_suffix(']')
            && let Ok(inode) = num.parse::<u64>()
            && inodes.contains(&inode)
        {
            return true;
        }
    }
    false
}

/// Socket inodes of LISTEN entries bound to `port` in a /proc/net/tcp{,6}
/// table. Rows that do not parse are skipped.
fn listener_inodes(content: &str, port: u16) -> Vec<u64> {
    const TCP_LISTEN: u8 = 0x0A;

    let mut inodes = Vec::new();
    for line in content.lines().skip(1) {
        // sl local_address rem_address st tx:rx tr:tm->when retrnsmt uid timeout inode
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }

        let Some(local_port) = parts[1]
            .rsplit(':')
            .next()
            .and_then(|p| u16::from_str_radix(p, 16).ok())
        else {
            continue;
        };
        let Ok(state) = u8::from_str_radix(parts[3], 16) else {
            continue;
        };
        if local_port != port || state != TCP_LISTEN {
            continue;
        }
        if let Ok(inode) = parts[9].parse::<u64>() {
            inodes.push(inode);
        }
    }
    inodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockBackend {
        owner: Option<u32>,
        terminated: Mutex<Vec<u32>>,
    }

    impl MockBackend {
        fn new(owner: Option<u32>) -> Self {
            Self {
                owner,
                terminated: Mutex::new(Vec::new()),
            }
        }
    }

    impl PortBackend for MockBackend {
        fn find_owner(&self, _port: u16) -> Option<u32> {
            self.owner
        }

        fn terminate(&self, pid: u32) -> bool {
            self.terminated.lock().unwrap().push(pid);
            true
        }
    }

    #[tokio::test]
    async fn reconcile_free_port_is_a_noop() {
        let backend = MockBackend::new(None);
        let cleared = reconcile(&backend, 4900, Duration::from_millis(1)).await;
        assert!(!cleared);
        assert!(backend.terminated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_terminates_the_owner() {
        let backend = MockBackend::new(Some(1234));
        let cleared = reconcile(&backend, 4900, Duration::from_millis(1)).await;
        assert!(cleared);
        assert_eq!(*backend.terminated.lock().unwrap(), vec![1234]);
    }

    #[test]
    fn listener_inodes_matches_listen_rows_only() {
        // 0x1324 == 4900
        let table = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
            0: 0100007F:1324 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 54321 1 0000000000000000 100 0 0 10 0\n\
            1: 0100007F:1324 0200007F:A1B2 01 00000000:00000000 00:00000000 00000000  1000        0 54322 1 0000000000000000 100 0 0 10 0\n\
            2: 0100007F:0050 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 54323 1 0000000000000000 100 0 0 10 0\n";
        assert_eq!(listener_inodes(table, 4900), vec![54321]);
    }

    #[test]
    fn listener_inodes_skips_garbled_rows() {
        let table = "header\n\
            not a socket row at all\n\
            0: ZZZZZZZZ:WXYZ 00000000:0000 0A 0 0 0 0 0 garbage\n\
            1: 0100007F:1324 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 777 1 0\n";
        assert_eq!(listener_inodes(table, 4900), vec![777]);
    }

    #[test]
    fn listener_inodes_empty_input() {
        assert!(listener_inodes("", 4900).is_empty());
    }

    #[test]
    fn find_free_port_skips_an_occupied_port() {
        // Hold an OS-assigned port, then ask for it with a window wide
        // enough that a neighbour is free.
        let held = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let base = held.local_addr().unwrap().port();
        let found = find_free_port(base, 10).expect("window should contain a free port");
        assert!(found > base);
    }

    #[test]
    fn find_free_port_exhausted_window() {
        let held = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let base = held.local_addr().unwrap().port();
        assert_eq!(find_free_port(base, 1), None);
    }
}
