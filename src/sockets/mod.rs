//! Socket index: the engine's view of which process owns which endpoint.
//!
//! A refresh runs netstat, parses its rows, and rebuilds three maps:
//! established connections keyed by the bidirectional 5-tuple key, TCP local
//! endpoints, and UDP local endpoints (with wildcard listener entries). The
//! maps are swapped in as a unit so readers see either the old or the new
//! index, never a mix. A failed invocation leaves the previous index intact.

pub mod netstat;

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::net::is_loopback;
use crate::procs::ProcessIndex;
use netstat::{NetstatRow, SocketProto};

/// A currently known socket 5-tuple.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkConnection {
    pub pid: Option<i32>,
    pub proc_name: Option<String>,
    pub src_addr: String,
    pub src_port: u16,
    pub dst_addr: String,
    pub dst_port: u16,
    pub protocol: String,
    pub state: String,
}

/// A UDP local endpoint. Listeners are entered under both their concrete
/// `"<addr>:<port>"` key and the wildcard key `":<port>"`.
#[derive(Debug, Clone, Serialize)]
pub struct UdpPortMapping {
    pub port: u16,
    pub address: String,
    pub pid: Option<i32>,
    pub proc_name: Option<String>,
    pub last_seen: i64,
    pub is_listener: bool,
}

/// A TCP local endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TcpEndpoint {
    pub pid: Option<i32>,
    pub proc_name: Option<String>,
    pub last_seen: i64,
}

#[derive(Debug, Default, Clone)]
pub struct SocketTables {
    pub connections: HashMap<String, NetworkConnection>,
    pub tcp: HashMap<String, TcpEndpoint>,
    pub udp: HashMap<String, UdpPortMapping>,
}

/// Bidirectional 5-tuple key: invariant under swapping the endpoints, so a
/// packet matches its connection regardless of direction.
///
/// ```
/// # use netlens::sockets::conn_key;
/// assert_eq!(
///     conn_key("10.0.0.1", 55555, "10.0.0.2", 443, "tcp"),
///     conn_key("10.0.0.2", 443, "10.0.0.1", 55555, "tcp"),
/// );
/// ```
pub fn conn_key(a_addr: &str, a_port: u16, b_addr: &str, b_port: u16, protocol: &str) -> String {
    let a = format!("{a_addr}:{a_port}");
    let b = format!("{b_addr}:{b_port}");
    if a <= b {
        format!("{a}|{b}|{protocol}")
    } else {
        format!("{b}|{a}|{protocol}")
    }
}

pub struct SocketIndex {
    tables: RwLock<SocketTables>,
    udp_stale_ms: i64,
    netstat_timeout_ms: u64,
    #[allow(dead_code)]
    lsof_timeout_ms: u64,
}

impl SocketIndex {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            tables: RwLock::new(SocketTables::default()),
            udp_stale_ms: config.udp_stale_ms,
            netstat_timeout_ms: config.netstat_timeout_ms,
            lsof_timeout_ms: config.lsof_timeout_ms,
        }
    }

    /// Run netstat and swap in a freshly built set of tables. On any failure
    /// the previous tables stay intact and the error propagates.
    pub async fn refresh(&self) -> eyre::Result<()> {
        let output = netstat::run_netstat(self.netstat_timeout_ms).await?;
        let mut rows = netstat::parse_netstat_output(&output);
        self.fill_pids_from_lsof(&mut rows).await;

        let now = Utc::now().timestamp_millis();
        let previous = self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let next = build_tables(previous, rows, now, self.udp_stale_ms);

        *self.tables.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(())
    }

    /// macOS: netstat rows occasionally miss pids; fill them from lsof keyed
    /// by local endpoint. Elsewhere this is a no-op.
    #[cfg(target_os = "macos")]
    async fn fill_pids_from_lsof(&self, rows: &mut [NetstatRow]) {
        if rows.iter().all(|r| r.pid.is_some()) {
            return;
        }

        let output = match netstat::run_lsof(self.lsof_timeout_ms).await {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!("lsof fallback unavailable: {e}");
                return;
            }
        };

        let endpoints = netstat::parse_lsof_output(&output);
        for row in rows.iter_mut().filter(|r| r.pid.is_none()) {
            let Some(port) = row.local_port else { continue };
            let key = format!("{}:{port}", row.local_addr);
            let wildcard = format!("*:{port}");
            if let Some((pid, name)) = endpoints.get(&key).or_else(|| endpoints.get(&wildcard)) {
                row.pid = Some(*pid);
                row.proc_name.get_or_insert_with(|| name.clone());
            }
        }
    }

    #[cfg(not(target_os = "macos"))]
    async fn fill_pids_from_lsof(&self, _rows: &mut [NetstatRow]) {}

    /// Look up a packet's bidirectional key in the connection map.
    pub fn connection_hit(&self, key: &str) -> Option<(Option<i32>, Option<String>)> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .connections
            .get(key)
            .map(|c| (c.pid, c.proc_name.clone()))
    }

    /// Look up a local endpoint in the TCP or UDP map, trying the concrete
    /// key first and the family wildcard second. A hit refreshes the entry's
    /// `last_seen`.
    pub fn endpoint_hit(
        &self,
        proto: SocketProto,
        local_addr: &str,
        local_port: u16,
        wildcard_key: &str,
        now: i64,
    ) -> Option<(Option<i32>, Option<String>)> {
        let concrete = format!("{local_addr}:{local_port}");
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);

        match proto {
            SocketProto::Tcp => {
                let key = if tables.tcp.contains_key(&concrete) {
                    concrete
                } else {
                    wildcard_key.to_string()
                };
                let endpoint = tables.tcp.get_mut(&key)?;
                endpoint.last_seen = now;
                Some((endpoint.pid, endpoint.proc_name.clone()))
            }
            SocketProto::Udp => {
                let key = if tables.udp.contains_key(&concrete) {
                    concrete
                } else {
                    wildcard_key.to_string()
                };
                let mapping = tables.udp.get_mut(&key)?;
                mapping.last_seen = now;
                Some((mapping.pid, mapping.proc_name.clone()))
            }
        }
    }

    /// Promote an endpoint-matched pairing into the connection map so the
    /// next packet of the flow matches on the bidirectional key directly.
    pub fn promote(&self, key: String, connection: NetworkConnection) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .connections
            .insert(key, connection);
    }

    /// Reconciliation pass: fill in missing process names from the process
    /// index. Runs on its own cadence and never blocks packet processing
    /// beyond the brief write lock.
    pub fn fill_missing_proc_names(&self, procs: &ProcessIndex) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);

        for connection in tables.connections.values_mut() {
            if connection.proc_name.is_none() {
                if let Some(pid) = connection.pid {
                    connection.proc_name = procs.get_name(pid);
                }
            }
        }
        for endpoint in tables.tcp.values_mut() {
            if endpoint.proc_name.is_none() {
                if let Some(pid) = endpoint.pid {
                    endpoint.proc_name = procs.get_name(pid);
                }
            }
        }
        for mapping in tables.udp.values_mut() {
            if mapping.proc_name.is_none() {
                if let Some(pid) = mapping.pid {
                    mapping.proc_name = procs.get_name(pid);
                }
            }
        }
    }

    pub fn snapshot(&self) -> SocketTables {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn install_rows(&self, rows: Vec<NetstatRow>, now: i64) {
        let previous = self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let next = build_tables(previous, rows, now, self.udp_stale_ms);
        *self.tables.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

/// Fold a batch of parsed netstat rows into the next table generation.
///
/// Connections and the TCP map are rebuilt from the rows; the UDP map is
/// merged so short-lived flows survive between observations, with non-listener
/// entries older than the stale threshold evicted up front.
fn build_tables(
    previous: SocketTables,
    rows: Vec<NetstatRow>,
    now: i64,
    udp_stale_ms: i64,
) -> SocketTables {
    let mut next = SocketTables {
        connections: HashMap::new(),
        tcp: HashMap::new(),
        udp: previous.udp,
    };

    next.udp
        .retain(|_, mapping| mapping.is_listener || now - mapping.last_seen <= udp_stale_ms);

    for row in rows {
        if is_loopback(&row.local_addr) || is_loopback(&row.remote_addr) {
            continue;
        }

        match row.proto {
            SocketProto::Tcp => fold_tcp_row(&mut next, &row, now),
            SocketProto::Udp => fold_udp_row(&mut next, &row, now),
        }
    }

    next
}

fn fold_tcp_row(tables: &mut SocketTables, row: &NetstatRow, now: i64) {
    let Some(local_port) = row.local_port else {
        return;
    };
    let state = row.state.as_deref().unwrap_or("");

    if state == "ESTABLISHED"
        && row.remote_addr != "*"
        && let Some(remote_port) = row.remote_port
    {
        let key = conn_key(&row.local_addr, local_port, &row.remote_addr, remote_port, "tcp");
        tables.connections.insert(
            key,
            NetworkConnection {
                pid: row.pid,
                proc_name: row.proc_name.clone(),
                src_addr: row.local_addr.clone(),
                src_port: local_port,
                dst_addr: row.remote_addr.clone(),
                dst_port: remote_port,
                protocol: "tcp".to_string(),
                state: "ESTABLISHED".to_string(),
            },
        );
    }

    if state == "ESTABLISHED" || state == "LISTENING" {
        let endpoint = TcpEndpoint {
            pid: row.pid,
            proc_name: row.proc_name.clone(),
            last_seen: now,
        };
        if row.local_addr == "*" {
            // A bare-wildcard listener answers on either family.
            tables
                .tcp
                .insert(format!("0.0.0.0:{local_port}"), endpoint.clone());
            tables.tcp.insert(
                format!("{}:{local_port}", crate::net::normalize_ipv6("::")),
                endpoint,
            );
        } else {
            tables
                .tcp
                .insert(format!("{}:{local_port}", row.local_addr), endpoint);
        }
    }
}

fn fold_udp_row(tables: &mut SocketTables, row: &NetstatRow, now: i64) {
    let Some(local_port) = row.local_port else {
        return;
    };

    let is_listener = row.remote_addr == "*" || row.remote_port.is_none();
    let state = if is_listener { "LISTENING" } else { "ESTABLISHED" };

    let (dst_addr, dst_port) = if is_listener {
        ("*".to_string(), 0)
    } else {
        (row.remote_addr.clone(), row.remote_port.unwrap_or(0))
    };
    let key = conn_key(&row.local_addr, local_port, &dst_addr, dst_port, "udp");
    tables.connections.insert(
        key,
        NetworkConnection {
            pid: row.pid,
            proc_name: row.proc_name.clone(),
            src_addr: row.local_addr.clone(),
            src_port: local_port,
            dst_addr,
            dst_port,
            protocol: "udp".to_string(),
            state: state.to_string(),
        },
    );

    let mapping = UdpPortMapping {
        port: local_port,
        address: row.local_addr.clone(),
        pid: row.pid,
        proc_name: row.proc_name.clone(),
        last_seen: now,
        is_listener,
    };

    if row.local_addr != "*" {
        tables
            .udp
            .insert(format!("{}:{local_port}", row.local_addr), mapping.clone());
    }
    if is_listener {
        tables.udp.insert(format!(":{local_port}"), mapping);
    }
}
