//! Rolling aggregates at three levels: global per-interface, per-application,
//! per-process.
//!
//! Registries are created lazily on first observation and live for the life
//! of the manager. The application and process levels reference each other by
//! id only; resolution always goes through the manager's maps. All mutation
//! happens under one lock, shared by the packet-processing path and the
//! detached geolocation updates.

pub mod friendly;
pub mod stats;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::attribution::Attribution;
use crate::capture::decode::PacketMetadata;
use crate::geo::{GeoLocationData, GeoService};
use crate::net::LocalAddrs;
use crate::procs::ProcessIndex;
use friendly::{executable_stem, friendly_app_name, slugify, title_case};
use stats::{Direction, InterfaceStats, Stats, StatsSnapshot, direction_of, remote_ip_of};

pub const SYSTEM_REGISTRY_ID: &str = "system";
pub const UNKNOWN_REGISTRY_ID: &str = "unknown";

#[derive(Debug, Clone)]
pub struct GlobalRegistry {
    pub interface_name: String,
    pub stats: Stats,
}

#[derive(Debug, Clone)]
pub struct ApplicationRegistry {
    pub app_name: String,
    pub app_display_name: String,
    pub stats: Stats,
    pub unique_remote_ips: HashSet<String>,
    pub unique_domains: HashSet<String>,
    pub geo_locations: Vec<GeoLocationData>,
    pub interface_stats: HashMap<String, InterfaceStats>,
    pub process_registry_ids: Vec<String>,
    pub process_count: usize,
}

#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    pub id: String,
    pub app_name: String,
    pub pid: Option<i32>,
    pub parent_pid: Option<i32>,
    pub proc_name: String,
    pub exe_path: Option<String>,
    pub is_root_process: bool,
    pub stats: Stats,
    pub unique_remote_ips: HashSet<String>,
    pub geo_locations: Vec<GeoLocationData>,
    pub interface_stats: HashMap<String, InterfaceStats>,
}

#[derive(Default)]
struct Registries {
    global: HashMap<String, GlobalRegistry>,
    applications: HashMap<String, ApplicationRegistry>,
    processes: HashMap<String, ProcessRegistry>,
}

/// How a packet was classified for aggregation.
struct AppIdentity {
    app_name: String,
    display_name: String,
    registry_id: String,
    pid: Option<i32>,
    parent_pid: Option<i32>,
    proc_name: String,
    exe_path: Option<String>,
    is_root_process: bool,
}

pub struct RegistryManager {
    registries: Mutex<Registries>,
    procs: Arc<ProcessIndex>,
    local: Arc<LocalAddrs>,
    geo: Option<Arc<GeoService>>,
}

impl RegistryManager {
    pub fn new(
        procs: Arc<ProcessIndex>,
        local: Arc<LocalAddrs>,
        geo: Option<Arc<GeoService>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registries: Mutex::new(Registries::default()),
            procs,
            local,
            geo,
        })
    }

    /// Fold one attributed packet into all three levels and fill the
    /// packet's application fields. Geolocation enrichment is scheduled
    /// asynchronously and never blocks this path.
    pub fn ingest(self: &Arc<Self>, packet: &mut PacketMetadata, attribution: &Attribution) {
        let direction = direction_of(packet, &self.local);
        let remote_ip = remote_ip_of(packet, &self.local);
        let identity = self.classify(packet, attribution);

        packet.app_registry_id = Some(identity.registry_id.clone());
        packet.app_name = Some(identity.app_name.clone());
        packet.app_display_name = Some(identity.display_name.clone());

        {
            let mut registries = self
                .registries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            registries
                .global
                .entry(packet.interface.clone())
                .or_insert_with(|| GlobalRegistry {
                    interface_name: packet.interface.clone(),
                    stats: Stats::default(),
                })
                .stats
                .fold(packet, direction);

            let process = registries
                .processes
                .entry(identity.registry_id.clone())
                .or_insert_with(|| ProcessRegistry {
                    id: identity.registry_id.clone(),
                    app_name: identity.app_name.clone(),
                    pid: identity.pid,
                    parent_pid: identity.parent_pid,
                    proc_name: identity.proc_name.clone(),
                    exe_path: identity.exe_path.clone(),
                    is_root_process: identity.is_root_process,
                    stats: Stats::default(),
                    unique_remote_ips: HashSet::new(),
                    geo_locations: Vec::new(),
                    interface_stats: HashMap::new(),
                });
            process.stats.fold(packet, direction);
            if let Some(remote) = &remote_ip {
                process.unique_remote_ips.insert(remote.clone());
            }
            process
                .interface_stats
                .entry(packet.interface.clone())
                .or_default()
                .fold(packet, direction);

            let application = registries
                .applications
                .entry(identity.app_name.clone())
                .or_insert_with(|| ApplicationRegistry {
                    app_name: identity.app_name.clone(),
                    app_display_name: identity.display_name.clone(),
                    stats: Stats::default(),
                    unique_remote_ips: HashSet::new(),
                    unique_domains: HashSet::new(),
                    geo_locations: Vec::new(),
                    interface_stats: HashMap::new(),
                    process_registry_ids: Vec::new(),
                    process_count: 0,
                });
            if !application
                .process_registry_ids
                .contains(&identity.registry_id)
            {
                application
                    .process_registry_ids
                    .push(identity.registry_id.clone());
                application.process_count = application.process_registry_ids.len();
            }
            application.stats.fold(packet, direction);
            if let Some(remote) = &remote_ip {
                application.unique_remote_ips.insert(remote.clone());
            }
            application
                .interface_stats
                .entry(packet.interface.clone())
                .or_default()
                .fold(packet, direction);

            aggregate_application_geo(&mut registries, &identity.app_name);
        }

        if let Some(remote) = remote_ip {
            self.schedule_geo_update(
                identity.registry_id,
                identity.app_name,
                remote,
                direction,
                u64::from(packet.frame_len),
            );
        }
    }

    /// System and unknown traffic roll up under fixed ids; everything else
    /// is keyed by the root-parent application and pid.
    fn classify(&self, packet: &PacketMetadata, attribution: &Attribution) -> AppIdentity {
        match attribution {
            Attribution::System => AppIdentity {
                app_name: "System".to_string(),
                display_name: "System".to_string(),
                registry_id: SYSTEM_REGISTRY_ID.to_string(),
                pid: Some(-1),
                parent_pid: None,
                proc_name: "SYSTEM".to_string(),
                exe_path: None,
                is_root_process: true,
            },
            Attribution::Unknown(_) => AppIdentity {
                app_name: "Unknown".to_string(),
                display_name: "Unknown".to_string(),
                registry_id: UNKNOWN_REGISTRY_ID.to_string(),
                pid: packet.pid,
                parent_pid: None,
                proc_name: packet
                    .proc_name
                    .clone()
                    .unwrap_or_else(|| "UNKNOWN".to_string()),
                exe_path: None,
                is_root_process: false,
            },
            Attribution::Matched { pid, name } => {
                let root = self.procs.find_root_parent(*pid);
                let (root_pid, root_name, parent_pid, exe_path) = match &root {
                    Some(root) => (
                        root.pid,
                        root.name.clone(),
                        Some(root.parent_pid),
                        root.cmd
                            .split_whitespace()
                            .next()
                            .map(std::string::ToString::to_string),
                    ),
                    None => (*pid, name.clone(), None, None),
                };

                let stem = executable_stem(&root_name);
                let app_name = friendly_app_name(&stem)
                    .map_or_else(|| title_case(&root_name), str::to_string);

                AppIdentity {
                    registry_id: format!("{}-{pid}", slugify(&app_name)),
                    display_name: app_name.clone(),
                    app_name,
                    pid: Some(*pid),
                    parent_pid,
                    proc_name: name.clone(),
                    exe_path,
                    is_root_process: root_pid == *pid,
                }
            }
        }
    }

    /// Fire-and-forget geolocation enrichment for one observed remote IP.
    fn schedule_geo_update(
        self: &Arc<Self>,
        registry_id: String,
        app_name: String,
        remote_ip: String,
        direction: Direction,
        bytes: u64,
    ) {
        let Some(geo) = self.geo.clone() else {
            return;
        };
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let data = geo.lookup(&remote_ip).await;
            manager.apply_geo_update(&registry_id, &app_name, &remote_ip, direction, bytes, data);
        });
    }

    /// Apply one resolved lookup to the owning process registry and re-derive
    /// the application-level rollup. Empty responses are dropped.
    fn apply_geo_update(
        &self,
        registry_id: &str,
        app_name: &str,
        remote_ip: &str,
        direction: Direction,
        bytes: u64,
        data: GeoLocationData,
    ) {
        if !data.has_identity() {
            tracing::debug!(ip = %remote_ip, "Geo update skipped: empty response");
            return;
        }

        let mut registries = self
            .registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(process) = registries.processes.get_mut(registry_id) else {
            return;
        };

        let (sent, received) = match direction {
            Direction::Outbound => (bytes, 0),
            Direction::Inbound => (0, bytes),
            Direction::Unknown => (0, 0),
        };

        match process
            .geo_locations
            .iter_mut()
            .find(|entry| entry.identity() == data.identity())
        {
            Some(entry) => {
                entry.packet_count += 1;
                entry.bytes_sent += sent;
                entry.bytes_received += received;
                if !entry.ips.iter().any(|ip| ip == remote_ip) {
                    entry.ips.push(remote_ip.to_string());
                }
            }
            None => {
                let mut entry = data;
                entry.ips = vec![remote_ip.to_string()];
                entry.packet_count = 1;
                entry.bytes_sent = sent;
                entry.bytes_received = received;
                process.geo_locations.push(entry);
            }
        }

        aggregate_application_geo(&mut registries, app_name);
    }

    /// Immutable copies of the three registry maps in their persistence form.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let registries = self
            .registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut global: Vec<GlobalSnapshot> = registries
            .global
            .values()
            .map(|g| GlobalSnapshot {
                interface_name: g.interface_name.clone(),
                stats: g.stats.snapshot(),
            })
            .collect();
        global.sort_by(|a, b| a.interface_name.cmp(&b.interface_name));

        let mut applications: Vec<ApplicationSnapshot> = registries
            .applications
            .values()
            .map(|a| {
                let mut process_registry_ids = a.process_registry_ids.clone();
                process_registry_ids.sort();
                ApplicationSnapshot {
                    app_name: a.app_name.clone(),
                    app_display_name: a.app_display_name.clone(),
                    stats: a.stats.snapshot(),
                    unique_remote_ips: sorted(&a.unique_remote_ips),
                    unique_domains: sorted(&a.unique_domains),
                    geo_locations: a.geo_locations.clone(),
                    interface_stats: a
                        .interface_stats
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    process_registry_ids,
                    process_count: a.process_count,
                }
            })
            .collect();
        applications.sort_by(|a, b| a.app_name.cmp(&b.app_name));

        let mut processes: Vec<ProcessSnapshot> = registries
            .processes
            .values()
            .map(|p| ProcessSnapshot {
                id: p.id.clone(),
                app_name: p.app_name.clone(),
                pid: p.pid,
                parent_pid: p.parent_pid,
                proc_name: p.proc_name.clone(),
                exe_path: p.exe_path.clone(),
                is_root_process: p.is_root_process,
                stats: p.stats.snapshot(),
                unique_remote_ips: sorted(&p.unique_remote_ips),
                geo_locations: p.geo_locations.clone(),
                interface_stats: p
                    .interface_stats
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            })
            .collect();
        processes.sort_by(|a, b| a.id.cmp(&b.id));

        RegistrySnapshot {
            global,
            applications,
            processes,
        }
    }
}

/// Rebuild an application's geo list from its children: entries keyed by
/// `(country, city, as)`, counters summed, ip lists unioned.
fn aggregate_application_geo(registries: &mut Registries, app_name: &str) {
    let Some(application) = registries.applications.get_mut(app_name) else {
        return;
    };

    let mut aggregated: Vec<GeoLocationData> = Vec::new();
    for id in &application.process_registry_ids {
        let Some(process) = registries.processes.get(id) else {
            continue;
        };
        for entry in &process.geo_locations {
            match aggregated
                .iter_mut()
                .find(|existing| existing.identity() == entry.identity())
            {
                Some(existing) => {
                    existing.packet_count += entry.packet_count;
                    existing.bytes_sent += entry.bytes_sent;
                    existing.bytes_received += entry.bytes_received;
                    for ip in &entry.ips {
                        if !existing.ips.iter().any(|known| known == ip) {
                            existing.ips.push(ip.clone());
                        }
                    }
                }
                None => aggregated.push(entry.clone()),
            }
        }
    }

    application.geo_locations = aggregated;
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut items: Vec<String> = set.iter().cloned().collect();
    items.sort();
    items
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalSnapshot {
    pub interface_name: String,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicationSnapshot {
    pub app_name: String,
    pub app_display_name: String,
    pub stats: StatsSnapshot,
    pub unique_remote_ips: Vec<String>,
    pub unique_domains: Vec<String>,
    pub geo_locations: Vec<GeoLocationData>,
    pub interface_stats: BTreeMap<String, InterfaceStats>,
    pub process_registry_ids: Vec<String>,
    pub process_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub id: String,
    pub app_name: String,
    pub pid: Option<i32>,
    pub parent_pid: Option<i32>,
    pub proc_name: String,
    pub exe_path: Option<String>,
    pub is_root_process: bool,
    pub stats: StatsSnapshot,
    pub unique_remote_ips: Vec<String>,
    pub geo_locations: Vec<GeoLocationData>,
    pub interface_stats: BTreeMap<String, InterfaceStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub global: Vec<GlobalSnapshot>,
    pub applications: Vec<ApplicationSnapshot>,
    pub processes: Vec<ProcessSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::UnknownReason;
    use crate::capture::decode::{self, tests::tcp_frame};

    fn manager() -> Arc<RegistryManager> {
        let procs = Arc::new(ProcessIndex::new());
        let local = Arc::new(LocalAddrs::from_addrs(["10.0.0.2".parse().expect("addr")]));
        RegistryManager::new(procs, local, None)
    }

    fn outbound_packet() -> PacketMetadata {
        decode::decode_frame(
            "eth0",
            1000,
            &tcp_frame([10, 0, 0, 2], 40000, [93, 184, 216, 34], 443),
        )
        .expect("decode")
    }

    fn matched(pid: i32, name: &str) -> Attribution {
        Attribution::Matched {
            pid,
            name: name.to_string(),
        }
    }

    #[test]
    fn matched_packet_builds_all_three_levels() {
        let manager = manager();
        let mut packet = outbound_packet();
        manager.ingest(&mut packet, &matched(2230, "firefox"));

        assert_eq!(packet.app_name.as_deref(), Some("Firefox"));
        assert_eq!(packet.app_registry_id.as_deref(), Some("firefox-2230"));

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.global.len(), 1);
        assert_eq!(snapshot.global[0].interface_name, "eth0");
        assert_eq!(snapshot.global[0].stats.total_packets, 1);

        let app = &snapshot.applications[0];
        assert_eq!(app.app_name, "Firefox");
        assert_eq!(app.process_count, 1);
        assert_eq!(app.process_registry_ids, vec!["firefox-2230".to_string()]);
        assert_eq!(app.unique_remote_ips, vec!["93.184.216.34".to_string()]);
        assert_eq!(app.stats.total_bytes_sent, app.stats.outbound_bytes);

        let process = &snapshot.processes[0];
        assert_eq!(process.id, "firefox-2230");
        assert_eq!(process.app_name, "Firefox");
        assert_eq!(process.pid, Some(2230));
        assert_eq!(
            process.interface_stats.get("eth0").map(|s| s.packets),
            Some(1)
        );
    }

    #[test]
    fn application_links_stay_consistent_across_processes() {
        let manager = manager();

        for pid in [100, 101, 100] {
            let mut packet = outbound_packet();
            manager.ingest(&mut packet, &matched(pid, "chrome"));
        }

        let snapshot = manager.snapshot();
        let app = snapshot
            .applications
            .iter()
            .find(|a| a.app_name == "Google Chrome")
            .expect("app registry");

        assert_eq!(app.process_count, 2);
        assert_eq!(app.process_registry_ids.len(), 2);
        assert_eq!(app.stats.total_packets, 3);
        for id in &app.process_registry_ids {
            let process = snapshot
                .processes
                .iter()
                .find(|p| &p.id == id)
                .expect("linked process");
            assert_eq!(process.app_name, app.app_name);
        }
    }

    #[test]
    fn system_and_unknown_use_fixed_registries() {
        let manager = manager();

        let mut system_packet = outbound_packet();
        system_packet.pid = Some(-1);
        system_packet.proc_name = Some("SYSTEM".to_string());
        manager.ingest(&mut system_packet, &Attribution::System);

        let mut unknown_packet = outbound_packet();
        unknown_packet.proc_name = Some("UNKNOWN_MATCHTCP_PKT".to_string());
        manager.ingest(
            &mut unknown_packet,
            &Attribution::Unknown(UnknownReason::NoTcpMap),
        );

        let snapshot = manager.snapshot();
        let ids: Vec<&str> = snapshot.processes.iter().map(|p| p.id.as_str()).collect();
        assert!(ids.contains(&SYSTEM_REGISTRY_ID));
        assert!(ids.contains(&UNKNOWN_REGISTRY_ID));

        let system_app = snapshot
            .applications
            .iter()
            .find(|a| a.app_name == "System")
            .expect("system app");
        assert_eq!(
            system_app.process_registry_ids,
            vec![SYSTEM_REGISTRY_ID.to_string()]
        );
        assert_eq!(snapshot.global[0].stats.total_packets, 2);
    }

    #[test]
    fn geo_updates_accumulate_per_identity() {
        let manager = manager();
        let mut packet = outbound_packet();
        manager.ingest(&mut packet, &matched(2230, "firefox"));

        let response = GeoLocationData {
            country: Some("US".to_string()),
            city: Some("NYC".to_string()),
            as_number: Some("100".to_string()),
            ..GeoLocationData::default()
        };

        manager.apply_geo_update(
            "firefox-2230",
            "Firefox",
            "93.184.216.34",
            Direction::Outbound,
            60,
            response.clone(),
        );
        manager.apply_geo_update(
            "firefox-2230",
            "Firefox",
            "93.184.216.35",
            Direction::Outbound,
            40,
            response,
        );

        let snapshot = manager.snapshot();
        let process = &snapshot.processes[0];
        assert_eq!(process.geo_locations.len(), 1);
        assert_eq!(process.geo_locations[0].packet_count, 2);
        assert_eq!(process.geo_locations[0].bytes_sent, 100);
        assert_eq!(process.geo_locations[0].ips.len(), 2);
    }

    #[test]
    fn empty_geo_responses_are_dropped() {
        let manager = manager();
        let mut packet = outbound_packet();
        manager.ingest(&mut packet, &matched(2230, "firefox"));

        manager.apply_geo_update(
            "firefox-2230",
            "Firefox",
            "93.184.216.34",
            Direction::Outbound,
            60,
            GeoLocationData::default(),
        );

        assert!(manager.snapshot().processes[0].geo_locations.is_empty());
    }

    #[test]
    fn application_geo_rolls_up_children() {
        let manager = manager();

        // Two processes under one application.
        for pid in [100, 101] {
            let mut packet = outbound_packet();
            manager.ingest(&mut packet, &matched(pid, "chrome"));
        }

        let us_nyc = |count: u64, sent: u64| GeoLocationData {
            country: Some("US".to_string()),
            city: Some("NYC".to_string()),
            as_number: Some("100".to_string()),
            packet_count: count,
            bytes_sent: sent,
            ips: vec![format!("198.51.100.{count}")],
            ..GeoLocationData::default()
        };

        {
            let mut registries = manager.registries.lock().expect("registries");
            registries
                .processes
                .get_mut("google-chrome-100")
                .expect("process 100")
                .geo_locations = vec![us_nyc(3, 100)];
            registries
                .processes
                .get_mut("google-chrome-101")
                .expect("process 101")
                .geo_locations = vec![us_nyc(2, 50)];
            aggregate_application_geo(&mut registries, "Google Chrome");
        }

        let snapshot = manager.snapshot();
        let app = snapshot
            .applications
            .iter()
            .find(|a| a.app_name == "Google Chrome")
            .expect("app");
        assert_eq!(app.geo_locations.len(), 1);
        assert_eq!(app.geo_locations[0].packet_count, 5);
        assert_eq!(app.geo_locations[0].bytes_sent, 150);
        assert_eq!(app.geo_locations[0].ips.len(), 2);
    }

    #[test]
    fn snapshot_serializes_sets_as_arrays() {
        let manager = manager();
        let mut packet = outbound_packet();
        manager.ingest(&mut packet, &matched(2230, "firefox"));

        let json = serde_json::to_value(manager.snapshot()).expect("serialize");
        let app = &json["applications"][0];
        assert!(app["unique_remote_ips"].is_array());
        assert!(app["interface_stats"].is_object());
        assert!(app["stats"]["tcp_percent"].is_u64());
    }
}
