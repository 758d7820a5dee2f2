//! netstat invocation and tabular output parsing.
//!
//! Three dialects are understood: Linux (`netstat -apntu`), macOS
//! (`netstat -vanl`), and Windows (`netstat.exe -ano`). The dialect is
//! detected from the header line, after which each data row is reduced to
//! `{proto, local, remote, state?, pid?, proc_name?}`. The parser is a pure
//! function over captured text so every dialect is exercised in tests
//! regardless of the host platform.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use eyre::Context;
use tokio::io::AsyncReadExt;

use crate::net::normalize_ipv6;

/// Cap on how much netstat output is read before parsing.
const MAX_OUTPUT_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketProto {
    Tcp,
    Udp,
}

impl SocketProto {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// One parsed netstat row. A `local_port`/`remote_port` of `None` means the
/// endpoint was a wildcard; a `local_addr`/`remote_addr` of `"*"` likewise.
#[derive(Debug, Clone)]
pub struct NetstatRow {
    pub proto: SocketProto,
    pub local_addr: String,
    pub local_port: Option<u16>,
    pub remote_addr: String,
    pub remote_port: Option<u16>,
    pub state: Option<String>,
    pub pid: Option<i32>,
    pub proc_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Linux,
    Macos,
    Windows,
}

/// Run the platform netstat with a wall-clock timeout and a bounded output
/// buffer. A non-zero exit propagates as an error; stderr is logged at debug.
pub async fn run_netstat(timeout_ms: u64) -> eyre::Result<String> {
    let (program, args): (&str, &[&str]) = if cfg!(target_os = "linux") {
        ("netstat", &["-apntu"])
    } else if cfg!(target_os = "macos") {
        ("netstat", &["-vanl"])
    } else if cfg!(windows) {
        ("netstat.exe", &["-ano"])
    } else {
        eyre::bail!("no netstat dialect is supported on this platform");
    };

    run_bounded(program, args, timeout_ms).await
}

/// Run the macOS lsof fallback used to fill pids the netstat output lacked.
pub async fn run_lsof(timeout_ms: u64) -> eyre::Result<String> {
    run_bounded("lsof", &["-nP", "-i", "-FpcnP"], timeout_ms).await
}

async fn run_bounded(program: &str, args: &[&str], timeout_ms: u64) -> eyre::Result<String> {
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Could not spawn {program}"))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| eyre::eyre!("Could not take {program} stdout"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| eyre::eyre!("Could not take {program} stderr"))?;

    let read_all = async {
        let mut out_buffer = Vec::new();
        let mut err_buffer = Vec::new();
        let mut limited_stdout = (&mut stdout).take(MAX_OUTPUT_BYTES);
        let (out_read, err_read) = tokio::join!(
            limited_stdout.read_to_end(&mut out_buffer),
            stderr.read_to_end(&mut err_buffer),
        );
        out_read.with_context(|| format!("Could not read {program} output"))?;
        err_read.with_context(|| format!("Could not read {program} stderr"))?;
        let status = child
            .wait()
            .await
            .with_context(|| format!("Could not wait for {program}"))?;
        Ok::<_, eyre::Report>((status, out_buffer, err_buffer))
    };

    let (status, out_buffer, err_buffer) =
        match tokio::time::timeout(Duration::from_millis(timeout_ms), read_all).await {
            Ok(result) => result?,
            Err(_) => {
                eyre::bail!("{program} did not finish within {timeout_ms} ms");
            }
        };

    if !status.success() {
        tracing::debug!(
            program = %program,
            status = %status,
            stderr = %String::from_utf8_lossy(&err_buffer),
            "Subprocess exited non-zero"
        );
        eyre::bail!("{program} exited with {status}");
    }

    Ok(String::from_utf8_lossy(&out_buffer).to_string())
}

/// Parse a complete netstat dump, auto-detecting the dialect from its header
/// line. Rows that do not fit the detected dialect are skipped.
pub fn parse_netstat_output(output: &str) -> Vec<NetstatRow> {
    let mut dialect = None;
    let mut rows = Vec::new();

    for line in output.lines() {
        if dialect.is_none() {
            if line.contains("Proto") && line.contains("Local Address") {
                dialect = Some(detect_dialect(line));
            }
            continue;
        }

        let Some(dialect) = dialect else { continue };
        match parse_row(dialect, line) {
            Some(row) => rows.push(row),
            None => {
                if !line.trim().is_empty() {
                    tracing::debug!(line = %line, "Skipping unparseable netstat row");
                }
            }
        }
    }

    rows
}

fn detect_dialect(header: &str) -> Dialect {
    if header.contains("PID/Program name") {
        Dialect::Linux
    } else if header.contains("(state)") || header.contains("rhiwat") {
        Dialect::Macos
    } else {
        Dialect::Windows
    }
}

fn parse_row(dialect: Dialect, line: &str) -> Option<NetstatRow> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let proto = parse_proto(tokens.first()?)?;
    let macos_dots = dialect == Dialect::Macos;

    let (local, remote, state, pid_token) = match dialect {
        Dialect::Linux => {
            // tcp: proto recvq sendq local remote state pid/prog
            // udp: proto recvq sendq local remote pid/prog
            let local = *tokens.get(3)?;
            let remote = *tokens.get(4)?;
            match proto {
                SocketProto::Tcp => (local, remote, tokens.get(5).copied(), tokens.get(6).copied()),
                SocketProto::Udp => {
                    // A udp row may still carry a state column (rare but seen
                    // for connected sockets).
                    if tokens.len() >= 7 {
                        (local, remote, tokens.get(5).copied(), tokens.get(6).copied())
                    } else {
                        (local, remote, None, tokens.get(5).copied())
                    }
                }
            }
        }
        Dialect::Macos => {
            // tcp: proto recvq sendq local remote state rhiwat shiwat pid …
            // udp: proto recvq sendq local remote       rhiwat shiwat pid …
            let local = *tokens.get(3)?;
            let remote = *tokens.get(4)?;
            let has_state = tokens
                .get(5)
                .is_some_and(|t| t.parse::<u64>().is_err());
            if has_state {
                (local, remote, tokens.get(5).copied(), tokens.get(8).copied())
            } else {
                (local, remote, None, tokens.get(7).copied())
            }
        }
        Dialect::Windows => {
            // tcp: proto local remote state pid
            // udp: proto local remote pid
            let local = *tokens.get(1)?;
            let remote = *tokens.get(2)?;
            match proto {
                SocketProto::Tcp => (local, remote, tokens.get(3).copied(), tokens.get(4).copied()),
                SocketProto::Udp => (local, remote, None, tokens.get(3).copied()),
            }
        }
    };

    let (local_addr, local_port) = parse_endpoint(local, macos_dots)?;
    let (remote_addr, remote_port) = parse_endpoint(remote, macos_dots)?;
    let (pid, proc_name) = pid_token.map_or((None, None), parse_pid_token);

    Some(NetstatRow {
        proto,
        local_addr,
        local_port,
        remote_addr,
        remote_port,
        state: state.map(normalize_state),
        pid,
        proc_name,
    })
}

fn parse_proto(token: &str) -> Option<SocketProto> {
    let token = token.to_ascii_lowercase();
    if token.starts_with("tcp") {
        Some(SocketProto::Tcp)
    } else if token.starts_with("udp") {
        Some(SocketProto::Udp)
    } else {
        None
    }
}

fn normalize_state(state: &str) -> String {
    match state {
        "LISTEN" | "LISTENING" => "LISTENING".to_string(),
        other => other.to_string(),
    }
}

/// Parse one endpoint token into `(address, port)`.
///
/// Handles `[v6]:port`, `v6:port` (port after the last colon), `v4:port`,
/// the macOS `host.port` form, and the wildcard spellings `*`, `*:*`, `*.*`,
/// `:::`, and `::`. A wildcard address is returned as `"*"`; a wildcard port
/// as `None`. IPv6 addresses come back canonicalized.
pub fn parse_endpoint(token: &str, macos_dots: bool) -> Option<(String, Option<u16>)> {
    match token {
        "*" | "*:*" | "*.*" => return Some(("*".to_string(), None)),
        "::" | ":::" => return Some((normalize_ipv6("::"), None)),
        _ => {}
    }

    let (addr_part, port_part) = if let Some(stripped) = token.strip_prefix('[') {
        // [v6]:port
        let (addr, rest) = stripped.split_once(']')?;
        let port = rest.strip_prefix(':')?;
        (addr, port)
    } else if macos_dots {
        let (addr, port) = token.rsplit_once('.')?;
        (addr, port)
    } else {
        let (addr, port) = token.rsplit_once(':')?;
        (addr, port)
    };

    let port = match port_part {
        "*" | "" => None,
        p => Some(p.parse::<u16>().ok()?),
    };

    let addr = match addr_part {
        "" | "*" => "*".to_string(),
        a => normalize_ipv6(a),
    };

    Some((addr, port))
}

/// Extract `(pid, process name)` from the dialect-specific pid column.
/// Handles `1234/progname` (Linux), `progname:1234`, and bare integers.
pub fn parse_pid_token(token: &str) -> (Option<i32>, Option<String>) {
    if token == "-" || token.is_empty() {
        return (None, None);
    }

    if let Ok(pid) = token.parse::<i32>() {
        return (if pid > 0 { Some(pid) } else { None }, None);
    }

    let Ok(tagged_re) = regex::Regex::new(r"^(?:([0-9]+)/(.*)|(.*):([0-9]+))$") else {
        return (None, None);
    };
    let Some(captures) = tagged_re.captures(token) else {
        return (None, None);
    };

    let (pid, name) = match (captures.get(1), captures.get(4)) {
        (Some(pid), None) => (pid.as_str(), captures.get(2).map(|m| m.as_str())),
        (None, Some(pid)) => (pid.as_str(), captures.get(3).map(|m| m.as_str())),
        _ => return (None, None),
    };

    let name = name
        .filter(|n| !n.is_empty())
        .map(std::string::ToString::to_string);
    (pid.parse().ok(), name)
}

/// Parse `lsof -nP -i -FpcnP` field output into a map from local endpoint
/// (`"<addr>:<port>"`, canonicalized) to `(pid, command)`. The protocol
/// (`P`) field lines are present in the output but not needed for the
/// mapping.
pub fn parse_lsof_output(output: &str) -> HashMap<String, (i32, String)> {
    let mut endpoints = HashMap::new();
    let mut pid: Option<i32> = None;
    let mut command = String::new();

    for line in output.lines() {
        match line.split_at_checked(1) {
            Some(("p", rest)) => pid = rest.parse().ok(),
            Some(("c", rest)) => command = rest.to_string(),
            Some(("n", rest)) => {
                let Some(pid) = pid else { continue };
                // "local->remote" for connected sockets; keep the local side.
                let local = rest.split("->").next().unwrap_or(rest);
                if let Some((addr, Some(port))) = parse_endpoint(local, false) {
                    endpoints.insert(format!("{addr}:{port}"), (pid, command.clone()));
                }
            }
            _ => {}
        }
    }

    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINUX_SAMPLE: &str = "\
Active Internet connections (servers and established)
Proto Recv-Q Send-Q Local Address           Foreign Address         State       PID/Program name
tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN      812/sshd
tcp        0      0 10.0.0.2:44321          142.250.74.36:443       ESTABLISHED 2230/firefox
tcp        0      0 127.0.0.1:5000          127.0.0.1:6000          ESTABLISHED 1234/flask
tcp6       0      0 :::22                   :::*                    LISTEN      812/sshd
udp        0      0 0.0.0.0:5353            0.0.0.0:*                           42/avahi-daemon
udp6       0      0 :::5353                 :::*                                42/avahi-daemon
garbage row that cannot parse
";

    const MACOS_SAMPLE: &str = "\
Active Internet connections (including servers)
Proto Recv-Q Send-Q  Local Address          Foreign Address        (state)     rhiwat shiwat    pid   epid  state  options
tcp4       0      0  192.168.1.5.49723      17.57.146.52.5223      ESTABLISHED 131072 131072    456      0 0x0102 0x00000020
tcp4       0      0  *.8080                 *.*                    LISTEN      131072 131072    777      0 0x0000 0x00000000
udp4       0      0  *.5353                 *.*                                196724   9216    789      0 0x0000 0x00000000
";

    const WINDOWS_SAMPLE: &str = "\
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    192.168.1.5:49723      52.97.146.178:443      ESTABLISHED     4321
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       1092
  UDP    0.0.0.0:5353           *:*                                    5678
  UDP    [::1]:1900             *:*                                    5678
";

    #[test]
    fn parses_linux_dialect() {
        let rows = parse_netstat_output(LINUX_SAMPLE);
        assert_eq!(rows.len(), 6);

        let established = &rows[1];
        assert_eq!(established.proto, SocketProto::Tcp);
        assert_eq!(established.local_addr, "10.0.0.2");
        assert_eq!(established.local_port, Some(44321));
        assert_eq!(established.remote_addr, "142.250.74.36");
        assert_eq!(established.remote_port, Some(443));
        assert_eq!(established.state.as_deref(), Some("ESTABLISHED"));
        assert_eq!(established.pid, Some(2230));
        assert_eq!(established.proc_name.as_deref(), Some("firefox"));

        let v6_listener = &rows[3];
        assert_eq!(
            v6_listener.local_addr,
            "0000:0000:0000:0000:0000:0000:0000:0000"
        );
        assert_eq!(v6_listener.local_port, Some(22));
        assert_eq!(v6_listener.state.as_deref(), Some("LISTENING"));

        let mdns = &rows[4];
        assert_eq!(mdns.proto, SocketProto::Udp);
        assert_eq!(mdns.local_addr, "0.0.0.0");
        assert_eq!(mdns.local_port, Some(5353));
        assert_eq!(mdns.remote_addr, "0.0.0.0");
        assert_eq!(mdns.remote_port, None);
        assert_eq!(mdns.pid, Some(42));
    }

    #[test]
    fn parses_macos_dialect() {
        let rows = parse_netstat_output(MACOS_SAMPLE);
        assert_eq!(rows.len(), 3);

        assert_eq!(rows[0].local_addr, "192.168.1.5");
        assert_eq!(rows[0].local_port, Some(49723));
        assert_eq!(rows[0].remote_addr, "17.57.146.52");
        assert_eq!(rows[0].remote_port, Some(5223));
        assert_eq!(rows[0].pid, Some(456));

        assert_eq!(rows[1].local_addr, "*");
        assert_eq!(rows[1].local_port, Some(8080));
        assert_eq!(rows[1].state.as_deref(), Some("LISTENING"));
        assert_eq!(rows[1].pid, Some(777));

        assert_eq!(rows[2].proto, SocketProto::Udp);
        assert_eq!(rows[2].local_port, Some(5353));
        assert_eq!(rows[2].state, None);
        assert_eq!(rows[2].pid, Some(789));
    }

    #[test]
    fn parses_windows_dialect() {
        let rows = parse_netstat_output(WINDOWS_SAMPLE);
        assert_eq!(rows.len(), 4);

        assert_eq!(rows[0].state.as_deref(), Some("ESTABLISHED"));
        assert_eq!(rows[0].pid, Some(4321));
        assert_eq!(rows[1].state.as_deref(), Some("LISTENING"));

        assert_eq!(rows[2].proto, SocketProto::Udp);
        assert_eq!(rows[2].pid, Some(5678));
        assert_eq!(rows[2].remote_addr, "*");

        assert_eq!(
            rows[3].local_addr,
            "0000:0000:0000:0000:0000:0000:0000:0001"
        );
        assert_eq!(rows[3].local_port, Some(1900));
    }

    #[test]
    fn parses_endpoint_forms() {
        assert_eq!(parse_endpoint("*", false), Some(("*".to_string(), None)));
        assert_eq!(parse_endpoint("*:*", false), Some(("*".to_string(), None)));
        assert_eq!(
            parse_endpoint(":::", false),
            Some(("0000:0000:0000:0000:0000:0000:0000:0000".to_string(), None))
        );
        assert_eq!(
            parse_endpoint(":::443", false),
            Some((
                "0000:0000:0000:0000:0000:0000:0000:0000".to_string(),
                Some(443)
            ))
        );
        assert_eq!(
            parse_endpoint("[2001:db8::1]:8080", false),
            Some((
                "2001:0db8:0000:0000:0000:0000:0000:0001".to_string(),
                Some(8080)
            ))
        );
        assert_eq!(
            parse_endpoint("10.1.2.3:80", false),
            Some(("10.1.2.3".to_string(), Some(80)))
        );
        assert_eq!(
            parse_endpoint("192.168.1.5.49723", true),
            Some(("192.168.1.5".to_string(), Some(49723)))
        );
        assert_eq!(
            parse_endpoint("*.5353", true),
            Some(("*".to_string(), Some(5353)))
        );
        assert_eq!(parse_endpoint("no-port", false), None);
    }

    #[test]
    fn parses_pid_token_forms() {
        assert_eq!(parse_pid_token("1234"), (Some(1234), None));
        assert_eq!(
            parse_pid_token("812/sshd"),
            (Some(812), Some("sshd".to_string()))
        );
        assert_eq!(
            parse_pid_token("firefox:2230"),
            (Some(2230), Some("firefox".to_string()))
        );
        assert_eq!(parse_pid_token("-"), (None, None));
        assert_eq!(parse_pid_token("0"), (None, None));
        assert_eq!(parse_pid_token("nonsense"), (None, None));
    }

    #[test]
    fn parses_lsof_fields() {
        let sample = "p456\ncfirefox\nPTCP\nn192.168.1.5:49723->17.57.146.52:5223\np789\ncmDNSResponder\nPUDP\nn*:5353\n";
        let endpoints = parse_lsof_output(sample);
        assert_eq!(
            endpoints.get("192.168.1.5:49723"),
            Some(&(456, "firefox".to_string()))
        );
        // Wildcard local endpoints carry a port, so they are keyed on "*".
        assert_eq!(
            endpoints.get("*:5353"),
            Some(&(789, "mDNSResponder".to_string()))
        );
    }
}
