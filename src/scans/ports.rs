//! TCP port scanning.
//!
//! `nmap` when present; otherwise a plain connect scan with a 2 s
//! timeout per port.

use std::sync::LazyLock;
use std::time::Duration;

use futures_util::future::join_all;
use regex::Regex;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::store::models::ScanTask;
use crate::util::json_i64;

use super::tools::{NMAP_TIMEOUT, binary_on_path, guess_service, run_tool};
use super::{ScanContext, ScanError};

const DEFAULT_PORTS: [u16; 8] = [80, 443, 22, 21, 8080, 8443, 3306, 3389];
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

static NMAP_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)/open/tcp//([^/]*)").expect("nmap output regex"));

struct OpenPort {
    port: u16,
    service: Option<String>,
}

pub async fn run(ctx: &ScanContext, task: &ScanTask) -> Result<Value, ScanError> {
    let ports = ports_from_config(&task.config);
    let batch_size = json_i64(&task.config, "batch_size", 1000);

    let ips = ctx.store.list_ip_addresses(task.project_id, batch_size).await?;
    let mut open_count = 0u64;

    for ip in &ips {
        let open_ports = scan_ports(&ip.ip, &ports).await;
        for open in open_ports {
            ctx.store
                .upsert_port(
                    ip.id,
                    open.port,
                    "tcp",
                    "open",
                    open.service.as_deref(),
                    None,
                )
                .await?;
            open_count += 1;
        }
    }

    info!(ips = ips.len(), open_ports = open_count, "port scan finished");
    Ok(json!({ "ips_scanned": ips.len(), "open_ports": open_count }))
}

fn ports_from_config(config: &Value) -> Vec<u16> {
    config
        .get("ports")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_u64)
                .filter(|p| (1..=65535).contains(p))
                .map(|p| p as u16)
                .collect()
        })
        .filter(|ports: &Vec<u16>| !ports.is_empty())
        .unwrap_or_else(|| DEFAULT_PORTS.to_vec())
}

async fn scan_ports(ip: &str, ports: &[u16]) -> Vec<OpenPort> {
    if binary_on_path("nmap").is_some() {
        let port_list = ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        match run_tool(
            "nmap",
            &["-sT", "-p", &port_list, "--open", "-oG", "-", ip],
            NMAP_TIMEOUT,
        )
        .await
        {
            Ok(output) if output.status.success() => {
                return parse_nmap_output(&String::from_utf8_lossy(&output.stdout));
            }
            Ok(_) | Err(_) => {
                warn!(ip, "nmap failed, falling back to connect scan");
            }
        }
    }
    connect_scan(ip, ports).await
}

async fn connect_scan(ip: &str, ports: &[u16]) -> Vec<OpenPort> {
    let attempts = ports.iter().map(|&port| async move {
        let attempt = TcpStream::connect((ip, port));
        match tokio::time::timeout(CONNECT_TIMEOUT, attempt).await {
            Ok(Ok(_)) => Some(OpenPort {
                port,
                service: Some(guess_service(port).to_string()),
            }),
            _ => None,
        }
    });
    join_all(attempts).await.into_iter().flatten().collect()
}

fn parse_nmap_output(output: &str) -> Vec<OpenPort> {
    let mut open = Vec::new();
    for line in output.lines() {
        let Some(ports_section) = line.split("Ports:").nth(1) else {
            continue;
        };
        for entry in ports_section.split(',') {
            if let Some(captures) = NMAP_OPEN_RE.captures(entry) {
                let Some(port) = captures.get(1).and_then(|m| m.as_str().parse::<u16>().ok())
                else {
                    continue;
                };
                let service = captures
                    .get(2)
                    .map(|m| m.as_str().to_string())
                    .filter(|s| !s.is_empty());
                open.push(OpenPort { port, service });
            }
        }
    }
    open
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_nmap_grepable_output() {
        let output = "Host: 10.0.0.1 ()\tPorts: 22/open/tcp//ssh/, 80/open/tcp//http/, 443/closed/tcp//https/";
        let open = parse_nmap_output(output);
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].port, 22);
        assert_eq!(open[0].service.as_deref(), Some("ssh"));
        assert_eq!(open[1].port, 80);
    }

    #[test]
    fn ports_config_defaults_and_bounds() {
        assert_eq!(ports_from_config(&json!({})), DEFAULT_PORTS.to_vec());
        assert_eq!(
            ports_from_config(&json!({"ports": [22, 0, 70000, 8080]})),
            vec![22, 8080]
        );
        assert_eq!(ports_from_config(&json!({"ports": []})), DEFAULT_PORTS.to_vec());
    }
}
