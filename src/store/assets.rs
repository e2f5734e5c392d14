//! Asset-graph upserts.
//!
//! Every upsert is keyed by the entity's natural key. If the row exists,
//! observation fields merge (a `None` never clears a stored value) and
//! `last_seen` advances; otherwise the row is inserted with
//! `first_seen = last_seen = now`. Upserts are idempotent.

use chrono::Utc;
use rustc_hash::FxHashMap;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::assets::fingerprint::{
    ip_fingerprint, normalize_url, subdomain_fingerprint, url_fingerprint, vuln_fingerprint,
};
use crate::types::Severity;

use super::models::{
    ApiEndpoint, ApiRiskFinding, IpAddress, JsAsset, Port, Subdomain, Vulnerability, WebAsset,
};
use super::{
    Result, Store, StoreError, json_text, opt_uuid, parse_json, parse_severity, parse_string_vec,
    parse_uuid, string_vec_json,
};

fn subdomain_from_row(row: &SqliteRow) -> Result<Subdomain> {
    Ok(Subdomain {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "subdomain.id")?,
        project_id: parse_uuid(&row.try_get::<String, _>("project_id")?, "subdomain.project_id")?,
        root_domain: row.try_get("root_domain")?,
        subdomain: row.try_get("subdomain")?,
        source: row.try_get("source")?,
        ip_addresses: parse_string_vec(row.try_get("ip_addresses")?),
        cname: row.try_get("cname")?,
        fingerprint_hash: row.try_get("fingerprint_hash")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

fn ip_from_row(row: &SqliteRow) -> Result<IpAddress> {
    Ok(IpAddress {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "ip.id")?,
        project_id: parse_uuid(&row.try_get::<String, _>("project_id")?, "ip.project_id")?,
        ip: row.try_get("ip")?,
        source: row.try_get("source")?,
        country: row.try_get("country")?,
        org: row.try_get("org")?,
        is_cdn: row.try_get("is_cdn")?,
        fingerprint_hash: row.try_get("fingerprint_hash")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

fn port_from_row(row: &SqliteRow) -> Result<Port> {
    Ok(Port {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "port.id")?,
        ip_id: parse_uuid(&row.try_get::<String, _>("ip_id")?, "port.ip_id")?,
        port: row.try_get::<i64, _>("port")? as u16,
        protocol: row.try_get("protocol")?,
        state: row.try_get("state")?,
        service: row.try_get("service")?,
        banner: row.try_get("banner")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

fn web_asset_from_row(row: &SqliteRow) -> Result<WebAsset> {
    Ok(WebAsset {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "web_asset.id")?,
        project_id: parse_uuid(&row.try_get::<String, _>("project_id")?, "web_asset.project_id")?,
        url: row.try_get("url")?,
        normalized_url: row.try_get("normalized_url")?,
        ip_id: opt_uuid(row.try_get("ip_id")?, "web_asset.ip_id")?,
        port_id: opt_uuid(row.try_get("port_id")?, "web_asset.port_id")?,
        title: row.try_get("title")?,
        status_code: row.try_get::<Option<i64>, _>("status_code")?.map(|c| c as u16),
        content_length: row.try_get("content_length")?,
        content_type: row.try_get("content_type")?,
        server: row.try_get("server")?,
        technologies: parse_string_vec(row.try_get("technologies")?),
        is_alive: row.try_get("is_alive")?,
        screenshot_path: row.try_get("screenshot_path")?,
        fingerprint_hash: row.try_get("fingerprint_hash")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

fn js_asset_from_row(row: &SqliteRow) -> Result<JsAsset> {
    Ok(JsAsset {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "js_asset.id")?,
        project_id: parse_uuid(&row.try_get::<String, _>("project_id")?, "js_asset.project_id")?,
        web_asset_id: opt_uuid(row.try_get("web_asset_id")?, "js_asset.web_asset_id")?,
        script_url: row.try_get("script_url")?,
        script_type: row.try_get("script_type")?,
        content_hash: row.try_get("content_hash")?,
        source_url: row.try_get("source_url")?,
        scan_metadata: parse_json(row.try_get("scan_metadata")?, serde_json::json!({})),
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

fn api_endpoint_from_row(row: &SqliteRow) -> Result<ApiEndpoint> {
    Ok(ApiEndpoint {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "api_endpoint.id")?,
        project_id: parse_uuid(
            &row.try_get::<String, _>("project_id")?,
            "api_endpoint.project_id",
        )?,
        js_asset_id: opt_uuid(row.try_get("js_asset_id")?, "api_endpoint.js_asset_id")?,
        endpoint: row.try_get("endpoint")?,
        method: row.try_get("method")?,
        host: row.try_get("host")?,
        evidence: parse_json(row.try_get("evidence")?, serde_json::json!({})),
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

fn vulnerability_from_row(row: &SqliteRow) -> Result<Vulnerability> {
    Ok(Vulnerability {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "vulnerability.id")?,
        project_id: parse_uuid(
            &row.try_get::<String, _>("project_id")?,
            "vulnerability.project_id",
        )?,
        target_url: row.try_get("target_url")?,
        template_id: row.try_get("template_id")?,
        template_name: row.try_get("template_name")?,
        severity: parse_severity(&row.try_get::<String, _>("severity")?),
        vuln_type: row.try_get("vuln_type")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        reference: parse_string_vec(row.try_get("reference")?),
        tags: parse_string_vec(row.try_get("tags")?),
        matched_at: row.try_get("matched_at")?,
        matcher_name: row.try_get("matcher_name")?,
        extracted_results: parse_string_vec(row.try_get("extracted_results")?),
        curl_command: row.try_get("curl_command")?,
        request: row.try_get("request")?,
        response: row.try_get("response")?,
        scan_task_id: opt_uuid(row.try_get("scan_task_id")?, "vulnerability.scan_task_id")?,
        target_type: row.try_get("target_type")?,
        target_id: opt_uuid(row.try_get("target_id")?, "vulnerability.target_id")?,
        raw_output: row
            .try_get::<Option<String>, _>("raw_output")?
            .and_then(|text| serde_json::from_str(&text).ok()),
        fingerprint_hash: row.try_get("fingerprint_hash")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

fn api_risk_from_row(row: &SqliteRow) -> Result<ApiRiskFinding> {
    Ok(ApiRiskFinding {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "api_risk.id")?,
        project_id: parse_uuid(&row.try_get::<String, _>("project_id")?, "api_risk.project_id")?,
        endpoint_id: opt_uuid(row.try_get("endpoint_id")?, "api_risk.endpoint_id")?,
        rule_name: row.try_get("rule_name")?,
        severity: parse_severity(&row.try_get::<String, _>("severity")?),
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        evidence: parse_json(row.try_get("evidence")?, serde_json::json!({})),
        status: row.try_get("status")?,
        status_history: parse_json(row.try_get("status_history")?, serde_json::json!([])),
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

/// Optional observation fields for a web-asset upsert. `None` fields
/// leave existing values untouched.
#[derive(Clone, Debug, Default)]
pub struct WebAssetPatch {
    pub ip_id: Option<Uuid>,
    pub port_id: Option<Uuid>,
    pub title: Option<String>,
    pub status_code: Option<u16>,
    pub content_length: Option<i64>,
    pub content_type: Option<String>,
    pub server: Option<String>,
    pub technologies: Option<Vec<String>>,
    pub is_alive: Option<bool>,
    pub screenshot_path: Option<String>,
}

/// Input for a vulnerability upsert; the natural key is
/// `(project_id, target_url, template_id)`.
#[derive(Clone, Debug, Default)]
pub struct VulnerabilityInput {
    pub target_url: String,
    pub template_id: String,
    pub template_name: Option<String>,
    pub severity: Severity,
    pub vuln_type: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub reference: Vec<String>,
    pub tags: Vec<String>,
    pub matched_at: Option<String>,
    pub matcher_name: Option<String>,
    pub extracted_results: Vec<String>,
    pub curl_command: Option<String>,
    pub request: Option<String>,
    pub response: Option<String>,
    pub scan_task_id: Option<Uuid>,
    pub target_type: Option<String>,
    pub target_id: Option<Uuid>,
    pub raw_output: Option<serde_json::Value>,
}

impl Store {
    pub async fn upsert_subdomain(
        &self,
        project_id: Uuid,
        root_domain: &str,
        subdomain: &str,
        source: &str,
        ip_addresses: Option<&[String]>,
        cname: Option<&str>,
    ) -> Result<Subdomain> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO subdomains
                (id, project_id, root_domain, subdomain, source, ip_addresses, cname,
                 fingerprint_hash, first_seen, last_seen)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (project_id, subdomain) DO UPDATE SET
                ip_addresses = COALESCE(?, subdomains.ip_addresses),
                cname = COALESCE(?, subdomains.cname),
                last_seen = ?",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id.to_string())
        .bind(root_domain)
        .bind(subdomain)
        .bind(source)
        .bind(ip_addresses.map(string_vec_json).unwrap_or_else(|| "[]".to_string()))
        .bind(cname)
        .bind(subdomain_fingerprint(project_id, subdomain))
        .bind(now)
        .bind(now)
        .bind(ip_addresses.map(string_vec_json))
        .bind(cname)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM subdomains WHERE project_id = ? AND subdomain = ?")
            .bind(project_id.to_string())
            .bind(subdomain)
            .fetch_one(&self.pool)
            .await?;
        subdomain_from_row(&row)
    }

    /// Batch variant used by subdomain enumeration; only `last_seen`
    /// advances on conflict. Returns the number of names processed.
    pub async fn bulk_upsert_subdomains(
        &self,
        project_id: Uuid,
        root_domain: &str,
        subdomains: &[String],
        source: &str,
    ) -> Result<u64> {
        let now = Utc::now();
        for name in subdomains {
            sqlx::query(
                "INSERT INTO subdomains
                    (id, project_id, root_domain, subdomain, source, ip_addresses,
                     fingerprint_hash, first_seen, last_seen)
                 VALUES (?, ?, ?, ?, ?, '[]', ?, ?, ?)
                 ON CONFLICT (project_id, subdomain) DO UPDATE SET last_seen = ?",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(project_id.to_string())
            .bind(root_domain)
            .bind(name)
            .bind(source)
            .bind(subdomain_fingerprint(project_id, name))
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }
        Ok(subdomains.len() as u64)
    }

    pub async fn list_subdomains(
        &self,
        project_id: Uuid,
        root_domain: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Subdomain>> {
        let rows = match root_domain {
            Some(root) => {
                sqlx::query(
                    "SELECT * FROM subdomains WHERE project_id = ? AND root_domain = ?
                     ORDER BY subdomain LIMIT ?",
                )
                .bind(project_id.to_string())
                .bind(root)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM subdomains WHERE project_id = ? ORDER BY subdomain LIMIT ?")
                    .bind(project_id.to_string())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(subdomain_from_row).collect()
    }

    /// Merge rows that share a fingerprint hash: the greatest `last_seen`
    /// wins, `ip_addresses` arrays union, losers are deleted in one
    /// batch. Returns the number of rows removed.
    pub async fn merge_duplicate_subdomains(&self, project_id: Uuid) -> Result<u64> {
        let pid = project_id.to_string();
        let dupes: Vec<String> = sqlx::query_scalar(
            "SELECT fingerprint_hash FROM subdomains
             WHERE project_id = ? AND fingerprint_hash IS NOT NULL
             GROUP BY fingerprint_hash HAVING COUNT(id) > 1",
        )
        .bind(&pid)
        .fetch_all(&self.pool)
        .await?;

        let mut merged = 0u64;
        for fingerprint in dupes {
            let rows = sqlx::query(
                "SELECT * FROM subdomains
                 WHERE project_id = ? AND fingerprint_hash = ?
                 ORDER BY last_seen DESC, id",
            )
            .bind(&pid)
            .bind(&fingerprint)
            .fetch_all(&self.pool)
            .await?;
            let records = rows
                .iter()
                .map(subdomain_from_row)
                .collect::<Result<Vec<_>>>()?;
            let Some((keeper, losers)) = records.split_first() else {
                continue;
            };
            if losers.is_empty() {
                continue;
            }

            let mut ips: Vec<String> = keeper.ip_addresses.clone();
            for loser in losers {
                for ip in &loser.ip_addresses {
                    if !ips.contains(ip) {
                        ips.push(ip.clone());
                    }
                }
            }
            sqlx::query("UPDATE subdomains SET ip_addresses = ? WHERE id = ?")
                .bind(string_vec_json(&ips))
                .bind(keeper.id.to_string())
                .execute(&self.pool)
                .await?;

            let placeholders = vec!["?"; losers.len()].join(", ");
            let delete_sql = format!("DELETE FROM subdomains WHERE id IN ({placeholders})");
            let mut delete = sqlx::query(&delete_sql);
            for loser in losers {
                delete = delete.bind(loser.id.to_string());
            }
            merged += delete.execute(&self.pool).await?.rows_affected();
        }
        Ok(merged)
    }

    pub async fn upsert_ip_address(
        &self,
        project_id: Uuid,
        ip: &str,
        source: &str,
    ) -> Result<IpAddress> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO ip_addresses
                (id, project_id, ip, source, is_cdn, fingerprint_hash, first_seen, last_seen)
             VALUES (?, ?, ?, ?, 0, ?, ?, ?)
             ON CONFLICT (project_id, ip) DO UPDATE SET last_seen = ?",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id.to_string())
        .bind(ip)
        .bind(source)
        .bind(ip_fingerprint(project_id, ip))
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM ip_addresses WHERE project_id = ? AND ip = ?")
            .bind(project_id.to_string())
            .bind(ip)
            .fetch_one(&self.pool)
            .await?;
        ip_from_row(&row)
    }

    pub async fn list_ip_addresses(&self, project_id: Uuid, limit: i64) -> Result<Vec<IpAddress>> {
        let rows = sqlx::query("SELECT * FROM ip_addresses WHERE project_id = ? ORDER BY ip LIMIT ?")
            .bind(project_id.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(ip_from_row).collect()
    }

    pub async fn upsert_port(
        &self,
        ip_id: Uuid,
        port: u16,
        protocol: &str,
        state: &str,
        service: Option<&str>,
        banner: Option<&str>,
    ) -> Result<Port> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO ports
                (id, ip_id, port, protocol, state, service, banner, first_seen, last_seen)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (ip_id, port, protocol) DO UPDATE SET
                state = ?,
                service = COALESCE(?, ports.service),
                banner = COALESCE(?, ports.banner),
                last_seen = ?",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(ip_id.to_string())
        .bind(port as i64)
        .bind(protocol)
        .bind(state)
        .bind(service)
        .bind(banner)
        .bind(now)
        .bind(now)
        .bind(state)
        .bind(service)
        .bind(banner)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM ports WHERE ip_id = ? AND port = ? AND protocol = ?")
            .bind(ip_id.to_string())
            .bind(port as i64)
            .bind(protocol)
            .fetch_one(&self.pool)
            .await?;
        port_from_row(&row)
    }

    pub async fn list_ports_by_ip(&self, ip_id: Uuid, limit: i64) -> Result<Vec<Port>> {
        let rows = sqlx::query("SELECT * FROM ports WHERE ip_id = ? ORDER BY port LIMIT ?")
            .bind(ip_id.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(port_from_row).collect()
    }

    /// Open ports for the exposure factor: all of a project's ports, or
    /// one IP's when `ip_id` is given.
    pub async fn list_open_port_numbers(
        &self,
        project_id: Uuid,
        ip_id: Option<Uuid>,
    ) -> Result<Vec<u16>> {
        let rows = match ip_id {
            Some(ip) => {
                sqlx::query(
                    "SELECT ports.port AS port FROM ports
                     JOIN ip_addresses ON ports.ip_id = ip_addresses.id
                     WHERE ip_addresses.project_id = ? AND ports.ip_id = ? AND ports.state = 'open'",
                )
                .bind(project_id.to_string())
                .bind(ip.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT ports.port AS port FROM ports
                     JOIN ip_addresses ON ports.ip_id = ip_addresses.id
                     WHERE ip_addresses.project_id = ? AND ports.state = 'open'",
                )
                .bind(project_id.to_string())
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter()
            .map(|row| Ok(row.try_get::<i64, _>("port")? as u16))
            .collect()
    }

    pub async fn upsert_web_asset(
        &self,
        project_id: Uuid,
        url: &str,
        patch: WebAssetPatch,
    ) -> Result<WebAsset> {
        let now = Utc::now();
        let normalized = normalize_url(url);
        sqlx::query(
            "INSERT INTO web_assets
                (id, project_id, url, normalized_url, ip_id, port_id, title, status_code,
                 content_length, content_type, server, technologies, is_alive,
                 screenshot_path, fingerprint_hash, first_seen, last_seen)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (project_id, normalized_url) DO UPDATE SET
                ip_id = COALESCE(?, web_assets.ip_id),
                port_id = COALESCE(?, web_assets.port_id),
                title = COALESCE(?, web_assets.title),
                status_code = COALESCE(?, web_assets.status_code),
                content_length = COALESCE(?, web_assets.content_length),
                content_type = COALESCE(?, web_assets.content_type),
                server = COALESCE(?, web_assets.server),
                technologies = COALESCE(?, web_assets.technologies),
                is_alive = COALESCE(?, web_assets.is_alive),
                screenshot_path = COALESCE(?, web_assets.screenshot_path),
                last_seen = ?",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id.to_string())
        .bind(url)
        .bind(&normalized)
        .bind(patch.ip_id.map(|v| v.to_string()))
        .bind(patch.port_id.map(|v| v.to_string()))
        .bind(patch.title.as_deref())
        .bind(patch.status_code.map(|v| v as i64))
        .bind(patch.content_length)
        .bind(patch.content_type.as_deref())
        .bind(patch.server.as_deref())
        .bind(patch.technologies.as_deref().map(string_vec_json))
        .bind(patch.is_alive.unwrap_or(false))
        .bind(patch.screenshot_path.as_deref())
        .bind(url_fingerprint(project_id, url))
        .bind(now)
        .bind(now)
        .bind(patch.ip_id.map(|v| v.to_string()))
        .bind(patch.port_id.map(|v| v.to_string()))
        .bind(patch.title.as_deref())
        .bind(patch.status_code.map(|v| v as i64))
        .bind(patch.content_length)
        .bind(patch.content_type.as_deref())
        .bind(patch.server.as_deref())
        .bind(patch.technologies.as_deref().map(string_vec_json))
        .bind(patch.is_alive)
        .bind(patch.screenshot_path.as_deref())
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM web_assets WHERE project_id = ? AND normalized_url = ?")
            .bind(project_id.to_string())
            .bind(&normalized)
            .fetch_one(&self.pool)
            .await?;
        web_asset_from_row(&row)
    }

    pub async fn list_web_assets(
        &self,
        project_id: Uuid,
        is_alive: Option<bool>,
        limit: i64,
    ) -> Result<Vec<WebAsset>> {
        let rows = match is_alive {
            Some(alive) => {
                sqlx::query(
                    "SELECT * FROM web_assets WHERE project_id = ? AND is_alive = ?
                     ORDER BY normalized_url LIMIT ?",
                )
                .bind(project_id.to_string())
                .bind(alive)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM web_assets WHERE project_id = ? ORDER BY normalized_url LIMIT ?",
                )
                .bind(project_id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(web_asset_from_row).collect()
    }

    pub async fn upsert_js_asset(
        &self,
        project_id: Uuid,
        web_asset_id: Option<Uuid>,
        script_url: &str,
        script_type: &str,
        content_hash: &str,
        source_url: Option<&str>,
        scan_metadata: &serde_json::Value,
    ) -> Result<JsAsset> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO js_assets
                (id, project_id, web_asset_id, script_url, script_type, content_hash,
                 source_url, scan_metadata, fingerprint_hash, first_seen, last_seen)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (project_id, script_url, content_hash) DO UPDATE SET
                web_asset_id = COALESCE(?, js_assets.web_asset_id),
                source_url = COALESCE(?, js_assets.source_url),
                scan_metadata = COALESCE(?, js_assets.scan_metadata),
                last_seen = ?",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id.to_string())
        .bind(web_asset_id.map(|v| v.to_string()))
        .bind(script_url)
        .bind(script_type)
        .bind(content_hash)
        .bind(source_url)
        .bind(json_text(scan_metadata))
        .bind(crate::assets::fingerprint::fingerprint_hash(
            project_id,
            "js",
            &format!("{script_url}:{content_hash}"),
        ))
        .bind(now)
        .bind(now)
        .bind(web_asset_id.map(|v| v.to_string()))
        .bind(source_url)
        .bind(json_text(scan_metadata))
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM js_assets WHERE project_id = ? AND script_url = ? AND content_hash = ?",
        )
        .bind(project_id.to_string())
        .bind(script_url)
        .bind(content_hash)
        .fetch_one(&self.pool)
        .await?;
        js_asset_from_row(&row)
    }

    pub async fn list_js_assets(&self, project_id: Uuid, limit: i64) -> Result<Vec<JsAsset>> {
        let rows = sqlx::query("SELECT * FROM js_assets WHERE project_id = ? ORDER BY script_url LIMIT ?")
            .bind(project_id.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(js_asset_from_row).collect()
    }

    pub async fn upsert_api_endpoint(
        &self,
        project_id: Uuid,
        js_asset_id: Option<Uuid>,
        endpoint: &str,
        method: &str,
        host: Option<&str>,
        evidence: &serde_json::Value,
    ) -> Result<ApiEndpoint> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO api_endpoints
                (id, project_id, js_asset_id, endpoint, method, host, evidence,
                 fingerprint_hash, first_seen, last_seen)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (project_id, endpoint, method) DO UPDATE SET
                js_asset_id = COALESCE(?, api_endpoints.js_asset_id),
                host = COALESCE(?, api_endpoints.host),
                evidence = COALESCE(?, api_endpoints.evidence),
                last_seen = ?",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id.to_string())
        .bind(js_asset_id.map(|v| v.to_string()))
        .bind(endpoint)
        .bind(method)
        .bind(host)
        .bind(json_text(evidence))
        .bind(crate::assets::fingerprint::fingerprint_hash(
            project_id,
            "api",
            &format!("{method}:{endpoint}"),
        ))
        .bind(now)
        .bind(now)
        .bind(js_asset_id.map(|v| v.to_string()))
        .bind(host)
        .bind(json_text(evidence))
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM api_endpoints WHERE project_id = ? AND endpoint = ? AND method = ?",
        )
        .bind(project_id.to_string())
        .bind(endpoint)
        .bind(method)
        .fetch_one(&self.pool)
        .await?;
        api_endpoint_from_row(&row)
    }

    pub async fn list_api_endpoints(&self, project_id: Uuid, limit: i64) -> Result<Vec<ApiEndpoint>> {
        let rows =
            sqlx::query("SELECT * FROM api_endpoints WHERE project_id = ? ORDER BY endpoint LIMIT ?")
                .bind(project_id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(api_endpoint_from_row).collect()
    }

    pub async fn upsert_vulnerability(
        &self,
        project_id: Uuid,
        input: VulnerabilityInput,
    ) -> Result<Vulnerability> {
        let now = Utc::now();
        let fingerprint = vuln_fingerprint(project_id, &input.target_url, &input.template_id);
        sqlx::query(
            "INSERT INTO vulnerabilities
                (id, project_id, target_url, template_id, template_name, severity, vuln_type,
                 title, description, reference, tags, matched_at, matcher_name,
                 extracted_results, curl_command, request, response, scan_task_id,
                 target_type, target_id, raw_output, fingerprint_hash, first_seen, last_seen)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (project_id, target_url, template_id) DO UPDATE SET
                template_name = COALESCE(?, vulnerabilities.template_name),
                severity = ?,
                vuln_type = COALESCE(?, vulnerabilities.vuln_type),
                title = COALESCE(?, vulnerabilities.title),
                description = COALESCE(?, vulnerabilities.description),
                matched_at = COALESCE(?, vulnerabilities.matched_at),
                matcher_name = COALESCE(?, vulnerabilities.matcher_name),
                curl_command = COALESCE(?, vulnerabilities.curl_command),
                scan_task_id = COALESCE(?, vulnerabilities.scan_task_id),
                target_type = COALESCE(?, vulnerabilities.target_type),
                target_id = COALESCE(?, vulnerabilities.target_id),
                raw_output = COALESCE(?, vulnerabilities.raw_output),
                last_seen = ?",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id.to_string())
        .bind(&input.target_url)
        .bind(&input.template_id)
        .bind(input.template_name.as_deref())
        .bind(input.severity.as_str())
        .bind(input.vuln_type.as_deref())
        .bind(input.title.as_deref())
        .bind(input.description.as_deref())
        .bind(string_vec_json(&input.reference))
        .bind(string_vec_json(&input.tags))
        .bind(input.matched_at.as_deref())
        .bind(input.matcher_name.as_deref())
        .bind(string_vec_json(&input.extracted_results))
        .bind(input.curl_command.as_deref())
        .bind(input.request.as_deref())
        .bind(input.response.as_deref())
        .bind(input.scan_task_id.map(|v| v.to_string()))
        .bind(input.target_type.as_deref())
        .bind(input.target_id.map(|v| v.to_string()))
        .bind(input.raw_output.as_ref().map(json_text))
        .bind(&fingerprint)
        .bind(now)
        .bind(now)
        .bind(input.template_name.as_deref())
        .bind(input.severity.as_str())
        .bind(input.vuln_type.as_deref())
        .bind(input.title.as_deref())
        .bind(input.description.as_deref())
        .bind(input.matched_at.as_deref())
        .bind(input.matcher_name.as_deref())
        .bind(input.curl_command.as_deref())
        .bind(input.scan_task_id.map(|v| v.to_string()))
        .bind(input.target_type.as_deref())
        .bind(input.target_id.map(|v| v.to_string()))
        .bind(input.raw_output.as_ref().map(json_text))
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM vulnerabilities
             WHERE project_id = ? AND target_url = ? AND template_id = ?",
        )
        .bind(project_id.to_string())
        .bind(&input.target_url)
        .bind(&input.template_id)
        .fetch_one(&self.pool)
        .await?;
        vulnerability_from_row(&row)
    }

    pub async fn list_vulnerabilities(
        &self,
        project_id: Uuid,
        severity: Option<Severity>,
        limit: i64,
    ) -> Result<Vec<Vulnerability>> {
        let rows = match severity {
            Some(sev) => {
                sqlx::query(
                    "SELECT * FROM vulnerabilities WHERE project_id = ? AND severity = ?
                     ORDER BY last_seen DESC LIMIT ?",
                )
                .bind(project_id.to_string())
                .bind(sev.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM vulnerabilities WHERE project_id = ?
                     ORDER BY last_seen DESC LIMIT ?",
                )
                .bind(project_id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(vulnerability_from_row).collect()
    }

    /// Severity histogram for the vulnerability risk factor, optionally
    /// narrowed to one asset.
    pub async fn count_vulnerabilities_by_severity(
        &self,
        project_id: Uuid,
        target_type: Option<&str>,
        target_id: Option<Uuid>,
    ) -> Result<FxHashMap<Severity, u32>> {
        let rows = match (target_type, target_id) {
            (Some(kind), Some(id)) => {
                sqlx::query(
                    "SELECT severity, COUNT(*) AS n FROM vulnerabilities
                     WHERE project_id = ? AND target_type = ? AND target_id = ?
                     GROUP BY severity",
                )
                .bind(project_id.to_string())
                .bind(kind)
                .bind(id.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            _ => {
                sqlx::query(
                    "SELECT severity, COUNT(*) AS n FROM vulnerabilities
                     WHERE project_id = ? GROUP BY severity",
                )
                .bind(project_id.to_string())
                .fetch_all(&self.pool)
                .await?
            }
        };
        let mut counts = FxHashMap::default();
        for row in rows {
            let severity = parse_severity(&row.try_get::<String, _>("severity")?);
            let n: i64 = row.try_get("n")?;
            *counts.entry(severity).or_insert(0) += n as u32;
        }
        Ok(counts)
    }

    pub async fn upsert_api_risk_finding(
        &self,
        project_id: Uuid,
        endpoint_id: Option<Uuid>,
        rule_name: &str,
        severity: Severity,
        title: Option<&str>,
        description: Option<&str>,
        evidence: &serde_json::Value,
    ) -> Result<ApiRiskFinding> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO api_risk_findings
                (id, project_id, endpoint_id, rule_name, severity, title, description,
                 evidence, status, status_history, first_seen, last_seen)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'open', '[]', ?, ?)
             ON CONFLICT (project_id, endpoint_id, rule_name) DO UPDATE SET
                severity = ?,
                title = COALESCE(?, api_risk_findings.title),
                description = COALESCE(?, api_risk_findings.description),
                evidence = COALESCE(?, api_risk_findings.evidence),
                last_seen = ?",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id.to_string())
        .bind(endpoint_id.map(|v| v.to_string()))
        .bind(rule_name)
        .bind(severity.as_str())
        .bind(title)
        .bind(description)
        .bind(json_text(evidence))
        .bind(now)
        .bind(now)
        .bind(severity.as_str())
        .bind(title)
        .bind(description)
        .bind(json_text(evidence))
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = match endpoint_id {
            Some(eid) => {
                sqlx::query(
                    "SELECT * FROM api_risk_findings
                     WHERE project_id = ? AND endpoint_id = ? AND rule_name = ?",
                )
                .bind(project_id.to_string())
                .bind(eid.to_string())
                .bind(rule_name)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM api_risk_findings
                     WHERE project_id = ? AND endpoint_id IS NULL AND rule_name = ?",
                )
                .bind(project_id.to_string())
                .bind(rule_name)
                .fetch_one(&self.pool)
                .await?
            }
        };
        api_risk_from_row(&row)
    }

    pub async fn list_api_risk_findings(
        &self,
        project_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ApiRiskFinding>> {
        let rows = sqlx::query(
            "SELECT * FROM api_risk_findings WHERE project_id = ? ORDER BY last_seen DESC LIMIT ?",
        )
        .bind(project_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(api_risk_from_row).collect()
    }

    /// Move a finding through its workflow, appending to `status_history`.
    pub async fn update_api_risk_status(
        &self,
        finding_id: Uuid,
        status: &str,
        notes: Option<&str>,
    ) -> Result<ApiRiskFinding> {
        let row = sqlx::query("SELECT * FROM api_risk_findings WHERE id = ?")
            .bind(finding_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound {
                what: "api risk finding".to_string(),
            })?;
        let finding = api_risk_from_row(&row)?;

        let mut history = match finding.status_history {
            serde_json::Value::Array(items) => items,
            _ => Vec::new(),
        };
        history.push(serde_json::json!({
            "status": status,
            "at": Utc::now().to_rfc3339(),
            "notes": notes,
        }));

        sqlx::query("UPDATE api_risk_findings SET status = ?, status_history = ? WHERE id = ?")
            .bind(status)
            .bind(json_text(&serde_json::Value::Array(history)))
            .bind(finding_id.to_string())
            .execute(&self.pool)
            .await?;

        let row = sqlx::query("SELECT * FROM api_risk_findings WHERE id = ?")
            .bind(finding_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        api_risk_from_row(&row)
    }
}
