//! Consul coordination backend over the HTTP API
//!
//! - Sessions: `/v1/session/*` with `Behavior=delete`, TTL clamped to >= 10s
//! - Locks: `/v1/kv/<key>?acquire|release=<session>` and plain `DELETE`
//! - Registry: `/v1/agent/service/*` and blocking `/v1/health/service/<name>`

use super::config::MIN_SESSION_TTL;
use super::coordinator::Coordinator;
use super::types::{
    ClusterError, ClusterResult, HEALTH_PASSING, ServiceEntry, ServiceRegistration,
};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra slack on top of the blocking query wait
const WATCH_SLACK: Duration = Duration::from_secs(5);

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionCreate<'a> {
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    behavior: &'a str,
    lock_delay: &'a str,
}

#[derive(Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct KvPair {
    #[serde(rename = "Session", default)]
    session: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    enable_tag_override: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    check: Option<AgentCheck>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    name: String,
    #[serde(rename = "TTL")]
    ttl: String,
    status: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    service: HealthService,
    #[serde(default)]
    checks: Vec<HealthCheck>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthCheck {
    status: String,
}

fn check_id(service_id: &str) -> String {
    format!("service:{}", service_id)
}

/// Worst status across checks, Consul's aggregation order
fn aggregate_status(checks: &[HealthCheck]) -> String {
    let mut worst = HEALTH_PASSING;
    for check in checks {
        match check.status.as_str() {
            "critical" | "maintenance" => return "critical".to_string(),
            "warning" => worst = "warning",
            _ => {}
        }
    }
    worst.to_string()
}

/// Consul HTTP client
pub struct ConsulCoordinator {
    http: Client,
    base: String,
    check_ttl: Option<Duration>,
}

impl ConsulCoordinator {
    pub fn new(address: &str) -> ClusterResult<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let base = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        Ok(Self {
            http,
            base,
            check_ttl: None,
        })
    }

    /// Attach a TTL health check to every registration
    pub fn with_check_ttl(mut self, ttl: Duration) -> Self {
        self.check_ttl = Some(ttl);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Map non-success responses, flagging session problems
    async fn check(response: Response) -> ClusterResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if body.to_lowercase().contains("session") {
            return Err(ClusterError::InvalidSession(body.trim().to_string()));
        }
        Err(ClusterError::Backend(format!("{}: {}", status, body.trim())))
    }

    async fn put_bool(&self, path: &str, query: &[(&str, &str)]) -> ClusterResult<bool> {
        let response = self.http.put(self.url(path)).query(query).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json::<bool>().await?)
    }
}

#[async_trait]
impl Coordinator for ConsulCoordinator {
    async fn create_session(&self, name: &str, ttl: Duration) -> ClusterResult<String> {
        let ttl = ttl.max(MIN_SESSION_TTL);
        let body = SessionCreate {
            name,
            ttl: format!("{}s", ttl.as_secs()),
            behavior: "delete",
            lock_delay: "0s",
        };
        let response = self
            .http
            .put(self.url("/v1/session/create"))
            .json(&body)
            .send()
            .await?;
        let created: SessionCreated = Self::check(response).await?.json().await?;
        if created.id.is_empty() {
            return Err(ClusterError::SessionEmpty);
        }
        debug!("Created consul session {}", created.id);
        Ok(created.id)
    }

    async fn renew_session(&self, session_id: &str) -> ClusterResult<()> {
        if session_id.is_empty() {
            return Err(ClusterError::SessionEmpty);
        }
        let response = self
            .http
            .put(self.url(&format!("/v1/session/renew/{}", session_id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClusterError::InvalidSession(session_id.to_string()));
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn destroy_session(&self, session_id: &str) -> ClusterResult<()> {
        if session_id.is_empty() {
            return Ok(());
        }
        self.put_bool(&format!("/v1/session/destroy/{}", session_id), &[])
            .await?;
        Ok(())
    }

    async fn acquire(&self, key: &str, session_id: &str) -> ClusterResult<bool> {
        if session_id.is_empty() {
            return Err(ClusterError::SessionEmpty);
        }
        self.put_bool(&format!("/v1/kv/{}", key), &[("acquire", session_id)])
            .await
    }

    async fn release(&self, key: &str, session_id: &str) -> ClusterResult<bool> {
        if session_id.is_empty() {
            return Err(ClusterError::SessionEmpty);
        }
        self.put_bool(&format!("/v1/kv/{}", key), &[("release", session_id)])
            .await
    }

    async fn delete(&self, key: &str) -> ClusterResult<()> {
        let response = self
            .http
            .delete(self.url(&format!("/v1/kv/{}", key)))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn lock_holder(&self, key: &str) -> ClusterResult<Option<String>> {
        let response = self
            .http
            .get(self.url(&format!("/v1/kv/{}", key)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let pairs: Vec<KvPair> = Self::check(response).await?.json().await?;
        Ok(pairs
            .into_iter()
            .next()
            .and_then(|pair| pair.session)
            .filter(|s| !s.is_empty()))
    }

    async fn register_service(&self, registration: &ServiceRegistration) -> ClusterResult<()> {
        let body = AgentServiceRegistration {
            id: &registration.id,
            name: &registration.name,
            address: &registration.address,
            port: registration.port,
            tags: &registration.tags,
            enable_tag_override: false,
            check: self.check_ttl.map(|ttl| AgentCheck {
                check_id: check_id(&registration.id),
                name: format!("{} heartbeat", registration.name),
                ttl: format!("{}ms", ttl.as_millis()),
                status: HEALTH_PASSING,
            }),
        };
        let response = self
            .http
            .put(self.url("/v1/agent/service/register"))
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> ClusterResult<()> {
        let response = self
            .http
            .put(self.url(&format!("/v1/agent/service/deregister/{}", service_id)))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn pass_check(&self, service_id: &str) -> ClusterResult<()> {
        if self.check_ttl.is_none() {
            return Ok(());
        }
        let response = self
            .http
            .put(self.url(&format!("/v1/agent/check/pass/{}", check_id(service_id))))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn services(&self, service_name: &str) -> ClusterResult<Vec<ServiceEntry>> {
        let (entries, _) = self
            .watch_services(service_name, 0, Duration::ZERO)
            .await?;
        Ok(entries)
    }

    async fn watch_services(
        &self,
        service_name: &str,
        index: u64,
        wait: Duration,
    ) -> ClusterResult<(Vec<ServiceEntry>, u64)> {
        let mut request = self
            .http
            .get(self.url(&format!("/v1/health/service/{}", service_name)));
        if index > 0 {
            request = request
                .query(&[
                    ("index", index.to_string()),
                    ("wait", format!("{}ms", wait.as_millis())),
                ])
                .timeout(wait + WATCH_SLACK);
        }

        let response = Self::check(request.send().await?).await?;
        let new_index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(index);

        let raw: Vec<HealthEntry> = response.json().await?;
        let entries = raw
            .into_iter()
            .map(|entry| ServiceEntry {
                status: aggregate_status(&entry.checks),
                id: entry.service.id,
                name: entry.service.service,
                address: entry.service.address,
                port: entry.service.port,
                tags: entry.service.tags.unwrap_or_default(),
            })
            .collect();

        Ok((entries, new_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checks(statuses: &[&str]) -> Vec<HealthCheck> {
        statuses
            .iter()
            .map(|s| HealthCheck {
                status: s.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_aggregate_status() {
        assert_eq!(aggregate_status(&[]), "passing");
        assert_eq!(aggregate_status(&checks(&["passing", "warning"])), "warning");
        assert_eq!(
            aggregate_status(&checks(&["warning", "critical", "passing"])),
            "critical"
        );
    }

    #[test]
    fn test_base_url() {
        let consul = ConsulCoordinator::new("127.0.0.1:8500").unwrap();
        assert_eq!(consul.url("/v1/kv/a"), "http://127.0.0.1:8500/v1/kv/a");

        let consul = ConsulCoordinator::new("https://consul.internal/").unwrap();
        assert_eq!(consul.url("/v1/kv/a"), "https://consul.internal/v1/kv/a");
    }

    #[test]
    fn test_health_entry_decoding() {
        let raw = r#"[{
            "Node": {"Node": "n1"},
            "Service": {"ID": "s1", "Service": "relay", "Address": "10.0.0.1", "Port": 9595,
                        "Tags": ["1", "s1", "1700000000000", "host-a", "relay/leader"]},
            "Checks": [{"Status": "passing"}, {"Status": "warning"}]
        }]"#;
        let entries: Vec<HealthEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].service.id, "s1");
        assert_eq!(entries[0].service.tags.as_ref().map(|t| t.len()), Some(5));
        assert_eq!(aggregate_status(&entries[0].checks), "warning");
    }

    #[test]
    fn test_session_body_shape() {
        let body = SessionCreate {
            name: "relay",
            ttl: "10s".to_string(),
            behavior: "delete",
            lock_delay: "0s",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["TTL"], "10s");
        assert_eq!(json["Behavior"], "delete");
        assert_eq!(json["LockDelay"], "0s");
        assert_eq!(json["Name"], "relay");
    }

    #[test]
    fn test_registration_carries_ttl_check() {
        let tags = vec!["0".to_string()];
        let body = AgentServiceRegistration {
            id: "node-1",
            name: "relay",
            address: "10.0.0.2",
            port: 9595,
            tags: &tags,
            enable_tag_override: false,
            check: Some(AgentCheck {
                check_id: check_id("node-1"),
                name: "relay heartbeat".to_string(),
                ttl: "10000ms".to_string(),
                status: HEALTH_PASSING,
            }),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["ID"], "node-1");
        assert_eq!(json["Check"]["CheckID"], "service:node-1");
        assert_eq!(json["Check"]["TTL"], "10000ms");

        let without = AgentServiceRegistration { check: None, ..body };
        let json = serde_json::to_value(&without).unwrap();
        assert!(json.get("Check").is_none());
    }
}
