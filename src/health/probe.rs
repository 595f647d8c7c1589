use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::{HealthDomain, HealthIssue, HealthLevel, HealthRegistry};
use crate::error::AppError;

/// Path listing locally installed models; cheap and unauthenticated.
const PROBE_PATH: &str = "/api/tags";

/// Reachability check for the inference backend. Writes the prerequisite
/// domain that gates vector collection bring-up.
pub struct ConnectivityProbe {
    client: reqwest::Client,
    endpoint: String,
}

impl ConnectivityProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: probe_endpoint(base_url),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Probe once. Never fails; transport errors become an unhealthy issue.
    pub async fn check(&self) -> HealthIssue {
        let started = Instant::now();
        let mut meta = BTreeMap::new();
        meta.insert("endpoint".to_string(), self.endpoint.clone());

        match self.client.get(&self.endpoint).send().await {
            Ok(resp) => {
                let status = resp.status();
                meta.insert("http_status".into(), status.as_u16().to_string());
                meta.insert("latency_ms".into(), started.elapsed().as_millis().to_string());
                if status.is_success() {
                    HealthIssue::healthy(format!("Connection successful (HTTP {})", status.as_u16()))
                        .with_metadata(meta)
                } else {
                    HealthIssue::new(
                        HealthLevel::Degraded,
                        Some(format!("Service returned HTTP {}", status.as_u16())),
                        None,
                        Some(meta),
                    )
                }
            }
            Err(e) => HealthIssue::new(
                HealthLevel::Unhealthy,
                Some(format!("Connection failed: {e}")),
                Some("Inference backend unreachable".into()),
                Some(meta),
            ),
        }
    }

    /// Probe and publish the result under [`HealthDomain::Inference`].
    pub async fn run(&self, registry: &HealthRegistry) -> HealthLevel {
        let issue = self.check().await;
        let level = issue.level;
        match level {
            HealthLevel::Healthy => tracing::info!(endpoint = %self.endpoint, "Inference backend reachable"),
            _ => tracing::warn!(
                endpoint = %self.endpoint,
                error = issue.error.as_deref().unwrap_or(""),
                "Inference backend not reachable"
            ),
        }
        registry.set_issue(HealthDomain::Inference, issue);
        level
    }
}

fn probe_endpoint(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), PROBE_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_endpoint_strips_trailing_slash() {
        assert_eq!(probe_endpoint("http://localhost:11434/"), "http://localhost:11434/api/tags");
        assert_eq!(probe_endpoint("http://localhost:11434"), "http://localhost:11434/api/tags");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unhealthy() {
        // Grab a free port, then close it so nothing is listening.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = ConnectivityProbe::new(
            &format!("http://127.0.0.1:{port}"),
            Duration::from_millis(500),
        )
        .unwrap();
        let registry = HealthRegistry::new();

        let level = probe.run(&registry).await;

        assert_eq!(level, HealthLevel::Unhealthy);
        let issue = registry.get(HealthDomain::Inference);
        assert!(issue.error.unwrap().starts_with("Connection failed"));
        assert_eq!(
            issue.metadata.unwrap().get("endpoint").map(String::as_str),
            Some(probe.endpoint())
        );
    }
}
