//! DNS liveness prober.
//!
//! Proves the operator controls the domain before anything billable is
//! created: a TXT record `kubefirst-liveness.<domain>` is written through the
//! cloud provider, then resolved until it propagates.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use k1_cloud::{CloudProvider, CloudProviderError, HostedZone, TxtRecord};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Host label of the liveness record.
pub const LIVENESS_LABEL: &str = "kubefirst-liveness";

/// Marker value of the liveness record.
pub const LIVENESS_VALUE: &str = "domain record propagated";

/// TTL of the liveness record, seconds.
pub const LIVENESS_TTL: u32 = 10;

/// Resolver used when the system resolver fails.
const FALLBACK_NAMESERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

/// Dial timeout of the fallback resolver.
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised by the liveness check.
#[derive(Error, Debug)]
pub enum DnsError {
    /// The record never became resolvable.
    #[error("TXT record {name} did not propagate after {attempts} attempts")]
    PropagationTimeout { name: String, attempts: u32 },

    /// Both resolvers failed for one attempt.
    #[error("TXT lookup for {name} failed: {reason}")]
    Lookup { name: String, reason: String },

    #[error(transparent)]
    Cloud(#[from] CloudProviderError),
}

/// Resolves TXT records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// TXT values published at `name`.
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError>;
}

/// System resolver with a public fallback.
pub struct HickoryResolver {
    system: Option<TokioAsyncResolver>,
    fallback: TokioAsyncResolver,
}

impl HickoryResolver {
    /// Build both resolvers. Caching is disabled so each attempt asks upstream.
    #[must_use]
    pub fn new() -> Self {
        let system = hickory_resolver::system_conf::read_system_conf()
            .map_err(|e| warn!(error = %e, "System resolver unavailable; using fallback only"))
            .ok()
            .map(|(config, mut opts)| {
                opts.cache_size = 0;
                TokioAsyncResolver::tokio(config, opts)
            });

        let mut opts = ResolverOpts::default();
        opts.timeout = FALLBACK_TIMEOUT;
        opts.cache_size = 0;
        let fallback = TokioAsyncResolver::tokio(
            ResolverConfig::from_parts(
                None,
                vec![],
                NameServerConfigGroup::from_ips_clear(&[FALLBACK_NAMESERVER], 53, true),
            ),
            opts,
        );

        Self { system, fallback }
    }

    async fn lookup_with(resolver: &TokioAsyncResolver, name: &str) -> Result<Vec<String>, String> {
        let lookup = resolver.txt_lookup(name).await.map_err(|e| e.to_string())?;
        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<String>()
            })
            .collect())
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TxtResolver for HickoryResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        if let Some(system) = &self.system {
            match Self::lookup_with(system, name).await {
                Ok(values) if !values.is_empty() => return Ok(values),
                Ok(_) => debug!(name = %name, "System resolver returned no TXT values"),
                Err(e) => debug!(name = %name, error = %e, "System resolver failed"),
            }
        }
        Self::lookup_with(&self.fallback, name)
            .await
            .map_err(|reason| DnsError::Lookup {
                name: name.to_string(),
                reason,
            })
    }
}

/// Writes, verifies and removes the liveness record.
pub struct LivenessProber {
    cloud: Arc<dyn CloudProvider>,
    resolver: Arc<dyn TxtResolver>,
    attempts: u32,
    interval: Duration,
    dry_run: bool,
}

impl LivenessProber {
    /// Prober with the standard bounds: 100 attempts, 10 seconds apart.
    pub fn new(cloud: Arc<dyn CloudProvider>, resolver: Arc<dyn TxtResolver>, dry_run: bool) -> Self {
        Self {
            cloud,
            resolver,
            attempts: 100,
            interval: Duration::from_secs(10),
            dry_run,
        }
    }

    /// Override the polling bounds.
    #[must_use]
    pub fn with_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.attempts = attempts;
        self.interval = interval;
        self
    }

    /// Fully qualified liveness record name.
    #[must_use]
    pub fn record_name(domain: &str) -> String {
        format!("{LIVENESS_LABEL}.{domain}")
    }

    fn record(domain: &str) -> TxtRecord {
        TxtRecord {
            name: Self::record_name(domain),
            value: LIVENESS_VALUE.to_string(),
            ttl: LIVENESS_TTL,
        }
    }

    /// Zone serving `domain`.
    ///
    /// # Errors
    /// Returns [`CloudProviderError::HostedZoneNotFound`] via [`DnsError::Cloud`].
    pub async fn hosted_zone(&self, domain: &str) -> Result<HostedZone, DnsError> {
        Ok(self.cloud.hosted_zone(domain).await?)
    }

    /// Create or refresh the liveness record.
    ///
    /// # Errors
    /// Returns error if the zone is missing or the provider rejects the write.
    pub async fn create_record(&self, domain: &str) -> Result<(), DnsError> {
        if self.dry_run {
            info!(domain = %domain, "[dry-run] skipping liveness record");
            return Ok(());
        }
        let zone = self.hosted_zone(domain).await?;
        self.cloud
            .upsert_txt_record(&zone, &Self::record(domain))
            .await?;
        info!(zone = %zone.name, record = %Self::record_name(domain), "Liveness record written");
        Ok(())
    }

    /// Poll until the record resolves.
    ///
    /// # Errors
    /// Returns [`DnsError::PropagationTimeout`] once every attempt is spent.
    pub async fn verify(&self, domain: &str) -> Result<bool, DnsError> {
        if self.dry_run {
            info!(domain = %domain, "[dry-run] skipping liveness check");
            return Ok(true);
        }
        let name = Self::record_name(domain);

        for attempt in 1..=self.attempts {
            match self.resolver.lookup_txt(&name).await {
                Ok(values) if !values.is_empty() => {
                    info!(name = %name, attempt, values = ?values, "Liveness record propagated");
                    return Ok(true);
                }
                Ok(_) => debug!(name = %name, attempt, "No TXT values yet"),
                Err(e) => debug!(name = %name, attempt, error = %e, "TXT lookup failed"),
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(DnsError::PropagationTimeout {
            name,
            attempts: self.attempts,
        })
    }

    /// Remove the liveness record.
    ///
    /// # Errors
    /// Returns error if the provider rejects the delete.
    pub async fn delete_record(&self, domain: &str) -> Result<(), DnsError> {
        if self.dry_run {
            return Ok(());
        }
        let zone = self.hosted_zone(domain).await?;
        self.cloud
            .delete_txt_record(&zone, &Self::record(domain))
            .await?;
        info!(record = %Self::record_name(domain), "Liveness record removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k1_cloud::k3d::K3d;

    fn prober(resolver: MockTxtResolver, dry_run: bool) -> LivenessProber {
        LivenessProber::new(Arc::new(K3d::new()), Arc::new(resolver), dry_run)
            .with_polling(10, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_dry_run_makes_no_lookups() {
        let mut resolver = MockTxtResolver::new();
        resolver.expect_lookup_txt().never();
        let started = std::time::Instant::now();
        assert!(prober(resolver, true).verify("example.test").await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_propagated_record_is_found() {
        let mut resolver = MockTxtResolver::new();
        let mut calls = 0;
        resolver
            .expect_lookup_txt()
            .withf(|name| name == "kubefirst-liveness.test.example.com")
            .returning(move |_| {
                calls += 1;
                if calls < 3 {
                    Ok(Vec::new())
                } else {
                    Ok(vec![LIVENESS_VALUE.to_string()])
                }
            })
            .times(3);
        assert!(prober(resolver, false).verify("test.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_lookup_errors_are_retried_until_timeout() {
        let mut resolver = MockTxtResolver::new();
        resolver
            .expect_lookup_txt()
            .returning(|name| {
                Err(DnsError::Lookup {
                    name: name.to_string(),
                    reason: "SERVFAIL".to_string(),
                })
            })
            .times(10);
        let err = prober(resolver, false).verify("example.com").await.unwrap_err();
        assert!(matches!(err, DnsError::PropagationTimeout { attempts: 10, .. }));
    }
}
