//! Route table and destination resolution.
//!
//! The route table is built once from configuration and never mutated at
//! request time. `Router::resolve` turns a message into a destination
//! host: a destination already resolved on the message wins outright,
//! otherwise the domain is matched against the table and the target
//! cluster's host is chosen either by a sticky-session binding or by the
//! load balancer. Affinity lookups that need the external assistant
//! suspend resolution; the worker re-enters once the answer arrives.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    affinity::{AffinityCache, affinity_key},
    cluster::{LoadBalancer, PickError},
    config::{ConfigError, RouteConfig},
    error::{ProxyError, Result, RoutingFailure},
    message::MessageMetadata,
    metrics,
};

/// One compiled route.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    domain: String,
    cluster: String,
    affinity_param: Option<String>,
}

impl RouteEntry {
    /// Domain predicate; `"*"` matches everything.
    #[must_use]
    pub fn matches(&self, domain: &str) -> bool { self.domain == "*" || self.domain == domain }

    /// Target cluster name.
    #[must_use]
    pub fn cluster(&self) -> &str { &self.cluster }

    /// Parameter carrying the affinity key, when customized affinity is
    /// configured for this route.
    #[must_use]
    pub fn affinity_param(&self) -> Option<&str> { self.affinity_param.as_deref() }
}

/// Immutable, ordered route table.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<RouteEntry>,
}

impl RouteTable {
    /// Compile a table from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when an entry fails validation.
    pub fn from_config(config: &RouteConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let routes = config
            .routes
            .iter()
            .map(|entry| RouteEntry {
                domain: entry.domain.clone(),
                cluster: entry.cluster.clone(),
                affinity_param: entry.affinity_param.clone(),
            })
            .collect();
        Ok(Self { routes })
    }

    /// Index of the first entry matching the message's domain.
    #[must_use]
    pub fn match_index(&self, metadata: &MessageMetadata) -> Option<usize> {
        let domain = metadata.domain().ok()?;
        self.routes.iter().position(|route| route.matches(domain))
    }

    /// Entry at `index`.
    #[must_use]
    pub fn entry(&self, index: usize) -> &RouteEntry { &self.routes[index] }

    #[must_use]
    pub fn len(&self) -> usize { self.routes.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.routes.is_empty() }
}

/// Result of one resolution step.
#[derive(Debug)]
pub enum RouteOutcome {
    /// A destination host is known; the route index is reported so the
    /// transaction can cache its decision.
    Destination {
        host: String,
        route: Option<usize>,
    },
    /// Resolution is suspended on an assistant lookup for this key.
    PendingAffinity { key: String, route: usize },
}

/// Affinity-aware destination resolver.
pub struct Router {
    table: Arc<RouteTable>,
    load_balancer: Arc<dyn LoadBalancer>,
    cache: Arc<AffinityCache>,
    assistant_available: bool,
}

impl Router {
    #[must_use]
    pub fn new(
        table: Arc<RouteTable>,
        load_balancer: Arc<dyn LoadBalancer>,
        cache: Arc<AffinityCache>,
        assistant_available: bool,
    ) -> Self {
        Self {
            table,
            load_balancer,
            cache,
            assistant_available,
        }
    }

    #[must_use]
    pub fn table(&self) -> &Arc<RouteTable> { &self.table }

    /// Resolve a destination host for the message.
    ///
    /// `cached_route` is the transaction's prior route decision, reused
    /// so a transaction never re-routes mid-flight.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Routing`] when no route matches or no host
    /// is available; the matching counter is incremented.
    pub fn resolve(
        &self,
        cached_route: Option<Option<usize>>,
        metadata: &mut MessageMetadata,
    ) -> Result<RouteOutcome> {
        if let Ok(host) = metadata.destination() {
            trace!(host, "destination already resolved");
            return Ok(RouteOutcome::Destination {
                host: host.to_owned(),
                route: cached_route.flatten(),
            });
        }

        let route = match cached_route {
            Some(route) => route,
            None => self.table.match_index(metadata),
        };
        let Some(index) = route else {
            metrics::inc_route_missing();
            return Err(ProxyError::Routing(RoutingFailure::RouteMissing));
        };
        let entry = self.table.entry(index);

        if let Some(param) = entry.affinity_param() {
            if let Some(key) = affinity_key(metadata, param) {
                if let Some(host) = self.cache.get(&key) {
                    debug!(key = %key, host = %host, "affinity cache hit");
                    metadata.set_destination(host.clone());
                    return Ok(RouteOutcome::Destination {
                        host,
                        route: Some(index),
                    });
                }
                if self.assistant_available {
                    debug!(key = %key, "affinity cache miss, querying assistant");
                    return Ok(RouteOutcome::PendingAffinity { key, route: index });
                }
            }
        }

        let host = self.pick(index, metadata)?;
        Ok(RouteOutcome::Destination {
            host,
            route: Some(index),
        })
    }

    /// Finish resolution after the assistant answered.
    ///
    /// A hit pins the binding locally and uses the bound host. A miss
    /// falls back to the load balancer; the picked host is cached as an
    /// optimistic hint and reported for a fire-and-forget bind.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Routing`] when the fallback pick fails.
    pub fn resolve_after_affinity(
        &self,
        key: &str,
        route: usize,
        looked_up: Option<String>,
        metadata: &mut MessageMetadata,
    ) -> Result<AffinityResolution> {
        if let Some(host) = looked_up {
            self.cache.insert(key, host.clone());
            metadata.set_destination(host.clone());
            return Ok(AffinityResolution {
                host,
                needs_bind: false,
            });
        }

        let host = self.pick(route, metadata)?;
        self.cache.insert(key, host.clone());
        Ok(AffinityResolution {
            host,
            needs_bind: true,
        })
    }

    fn pick(&self, route: usize, metadata: &mut MessageMetadata) -> Result<String> {
        let entry = self.table.entry(route);
        match self.load_balancer.pick_host(entry.cluster(), metadata) {
            Ok(host) => {
                debug!(cluster = %entry.cluster(), host = %host, "load balancer pick");
                metadata.set_destination(host.clone());
                Ok(host)
            }
            Err(error) => {
                match error {
                    PickError::UnknownCluster => metrics::inc_unknown_cluster(),
                    PickError::MaintenanceMode => metrics::inc_maintenance_mode(),
                    PickError::NoHealthyUpstream => metrics::inc_no_healthy_upstream(),
                }
                Err(ProxyError::Routing(error.into()))
            }
        }
    }
}

/// Outcome of [`Router::resolve_after_affinity`].
#[derive(Debug)]
pub struct AffinityResolution {
    /// The destination host.
    pub host: String,
    /// Whether the caller should register the key-to-host binding with
    /// the assistant.
    pub needs_bind: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RouteEntryConfig,
        test_helpers::{StaticLoadBalancer, request_metadata},
    };

    fn table() -> Arc<RouteTable> {
        let config = RouteConfig {
            routes: vec![
                RouteEntryConfig {
                    domain: "a.example.com".into(),
                    cluster: "clusterA".into(),
                    affinity_param: None,
                },
                RouteEntryConfig {
                    domain: "s.example.com".into(),
                    cluster: "clusterS".into(),
                    affinity_param: Some("lskpmc".into()),
                },
            ],
        };
        Arc::new(RouteTable::from_config(&config).unwrap())
    }

    fn balancer() -> Arc<StaticLoadBalancer> {
        let balancer = StaticLoadBalancer::default();
        balancer.add_cluster("clusterA", &["10.0.0.5:5060"]);
        balancer.add_cluster("clusterS", &["10.0.0.7:5060"]);
        Arc::new(balancer)
    }

    fn router(assistant: bool) -> (Router, Arc<StaticLoadBalancer>, Arc<AffinityCache>) {
        let balancer = balancer();
        let cache = AffinityCache::new();
        let router = Router::new(
            table(),
            Arc::clone(&balancer) as Arc<dyn LoadBalancer>,
            Arc::clone(&cache),
            assistant,
        );
        (router, balancer, cache)
    }

    #[test]
    fn matching_domain_resolves_through_load_balancer() {
        let (router, balancer, _) = router(false);
        let mut metadata = request_metadata("t1", "a.example.com");

        match router.resolve(None, &mut metadata).unwrap() {
            RouteOutcome::Destination { host, route } => {
                assert_eq!(host, "10.0.0.5:5060");
                assert_eq!(route, Some(0));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(balancer.picks(), 1);
        assert_eq!(metadata.destination(), Ok("10.0.0.5:5060"));
    }

    #[test]
    fn unmatched_domain_is_route_missing() {
        let (router, _, _) = router(false);
        let mut metadata = request_metadata("t1", "b.example.com");
        assert!(matches!(
            router.resolve(None, &mut metadata),
            Err(ProxyError::Routing(RoutingFailure::RouteMissing))
        ));
    }

    #[test]
    fn preresolved_destination_skips_table_and_balancer() {
        let (router, balancer, _) = router(false);
        let mut metadata = request_metadata("t1", "b.example.com");
        metadata.set_destination("10.9.9.9:5060");

        match router.resolve(None, &mut metadata).unwrap() {
            RouteOutcome::Destination { host, .. } => assert_eq!(host, "10.9.9.9:5060"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(balancer.picks(), 0);
    }

    #[test]
    fn affinity_cache_hit_bypasses_balancer() {
        let (router, balancer, cache) = router(true);
        cache.insert("S1P1", "10.0.0.42:5060");
        let mut metadata = request_metadata("t1", "s.example.com");
        metadata.set_request_uri("sip:alice@s.example.com;lskpmc=S1P1");

        match router.resolve(None, &mut metadata).unwrap() {
            RouteOutcome::Destination { host, .. } => assert_eq!(host, "10.0.0.42:5060"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(balancer.picks(), 0);
    }

    #[test]
    fn affinity_miss_with_assistant_is_pending() {
        let (router, _, _) = router(true);
        let mut metadata = request_metadata("t1", "s.example.com");
        metadata.set_request_uri("sip:alice@s.example.com;lskpmc=S1P1");

        match router.resolve(None, &mut metadata).unwrap() {
            RouteOutcome::PendingAffinity { key, route } => {
                assert_eq!(key, "S1P1");
                assert_eq!(route, 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn affinity_miss_without_assistant_falls_back_to_balancer() {
        let (router, balancer, _) = router(false);
        let mut metadata = request_metadata("t1", "s.example.com");
        metadata.set_request_uri("sip:alice@s.example.com;lskpmc=S1P1");

        match router.resolve(None, &mut metadata).unwrap() {
            RouteOutcome::Destination { host, .. } => assert_eq!(host, "10.0.0.7:5060"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(balancer.picks(), 1);
    }

    #[test]
    fn assistant_miss_picks_binds_and_caches() {
        let (router, balancer, cache) = router(true);
        let mut metadata = request_metadata("t1", "s.example.com");

        let resolution = router
            .resolve_after_affinity("S1P1", 1, None, &mut metadata)
            .unwrap();
        assert!(resolution.needs_bind);
        assert_eq!(resolution.host, "10.0.0.7:5060");
        assert_eq!(balancer.picks(), 1);
        assert_eq!(cache.get("S1P1"), Some("10.0.0.7:5060".into()));
    }

    #[test]
    fn assistant_hit_needs_no_bind() {
        let (router, balancer, cache) = router(true);
        let mut metadata = request_metadata("t1", "s.example.com");

        let resolution = router
            .resolve_after_affinity("S1P1", 1, Some("10.0.0.42:5060".into()), &mut metadata)
            .unwrap();
        assert!(!resolution.needs_bind);
        assert_eq!(resolution.host, "10.0.0.42:5060");
        assert_eq!(balancer.picks(), 0);
        assert_eq!(cache.get("S1P1"), Some("10.0.0.42:5060".into()));
    }

    #[test]
    fn unhealthy_cluster_maps_to_routing_error() {
        let config = RouteConfig {
            routes: vec![RouteEntryConfig {
                domain: "a.example.com".into(),
                cluster: "empty".into(),
                affinity_param: None,
            }],
        };
        let table = Arc::new(RouteTable::from_config(&config).unwrap());
        let balancer = StaticLoadBalancer::default();
        balancer.add_cluster("empty", &[]);
        let router = Router::new(
            table,
            Arc::new(balancer),
            AffinityCache::new(),
            false,
        );
        let mut metadata = request_metadata("t1", "a.example.com");

        assert!(matches!(
            router.resolve(None, &mut metadata),
            Err(ProxyError::Routing(RoutingFailure::NoHealthyUpstream))
        ));
    }
}
