use super::worker::{TopologyRefreshWorker, spawn_topology_refresh_worker};
use crate::cache::AsyncCache;
use crate::config::EndpointConfig;
use crate::core::{
    DatabaseAccount, EndpointHealth, OperationKind, RegionalEndpoint, Result, RoutingError,
};
use crate::reader::MetadataReader;
use chrono::Utc;
use im::HashMap as ImHashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::time::Instant;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

/// Name of the placeholder region used until the account topology is known.
pub const DEFAULT_REGION: &str = "default";

#[derive(Debug, Clone)]
struct RegionState {
    endpoint: RegionalEndpoint,
    suspected_since: Option<Instant>,
    unavailable_since: Option<Instant>,
}

impl RegionState {
    fn new(region: &str, uri: &str) -> Self {
        Self {
            endpoint: RegionalEndpoint::new(region, uri),
            suspected_since: None,
            unavailable_since: None,
        }
    }

    fn transition(&mut self, health: EndpointHealth, now: Instant) {
        self.endpoint.health = health;
        self.endpoint.last_transition = Utc::now();
        match health {
            EndpointHealth::Healthy => {
                self.suspected_since = None;
                self.unavailable_since = None;
            }
            EndpointHealth::Suspected => self.suspected_since = Some(now),
            EndpointHealth::Unavailable => self.unavailable_since = Some(now),
        }
    }
}

/// Immutable view of the account's regions; replaced whole on every change.
#[derive(Debug, Clone)]
struct EndpointSnapshot {
    regions: ImHashMap<String, RegionState>,
    write_order: Vec<String>,
    read_order: Vec<String>,
    multi_write: bool,
    topology_known: bool,
}

impl EndpointSnapshot {
    fn bootstrap(default_endpoint: &str) -> Self {
        let mut regions = ImHashMap::new();
        regions.insert(
            DEFAULT_REGION.to_string(),
            RegionState::new(DEFAULT_REGION, default_endpoint),
        );
        Self {
            regions,
            write_order: vec![DEFAULT_REGION.to_string()],
            read_order: vec![DEFAULT_REGION.to_string()],
            multi_write: false,
            topology_known: false,
        }
    }

    /// Region name addressed by `target`, which may be a region name or an
    /// endpoint URI.
    fn region_name(&self, target: &str) -> Option<String> {
        if self.regions.contains_key(target) {
            return Some(target.to_string());
        }
        self.regions
            .iter()
            .find(|(_, state)| state.endpoint.uri == target)
            .map(|(name, _)| name.clone())
    }

    fn account_order(&self) -> Vec<RegionalEndpoint> {
        let mut seen = HashSet::new();
        self.write_order
            .iter()
            .chain(self.read_order.iter())
            .filter(|name| seen.insert(name.as_str()))
            .filter_map(|name| self.regions.get(name))
            .map(|state| state.endpoint.clone())
            .collect()
    }
}

/// Tracks the regions of the account, their health, and the order in which
/// requests should try them.
///
/// Health per region:
/// `Healthy -> Suspected` after `failure_threshold` consecutive failures,
/// `Suspected -> Unavailable` when failures continue for `unavailable_after`,
/// any success -> `Healthy`. Unavailable regions are rechecked once
/// `recheck_cooldown` has passed.
pub struct GlobalEndpointManager {
    config: EndpointConfig,
    reader: Arc<dyn MetadataReader>,
    snapshot: RwLock<Arc<EndpointSnapshot>>,
    topology: AsyncCache<(), DatabaseAccount>,
    applied_generation: AtomicU64,
    topology_version: AtomicU64,
    last_refresh: Mutex<Option<Instant>>,
    self_ref: Weak<GlobalEndpointManager>,
}

impl GlobalEndpointManager {
    pub fn new(
        config: EndpointConfig,
        reader: Arc<dyn MetadataReader>,
        fetch_timeout: std::time::Duration,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            snapshot: RwLock::new(Arc::new(EndpointSnapshot::bootstrap(&config.default_endpoint))),
            config,
            reader,
            topology: AsyncCache::new("account_topology", fetch_timeout),
            applied_generation: AtomicU64::new(0),
            topology_version: AtomicU64::new(0),
            last_refresh: Mutex::new(None),
            self_ref: self_ref.clone(),
        }))
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    fn snapshot(&self) -> Arc<EndpointSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn update<R>(&self, change: impl FnOnce(&mut EndpointSnapshot) -> R) -> R {
        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = (**guard).clone();
        let outcome = change(&mut next);
        *guard = Arc::new(next);
        outcome
    }

    /// Returns true once an account document has been applied.
    pub fn topology_known(&self) -> bool {
        self.snapshot().topology_known
    }

    /// Fetches the account document and rebuilds the region set.
    ///
    /// The document is read through the default endpoint first, then through
    /// every known regional endpoint. Concurrent callers share one fetch.
    pub async fn refresh_topology(&self) -> Result<()> {
        let mut candidates = vec![self.config.default_endpoint.clone()];
        for region in self.snapshot().account_order() {
            if !candidates.contains(&region.uri) {
                candidates.push(region.uri);
            }
        }

        let reader = Arc::clone(&self.reader);
        let span = info_span!("endpoint.refresh_topology", candidates = candidates.len());
        let entry = self
            .topology
            .refresh((), move || {
                async move {
                    let mut last_error = None;
                    for endpoint in candidates {
                        match reader.fetch_account_topology(&endpoint).await {
                            Ok(account)
                                if account.writable_locations.is_empty()
                                    && account.readable_locations.is_empty() =>
                            {
                                last_error = Some(RoutingError::TransientFetchFailure(format!(
                                    "Account document from '{}' lists no regions",
                                    endpoint
                                )));
                            }
                            Ok(account) => return Ok(account),
                            Err(err) => {
                                event!(
                                    Level::WARN,
                                    endpoint = %endpoint,
                                    error = %err,
                                    "account topology fetch failed"
                                );
                                last_error = Some(err);
                            }
                        }
                    }
                    Err(last_error.unwrap_or_else(|| {
                        RoutingError::TransientFetchFailure(
                            "No endpoint to read the account topology from".to_string(),
                        )
                    }))
                }
                .instrument(span)
            })
            .await?;

        *self.last_refresh.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        let generation = entry.generation();
        if self.applied_generation.fetch_max(generation, Ordering::SeqCst) < generation {
            self.apply_account(entry.value());
        }
        Ok(())
    }

    fn apply_account(&self, account: &DatabaseAccount) {
        let multi_write =
            account.enable_multiple_write_locations && self.config.enable_multiple_write_locations;

        let (regions, writes, reads) = self.update(|snapshot| {
            let mut regions = ImHashMap::new();
            for location in account
                .writable_locations
                .iter()
                .chain(account.readable_locations.iter())
            {
                if regions.contains_key(&location.name) {
                    continue;
                }
                let state = match snapshot.regions.get(&location.name) {
                    Some(existing) if existing.endpoint.uri == location.database_account_endpoint => {
                        existing.clone()
                    }
                    _ => RegionState::new(&location.name, &location.database_account_endpoint),
                };
                regions.insert(location.name.clone(), state);
            }

            let write_order: Vec<String> = account
                .writable_locations
                .iter()
                .map(|location| location.name.clone())
                .collect();
            let mut read_order: Vec<String> = account
                .readable_locations
                .iter()
                .map(|location| location.name.clone())
                .collect();
            if read_order.is_empty() {
                read_order = write_order.clone();
            }

            snapshot.regions = regions;
            snapshot.write_order = write_order;
            snapshot.read_order = read_order;
            snapshot.multi_write = multi_write;
            snapshot.topology_known = true;
            (
                snapshot.regions.len(),
                snapshot.write_order.len(),
                snapshot.read_order.len(),
            )
        });

        self.topology_version.fetch_add(1, Ordering::SeqCst);
        event!(
            Level::INFO,
            regions,
            write_regions = writes,
            read_regions = reads,
            multi_write,
            "account topology applied"
        );
    }

    /// Number of account documents applied so far. Changes whenever the
    /// region set may have changed.
    pub fn topology_version(&self) -> u64 {
        self.topology_version.load(Ordering::SeqCst)
    }

    /// Returns true when the periodic topology refresh is due.
    pub fn topology_refresh_due(&self) -> bool {
        self.last_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none_or(|at| at.elapsed() >= self.config.topology_refresh_interval_duration())
    }

    /// Usable read regions in the order requests should try them.
    pub fn read_endpoints(&self) -> Vec<RegionalEndpoint> {
        let snapshot = self.snapshot();
        self.ordered(&snapshot, &snapshot.read_order, true)
    }

    /// Usable write regions in the order requests should try them.
    ///
    /// Preferences only apply to multi-write accounts; a single-write account
    /// is written in the account's own write-region order.
    pub fn write_endpoints(&self) -> Vec<RegionalEndpoint> {
        let snapshot = self.snapshot();
        self.ordered(&snapshot, &snapshot.write_order, snapshot.multi_write)
    }

    fn ordered(
        &self,
        snapshot: &EndpointSnapshot,
        account_order: &[String],
        use_preferences: bool,
    ) -> Vec<RegionalEndpoint> {
        let usable = |name: &String| {
            account_order.contains(name)
                && snapshot
                    .regions
                    .get(name)
                    .is_some_and(|state| state.endpoint.is_usable())
        };

        let preferred: Vec<&String> = if use_preferences {
            let mut seen = HashSet::new();
            self.config
                .preferred_regions
                .iter()
                .filter(|name| seen.insert(name.as_str()))
                .filter(|name| usable(*name))
                .collect()
        } else {
            Vec::new()
        };
        let names: Vec<&String> = if preferred.is_empty() {
            account_order.iter().filter(|name| usable(*name)).collect()
        } else {
            preferred
        };

        let mut endpoints: Vec<RegionalEndpoint> = names
            .into_iter()
            .filter_map(|name| snapshot.regions.get(name))
            .map(|state| state.endpoint.clone())
            .collect();
        // Stable: keeps preference order within each health class.
        endpoints.sort_by_key(|endpoint| endpoint.health != EndpointHealth::Healthy);
        endpoints
    }

    pub fn endpoints_for(&self, operation: OperationKind) -> Vec<RegionalEndpoint> {
        match operation {
            OperationKind::Read => self.read_endpoints(),
            OperationKind::Write => self.write_endpoints(),
        }
    }

    pub fn current_write_endpoint(&self) -> Result<RegionalEndpoint> {
        self.resolve_service_endpoint(OperationKind::Write)
    }

    pub fn current_read_endpoints(&self) -> Result<Vec<RegionalEndpoint>> {
        let endpoints = self.read_endpoints();
        if endpoints.is_empty() {
            return Err(RoutingError::TopologyUnavailable(
                "No readable region is usable".to_string(),
            ));
        }
        Ok(endpoints)
    }

    /// First endpoint to try for `operation`.
    pub fn resolve_service_endpoint(&self, operation: OperationKind) -> Result<RegionalEndpoint> {
        self.endpoints_for(operation).into_iter().next().ok_or_else(|| {
            RoutingError::TopologyUnavailable(format!(
                "No region is usable for {:?} operations",
                operation
            ))
        })
    }

    /// Looks a region up by name or endpoint URI.
    pub fn endpoint(&self, target: &str) -> Option<RegionalEndpoint> {
        let snapshot = self.snapshot();
        let name = snapshot.region_name(target)?;
        snapshot.regions.get(&name).map(|state| state.endpoint.clone())
    }

    /// Every known region in account order, regardless of health.
    pub fn regions(&self) -> Vec<RegionalEndpoint> {
        self.snapshot().account_order()
    }

    /// Records a failed request against the region named by `target` (region
    /// name or endpoint URI) and returns its resulting health.
    pub fn report_failure(&self, target: &str) -> Option<EndpointHealth> {
        let now = Instant::now();
        let threshold = self.config.failure_threshold;
        let unavailable_after = self.config.unavailable_after_duration();

        let (region, before, after, failures) = self.update(|snapshot| {
            let name = snapshot.region_name(target)?;
            let state = snapshot.regions.get_mut(&name)?;
            let before = state.endpoint.health;
            state.endpoint.consecutive_failures =
                state.endpoint.consecutive_failures.saturating_add(1);

            match before {
                EndpointHealth::Healthy if state.endpoint.consecutive_failures >= threshold => {
                    state.transition(EndpointHealth::Suspected, now);
                }
                EndpointHealth::Suspected
                    if state
                        .suspected_since
                        .is_some_and(|since| now.saturating_duration_since(since) >= unavailable_after) =>
                {
                    state.transition(EndpointHealth::Unavailable, now);
                }
                // A failed recheck restarts the cooldown.
                EndpointHealth::Unavailable => state.unavailable_since = Some(now),
                _ => {}
            }
            Some((
                name,
                before,
                state.endpoint.health,
                state.endpoint.consecutive_failures,
            ))
        })?;

        if before != after {
            event!(
                Level::WARN,
                region = %region,
                from = ?before,
                to = ?after,
                consecutive_failures = failures,
                "region health degraded"
            );
            if after == EndpointHealth::Unavailable {
                self.spawn_topology_refresh();
            }
        }
        Some(after)
    }

    /// Records a successful request against `target`; the region becomes
    /// healthy again.
    pub fn report_success(&self, target: &str) -> Option<EndpointHealth> {
        let now = Instant::now();
        let (region, before) = self.update(|snapshot| {
            let name = snapshot.region_name(target)?;
            let state = snapshot.regions.get_mut(&name)?;
            let before = state.endpoint.health;
            state.endpoint.consecutive_failures = 0;
            if before != EndpointHealth::Healthy {
                state.transition(EndpointHealth::Healthy, now);
            }
            Some((name, before))
        })?;

        if before != EndpointHealth::Healthy {
            event!(Level::INFO, region = %region, from = ?before, "region recovered");
        }
        Some(EndpointHealth::Healthy)
    }

    /// Unavailable regions whose recheck cooldown has passed.
    pub fn regions_due_for_recheck(&self) -> Vec<RegionalEndpoint> {
        let cooldown = self.config.recheck_cooldown_duration();
        let snapshot = self.snapshot();
        snapshot
            .account_order()
            .into_iter()
            .filter(|endpoint| {
                snapshot.regions.get(&endpoint.region).is_some_and(|state| {
                    state.endpoint.health == EndpointHealth::Unavailable
                        && state
                            .unavailable_since
                            .is_none_or(|since| since.elapsed() >= cooldown)
                })
            })
            .collect()
    }

    /// Checks every region due for a recheck through its own endpoint and
    /// records the outcome. Returns how many regions were checked.
    pub async fn recheck_due_regions(&self) -> usize {
        let due = self.regions_due_for_recheck();
        for endpoint in &due {
            match self.reader.fetch_account_topology(&endpoint.uri).await {
                Ok(_) => {
                    self.report_success(&endpoint.uri);
                }
                Err(err) => {
                    event!(
                        Level::DEBUG,
                        region = %endpoint.region,
                        error = %err,
                        "recheck failed"
                    );
                    self.report_failure(&endpoint.uri);
                }
            }
        }
        due.len()
    }

    /// Next untried usable endpoint for the cursor's operation.
    pub fn next_endpoint(&self, cursor: &mut FailoverCursor) -> Option<RegionalEndpoint> {
        let next = self
            .endpoints_for(cursor.operation)
            .into_iter()
            .find(|endpoint| !cursor.tried.contains(&endpoint.uri))?;
        cursor.tried.insert(next.uri.clone());
        event!(
            Level::DEBUG,
            operation_id = %cursor.operation_id,
            region = %next.region,
            attempt = cursor.tried.len(),
            "failover endpoint selected"
        );
        Some(next)
    }

    /// Starts the periodic topology refresh and recheck task.
    pub fn start_background_refresh(self: &Arc<Self>) -> TopologyRefreshWorker {
        spawn_topology_refresh_worker(Arc::downgrade(self), &self.config)
    }

    fn spawn_topology_refresh(&self) {
        let Some(manager) = self.self_ref.upgrade() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            if let Err(err) = manager.refresh_topology().await {
                event!(Level::WARN, error = %err, "on-demand topology refresh failed");
            }
        });
    }
}

/// Per-operation failover state: which endpoints were already tried.
#[derive(Debug, Clone)]
pub struct FailoverCursor {
    operation: OperationKind,
    operation_id: Uuid,
    tried: HashSet<String>,
}

impl FailoverCursor {
    pub fn new(operation: OperationKind) -> Self {
        Self {
            operation,
            operation_id: Uuid::new_v4(),
            tried: HashSet::new(),
        }
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub fn attempts(&self) -> usize {
        self.tried.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AccountRegion;
    use crate::testing::{InMemoryMetadataReader, MetadataCall};
    use std::time::Duration;

    const GLOBAL: &str = "https://acct.example:443/";

    fn account() -> DatabaseAccount {
        DatabaseAccount {
            writable_locations: vec![AccountRegion::new("A", "https://acct-a.example:443/")],
            readable_locations: vec![
                AccountRegion::new("A", "https://acct-a.example:443/"),
                AccountRegion::new("B", "https://acct-b.example:443/"),
                AccountRegion::new("C", "https://acct-c.example:443/"),
            ],
            enable_multiple_write_locations: false,
        }
    }

    async fn manager(config: EndpointConfig) -> (Arc<GlobalEndpointManager>, InMemoryMetadataReader) {
        let reader = InMemoryMetadataReader::new();
        reader.set_account(account());
        let manager =
            GlobalEndpointManager::new(config, Arc::new(reader.clone()), Duration::from_secs(5))
                .unwrap();
        manager.refresh_topology().await.unwrap();
        (manager, reader)
    }

    fn names(endpoints: &[RegionalEndpoint]) -> Vec<&str> {
        endpoints.iter().map(|endpoint| endpoint.region.as_str()).collect()
    }

    #[tokio::test]
    async fn bootstrap_uses_default_endpoint() {
        let reader = InMemoryMetadataReader::new();
        let manager = GlobalEndpointManager::new(
            EndpointConfig::new(GLOBAL),
            Arc::new(reader),
            Duration::from_secs(5),
        )
        .unwrap();

        assert!(!manager.topology_known());
        assert_eq!(manager.current_write_endpoint().unwrap().uri, GLOBAL);
    }

    #[tokio::test(start_paused = true)]
    async fn health_ordering_follows_preferences() {
        let config = EndpointConfig::new(GLOBAL)
            .preferred_regions(["B", "C", "A"])
            .failure_threshold(1)
            .unavailable_after(Duration::from_secs(10));
        let (manager, _reader) = manager(config).await;

        manager.report_failure("B");
        manager.report_failure("C");
        tokio::time::advance(Duration::from_secs(10)).await;
        manager.report_failure("C");

        assert_eq!(manager.endpoint("B").unwrap().health, EndpointHealth::Suspected);
        assert_eq!(manager.endpoint("C").unwrap().health, EndpointHealth::Unavailable);
        assert_eq!(names(&manager.read_endpoints()), ["A", "B"]);
    }

    #[tokio::test]
    async fn empty_preferences_fall_back_to_account_order() {
        let (manager, _reader) = manager(EndpointConfig::new(GLOBAL)).await;
        assert_eq!(names(&manager.read_endpoints()), ["A", "B", "C"]);
        assert_eq!(names(&manager.write_endpoints()), ["A"]);
    }

    #[tokio::test]
    async fn repeated_preferences_list_each_region_once() {
        let config = EndpointConfig::new(GLOBAL).preferred_regions(["C", "A", "C", "A"]);
        let (manager, _reader) = manager(config).await;
        assert_eq!(names(&manager.read_endpoints()), ["C", "A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn suspected_region_needs_sustained_failures_to_become_unavailable() {
        let config = EndpointConfig::new(GLOBAL).unavailable_after(Duration::from_secs(30));
        let (manager, _reader) = manager(config).await;

        for _ in 0..2 {
            assert_eq!(manager.report_failure("B"), Some(EndpointHealth::Healthy));
        }
        assert_eq!(manager.report_failure("B"), Some(EndpointHealth::Suspected));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(manager.report_failure("B"), Some(EndpointHealth::Suspected));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(manager.report_failure("B"), Some(EndpointHealth::Unavailable));

        assert_eq!(manager.report_success("B"), Some(EndpointHealth::Healthy));
        assert_eq!(manager.endpoint("B").unwrap().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_region_is_rechecked_after_cooldown() {
        let config = EndpointConfig::new(GLOBAL)
            .failure_threshold(1)
            .unavailable_after(Duration::ZERO)
            .recheck_cooldown(Duration::from_secs(30));
        let (manager, reader) = manager(config).await;
        let c = "https://acct-c.example:443/";

        reader.set_endpoint_reachable(c, false);
        manager.report_failure(c);
        manager.report_failure(c);
        assert_eq!(manager.endpoint(c).unwrap().health, EndpointHealth::Unavailable);

        assert_eq!(manager.recheck_due_regions().await, 0);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(manager.recheck_due_regions().await, 1);
        assert_eq!(manager.endpoint(c).unwrap().health, EndpointHealth::Unavailable);

        reader.set_endpoint_reachable(c, true);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(manager.recheck_due_regions().await, 1);
        assert_eq!(manager.endpoint(c).unwrap().health, EndpointHealth::Healthy);
    }

    #[tokio::test]
    async fn topology_falls_back_to_regional_endpoints() {
        let (manager, reader) = manager(EndpointConfig::new(GLOBAL)).await;
        reader.set_endpoint_reachable(GLOBAL, false);

        manager.refresh_topology().await.unwrap();
        assert_eq!(reader.topology_calls(GLOBAL), 2);
        assert_eq!(reader.topology_calls("https://acct-a.example:443/"), 1);
        assert_eq!(reader.calls(MetadataCall::AccountTopology), 3);
    }

    #[tokio::test]
    async fn refresh_preserves_health_of_surviving_regions() {
        let config = EndpointConfig::new(GLOBAL).failure_threshold(1);
        let (manager, reader) = manager(config).await;
        manager.report_failure("B");

        let mut next = account();
        next.readable_locations.push(AccountRegion::new("D", "https://acct-d.example:443/"));
        reader.set_account(next);
        manager.refresh_topology().await.unwrap();

        assert_eq!(manager.endpoint("B").unwrap().health, EndpointHealth::Suspected);
        assert_eq!(names(&manager.read_endpoints()), ["A", "C", "D", "B"]);
    }

    #[tokio::test]
    async fn multi_write_accounts_honour_preferences_for_writes() {
        let reader = InMemoryMetadataReader::new();
        let mut multi = account();
        multi.writable_locations = multi.readable_locations.clone();
        multi.enable_multiple_write_locations = true;
        reader.set_account(multi);

        let config = EndpointConfig::new(GLOBAL).preferred_regions(["C", "A"]);
        let manager =
            GlobalEndpointManager::new(config.clone(), Arc::new(reader.clone()), Duration::from_secs(5))
                .unwrap();
        manager.refresh_topology().await.unwrap();
        assert_eq!(names(&manager.write_endpoints()), ["C", "A"]);

        let single = GlobalEndpointManager::new(
            config.multiple_write_locations(false),
            Arc::new(reader),
            Duration::from_secs(5),
        )
        .unwrap();
        single.refresh_topology().await.unwrap();
        assert_eq!(names(&single.write_endpoints()), ["A", "B", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failover_cursor_walks_each_endpoint_once() {
        let config = EndpointConfig::new(GLOBAL).failure_threshold(1);
        let (manager, _reader) = manager(config).await;
        manager.report_failure("A");

        let mut cursor = FailoverCursor::new(OperationKind::Read);
        let order: Vec<String> = std::iter::from_fn(|| manager.next_endpoint(&mut cursor))
            .map(|endpoint| endpoint.region)
            .collect();

        assert_eq!(order, ["B", "C", "A"]);
        assert_eq!(cursor.attempts(), 3);
    }

    #[tokio::test]
    async fn no_usable_region_is_topology_unavailable() {
        let config = EndpointConfig::new(GLOBAL)
            .failure_threshold(1)
            .unavailable_after(Duration::ZERO);
        let (manager, _reader) = manager(config).await;
        for region in ["A", "B", "C"] {
            manager.report_failure(region);
            manager.report_failure(region);
        }

        assert!(matches!(
            manager.current_read_endpoints(),
            Err(RoutingError::TopologyUnavailable(_))
        ));
        assert!(matches!(
            manager.current_write_endpoint(),
            Err(RoutingError::TopologyUnavailable(_))
        ));
    }
}
