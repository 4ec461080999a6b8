use docroute::testing::InMemoryMetadataReader;
use docroute::{
    AccountRegion, DatabaseAccount, EndpointConfig, EndpointHealth, FailoverCursor,
    GlobalAddressResolver, OperationKind, PartitionKey, PartitionKeyDefinition, RegionalEndpoint,
    RequestContext, RoutingConfig, RoutingError, StaticReaderFactory,
};
use std::sync::Arc;
use std::time::Duration;

const GLOBAL: &str = "https://acct.example:443/";
const A: &str = "https://acct-a.example:443/";
const B: &str = "https://acct-b.example:443/";
const C: &str = "https://acct-c.example:443/";
const CATALOG: &str = "dbs/shop/colls/catalog";

fn three_region_account() -> DatabaseAccount {
    DatabaseAccount {
        writable_locations: vec![AccountRegion::new("A", A), AccountRegion::new("B", B)],
        readable_locations: vec![
            AccountRegion::new("A", A),
            AccountRegion::new("B", B),
            AccountRegion::new("C", C),
        ],
        enable_multiple_write_locations: true,
    }
}

async fn resolver(endpoints: EndpointConfig) -> anyhow::Result<(InMemoryMetadataReader, GlobalAddressResolver)> {
    let reader = InMemoryMetadataReader::new();
    reader.set_account(three_region_account());
    reader.add_collection(CATALOG, "rid-catalog", PartitionKeyDefinition::hash("/sku")?);

    let config = RoutingConfig::new(GLOBAL).endpoints(endpoints);
    let resolver = GlobalAddressResolver::new(
        config,
        Arc::new(StaticReaderFactory::shared(Arc::new(reader.clone()))),
    )?;
    resolver.initialize().await?;
    Ok((reader, resolver))
}

fn regions(endpoints: &[RegionalEndpoint]) -> Vec<&str> {
    endpoints.iter().map(|endpoint| endpoint.region.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn healthy_regions_come_before_suspected_ones() -> anyhow::Result<()> {
    let endpoints = EndpointConfig::new(GLOBAL)
        .preferred_regions(["B", "C", "A"])
        .failure_threshold(3)
        .unavailable_after(Duration::from_secs(30));
    let (_reader, resolver) = resolver(endpoints).await?;

    for _ in 0..3 {
        resolver.report_endpoint_failure(B);
        resolver.report_endpoint_failure(C);
    }
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(
        resolver.report_endpoint_failure(C),
        Some(EndpointHealth::Unavailable)
    );

    assert_eq!(regions(&resolver.current_read_endpoints()?), ["A", "B"]);

    let route = resolver
        .resolve(&RequestContext::for_partition_key(CATALOG, PartitionKey::from("abc")), false)
        .await?;
    assert_eq!(route.endpoint.region, "A");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failover_cursor_skips_unavailable_regions() -> anyhow::Result<()> {
    let endpoints = EndpointConfig::new(GLOBAL)
        .failure_threshold(1)
        .unavailable_after(Duration::ZERO);
    let (_reader, resolver) = resolver(endpoints).await?;
    resolver.report_endpoint_failure("A");
    resolver.report_endpoint_failure("A");

    let mut cursor = FailoverCursor::new(OperationKind::Read);
    let mut tried = Vec::new();
    while let Some(endpoint) = resolver.next_endpoint(&mut cursor) {
        let request = RequestContext::for_partition_key(CATALOG, PartitionKey::from("abc"))
            .on_endpoint(endpoint.uri.as_str());
        let route = resolver.resolve(&request, false).await?;
        tried.push(route.endpoint.region);
    }

    assert_eq!(tried, ["B", "C"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn writes_fail_over_between_write_regions() -> anyhow::Result<()> {
    let endpoints = EndpointConfig::new(GLOBAL)
        .preferred_regions(["A", "B"])
        .failure_threshold(1)
        .unavailable_after(Duration::ZERO);
    let (_reader, resolver) = resolver(endpoints).await?;
    assert_eq!(resolver.current_write_endpoint()?.region, "A");

    resolver.report_endpoint_failure(A);
    resolver.report_endpoint_failure(A);
    assert_eq!(resolver.current_write_endpoint()?.region, "B");

    resolver.report_endpoint_failure(B);
    resolver.report_endpoint_failure(B);
    let err = resolver.current_write_endpoint().unwrap_err();
    assert!(matches!(err, RoutingError::TopologyUnavailable(_)));

    resolver.report_endpoint_success(A);
    assert_eq!(resolver.current_write_endpoint()?.region, "A");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn background_worker_recovers_regions_and_tracks_topology() -> anyhow::Result<()> {
    let endpoints = EndpointConfig::new(GLOBAL)
        .failure_threshold(1)
        .unavailable_after(Duration::ZERO)
        .recheck_cooldown(Duration::from_secs(10))
        .topology_refresh_interval(Duration::from_secs(60));
    let (reader, resolver) = resolver(endpoints).await?;

    reader.set_endpoint_reachable(C, false);
    resolver.report_endpoint_failure(C);
    resolver.report_endpoint_failure(C);
    let worker = resolver.start_background_refresh();

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(
        resolver.endpoint_manager().endpoint(C).map(|e| e.health),
        Some(EndpointHealth::Unavailable)
    );

    reader.set_endpoint_reachable(C, true);
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(
        resolver.endpoint_manager().endpoint(C).map(|e| e.health),
        Some(EndpointHealth::Healthy)
    );

    let mut account = three_region_account();
    account.readable_locations.push(AccountRegion::new("D", "https://acct-d.example:443/"));
    reader.set_account(account);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(regions(&resolver.current_read_endpoints()?), ["A", "B", "C", "D"]);

    worker.stop().await?;
    Ok(())
}

#[tokio::test]
async fn unreachable_topology_keeps_default_endpoint() -> anyhow::Result<()> {
    let reader = InMemoryMetadataReader::new();
    reader.set_endpoint_reachable(GLOBAL, false);
    let resolver = GlobalAddressResolver::new(
        RoutingConfig::new(GLOBAL),
        Arc::new(StaticReaderFactory::shared(Arc::new(reader.clone()))),
    )?;

    let err = resolver.initialize().await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(resolver.current_write_endpoint()?.uri, GLOBAL);
    assert_eq!(resolver.current_read_endpoints()?.len(), 1);
    Ok(())
}
