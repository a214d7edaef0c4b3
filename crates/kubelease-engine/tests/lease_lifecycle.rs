//! Integration tests for the lease lifecycle
//!
//! These tests tell the story of a secrets host driving the backend against
//! an in-memory target cluster: configuring it, issuing leases, revoking
//! them, and surviving every way a multi-step issuance can go wrong.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kubelease_common::{Error, IssueStep, Operation, ResourceRef};
use kubelease_engine::{
    Backend, Call, ConfigRecord, InMemoryCluster, MemoryStorage, RequestContext,
    RevocationTarget, StaticConnector, TierPolicy,
};

// =============================================================================
// Test Fixtures
// =============================================================================

/// maxTTL=600, defaultTTL=300, viewer -> view-role, 1s credential wait
fn scenario_config() -> ConfigRecord {
    ConfigRecord::new("https://10.0.0.1:6443", "cluster-ca", "admin-jwt")
        .with_ttls(600, 300)
        .with_tier("viewer", "view-role")
        .with_credential_wait(1, 100)
}

async fn configured_backend(cluster: &InMemoryCluster) -> Backend {
    let backend = Backend::new(
        Arc::new(MemoryStorage::new()),
        TierPolicy::Open,
        Arc::new(StaticConnector::new(Arc::new(cluster.clone()))),
    );
    backend.configure(&scenario_config()).await.unwrap();
    backend
}

fn scripted_cluster() -> InMemoryCluster {
    InMemoryCluster::new()
        .with_identity_names(["id-123"])
        .with_binding_names(["rb-1"])
}

// =============================================================================
// Issuance and revocation
// =============================================================================

/// Story: a viewer lease is issued into a fresh namespace and later revoked
#[tokio::test]
async fn story_viewer_lease_round_trip() {
    let cluster = scripted_cluster();
    let backend = configured_backend(&cluster).await;
    let ctx = RequestContext::new();

    let lease = backend
        .issue_credential(&ctx, "viewer", "team-a", 0)
        .await
        .unwrap();

    assert_eq!(lease.namespace, "team-a");
    assert_eq!(lease.identity_name, "id-123");
    assert_eq!(lease.binding_name, "rb-1");
    assert_eq!(lease.role_name, "view-role");
    assert_eq!(lease.effective_ttl_seconds, 300);
    assert!(lease.namespace_created);
    assert!(!lease.lease_options().renewable);
    assert!(cluster.has_identity("team-a", "id-123"));
    assert!(cluster.has_binding("team-a", "rb-1"));

    let before_revoke = cluster.calls().len();
    backend
        .revoke_credential(&ctx, &RevocationTarget::from(&lease))
        .await
        .unwrap();

    let revoke_calls = cluster.calls()[before_revoke..].to_vec();
    assert_eq!(
        revoke_calls,
        vec![
            Call::delete_binding("team-a", "rb-1"),
            Call::delete_identity("team-a", "id-123"),
        ]
    );
    assert_eq!(cluster.identity_count(), 0);
    assert_eq!(cluster.binding_count(), 0);
    // Auto-created namespaces outlive their leases
    assert_eq!(cluster.namespaces(), vec!["team-a"]);
}

/// Story: many leases issued and revoked leave the cluster as they found it
#[tokio::test]
async fn story_round_trips_are_clean_for_every_input() {
    let cluster = InMemoryCluster::new().with_namespace("shared");
    let backend = configured_backend(&cluster).await;
    let ctx = RequestContext::new();

    for (namespace, ttl) in [("shared", 0), ("shared", 60), ("new-ns", 10_000), ("x", -3)] {
        let lease = backend
            .issue_credential(&ctx, "VIEWER", namespace, ttl)
            .await
            .unwrap();
        backend
            .revoke_credential(&ctx, &RevocationTarget::from(&lease))
            .await
            .unwrap();
    }
    assert_eq!(cluster.identity_count(), 0);
    assert_eq!(cluster.binding_count(), 0);
}

/// Story: the effective TTL obeys the default and maximum
#[tokio::test]
async fn story_ttl_is_defaulted_and_clamped() {
    let cluster = InMemoryCluster::new();
    let backend = configured_backend(&cluster).await;
    let ctx = RequestContext::new();

    let cases = [
        (0, 300),
        (-1, 300),
        (1, 1),
        (599, 599),
        (600, 600),
        (601, 600),
        (i64::MAX, 600),
    ];
    for (requested, expected) in cases {
        let lease = backend
            .issue_credential(&ctx, "viewer", "team-a", requested)
            .await
            .unwrap();
        assert_eq!(lease.effective_ttl_seconds, expected, "requested {requested}");
    }
}

/// Story: configuration changes apply to the very next issuance
#[tokio::test]
async fn story_configuration_is_reread_on_every_call() {
    let cluster = InMemoryCluster::new();
    let backend = configured_backend(&cluster).await;
    let ctx = RequestContext::new();

    let lease = backend
        .issue_credential(&ctx, "viewer", "team-a", 0)
        .await
        .unwrap();
    assert_eq!(lease.effective_ttl_seconds, 300);

    backend
        .configure(&scenario_config().with_ttls(100, 50))
        .await
        .unwrap();
    let lease = backend
        .issue_credential(&ctx, "viewer", "team-a", 0)
        .await
        .unwrap();
    assert_eq!(lease.effective_ttl_seconds, 50);
}

// =============================================================================
// Caller and configuration errors
// =============================================================================

/// Story: a caller asks for a tier that is not configured
#[tokio::test]
async fn story_unknown_tier_touches_nothing() {
    let cluster = InMemoryCluster::new();
    let backend = configured_backend(&cluster).await;

    let err = backend
        .issue_credential(&RequestContext::new(), "admin", "team-a", 0)
        .await
        .unwrap_err();

    match err {
        Error::TierNotAllowed { tier, allowed } => {
            assert_eq!(tier, "admin");
            assert_eq!(allowed, vec!["viewer"]);
        }
        other => panic!("expected TierNotAllowed, got {other:?}"),
    }
    assert!(cluster.calls().is_empty());
}

/// Story: an operator asks for a credential wait far beyond any sane bound
#[tokio::test]
async fn story_unbounded_credential_wait_is_rejected() {
    let cluster = InMemoryCluster::new();
    let backend = configured_backend(&cluster).await;

    let err = backend
        .configure(&scenario_config().with_credential_wait(u64::MAX, 100))
        .await
        .unwrap_err();
    assert_eq!(err.field(), Some("credential_wait_secs"));

    let err = backend
        .configure(&scenario_config().with_credential_wait(1, u64::MAX))
        .await
        .unwrap_err();
    assert_eq!(err.field(), Some("credential_poll_millis"));

    let current = backend.read_config_raw().await.unwrap().unwrap();
    assert_eq!(current, scenario_config());
}

/// Story: an operator fat-fingers the cluster URL
#[tokio::test]
async fn story_invalid_url_keeps_previous_configuration() {
    let cluster = InMemoryCluster::new();
    let backend = configured_backend(&cluster).await;

    let mut bad = scenario_config().with_ttls(60, 30);
    bad.base_url = "not a url".to_string();
    let err = backend.configure(&bad).await.unwrap_err();
    assert_eq!(err.field(), Some("base_url"));

    let current = backend.read_config_raw().await.unwrap().unwrap();
    assert_eq!(current, scenario_config());
}

/// Story: the same mistake before anything was configured stays "not configured"
#[tokio::test]
async fn story_invalid_first_configuration_leaves_backend_unconfigured() {
    let backend = Backend::new(
        Arc::new(MemoryStorage::new()),
        TierPolicy::Open,
        Arc::new(StaticConnector::new(Arc::new(InMemoryCluster::new()))),
    );
    let mut bad = scenario_config();
    bad.base_url = "not a url".to_string();

    assert!(backend.configure(&bad).await.is_err());
    assert!(backend.read_config().await.unwrap().is_none());
    let err = backend
        .issue_credential(&RequestContext::new(), "viewer", "team-a", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

// =============================================================================
// Compensation
// =============================================================================

/// Story: binding creation is forbidden, the identity is rolled back
#[tokio::test]
async fn story_binding_failure_rolls_back_identity_only() {
    let cluster = scripted_cluster().with_namespace("team-a");
    cluster.fail(Operation::CreateBinding, 403, "forbidden");
    let backend = configured_backend(&cluster).await;

    let err = backend
        .issue_credential(&RequestContext::new(), "viewer", "team-a", 0)
        .await
        .unwrap_err();

    assert_eq!(err.failed_step(), Some(IssueStep::CreateBinding));
    assert!(matches!(
        err.root_cause(),
        Error::RemoteResource {
            operation: Operation::CreateBinding,
            status: Some(403),
            ..
        }
    ));
    let report = err.compensation().unwrap();
    assert!(report.is_clean());
    assert_eq!(report.rolled_back, vec![ResourceRef::identity("team-a", "id-123")]);
    assert!(report.retained.is_empty());

    assert_eq!(
        cluster.calls_of(Operation::DeleteIdentity),
        vec![Call::delete_identity("team-a", "id-123")]
    );
    assert_eq!(cluster.identity_count(), 0);
    assert_eq!(cluster.namespaces(), vec!["team-a"]);
}

/// Story: the token never shows up, the identity is deleted exactly once
#[tokio::test(start_paused = true)]
async fn story_propagation_timeout_deletes_identity_once() {
    let cluster = scripted_cluster().with_credentials_per_identity(0);
    let backend = configured_backend(&cluster).await;

    let err = backend
        .issue_credential(&RequestContext::new(), "viewer", "team-a", 0)
        .await
        .unwrap_err();

    assert_eq!(err.failed_step(), Some(IssueStep::FetchCredentials));
    assert!(matches!(
        err.root_cause(),
        Error::PropagationTimeout { waited, .. } if *waited == Duration::from_secs(1)
    ));
    assert_eq!(
        cluster.calls_of(Operation::DeleteIdentity),
        vec![Call::delete_identity("team-a", "id-123")]
    );
    assert!(cluster.calls_of(Operation::CreateBinding).is_empty());
    // 1s wait at 100ms intervals
    assert_eq!(cluster.calls_of(Operation::FetchCredentials).len(), 11);

    // The namespace this call created is retained and reported
    let report = err.compensation().unwrap();
    assert_eq!(report.retained, vec![ResourceRef::namespace("team-a")]);
    assert!(err.to_string().contains("retained [namespace team-a]"));
}

/// Story: the token controller is slow but within the bound
#[tokio::test(start_paused = true)]
async fn story_slow_token_is_waited_for() {
    let cluster = scripted_cluster().with_credentials_after_fetches(3);
    let backend = configured_backend(&cluster).await;

    let lease = backend
        .issue_credential(&RequestContext::new(), "viewer", "team-a", 0)
        .await
        .unwrap();
    assert_eq!(lease.identity_name, "id-123");
    assert_eq!(cluster.calls_of(Operation::FetchCredentials).len(), 4);
}

/// Story: two token secrets reference the identity
#[tokio::test]
async fn story_ambiguous_credentials_fail_and_roll_back() {
    let cluster = scripted_cluster().with_credentials_per_identity(2);
    let backend = configured_backend(&cluster).await;

    let err = backend
        .issue_credential(&RequestContext::new(), "viewer", "team-a", 0)
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), Error::MultipleSecrets { count: 2, .. }));
    assert_eq!(cluster.identity_count(), 0);
}

/// Story: rollback itself fails and the operator is told what is left
#[tokio::test]
async fn story_failed_rollback_reports_remaining_resources() {
    let cluster = scripted_cluster().with_namespace("team-a");
    cluster.fail(Operation::CreateBinding, 500, "internal error");
    cluster.fail(Operation::DeleteIdentity, 503, "unavailable");
    let backend = configured_backend(&cluster).await;

    let err = backend
        .issue_credential(&RequestContext::new(), "viewer", "team-a", 0)
        .await
        .unwrap_err();

    // The original failure is kept
    assert!(matches!(
        err.root_cause(),
        Error::RemoteResource {
            operation: Operation::CreateBinding,
            ..
        }
    ));
    let report = err.compensation().unwrap();
    assert!(!report.is_clean());
    assert_eq!(report.remaining(), vec![&ResourceRef::identity("team-a", "id-123")]);
    assert!(err.to_string().contains("manual cleanup required"));
    assert!(cluster.has_identity("team-a", "id-123"));
}

// =============================================================================
// Cancellation
// =============================================================================

/// Story: the caller gives up while the binding call hangs
#[tokio::test(start_paused = true)]
async fn story_cancellation_still_compensates() {
    let cluster = scripted_cluster();
    cluster.hang(Operation::CreateBinding);
    let backend = configured_backend(&cluster).await;

    let token = CancellationToken::new();
    let ctx = RequestContext::with_cancellation(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        token.cancel();
    });

    let err = backend
        .issue_credential(&ctx, "viewer", "team-a", 0)
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert_eq!(err.failed_step(), Some(IssueStep::CreateBinding));
    assert!(matches!(
        err.root_cause(),
        Error::Cancelled {
            timed_out: false,
            ..
        }
    ));
    assert!(err.compensation().unwrap().is_clean());
    assert_eq!(cluster.identity_count(), 0);
}

/// Story: a hung call is bounded by the per-call timeout
#[tokio::test(start_paused = true)]
async fn story_hung_call_times_out_and_compensates() {
    let cluster = scripted_cluster();
    cluster.hang(Operation::CreateBinding);
    let backend = configured_backend(&cluster).await;

    let ctx = RequestContext::new().with_call_timeout(Duration::from_secs(5));
    let err = backend
        .issue_credential(&ctx, "viewer", "team-a", 0)
        .await
        .unwrap_err();

    assert!(matches!(
        err.root_cause(),
        Error::Cancelled {
            timed_out: true,
            ..
        }
    ));
    assert_eq!(cluster.identity_count(), 0);
}

/// Story: the binding is written but the response never arrives
#[tokio::test(start_paused = true)]
async fn story_binding_committed_before_timeout_is_rolled_back() {
    let cluster = scripted_cluster();
    cluster.hang_after_commit(Operation::CreateBinding);
    let backend = configured_backend(&cluster).await;

    let ctx = RequestContext::new().with_call_timeout(Duration::from_secs(5));
    let err = backend
        .issue_credential(&ctx, "viewer", "team-a", 0)
        .await
        .unwrap_err();

    assert_eq!(err.failed_step(), Some(IssueStep::CreateBinding));
    assert!(matches!(
        err.root_cause(),
        Error::Cancelled {
            timed_out: true,
            ..
        }
    ));
    let report = err.compensation().unwrap();
    assert!(report.is_clean());
    assert_eq!(
        report.rolled_back,
        vec![
            ResourceRef::binding("team-a", "rb-1"),
            ResourceRef::identity("team-a", "id-123"),
        ]
    );
    assert_eq!(cluster.binding_count(), 0);
    assert_eq!(cluster.identity_count(), 0);
}

/// Story: the identity is written but the caller gives up before hearing so
#[tokio::test(start_paused = true)]
async fn story_identity_committed_before_cancellation_is_rolled_back() {
    let cluster = scripted_cluster();
    cluster.hang_after_commit(Operation::CreateIdentity);
    let backend = configured_backend(&cluster).await;

    let token = CancellationToken::new();
    let ctx = RequestContext::with_cancellation(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        token.cancel();
    });

    let err = backend
        .issue_credential(&ctx, "viewer", "team-a", 0)
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert_eq!(err.failed_step(), Some(IssueStep::CreateIdentity));
    assert!(matches!(
        err.root_cause(),
        Error::Cancelled {
            timed_out: false,
            ..
        }
    ));
    let report = err.compensation().unwrap();
    assert_eq!(report.rolled_back, vec![ResourceRef::identity("team-a", "id-123")]);
    assert!(cluster.calls_of(Operation::CreateBinding).is_empty());
    assert_eq!(cluster.identity_count(), 0);
}

/// Story: a credential lookup hangs and the wait still ends on time
#[tokio::test(start_paused = true)]
async fn story_hanging_lookup_is_bounded_by_the_credential_wait() {
    let cluster = scripted_cluster();
    cluster.hang(Operation::FetchCredentials);
    let backend = configured_backend(&cluster).await;

    let started = tokio::time::Instant::now();
    let err = backend
        .issue_credential(&RequestContext::new(), "viewer", "team-a", 0)
        .await
        .unwrap_err();

    // The 30s call timeout never comes into play
    assert!(started.elapsed() <= Duration::from_secs(1));
    assert_eq!(err.failed_step(), Some(IssueStep::FetchCredentials));
    assert!(matches!(
        err.root_cause(),
        Error::PropagationTimeout { waited, .. } if *waited == Duration::from_secs(1)
    ));
    assert_eq!(cluster.identity_count(), 0);
}

/// Story: cancellation during the credential wait aborts it promptly
#[tokio::test(start_paused = true)]
async fn story_cancellation_aborts_the_credential_wait() {
    let cluster = scripted_cluster().with_credentials_per_identity(0);
    let backend = Backend::new(
        Arc::new(MemoryStorage::new()),
        TierPolicy::Open,
        Arc::new(StaticConnector::new(Arc::new(cluster.clone()))),
    );
    backend
        .configure(&scenario_config().with_credential_wait(600, 500))
        .await
        .unwrap();

    let token = CancellationToken::new();
    let ctx = RequestContext::with_cancellation(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        token.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = backend
        .issue_credential(&ctx, "viewer", "team-a", 0)
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(err.failed_step(), Some(IssueStep::FetchCredentials));
    assert!(matches!(err.root_cause(), Error::Cancelled { .. }));
    assert_eq!(cluster.identity_count(), 0);
}

// =============================================================================
// Revocation failures
// =============================================================================

/// Story: the binding delete fails and the identity is left alone
#[tokio::test]
async fn story_revocation_stops_at_first_failure() {
    let cluster = scripted_cluster();
    let backend = configured_backend(&cluster).await;
    let ctx = RequestContext::new();
    let lease = backend
        .issue_credential(&ctx, "viewer", "team-a", 0)
        .await
        .unwrap();

    cluster.fail_times(Operation::DeleteBinding, 1, 500, "internal error");
    let err = backend
        .revoke_credential(&ctx, &RevocationTarget::from(&lease))
        .await
        .unwrap_err();
    assert!(!err.is_not_found());
    assert!(cluster.calls_of(Operation::DeleteIdentity).is_empty());
    assert!(cluster.has_identity("team-a", "id-123"));

    // The host retries once the cluster recovers
    backend
        .revoke_credential(&ctx, &RevocationTarget::from(&lease))
        .await
        .unwrap();
    assert_eq!(cluster.identity_count(), 0);
}

/// Story: revoking twice reports the resources as already gone
#[tokio::test]
async fn story_second_revocation_is_not_found() {
    let cluster = scripted_cluster();
    let backend = configured_backend(&cluster).await;
    let ctx = RequestContext::new();
    let lease = backend
        .issue_credential(&ctx, "viewer", "team-a", 0)
        .await
        .unwrap();
    let target = RevocationTarget::from(&lease);

    backend.revoke_credential(&ctx, &target).await.unwrap();
    let err = backend.revoke_credential(&ctx, &target).await.unwrap_err();
    assert!(err.is_not_found());
}
