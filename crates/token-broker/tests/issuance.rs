//! End-to-end token issuance over TLS

mod common;

use std::time::Duration;

use common::{Harness, expired_token, forged_token, valid_token};
use futures::future::join_all;
use token_broker::{AccessMode, ClientError, Outcome};

const SVC_A: &str = "svcA:read-a:orders:read:tenant-a";
const SVC_B: &str = "svcB:write-b:orders:all:tenant-b";

fn refused(err: &ClientError) -> (u16, &str) {
    match err {
        ClientError::Refused { status, detail } => (*status, detail.code.as_str()),
        other => panic!("expected a refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn test_known_unknown_and_expired_callers() {
    let mut broker = Harness::start(&[SVC_A, SVC_B]).await;

    let token = broker.client.token(&valid_token("svcA"), None).await.unwrap();
    assert_eq!(token.resource, "dbs/appdb/colls/orders");
    assert_eq!(token.partition_key.as_deref(), Some("tenant-a"));
    assert_eq!(token.mode, AccessMode::Read);
    assert!(!token.token.is_empty());
    assert!(token.expires_at > chrono::Utc::now());

    let creates = broker.directory.creates();
    let users = broker.directory.inner.user_count();
    let err = broker
        .client
        .token(&valid_token("svcC"), None)
        .await
        .unwrap_err();
    assert_eq!(refused(&err), (403, "UnknownPrincipal"));
    assert!(!err.is_retryable());
    assert_eq!(broker.directory.creates(), creates);
    assert_eq!(broker.directory.inner.user_count(), users);

    let err = broker
        .client
        .token(&expired_token("svcA"), None)
        .await
        .unwrap_err();
    assert_eq!(refused(&err), (401, "Unauthenticated"));

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_rejected_identity_never_reaches_store() {
    let mut broker = Harness::start(&[SVC_A]).await;
    let before = broker.directory.total_calls();

    for bearer in [
        expired_token("svcA"),
        forged_token("svcA"),
        "not-a-jwt".to_string(),
    ] {
        let err = broker.client.token(&bearer, None).await.unwrap_err();
        assert_eq!(refused(&err), (401, "Unauthenticated"));
    }

    assert_eq!(broker.directory.total_calls(), before);
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_callers_get_only_their_own_scope() {
    let specs: Vec<String> = (0..8)
        .map(|i| format!("svc{i}:read-{i}:orders:read:tenant-{i}"))
        .collect();
    let refs: Vec<&str> = specs.iter().map(String::as_str).collect();
    let mut broker = Harness::start(&refs).await;

    let requests = (0..8).flat_map(|i| std::iter::repeat_n(i, 4)).map(|i| {
        let client = broker.client.clone();
        async move {
            let token = client
                .token(&valid_token(&format!("svc{i}")), None)
                .await
                .unwrap();
            (i, token)
        }
    });

    let results = join_all(requests).await;
    assert_eq!(results.len(), 32);
    for (i, token) in results {
        assert_eq!(token.partition_key, Some(format!("tenant-{i}")));
        assert_eq!(token.resource, "dbs/appdb/colls/orders");
    }

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_store_outage_is_retryable() {
    let mut broker = Harness::start(&[SVC_A]).await;
    broker.directory.set_unavailable(true);

    let err = broker
        .client
        .token(&valid_token("svcA"), None)
        .await
        .unwrap_err();
    assert_eq!(refused(&err), (503, "StoreUnavailable"));
    assert!(err.is_retryable());

    broker.directory.set_unavailable(false);
    broker.client.token(&valid_token("svcA"), None).await.unwrap();

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_slow_store_times_out_as_unavailable() {
    let mut broker =
        Harness::start_with(&[SVC_A], |b| b.call_timeout(Duration::from_millis(200))).await;
    broker.directory.set_mint_delay(Some(Duration::from_secs(5)));

    let err = broker
        .client
        .token(&valid_token("svcA"), None)
        .await
        .unwrap_err();
    assert_eq!(refused(&err), (503, "StoreUnavailable"));

    broker.directory.set_mint_delay(None);
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_permission_selector() {
    let mut broker = Harness::start(&[SVC_A, SVC_B]).await;

    let token = broker
        .client
        .token(&valid_token("svcB"), Some("write-b"))
        .await
        .unwrap();
    assert_eq!(token.mode, AccessMode::All);

    // Another principal's permission is not selectable
    let err = broker
        .client
        .token(&valid_token("svcA"), Some("write-b"))
        .await
        .unwrap_err();
    assert_eq!(refused(&err), (403, "UnknownPrincipal"));

    let err = broker
        .client
        .token(&valid_token("svcA"), Some("Not Valid"))
        .await
        .unwrap_err();
    assert_eq!(refused(&err), (400, "InvalidRequest"));

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_revoked_permission_is_unknown() {
    let mut broker = Harness::start(&[SVC_A]).await;
    assert!(
        broker
            .directory
            .inner
            .remove_permission(&common::id("svcA"), "read-a")
    );

    let err = broker
        .client
        .token(&valid_token("svcA"), None)
        .await
        .unwrap_err();
    assert_eq!(refused(&err), (403, "UnknownPrincipal"));

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_cache_reuses_fresh_tokens() {
    let mut broker = Harness::start_with(&[SVC_A], |b| b.cache_enabled(true)).await;

    let first = broker.client.token(&valid_token("svcA"), None).await.unwrap();
    let second = broker.client.token(&valid_token("svcA"), None).await.unwrap();
    assert_eq!(first.token, second.token);
    assert_eq!(broker.directory.mints(), 1);

    broker.stop().await.unwrap();
    let cached: Vec<bool> = broker.audit.records().iter().map(|r| r.cached).collect();
    assert_eq!(cached, vec![false, true]);
}

#[tokio::test]
async fn test_every_attempt_is_audited() {
    let mut broker = Harness::start(&[SVC_A]).await;

    broker.client.token(&valid_token("svcA"), None).await.unwrap();
    broker
        .client
        .token(&valid_token("svcC"), None)
        .await
        .unwrap_err();
    broker
        .client
        .token(&forged_token("svcA"), None)
        .await
        .unwrap_err();

    broker.stop().await.unwrap();

    let records = broker.audit.records();
    let outcomes: Vec<Outcome> = records.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            Outcome::Success,
            Outcome::UnknownPrincipal,
            Outcome::Unauthenticated
        ]
    );
    assert_eq!(records[0].principal_label(), "svcA");
    assert_eq!(records[1].principal_label(), "svcC");
    assert_eq!(records[2].principal_label(), token_broker::audit::UNVERIFIED);
    assert!(records.iter().all(|r| r.peer.is_some()));
}
