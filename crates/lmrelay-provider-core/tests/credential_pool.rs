use std::sync::Arc;
use std::time::Duration;

use lmrelay_protocol::{ModelFamily, Service};
use lmrelay_provider_core::{
    CredentialHealth, CredentialPool, CredentialSpec, DisableReason, EventHub, Outcome, PoolEvent,
};

fn pool_with(secrets: &[&str]) -> CredentialPool {
    let mut pool = CredentialPool::new(EventHub::new(16));
    for secret in secrets {
        pool.insert(Service::OpenAI, CredentialSpec::new(*secret));
    }
    pool
}

fn select(pool: &CredentialPool) -> Option<lmrelay_provider_core::CredentialLease> {
    pool.select(Service::OpenAI, ModelFamily::Gpt4o, "gpt-4o").ok()
}

#[tokio::test]
async fn rotates_least_recently_used() {
    let pool = pool_with(&["a", "b", "c"]);
    let first = select(&pool).unwrap().id().clone();
    let second = select(&pool).unwrap().id().clone();
    let third = select(&pool).unwrap().id().clone();
    assert_ne!(first, second);
    assert_ne!(second, third);
    assert_ne!(first, third);
    assert_eq!(select(&pool).unwrap().id(), &first);
}

#[tokio::test]
async fn disabled_credentials_are_never_selected() {
    let pool = pool_with(&["a", "b"]);
    let lease = select(&pool).unwrap();
    let disabled = lease.id().clone();
    pool.report_outcome(lease, Outcome::Invalid);

    for _ in 0..10 {
        let lease = select(&pool).unwrap();
        assert_ne!(lease.id(), &disabled);
    }
    assert_eq!(
        pool.health(&disabled),
        Some(CredentialHealth::Disabled {
            reason: DisableReason::Invalid
        })
    );
}

#[tokio::test]
async fn all_disabled_yields_no_credential() {
    let pool = pool_with(&["a"]);
    let lease = select(&pool).unwrap();
    pool.report_outcome(lease, Outcome::QuotaExceeded);
    let err = pool
        .select(Service::OpenAI, ModelFamily::Gpt4o, "gpt-4o")
        .unwrap_err();
    assert_eq!(err.service, Service::OpenAI);
}

#[tokio::test]
async fn dispatched_lease_survives_concurrent_disable() {
    let pool = pool_with(&["a"]);
    let in_flight = select(&pool).unwrap();
    let id = in_flight.id().clone();

    // A second holder of the same credential reports it invalid mid-flight.
    let other = pool
        .select(Service::OpenAI, ModelFamily::Gpt4o, "gpt-4o")
        .unwrap();
    pool.report_outcome(other, Outcome::Invalid);

    assert_eq!(in_flight.id(), &id);
    assert_eq!(in_flight.secret(), "a");
    assert_eq!(pool.snapshot(Service::OpenAI)[0].in_flight, 1);
    drop(in_flight);
    assert_eq!(pool.snapshot(Service::OpenAI)[0].in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_expires_lazily() {
    let hub = EventHub::new(16);
    let mut rx = hub.subscribe();
    let mut pool = CredentialPool::new(hub);
    pool.insert(Service::OpenAI, CredentialSpec::new("only"));

    let lease = select(&pool).unwrap();
    pool.report_outcome(
        lease,
        Outcome::RateLimited {
            retry_after: Duration::from_secs(30),
        },
    );
    assert!(matches!(rx.recv().await.unwrap(), PoolEvent::RateLimited { retry_after_ms: 30_000, .. }));
    assert!(select(&pool).is_none());

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(select(&pool).is_some());
    assert!(matches!(rx.recv().await.unwrap(), PoolEvent::Recovered { .. }));
}

#[tokio::test]
async fn rate_limit_does_not_revive_disabled() {
    let pool = pool_with(&["a"]);
    let first = select(&pool).unwrap();
    let second = pool
        .select(Service::OpenAI, ModelFamily::Gpt4o, "gpt-4o")
        .unwrap();
    let id = first.id().clone();
    pool.report_outcome(first, Outcome::Invalid);
    pool.report_outcome(
        second,
        Outcome::RateLimited {
            retry_after: Duration::from_secs(1),
        },
    );
    assert!(pool.health(&id).unwrap().is_disabled());
}

#[tokio::test]
async fn dropped_lease_leaves_health_untouched() {
    let pool = pool_with(&["a"]);
    let lease = select(&pool).unwrap();
    let id = lease.id().clone();
    drop(lease);
    assert_eq!(pool.health(&id), Some(CredentialHealth::Active));
}

#[tokio::test]
async fn list_models_filters_families_prefixes_and_fine_tunes() {
    let mut pool = CredentialPool::new(EventHub::default());
    pool.insert(
        Service::OpenAI,
        CredentialSpec {
            secret: "a".to_string(),
            families: Vec::new(),
            models: vec![
                "gpt-4o".to_string(),
                "gpt-3.5-turbo".to_string(),
                "ft:gpt-3.5-turbo:acme::abc".to_string(),
                "whisper-1".to_string(),
            ],
        },
    );
    pool.insert(
        Service::OpenAI,
        CredentialSpec {
            secret: "b".to_string(),
            families: Vec::new(),
            models: vec!["gpt-4o".to_string(), "text-embedding-3-small".to_string()],
        },
    );
    let allowed = [ModelFamily::Gpt4o, ModelFamily::Turbo, ModelFamily::Embedding];
    assert_eq!(
        pool.list_models(Service::OpenAI, &allowed),
        vec!["gpt-3.5-turbo", "gpt-4o", "text-embedding-3-small"]
    );
    assert_eq!(
        pool.list_models(Service::OpenAI, &[ModelFamily::Gpt4o]),
        vec!["gpt-4o"]
    );
}

#[tokio::test]
async fn concurrent_selection_spreads_load() {
    let pool = Arc::new(pool_with(&["a", "b", "c", "d"]));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            pool.select(Service::OpenAI, ModelFamily::Gpt4o, "gpt-4o")
                .map(|lease| lease.id().clone())
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
}
