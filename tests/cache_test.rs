mod common;

use common::{recording_context, yaml};
use helios::cache::Cache;
use helios::error::HeliosError;
use helios::value::getter;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn slow_counter(calls: Arc<AtomicUsize>) -> helios::value::Getter<usize> {
    getter(move || {
        let calls = calls.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
        }
    })
}

#[tokio::test(start_paused = true)]
async fn concurrent_misses_share_one_refresh() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Arc::new(Cache::new(slow_counter(calls.clone()), Duration::from_secs(10)));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move { cache.get().await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 1);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn value_expires_after_ttl() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Cache::new(slow_counter(calls.clone()), Duration::from_secs(10));

    assert_eq!(cache.get().await.unwrap(), 1);
    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(cache.get().await.unwrap(), 1);
    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(cache.get().await.unwrap(), 2);

    cache.reset().await;
    assert_eq!(cache.get().await.unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn failures_are_not_memoized() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let flaky = getter(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                Err(HeliosError::network("unreachable"))
            } else {
                Ok(n)
            }
        }
    });
    let cache = Cache::new(flaky, Duration::from_secs(60));

    assert!(cache.get().await.is_err());
    assert_eq!(cache.get().await.unwrap(), 1);
    assert_eq!(cache.get().await.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn context_wraps_getters_with_cache_setting() {
    let (ctx, _) = recording_context();
    let counter = yaml("source: recorder\ncache: 5s\n");
    let get = ctx.string_getter(&counter).await.unwrap();
    let set = ctx
        .string_setter(&yaml("source: recorder\n"), "value")
        .await
        .unwrap();

    assert_eq!(get().await.unwrap(), "0");
    set("x".to_string()).await.unwrap();
    assert_eq!(get().await.unwrap(), "0");

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(get().await.unwrap(), "1");

    let invalid = yaml("source: recorder\ncache: soon\n");
    assert!(ctx.string_getter(&invalid).await.is_err());
}
