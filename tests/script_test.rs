mod common;

use async_trait::async_trait;
use common::{recording_context, yaml};
use helios::error::{HeliosError, Result};
use helios::provider::{Config, Context, Provider, bootstrap, factory};
use helios::value::{Capabilities, Capability, Getter, getter};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

#[tokio::test]
async fn stdout_is_the_value() {
    let (ctx, _) = recording_context();
    let get = ctx
        .float_getter(&yaml("source: script\ncmd: /bin/sh -c 'echo \" 42 \"'\nscale: 0.5\n"))
        .await
        .unwrap();
    assert_eq!(get().await.unwrap(), 21.0);

    let get = ctx
        .string_getter(&yaml("source: script\ncmd: /bin/sh -c 'echo state=charging'\nregex: state=(\\w+)\n"))
        .await
        .unwrap();
    assert_eq!(get().await.unwrap(), "charging");
}

#[tokio::test]
async fn failures_report_stderr() {
    let (ctx, _) = recording_context();
    let get = ctx
        .string_getter(&yaml("source: script\ncmd: /bin/sh -c 'echo broken >&2; exit 3'\n"))
        .await
        .unwrap();
    let err = get().await.unwrap_err();
    assert!(matches!(err, HeliosError::Script { .. }));
    assert!(err.to_string().contains("broken"));

    let get = ctx
        .string_getter(&yaml("source: script\ncmd: /bin/sh -c 'echo ErrAsleep >&2; exit 1'\n"))
        .await
        .unwrap();
    assert!(matches!(get().await, Err(HeliosError::Asleep)));
}

#[tokio::test]
async fn slow_commands_time_out() {
    let (ctx, _) = recording_context();
    let get = ctx
        .string_getter(&yaml("source: script\ncmd: sleep 5\ntimeout: 100ms\n"))
        .await
        .unwrap();
    let start = std::time::Instant::now();
    assert!(get().await.unwrap_err().is_timeout());
    assert!(start.elapsed() < std::time::Duration::from_secs(4));
}

#[tokio::test]
async fn setter_substitutes_value() {
    let (ctx, _) = recording_context();
    let set = ctx
        .int_setter(
            &yaml("source: script\ncmd: /bin/sh -c 'test ${current:%d} -eq 16'\n"),
            "current",
        )
        .await
        .unwrap();
    assert!(set(16).await.is_ok());
    assert!(set(10).await.is_err());
}

#[tokio::test]
async fn provider_cache_reuses_output() {
    let (ctx, _) = recording_context();
    let get = ctx
        .string_getter(&yaml("source: script\ncmd: /bin/sh -c 'date +%s%N'\ncache: 1h\n"))
        .await
        .unwrap();
    let first = get().await.unwrap();
    let second = get().await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn empty_command_is_rejected() {
    let (ctx, _) = recording_context();
    assert!(ctx.string_getter(&yaml("source: script\ncmd: ''\n")).await.is_err());
}

#[tokio::test]
async fn script_failures_back_off_once() {
    let dir = tempfile::tempdir().unwrap();
    let runs = dir.path().join("runs");
    let (ctx, _) = recording_context();
    let cfg = yaml(&format!(
        "source: script\ncmd: /bin/sh -c 'echo x >> {} && exit 1'\ncache: 1h\nbackoff: true\n",
        runs.display()
    ));
    let get = ctx.string_getter(&cfg).await.unwrap();
    assert!(get().await.is_err());
    assert!(get().await.is_err());
    assert_eq!(std::fs::read_to_string(&runs).unwrap().lines().count(), 1);
}

/// Provider that counts reads and claims to handle `cache` itself
struct Counting(Arc<AtomicI64>);

#[async_trait]
impl Provider for Counting {
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.with(Capability::IntGetter)
    }

    fn caches_reads(&self) -> bool {
        true
    }

    async fn int_getter(&self) -> Result<Getter<i64>> {
        let reads = self.0.clone();
        Ok(getter(move || {
            let n = reads.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(n) }
        }))
    }
}

#[tokio::test]
async fn self_caching_providers_are_not_wrapped_again() {
    let reads = Arc::new(AtomicI64::new(0));
    let mut registry = bootstrap().unwrap();
    let shared = reads.clone();
    registry
        .register(
            "counting",
            factory(move |_: &Context, _: &Config| Ok(Counting(shared.clone()))),
        )
        .unwrap();
    let ctx = Context::new(registry);

    let get = ctx.int_getter(&yaml("source: counting\ncache: 1h\n")).await.unwrap();
    assert_eq!(get().await.unwrap(), 1);
    assert_eq!(get().await.unwrap(), 2);
}
