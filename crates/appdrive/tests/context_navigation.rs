mod common;

use appdrive::context::navigation::RELOAD_TAP_PAYLOAD;
use appdrive::context::{BlankPagePolicy, ContextEngine, DISCOVERY_PROBE, NavigationBudget, NavigationTarget};
use appdrive::dispatch::{CommandQueue, DispatchState};
use appdrive::{DriverError, SessionArgs};
use common::{FakeDebugger, FakeProxy, Harness};
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;

async fn engine() -> (ContextEngine, Arc<FakeProxy>, Arc<FakeDebugger>) {
    let state = DispatchState::new();
    let proxy = FakeProxy::new();
    state.publish_proxy(proxy.clone()).await;
    let (queue, _worker) = CommandQueue::spawn(state.clone(), Duration::from_secs(60));
    let debugger = Arc::new(FakeDebugger::default());
    let engine = ContextEngine::new(queue, state.gates.clone(), debugger.clone());
    (engine, proxy, debugger)
}

fn foo_target() -> NavigationTarget {
    NavigationTarget::new(Regex::new("Foo").unwrap(), BlankPagePolicy::Reject)
}

#[tokio::test(start_paused = true)]
async fn test_navigation_gives_up_after_budget() {
    let (engine, proxy, _debugger) = engine().await;
    proxy.set_webviews(json!([{"id": 1, "title": "Bar", "url": "http://bar"}]));

    let started = Instant::now();
    let err = engine.navigate(&foo_target()).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, DriverError::WebviewNotFound(_)));
    assert!(elapsed >= Duration::from_secs(90), "gave up early after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(91), "gave up late after {elapsed:?}");
    assert_eq!(engine.current_context().await, "NATIVE_APP");
}

#[tokio::test(start_paused = true)]
async fn test_navigation_honours_shorter_budget() {
    let (engine, proxy, _debugger) = engine().await;
    let engine = engine.with_budget(NavigationBudget {
        timeout: Duration::from_secs(2),
        tick: Duration::from_millis(250),
    });

    let started = Instant::now();
    let err = engine.navigate(&foo_target()).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, DriverError::WebviewNotFound(_)));
    assert!(elapsed >= Duration::from_secs(2), "gave up early after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "gave up late after {elapsed:?}");
    assert!(proxy.sent_count(DISCOVERY_PROBE) >= 8);
}

#[tokio::test(start_paused = true)]
async fn test_navigation_selects_page_once_it_appears() {
    let (engine, proxy, debugger) = engine().await;

    let late = proxy.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        late.set_webviews(json!([{"id": "42", "title": "Foo Checkout", "url": "http://shop"}]));
    });

    let mut target = foo_target();
    target.reload_tap = true;
    let found = engine.navigate(&target).await.unwrap();

    assert_eq!(found.id, "42");
    assert_eq!(engine.current_context().await, "WEBVIEW_42");
    assert_eq!(debugger.selected(), vec!["42"]);
    assert_eq!(debugger.cancels.load(Ordering::SeqCst), 1);
    assert!(proxy.sent_count(RELOAD_TAP_PAYLOAD) >= 1);
}

#[tokio::test]
async fn test_selection_prefers_real_url_over_blank_page() {
    let (engine, proxy, _debugger) = engine().await;
    proxy.set_webviews(json!([
        {"id": 1, "title": "Foo", "url": "about:blank"},
        {"id": 2, "title": "Foo", "url": "http://x"}
    ]));

    let found = engine.navigate(&foo_target()).await.unwrap();
    assert_eq!(found.id, "2");
    assert_eq!(found.url, "http://x");
}

#[tokio::test]
async fn test_contexts_list_native_first() {
    let (engine, proxy, _debugger) = engine().await;
    proxy.set_webviews(json!([
        {"id": 5, "title": "Docs", "url": "http://docs"},
        {"id": 6, "title": "Help", "url": "http://help"}
    ]));

    let contexts = engine.contexts().await.unwrap();
    assert_eq!(contexts, vec!["NATIVE_APP", "WEBVIEW_5", "WEBVIEW_6"]);

    engine.set_context("WEBVIEW_6").await.unwrap();
    assert_eq!(engine.current_context().await, "WEBVIEW_6");

    engine.set_context("NATIVE_APP").await.unwrap();
    assert_eq!(engine.current_context().await, "NATIVE_APP");

    let err = engine.set_context("WEBVIEW_99").await.unwrap_err();
    assert!(matches!(err, DriverError::CommandProxy(_)));
}

#[tokio::test]
async fn test_browser_session_lands_in_web_context() {
    let h = Harness::new();
    h.proxy
        .set_webviews(json!([{"id": 3, "title": "Example Domain", "url": "http://example.com"}]));
    let controller = h.controller();

    let args = SessionArgs {
        browser_name: Some("Safari".to_string()),
        platform_version: Some("17.2".to_string()),
        initial_url: Some("http://example.com".to_string()),
        ..Default::default()
    };
    controller.start(args).await.unwrap();

    assert_eq!(controller.current_context().await.as_deref(), Some("WEBVIEW_3"));
    assert_eq!(h.proxy.sent_count("au.enterUrl(\"http://example.com\")"), 1);
    assert_eq!(h.debugger.selected(), vec!["3"]);

    controller.stop().await.unwrap();
    assert!(controller.current_context().await.is_none());
}
