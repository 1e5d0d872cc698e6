mod common;

use appdrive::dispatch::{CommandQueue, DispatchState, GateCondition};
use common::FakeProxy;
use futures::future::join_all;
use std::time::Duration;

async fn attached() -> (CommandQueue, std::sync::Arc<DispatchState>, std::sync::Arc<FakeProxy>) {
    let state = DispatchState::new();
    let proxy = FakeProxy::new();
    state.publish_proxy(proxy.clone()).await;
    let (queue, _worker) = CommandQueue::spawn(state.clone(), Duration::from_secs(60));
    (queue, state, proxy)
}

#[tokio::test]
async fn test_commands_are_serviced_in_submission_order() {
    let (queue, state, proxy) = attached().await;

    let payloads: Vec<String> = (0..25).map(|i| format!("au.tap('button-{}')", i)).collect();
    let receivers: Vec<_> = payloads.iter().map(|p| queue.submit(p.clone())).collect();

    let results = join_all(receivers).await;
    for (payload, result) in payloads.iter().zip(results) {
        let response = result.unwrap().unwrap().unwrap();
        assert_eq!(response.value_str(), Some(payload.as_str()));
    }

    assert_eq!(proxy.sent(), payloads);
    assert_eq!(proxy.max_in_flight(), 1);
    assert!(state.pending.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_alert_command_bypasses_remote_gate() {
    let (queue, state, proxy) = attached().await;
    state.gates.open(GateCondition::RemoteCommandInProgress);

    let alert = queue.execute("au.acceptAlert()").await.unwrap();
    assert!(alert.is_some());
    assert_eq!(proxy.sent(), vec!["au.acceptAlert()"]);

    let blocked = queue.submit("au.tap('Login')");
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(proxy.sent_count("au.tap('Login')"), 0);

    state.gates.close(GateCondition::RemoteCommandInProgress);
    assert!(blocked.await.unwrap().unwrap().is_some());
    assert_eq!(proxy.sent_count("au.tap('Login')"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_alert_command_still_waits_for_page_selection() {
    let (queue, state, proxy) = attached().await;
    let guard = state.gates.hold(GateCondition::SelectingNewPage);

    let pending = queue.submit("au.dismissAlert()");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(proxy.sent().is_empty());

    drop(guard);
    assert!(pending.await.unwrap().unwrap().is_some());
}

#[tokio::test]
async fn test_commands_after_withdrawal_resolve_empty() {
    let (queue, state, proxy) = attached().await;
    assert!(queue.execute("first").await.unwrap().is_some());

    state.withdraw_proxy().await;
    assert!(queue.execute("second").await.unwrap().is_none());
    assert_eq!(proxy.sent(), vec!["first"]);
}
