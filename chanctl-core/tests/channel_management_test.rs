use std::sync::Arc;

use chanctl::util::mocks::{make_test_channel, MockNode, NodeCall};
use chanctl::{
    Channel, ChannelRegistry, DisplayUnit, Error, FeePolicyManager, FeeStatus, NavigationHint,
    NodeError, RegistryEvent, UnitConverter,
};
use test_log::test;

fn setup(channels: Vec<Channel>) -> (Arc<MockNode>, ChannelRegistry, FeePolicyManager) {
    let node = Arc::new(MockNode::new(channels));
    let registry = ChannelRegistry::new(node.clone());
    let fees = FeePolicyManager::new(node.clone());
    (node, registry, fees)
}

fn close_calls(node: &MockNode) -> Vec<NodeCall> {
    node.calls()
        .into_iter()
        .filter(|c| matches!(c, NodeCall::CloseById(_) | NodeCall::CloseByOutpoint(..)))
        .collect()
}

#[test(tokio::test)]
async fn close_path_follows_channel_id_test() {
    let confirmed = make_test_channel("1111:1", Some(123_456));
    let pending = make_test_channel("abcd1234:0", None);
    let (node, registry, _fees) = setup(vec![confirmed.clone(), pending.clone()]);
    registry.refresh().await.unwrap();

    assert_eq!(registry.close_channel(&confirmed).await, Ok(NavigationHint::ReturnToWallet));
    assert_eq!(close_calls(&node), vec![NodeCall::CloseById(123_456)]);

    assert_eq!(registry.close_channel(&pending).await, Ok(NavigationHint::ReturnToWallet));
    assert_eq!(
        close_calls(&node),
        vec![NodeCall::CloseById(123_456), NodeCall::CloseByOutpoint("abcd1234".to_string(), 0)]
    );
    assert!(registry.channels().is_empty());
}

#[test(tokio::test)]
async fn malformed_channel_point_makes_no_call_test() {
    let bad = make_test_channel("abcd1234", None);
    let (node, registry, _fees) = setup(vec![bad.clone()]);
    registry.refresh().await.unwrap();

    assert!(matches!(registry.close_channel(&bad).await, Err(Error::InvalidChannelReference(_))));
    let non_numeric = make_test_channel("abcd1234:x", None);
    assert!(matches!(
        registry.close_channel(&non_numeric).await,
        Err(Error::InvalidChannelReference(_))
    ));
    assert!(close_calls(&node).is_empty());
    assert!(!registry.is_closing("abcd1234"));
    assert!(registry.get_channel("abcd1234").is_ok());
}

#[test(tokio::test)]
async fn second_close_while_pending_is_rejected_test() {
    let channel = make_test_channel("aa:0", Some(5));
    let (node, registry, _fees) = setup(vec![channel.clone()]);
    registry.refresh().await.unwrap();

    let gate = node.hold_close();
    let (r, c) = (registry.clone(), channel.clone());
    let first = tokio::spawn(async move { r.close_channel(&c).await });
    gate.entered().await;
    assert!(registry.is_closing("aa:0"));
    // still listed while the node works on it
    assert!(registry.get_channel("aa:0").is_ok());

    assert_eq!(
        registry.close_channel(&channel).await,
        Err(Error::SubmissionInProgress("aa:0".to_string()))
    );
    gate.release();
    assert_eq!(first.await.unwrap(), Ok(NavigationHint::ReturnToWallet));
    assert!(!registry.is_closing("aa:0"));
    assert_eq!(close_calls(&node).len(), 1);
}

#[test(tokio::test)]
async fn close_wins_over_concurrent_refresh_test() {
    let channel = make_test_channel("aa:0", Some(5));
    let other = make_test_channel("bb:1", Some(6));
    let (node, registry, _fees) = setup(vec![channel.clone(), other.clone()]);
    registry.refresh().await.unwrap();

    // a refresh whose node response still lists the channel
    let list_gate = node.hold_list();
    let r = registry.clone();
    let refresh = tokio::spawn(async move { r.refresh().await });
    list_gate.entered().await;

    registry.close_channel(&channel).await.unwrap();
    list_gate.release();
    let snapshot = refresh.await.unwrap().unwrap();

    assert!(snapshot.get("aa:0").is_none());
    assert_eq!(registry.get_channel("aa:0"), Err(Error::ChannelNotFound("aa:0".to_string())));
    assert!(registry.get_channel("bb:1").is_ok());

    // the node is slow to drop it
    node.set_channels(vec![channel.clone(), other.clone()]);
    registry.refresh().await.unwrap();
    assert!(registry.get_channel("aa:0").is_err());

    // once a refresh confirms absence, the channel is no longer filtered
    node.set_channels(vec![other.clone()]);
    registry.refresh().await.unwrap();
    node.set_channels(vec![channel.clone(), other]);
    registry.refresh().await.unwrap();
    assert!(registry.get_channel("aa:0").is_ok());
}

#[test(tokio::test)]
async fn refresh_during_failed_close_keeps_channel_test() {
    let channel = make_test_channel("aa:0", None);
    let (node, registry, _fees) = setup(vec![channel.clone()]);
    registry.refresh().await.unwrap();
    node.fail_close(Some(NodeError::Rejected("funding not found".to_string())));

    let gate = node.hold_close();
    let (r, c) = (registry.clone(), channel.clone());
    let close = tokio::spawn(async move { r.close_channel(&c).await });
    gate.entered().await;
    registry.refresh().await.unwrap();
    gate.release();

    assert_eq!(close.await.unwrap(), Err(Error::CloseFailed("funding not found".to_string())));
    registry.refresh().await.unwrap();
    assert!(registry.get_channel("aa:0").is_ok());
}

#[test(tokio::test)]
async fn abandoned_close_still_resolves_test() {
    let channel = make_test_channel("aa:0", Some(5));
    let (node, registry, _fees) = setup(vec![channel.clone()]);
    registry.refresh().await.unwrap();
    let mut events = registry.subscribe();

    let gate = node.hold_close();
    let (r, c) = (registry.clone(), channel.clone());
    let caller = tokio::spawn(async move { r.close_channel(&c).await });
    gate.entered().await;
    caller.abort();
    gate.release();

    assert_eq!(events.recv().await.unwrap(), RegistryEvent::CloseDispatched("aa:0".to_string()));
    assert_eq!(events.recv().await.unwrap(), RegistryEvent::Closed("aa:0".to_string()));
    assert!(!registry.is_closing("aa:0"));
    assert!(registry.get_channel("aa:0").is_err());
}

#[test(tokio::test)]
async fn second_fee_submission_is_rejected_test() {
    let (node, _registry, fees) = setup(vec![]);
    let gate = node.hold_fees();
    let f = fees.clone();
    let first = tokio::spawn(async move { f.set_fees("aa:0", 1000, 0.0001).await });
    gate.entered().await;
    assert_eq!(fees.get_policy("aa:0").status, FeeStatus::Pending);

    assert_eq!(
        fees.set_fees("aa:0", 2000, 0.0002).await,
        Err(Error::SubmissionInProgress("aa:0".to_string()))
    );
    // other channels are independent
    fees.set_fees("bb:1", 1, 0.0).await.unwrap();

    gate.release();
    let policy = first.await.unwrap().unwrap();
    assert_eq!(policy.status, FeeStatus::Succeeded);
    assert_eq!(policy.base_fee_msat, 1000);
    assert_eq!(policy.fee_rate, 0.0001);
    let submissions = node
        .calls()
        .into_iter()
        .filter(|c| matches!(c, NodeCall::SetFeePolicy(cp, ..) if cp == "aa:0"))
        .count();
    assert_eq!(submissions, 1);
}

#[test(tokio::test)]
async fn zero_balances_round_trip_test() {
    let channel = Channel {
        channel_point: "aa:0".to_string(),
        channel_id: Some(1),
        local_balance: 0,
        remote_balance: 0,
        unsettled_balance: 0,
        capacity: 100,
        ..Default::default()
    };
    let (_node, registry, _fees) = setup(vec![channel.clone()]);
    let snapshot = registry.refresh().await.unwrap();
    assert_eq!(snapshot.get("aa:0"), Some(&channel));
    assert!(snapshot.observations().is_empty());

    let large = Channel {
        capacity: 2_100_000_000_000_000,
        local_balance: 2_099_999_999_999_999,
        ..channel
    };
    let (_node, registry, _fees) = setup(vec![large.clone()]);
    registry.refresh().await.unwrap();
    assert_eq!(registry.get_channel("aa:0").unwrap(), large);
}

#[test]
fn unit_properties_test() {
    let units = UnitConverter::new(DisplayUnit::Btc);
    for _ in 0..DisplayUnit::ALL.len() {
        assert_eq!(units.get_amount(Some(0)), units.get_amount(None));
        units.change_unit();
    }
    assert_eq!(units.unit(), DisplayUnit::Btc);
}
