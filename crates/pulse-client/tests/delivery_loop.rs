//! End-to-end behaviour of the session client and delivery loop against a
//! simulated cluster: sequencing, retries, keep-alive pacing, leader changes
//! and startup validation.

use std::path::PathBuf;
use std::time::Duration;

use proptest::prelude::*;
use pulse_client::{
    ClientConfig, ClientError, DeliveryConfig, DeliveryLoop, FailedOfferPolicy, KeepAliveAction,
    SendOutcome,
};
use pulse_client::SessionClient;
use pulse_transport::{
    BackoffIdleStrategy, MessageType, NoopListener, OfferOutcome, RecordingListener,
    RequestEnvelope, SessionEvent, SessionListener, SimCluster, SimClusterConfig, SimTransport,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const MS: Duration = Duration::from_millis(1);

fn session(cluster: &SimCluster, listener: Box<dyn SessionListener>) -> SessionClient<SimTransport> {
    SessionClient::new(
        cluster.transport(listener),
        Box::new(BackoffIdleStrategy::default()),
    )
}

async fn started(
    cluster: &SimCluster,
    config: DeliveryConfig,
) -> (DeliveryLoop<SimTransport>, Instant) {
    let mut client = session(cluster, Box::new(NoopListener));
    client.connect(&CancellationToken::new()).await.unwrap();
    let start = Instant::now();
    (DeliveryLoop::new(client, config, start), start)
}

fn accepted_ids(cluster: &SimCluster) -> Vec<u64> {
    cluster
        .accepted_payloads()
        .iter()
        .map(|payload| {
            let envelope = RequestEnvelope::decode(payload).unwrap();
            assert_eq!(envelope.msg_type, MessageType::TxRequest);
            envelope.tx_id
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_one_tick_after_connect_offers_once_without_keep_alive() {
    let cluster = SimCluster::default();
    let (mut delivery, start) = started(&cluster, DeliveryConfig::default()).await;

    let report = delivery
        .tick_at(start + MS, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.keep_alive, KeepAliveAction::NotDue);
    assert_eq!(report.messages.len(), 1);
    let stats = cluster.stats();
    assert_eq!(stats.keep_alive_attempts, 0);
    assert_eq!(stats.offer_attempts, 1);
    assert_eq!(accepted_ids(&cluster), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn test_payload_is_big_endian_envelope() {
    let cluster = SimCluster::default();
    let (delivery, start) = started(&cluster, DeliveryConfig::default()).await;
    let mut delivery = delivery.with_next_tx_id(0x0102_0304_0506_0708);

    delivery
        .tick_at(start + MS, &CancellationToken::new())
        .await
        .unwrap();

    let payloads = cluster.accepted_payloads();
    assert_eq!(
        payloads[0].as_ref(),
        &[0x0F, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
    );
}

#[tokio::test(start_paused = true)]
async fn test_sequence_advances_regardless_of_outcome() {
    let cluster = SimCluster::default();
    let (mut delivery, start) = started(&cluster, DeliveryConfig::default()).await;
    let cancel = CancellationToken::new();

    for i in 1..=6u32 {
        if i % 2 == 0 {
            cluster.reject_next_offers(3);
        }
        let before = delivery.next_tx_id();
        let report = delivery.tick_at(start + i * MS, &cancel).await.unwrap();
        assert_eq!(delivery.next_tx_id(), before + 1);
        assert_eq!(report.messages[0].tx_id, before);
    }

    assert_eq!(accepted_ids(&cluster), vec![0, 2, 4]);
    assert_eq!(delivery.stats().messages_delivered, 3);
    assert_eq!(delivery.stats().messages_failed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_fewer_failures_than_retry_limit_still_deliver() {
    let cluster = SimCluster::default();
    let (mut delivery, start) = started(&cluster, DeliveryConfig::default()).await;

    cluster.reject_next_offers(2);
    let report = delivery
        .tick_at(start + MS, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.messages[0].outcome, SendOutcome::Delivered { attempts: 3 });
    assert_eq!(accepted_ids(&cluster), vec![0]);
    assert_eq!(cluster.stats().offer_attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_offer_polls_between_attempts_and_moves_on() {
    let cluster = SimCluster::default();
    let (mut delivery, start) = started(&cluster, DeliveryConfig::default()).await;
    let cancel = CancellationToken::new();
    let polls_before = cluster.stats().polls;

    cluster.reject_next_offers(3);
    let report = delivery.tick_at(start + MS, &cancel).await.unwrap();
    assert_eq!(
        report.messages[0].outcome,
        SendOutcome::Exhausted {
            attempts: 3,
            last: OfferOutcome::BackPressured
        }
    );
    // tick poll, connect poll, then one poll between each pair of attempts
    assert_eq!(cluster.stats().polls, polls_before + 4);

    let report = delivery.tick_at(start + 2 * MS, &cancel).await.unwrap();
    assert_eq!(report.messages[0].tx_id, 1);
    assert!(report.messages[0].outcome.is_delivered());
    assert_eq!(accepted_ids(&cluster), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_never_before_interval() {
    let cluster = SimCluster::default();
    let (mut delivery, start) = started(&cluster, DeliveryConfig::default()).await;
    let cancel = CancellationToken::new();
    let interval = Duration::from_secs(2);

    let mut last_sent = start;
    let mut sent = 0;
    for i in 1..=5000u32 {
        let now = start + i * MS;
        let report = delivery.tick_at(now, &cancel).await.unwrap();
        if report.keep_alive == KeepAliveAction::Sent {
            assert!(now - last_sent > interval);
            last_sent = now;
            sent += 1;
        }
    }

    assert_eq!(sent, 2);
    assert_eq!(cluster.stats().keep_alive_attempts, 2);
    assert_eq!(delivery.timers().last_keep_alive, start + 4002 * MS);
    assert_eq!(
        delivery.session().session().last_keep_alive,
        Some(start + 4002 * MS)
    );
    assert_eq!(cluster.stats().offers_accepted, 5000);
}

#[tokio::test(start_paused = true)]
async fn test_failed_keep_alive_skips_tick_and_retries() {
    let cluster = SimCluster::default();
    let (mut delivery, start) = started(&cluster, DeliveryConfig::default()).await;
    let cancel = CancellationToken::new();

    let due = start + 2001 * MS;
    cluster.reject_next_keep_alives(2);
    let offers_before = cluster.stats().offer_attempts;

    let report = delivery.tick_at(due, &cancel).await.unwrap();
    assert_eq!(report.keep_alive, KeepAliveAction::Failed);
    assert!(!report.message_tick);
    let report = delivery.tick_at(due + MS, &cancel).await.unwrap();
    assert_eq!(report.keep_alive, KeepAliveAction::Failed);
    assert_eq!(cluster.stats().offer_attempts, offers_before);
    assert_eq!(delivery.timers().last_message, start);

    let report = delivery.tick_at(due + 2 * MS, &cancel).await.unwrap();
    assert_eq!(report.keep_alive, KeepAliveAction::Sent);
    assert!(report.message_tick);
    assert_eq!(report.delivered(), 1);
    assert_eq!(delivery.stats().keep_alive_failures, 2);
    assert_eq!(delivery.timers().last_keep_alive, due + 2 * MS);
}

#[tokio::test(start_paused = true)]
async fn test_leader_change_reconnects_before_offering() {
    let cluster = SimCluster::new(SimClusterConfig {
        connect_polls: 3,
        ..Default::default()
    });
    let recorder = RecordingListener::new();
    let mut client = session(&cluster, Box::new(recorder.clone()));
    let cancel = CancellationToken::new();
    client.connect(&cancel).await.unwrap();
    let start = Instant::now();
    let mut delivery = DeliveryLoop::new(client, DeliveryConfig::default(), start);

    delivery.tick_at(start + MS, &cancel).await.unwrap();
    cluster.elect_leader(2);
    let report = delivery.tick_at(start + 2 * MS, &cancel).await.unwrap();

    assert_eq!(report.delivered(), 1);
    assert_eq!(accepted_ids(&cluster), vec![0, 1]);
    let stats = cluster.stats();
    assert_eq!(stats.offers_while_disconnected, 0);
    assert_eq!(stats.sessions_opened, 2);
    assert_eq!(delivery.session().session().reconnects, 1);
    assert_eq!(delivery.session().leader_id(), Some(2));

    let events = recorder.events();
    let new_leader = events
        .iter()
        .position(|e| matches!(e, SessionEvent::NewLeader { leader_member_id: 2, .. }))
        .unwrap();
    let reconnected = events
        .iter()
        .rposition(|e| matches!(e, SessionEvent::Connected { leader_member_id: 2, .. }))
        .unwrap();
    assert!(new_leader < reconnected);
}

#[tokio::test(start_paused = true)]
async fn test_redeliver_preserves_order() {
    let cluster = SimCluster::default();
    let config = DeliveryConfig {
        failed_offer_policy: FailedOfferPolicy::Redeliver { max_pending: 16 },
        ..Default::default()
    };
    let (mut delivery, start) = started(&cluster, config).await;
    let cancel = CancellationToken::new();

    cluster.set_backpressure(true);
    delivery.tick_at(start + MS, &cancel).await.unwrap();
    delivery.tick_at(start + 2 * MS, &cancel).await.unwrap();
    assert_eq!(delivery.pending_len(), 2);
    assert_eq!(delivery.next_tx_id(), 2);

    cluster.set_backpressure(false);
    delivery.tick_at(start + 3 * MS, &cancel).await.unwrap();
    assert_eq!(accepted_ids(&cluster), vec![0, 1, 2]);
    assert_eq!(delivery.pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_drop_policy_discards_failed() {
    let cluster = SimCluster::default();
    let (mut delivery, start) = started(&cluster, DeliveryConfig::default()).await;
    let cancel = CancellationToken::new();

    cluster.set_backpressure(true);
    delivery.tick_at(start + MS, &cancel).await.unwrap();
    delivery.tick_at(start + 2 * MS, &cancel).await.unwrap();
    cluster.set_backpressure(false);
    delivery.tick_at(start + 3 * MS, &cancel).await.unwrap();

    assert_eq!(accepted_ids(&cluster), vec![2]);
    assert_eq!(delivery.stats().messages_dropped, 2);
}

#[tokio::test(start_paused = true)]
async fn test_run_until_cancelled() {
    let cluster = SimCluster::default();
    let (mut delivery, _) = started(&cluster, DeliveryConfig::default()).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    delivery.run(&cancel).await.unwrap();
    let ticks = delivery.stats().ticks;
    assert!((9..=11).contains(&ticks), "ticks = {}", ticks);
    assert_eq!(delivery.stats().messages_delivered, ticks);
    assert_eq!(cluster.stats().keep_alive_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_when_cancelled_while_connecting() {
    let cluster = SimCluster::default();
    let (mut delivery, _) = started(&cluster, DeliveryConfig::default()).await;
    cluster.set_reachable(false);
    cluster.disconnect();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    delivery.run(&cancel).await.unwrap();
    assert_eq!(delivery.stats().offer_attempts, 0);
    assert_eq!(cluster.stats().offers_while_disconnected, 0);
}

#[test]
fn test_missing_transport_dir_aborts_startup() {
    let config = ClientConfig {
        transport_dir: PathBuf::from("/nonexistent/pulse-transport"),
        ..Default::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ClientError::TransportDirMissing { .. })
    ));
}

proptest! {
    #[test]
    fn prop_accepted_ids_strictly_increase(
        batch_size in 1usize..4,
        rejections in proptest::collection::vec(0u32..5, 1..40),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        runtime.block_on(async {
            let cluster = SimCluster::default();
            let config = DeliveryConfig { batch_size, ..Default::default() };
            let (mut delivery, start) = started(&cluster, config).await;
            let cancel = CancellationToken::new();

            for (i, rejected) in rejections.iter().enumerate() {
                cluster.reject_next_offers(*rejected);
                delivery.tick_at(start + (i as u32 + 1) * MS, &cancel).await.unwrap();
            }

            let created = (rejections.len() * batch_size) as u64;
            prop_assert_eq!(delivery.next_tx_id(), created);
            let ids = accepted_ids(&cluster);
            prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(ids.iter().all(|id| *id < created));
            prop_assert_eq!(
                delivery.stats().messages_delivered + delivery.stats().messages_failed,
                created
            );
            Ok(())
        })?;
    }
}
