mod common;

use std::time::Duration;

use coachline::{
    conversation::Role,
    retry::RetryPolicy,
    store::MessageStore,
    sync::ConnectionStatus,
};
use common::{World, bodies, settle, wait_for_view};

#[tokio::test(start_paused = true)]
async fn missed_events_are_recovered_by_refetch() {
    let world = World::new();
    let (coach, key) = (world.coach(), world.key());
    let first = world.store.append(key, coach, Role::Coach, "first".into()).await.unwrap();
    let doomed = world.store.append(key, coach, Role::Coach, "doomed".into()).await.unwrap();

    let session = world.open_as(world.trainee()).await;
    assert_eq!(bodies(&session.view()), ["first", "doomed"]);

    // changes that never reach the subscriber
    let silent = world.silent_store();
    silent.edit(first.id, coach, "first, edited".into()).await.unwrap();
    silent.delete(doomed.id, coach).await.unwrap();
    silent.append(key, coach, Role::Coach, "while away".into()).await.unwrap();
    settle().await;
    assert_eq!(bodies(&session.view()), ["first", "doomed"]);

    world.source.fail_next(2);
    world.feed.disconnect(key);
    settle().await;
    assert_eq!(session.view().connection, ConnectionStatus::Reconnecting);

    let view = wait_for_view(&session, |v| v.connection == ConnectionStatus::Connected).await;
    let stored = world.store.list(key).await.unwrap();
    let stored_ids: Vec<_> = stored.iter().map(|m| m.id).collect();
    let view_ids: Vec<_> = view.messages.iter().map(|m| m.id).collect();
    assert_eq!(view_ids, stored_ids);
    assert_eq!(bodies(&view), ["first, edited", "while away"]);
    assert!(view.messages[0].edited);

    // one open, two refused, one successful retry
    assert_eq!(world.source.connects(), 4);
}

#[tokio::test(start_paused = true)]
async fn replayed_events_do_not_duplicate() {
    let world = World::new();
    let session = world.open_as(world.trainee()).await;
    let sent = world
        .store
        .append(world.key(), world.coach(), Role::Coach, "once".into())
        .await
        .unwrap();
    settle().await;

    world.feed.disconnect(world.key());
    wait_for_view(&session, |v| v.connection == ConnectionStatus::Connected).await;
    settle().await;

    let view = session.view();
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].id, sent.id);
}

#[tokio::test(start_paused = true)]
async fn gives_up_then_reconnects_on_demand() {
    let world = World::with_policy(RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
    });
    let session = world.open_as(world.coach()).await;
    assert_eq!(world.sync.connection_status(), ConnectionStatus::Connected);

    world.source.fail_next(u32::MAX);
    world.feed.disconnect(world.key());
    wait_for_view(&session, |v| v.connection == ConnectionStatus::Disconnected).await;
    assert_eq!(world.sync.connection_status(), ConnectionStatus::Disconnected);

    // stays down on its own
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(session.view().connection, ConnectionStatus::Disconnected);

    world.source.fail_next(0);
    let sent = world
        .store
        .append(world.key(), world.trainee(), Role::Trainee, "you there?".into())
        .await
        .unwrap();
    world.sync.reconnect_now();

    let view = wait_for_view(&session, |v| v.connection == ConnectionStatus::Connected).await;
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].id, sent.id);
}

#[tokio::test(start_paused = true)]
async fn status_is_worst_across_subscriptions() {
    let world = World::new();
    assert_eq!(world.sync.connection_status(), ConnectionStatus::Connected);

    let session = world.open_as(world.coach()).await;
    assert_eq!(world.sync.subscription_count(), 1);
    drop(session);
    assert_eq!(world.sync.subscription_count(), 0);
    assert_eq!(world.sync.connection_status(), ConnectionStatus::Connected);
}
