//! End-to-end scenarios through ingest, persistence and live fan-out.

mod common;

use common::{app, create_channel, is_message, submission, Client, WAIT};
use murmur_core::Record;
use murmur_protocol::{ClientFrame, HistoryEntry, ServerFrame};
use std::time::Duration;

async fn wait_for_records(state: &murmur_gateway::AppState, channel: &str, count: usize) -> Vec<Record> {
    tokio::time::timeout(WAIT, async {
        loop {
            let records = state.backend.history(channel, 100).await.expect("history");
            if records.len() >= count {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("records never arrived")
}

#[tokio::test]
async fn message_reaches_only_its_channel() {
    let state = app().await;
    create_channel(&state, "alpha").await;
    create_channel(&state, "bravo").await;

    let mut on_alpha = Client::connect(&state, 1).await;
    on_alpha.switch(&state, "alpha").await;
    let mut on_bravo = Client::connect(&state, 2).await;
    on_bravo.switch(&state, "bravo").await;

    state
        .backend
        .ingest
        .submit(&submission("alpha", "1", 1000, "hi"))
        .await
        .unwrap();

    assert_eq!(
        on_alpha.expect(is_message).await,
        ServerFrame::message("1", "hi")
    );
    let records = wait_for_records(&state, "alpha", 1).await;
    assert_eq!(
        records,
        vec![Record {
            account: 1,
            timestamp: 1000,
            content: "hi".into()
        }]
    );

    assert!(!on_bravo
        .drain(Duration::from_millis(300))
        .await
        .iter()
        .any(is_message));
    assert!(state.backend.history("bravo", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn two_sessions_each_get_one_copy() {
    let state = app().await;
    create_channel(&state, "alpha").await;

    let mut first = Client::connect(&state, 1).await;
    first.switch(&state, "alpha").await;
    let mut second = Client::connect(&state, 2).await;
    second.switch(&state, "alpha").await;

    state
        .backend
        .ingest
        .submit(&submission("alpha", "1", 1000, "hi"))
        .await
        .unwrap();

    for client in [&mut first, &mut second] {
        client.expect(is_message).await;
        let extra = client.drain(Duration::from_millis(300)).await;
        assert!(!extra.iter().any(is_message), "duplicate delivery: {extra:?}");
    }
}

#[tokio::test]
async fn resubmitting_a_message_stores_it_once() {
    let state = app().await;
    create_channel(&state, "alpha").await;

    let request = submission("alpha", "3", 5000, "once");
    state.backend.ingest.submit(&request).await.unwrap();
    state.backend.ingest.submit(&request).await.unwrap();
    state
        .backend
        .ingest
        .submit(&submission("alpha", "3", 5001, "twice"))
        .await
        .unwrap();

    let records = wait_for_records(&state, "alpha", 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let records_later = state.backend.history("alpha", 100).await.unwrap();
    assert_eq!(records, records_later);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].content, "once");
}

#[tokio::test]
async fn switching_replays_history_and_stops_old_channel() {
    let state = app().await;
    create_channel(&state, "alpha").await;
    create_channel(&state, "bravo").await;

    state
        .backend
        .ingest
        .submit(&submission("alpha", "4", 1000, "earlier"))
        .await
        .unwrap();
    wait_for_records(&state, "alpha", 1).await;

    let mut client = Client::connect(&state, 1).await;
    let history = client.switch(&state, "alpha").await;
    assert_eq!(
        history,
        ServerFrame::History {
            channel: "alpha".into(),
            messages: vec![HistoryEntry {
                account_id: "4".into(),
                content: "earlier".into(),
                timestamp: 1000,
            }],
        }
    );

    client.switch(&state, "bravo").await;
    let status = state.gateway.status().await.unwrap();
    assert_eq!(status.session(&client.id).unwrap().subscribed_to, "bravo");

    state
        .backend
        .ingest
        .submit(&submission("alpha", "4", 2000, "later"))
        .await
        .unwrap();
    wait_for_records(&state, "alpha", 2).await;
    assert!(!client
        .drain(Duration::from_millis(300))
        .await
        .iter()
        .any(is_message));
}

#[tokio::test]
async fn switch_sends_clear_then_channel_changed() {
    let state = app().await;
    create_channel(&state, "alpha").await;

    let mut client = Client::connect(&state, 1).await;
    client.send(
        &state,
        ClientFrame::ChangeChannel {
            channel: "alpha".into(),
        },
    );
    assert_eq!(client.next().await, ServerFrame::ClearHistory);
    assert_eq!(
        client.next().await,
        ServerFrame::ChannelChanged {
            channel: "alpha".into()
        }
    );
}

#[tokio::test]
async fn submit_frame_uses_connection_account() {
    let state = app().await;
    let mut client = Client::connect(&state, 42).await;

    client.send(
        &state,
        ClientFrame::SubmitMessage {
            channel: "Main".into(),
            message: "hello".into(),
        },
    );
    assert_eq!(
        client.expect(is_message).await,
        ServerFrame::message("42", "hello")
    );

    let records = wait_for_records(&state, "Main", 1).await;
    assert_eq!(records[0].account, 42);
    assert!(records[0].timestamp > 0);
}

#[tokio::test]
async fn submit_frame_to_unknown_channel_is_rejected() {
    let state = app().await;
    let mut client = Client::connect(&state, 1).await;
    client.send(
        &state,
        ClientFrame::SubmitMessage {
            channel: "ghost".into(),
            message: "boo".into(),
        },
    );
    assert_eq!(
        client.next().await,
        ServerFrame::error("Unknown channel: ghost")
    );
}

#[tokio::test]
async fn new_channel_frame_provisions_and_subscribes() {
    let state = app().await;
    let mut client = Client::connect(&state, 1).await;

    client.send(
        &state,
        ClientFrame::NewChannel {
            new_channel: "charlie".into(),
        },
    );
    assert_eq!(
        client
            .expect(|f| matches!(f, ServerFrame::ChannelCreated { .. }))
            .await,
        ServerFrame::ChannelCreated {
            channel: "charlie".into()
        }
    );
    client
        .expect(|f| matches!(f, ServerFrame::History { .. }))
        .await;

    let status = state.gateway.status().await.unwrap();
    let session = status.session(&client.id).unwrap();
    assert_eq!(session.subscribed_to, "charlie");
    assert_eq!(session.known_channels, vec!["Main", "charlie"]);

    let listed = state.backend.infra.directory.list().await.unwrap();
    assert!(listed.iter().any(|r| r.name == "charlie"));

    common::wait_confirmed(&state, "charlie").await;
    client.send(
        &state,
        ClientFrame::SubmitMessage {
            channel: "charlie".into(),
            message: "first".into(),
        },
    );
    assert_eq!(
        client.expect(is_message).await,
        ServerFrame::message("1", "first")
    );
}

#[tokio::test]
async fn new_channel_frame_rejects_existing_and_invalid_names() {
    let state = app().await;
    let mut client = Client::connect(&state, 1).await;

    client.send(
        &state,
        ClientFrame::NewChannel {
            new_channel: "Main".into(),
        },
    );
    assert_eq!(
        client.next().await,
        ServerFrame::error("Channel already exists: Main")
    );

    client.send(
        &state,
        ClientFrame::NewChannel {
            new_channel: "no spaces".into(),
        },
    );
    assert!(matches!(client.next().await, ServerFrame::Error { .. }));
}

#[tokio::test]
async fn rename_moves_live_sessions() {
    let state = app().await;
    create_channel(&state, "alpha").await;

    let mut client = Client::connect(&state, 1).await;
    client.switch(&state, "alpha").await;

    let record = state
        .backend
        .provisioner
        .rename_channel("alpha", "omega")
        .await
        .unwrap();
    state.gateway.channel_renamed("alpha", &record.name).unwrap();

    assert_eq!(
        client.next().await,
        ServerFrame::ChannelRenamed {
            from: "alpha".into(),
            to: "omega".into()
        }
    );

    state
        .backend
        .ingest
        .submit(&submission("omega", "1", 1000, "renamed"))
        .await
        .unwrap();
    assert_eq!(
        client.expect(is_message).await,
        ServerFrame::message("1", "renamed")
    );
    assert!(state
        .backend
        .ingest
        .submit(&submission("alpha", "1", 1001, "stale"))
        .await
        .is_err());
}

#[tokio::test]
async fn recreating_a_renamed_channels_old_name_keeps_them_apart() {
    let state = app().await;
    create_channel(&state, "alpha").await;
    let record = state
        .backend
        .provisioner
        .rename_channel("alpha", "omega")
        .await
        .unwrap();
    state.gateway.channel_renamed("alpha", &record.name).unwrap();
    create_channel(&state, "alpha").await;

    let mut on_omega = Client::connect(&state, 1).await;
    on_omega.switch(&state, "omega").await;
    let mut on_alpha = Client::connect(&state, 2).await;
    on_alpha.switch(&state, "alpha").await;

    state
        .backend
        .ingest
        .submit(&submission("omega", "1", 1000, "to omega"))
        .await
        .unwrap();
    state
        .backend
        .ingest
        .submit(&submission("alpha", "2", 1000, "to alpha"))
        .await
        .unwrap();

    assert_eq!(
        on_omega.expect(is_message).await,
        ServerFrame::message("1", "to omega")
    );
    assert_eq!(
        on_alpha.expect(is_message).await,
        ServerFrame::message("2", "to alpha")
    );

    let omega = wait_for_records(&state, "omega", 1).await;
    let alpha = wait_for_records(&state, "alpha", 1).await;
    assert_eq!(omega[0].content, "to omega");
    assert_eq!(alpha[0].content, "to alpha");
    assert!(!on_omega
        .drain(Duration::from_millis(300))
        .await
        .iter()
        .any(is_message));
}

#[tokio::test]
async fn delete_falls_back_to_remaining_channel() {
    let state = app().await;
    create_channel(&state, "alpha").await;

    let mut client = Client::connect(&state, 1).await;
    client.switch(&state, "alpha").await;

    state.backend.provisioner.delete_channel("alpha").await.unwrap();
    state.gateway.channel_deleted("alpha").unwrap();

    assert_eq!(client.next().await, ServerFrame::ClearHistory);
    assert_eq!(
        client.next().await,
        ServerFrame::ChannelChanged {
            channel: "Main".into()
        }
    );

    let status = state.gateway.status().await.unwrap();
    assert_eq!(status.channels, vec!["Main"]);
    assert_eq!(
        status.session(&client.id).unwrap().known_channels,
        vec!["Main"]
    );
}

#[tokio::test]
async fn closed_session_gets_nothing() {
    let state = app().await;
    let mut client = Client::connect(&state, 1).await;
    state.gateway.close(client.id.clone()).unwrap();

    state
        .backend
        .ingest
        .submit(&submission("Main", "1", 1000, "hi"))
        .await
        .unwrap();
    wait_for_records(&state, "Main", 1).await;

    assert!(!client
        .drain(Duration::from_millis(300))
        .await
        .iter()
        .any(is_message));
    assert!(state.gateway.status().await.unwrap().sessions.is_empty());
}
