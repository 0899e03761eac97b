mod common;

use std::{sync::atomic::Ordering, sync::Arc, time::Duration};

use serde_json::json;

use lavaclient::{
    dispatch::Dispatcher,
    events::Event,
    http::SessionUpdate,
    protocol::messages::{EndReason, Severity},
    query::{Classifier, ClassifierConfig, Source},
    track::Track,
};

use common::{node_config, FakePlayer, Harness, RICK};

fn dispatcher(harness: &Harness) -> Dispatcher {
    harness.node.set_api_version(4);
    Dispatcher::new(
        Arc::clone(&harness.node),
        harness.services.api.clone(),
        harness.services.players.clone(),
        harness.services.sink.clone(),
        harness.services.classifier.clone(),
    )
}

fn ready(session_id: &str) -> String {
    json!({ "op": "ready", "resumed": false, "sessionId": session_id }).to_string()
}

fn player_update(guild_id: u64, connected: bool) -> String {
    json!({
        "op": "playerUpdate",
        "guildId": guild_id.to_string(),
        "state": { "time": 1_700_000_000_000_u64, "position": 1500, "connected": connected, "ping": -1 }
    })
    .to_string()
}

fn track_event(event_type: &str, guild_id: u64, extra: serde_json::Value) -> String {
    let mut frame = json!({
        "op": "event",
        "type": event_type,
        "guildId": guild_id.to_string(),
        "track": { "encoded": RICK, "info": {}, "pluginInfo": {} },
    });

    if let (Some(frame), Some(extra)) = (frame.as_object_mut(), extra.as_object()) {
        frame.extend(extra.clone());
    }
    frame.to_string()
}

#[tokio::test]
async fn ready_configures_resuming_once() {
    let mut harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);

    dispatcher.handle(&ready("session-1")).await.unwrap();
    dispatcher.handle(&ready("session-2")).await.unwrap();

    assert!(harness.node.is_ready());
    assert_eq!(harness.node.session_id().as_deref(), Some("session-2"));
    assert_eq!(
        harness.api.patches(),
        [(
            "session-1".to_owned(),
            SessionUpdate {
                resuming_key: "resume-key".to_owned(),
                timeout: 600,
            }
        )]
    );

    let event = harness.events.try_recv().unwrap();
    assert_eq!(
        event,
        Event::NodeReady {
            node: "main".to_owned(),
            session_id: "session-1".to_owned(),
            resumed: false,
        }
    );
}

#[tokio::test]
async fn failed_resume_configuration_is_retried() {
    let harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);

    *harness.api.fail_patch.lock().unwrap() = true;
    dispatcher.handle(&ready("session-1")).await.unwrap();
    assert!(!harness.node.is_resume_configured());
    assert!(harness.api.patches().is_empty());

    *harness.api.fail_patch.lock().unwrap() = false;
    dispatcher.handle(&ready("session-2")).await.unwrap();
    assert!(harness.node.is_resume_configured());
    assert_eq!(harness.api.patches().len(), 1);
    assert_eq!(harness.api.patches()[0].0, "session-2");
}

#[tokio::test]
async fn nodes_without_resume_key_are_not_patched() {
    let mut config = node_config();
    config.resume_key = None;
    let harness = Harness::new(config);
    let dispatcher = dispatcher(&harness);

    dispatcher.handle(&ready("session-1")).await.unwrap();
    assert!(harness.node.is_ready());
    assert!(harness.api.patches().is_empty());
}

#[tokio::test]
async fn stats_are_stored() {
    let harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);

    let frame = json!({
        "op": "stats",
        "players": 3,
        "playingPlayers": 2,
        "uptime": 123_456,
        "memory": { "free": 1, "used": 2, "allocated": 3, "reservable": 4 },
        "cpu": { "cores": 4, "systemLoad": 0.0, "lavalinkLoad": 0.1 }
    });
    dispatcher.handle(&frame.to_string()).await.unwrap();

    let stats = harness.node.stats().unwrap();
    assert_eq!(stats.players, 3);
    assert_eq!(stats.playing_players, 2);
    assert!((harness.node.penalty() - 2.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn unknown_frames_are_skipped() {
    let mut harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);

    dispatcher.handle(r#"{"op":"pluginThing"}"#).await.unwrap();
    dispatcher
        .handle(r#"{"op":"event","type":"LyricsFoundEvent","guildId":"1"}"#)
        .await
        .unwrap();
    dispatcher.handle(r#"{"op":"event","guildId":"1"}"#).await.unwrap();

    assert!(harness.events.try_recv().is_err());
    assert!(dispatcher.handle("not json").await.is_err());
    assert!(dispatcher.handle(r#"{"op":"ready"}"#).await.is_err());
}

#[tokio::test]
async fn player_updates_are_forwarded() {
    let harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);
    let player = harness.players.insert(FakePlayer::new(1, "main"));

    dispatcher.handle(&player_update(1, true)).await.unwrap();
    // Recently connected players are not probed.
    dispatcher.handle(&player_update(1, false)).await.unwrap();
    // Unknown guilds are ignored.
    dispatcher.handle(&player_update(2, true)).await.unwrap();

    let states = player.states.lock().unwrap().clone();
    assert_eq!(states.len(), 2);
    assert!(states[0].connected);
    assert_eq!(states[0].position, 1500);
    assert!(!states[1].connected);
    assert_eq!(dispatcher.pending_probes(), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_players_are_probed_and_reconnected() {
    let harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);
    dispatcher.handle(&ready("session-1")).await.unwrap();

    let player = harness.players.insert(FakePlayer::new(1, "main"));
    tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;

    dispatcher.handle(&player_update(1, false)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    dispatcher.handle(&player_update(1, false)).await.unwrap();

    // The second update replaced the first probe.
    assert_eq!(dispatcher.pending_probes(), 1);
    assert!(player.states.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(harness.api.player_calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.api.player_calls.load(Ordering::SeqCst), 1);
    assert_eq!(player.reconnects(), 1);
    assert_eq!(dispatcher.pending_probes(), 0);
}

#[tokio::test(start_paused = true)]
async fn probes_leave_reconnected_players_alone() {
    let harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);
    dispatcher.handle(&ready("session-1")).await.unwrap();

    let player = harness.players.insert(FakePlayer::new(1, "main"));
    tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
    *harness.api.voice_connected.lock().unwrap() = Some(true);

    dispatcher.handle(&player_update(1, false)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(harness.api.player_calls.load(Ordering::SeqCst), 1);
    assert_eq!(player.reconnects(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_probes_do_not_run() {
    let harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);
    dispatcher.handle(&ready("session-1")).await.unwrap();

    let player = harness.players.insert(FakePlayer::new(1, "main"));
    tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;

    dispatcher.handle(&player_update(1, false)).await.unwrap();
    dispatcher.cancel_probes();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(harness.api.player_calls.load(Ordering::SeqCst), 0);
    assert_eq!(player.reconnects(), 0);
}

#[tokio::test]
async fn track_start_reports_the_source() {
    let mut harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);
    harness.players.insert(FakePlayer::new(1, "main"));

    dispatcher
        .handle(&track_event("TrackStartEvent", 1, json!({})))
        .await
        .unwrap();

    let Event::TrackStart {
        node,
        guild_id,
        track,
        source,
    } = harness.events.try_recv().unwrap()
    else {
        panic!("expected a track start");
    };
    assert_eq!(node, "main");
    assert_eq!(guild_id, 1);
    assert_eq!(track.title(), "Rick Astley - Never Gonna Give You Up");
    assert_eq!(track.duration(), Duration::from_millis(212_000));
    assert_eq!(source, Source::YouTubeMusic);
}

#[tokio::test]
async fn current_tracks_are_reused() {
    let mut harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);

    let classifier = Classifier::with_fs(ClassifierConfig::default());
    let query = classifier.classify_offline("ytsearch:never gonna give you up");
    let current = Track::decode(RICK).await.unwrap().with_query(query);

    let mut player = FakePlayer::new(1, "main");
    player.current = Some(current);
    let player = harness.players.insert(player);

    dispatcher
        .handle(&track_event("TrackStartEvent", 1, json!({})))
        .await
        .unwrap();
    let event = harness.events.try_recv().unwrap();
    assert!(matches!(
        event,
        Event::TrackStart {
            source: Source::YouTube,
            ..
        }
    ));

    // v3 nodes send the encoded track on its own.
    let frame = json!({
        "op": "event",
        "type": "TrackEndEvent",
        "guildId": "1",
        "track": RICK,
        "reason": "FINISHED",
    });
    dispatcher.handle(&frame.to_string()).await.unwrap();

    let event = harness.events.try_recv().unwrap();
    let Event::TrackEnd { track, reason, .. } = &event else {
        panic!("expected a track end");
    };
    assert_eq!(*reason, EndReason::Finished);
    assert_eq!(
        track.query().map(lavaclient::query::Query::source),
        Some(Source::YouTube)
    );
    assert_eq!(*player.events.lock().unwrap(), [event]);
}

#[tokio::test]
async fn exceptions_from_other_nodes_are_dropped() {
    let mut harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);
    let moved = harness.players.insert(FakePlayer::new(1, "backup"));
    let local = harness.players.insert(FakePlayer::new(2, "main"));

    let exception = json!({
        "exception": { "message": "Video unavailable", "severity": "common", "cause": "FriendlyException" }
    });
    dispatcher
        .handle(&track_event("TrackExceptionEvent", 1, exception.clone()))
        .await
        .unwrap();
    assert!(harness.events.try_recv().is_err());
    assert!(moved.events.lock().unwrap().is_empty());

    dispatcher
        .handle(&track_event("TrackExceptionEvent", 2, exception))
        .await
        .unwrap();
    let Event::TrackException { exception, .. } = harness.events.try_recv().unwrap() else {
        panic!("expected a track exception");
    };
    assert_eq!(exception.severity, Severity::Common);
    assert_eq!(exception.message.as_deref(), Some("Video unavailable"));
    assert_eq!(local.events.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn stuck_tracks_and_voice_closes() {
    let mut harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);
    let player = harness.players.insert(FakePlayer::new(1, "main"));

    dispatcher
        .handle(&track_event(
            "TrackStuckEvent",
            1,
            json!({ "thresholdMs": 10_000 }),
        ))
        .await
        .unwrap();
    assert!(matches!(
        harness.events.try_recv().unwrap(),
        Event::TrackStuck { threshold, .. } if threshold == Duration::from_secs(10)
    ));

    let closed = json!({
        "op": "event",
        "type": "WebSocketClosedEvent",
        "guildId": "1",
        "code": 4006,
        "reason": "Your session is no longer valid.",
        "byRemote": true,
    });
    dispatcher.handle(&closed.to_string()).await.unwrap();
    assert_eq!(
        harness.events.try_recv().unwrap(),
        Event::WebSocketClosed {
            node: "main".to_owned(),
            guild_id: 1,
            code: 4006,
            reason: "Your session is no longer valid.".to_owned(),
            by_remote: true,
        }
    );

    // Only track ends, exceptions and stuck tracks reach the player.
    assert_eq!(player.events.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn sponsorblock_segments() {
    let mut harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);
    harness.players.insert(FakePlayer::new(1, "main"));

    let loaded = json!({
        "op": "event",
        "type": "SegmentsLoaded",
        "guildId": "1",
        "segments": [{ "category": "sponsor", "start": 1000, "end": "5000" }],
    });
    dispatcher.handle(&loaded.to_string()).await.unwrap();

    let Event::SegmentsLoaded { segments, .. } = harness.events.try_recv().unwrap() else {
        panic!("expected loaded segments");
    };
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].category, "sponsor");
    assert_eq!(segments[0].end, 5000);

    let skipped = json!({
        "op": "event",
        "type": "SegmentSkippedEvent",
        "guildId": "1",
        "segment": { "category": "intro", "start": 0, "end": 3000 },
    });
    dispatcher.handle(&skipped.to_string()).await.unwrap();
    assert!(matches!(
        harness.events.try_recv().unwrap(),
        Event::SegmentSkipped { segment, .. } if segment.category == "intro"
    ));
}

#[tokio::test(start_paused = true)]
async fn events_wait_for_late_players() {
    let mut harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);

    dispatcher
        .handle(&track_event("TrackStartEvent", 1, json!({})))
        .await
        .unwrap();
    dispatcher
        .handle(&track_event("TrackStartEvent", 2, json!({})))
        .await
        .unwrap();
    assert!(harness.events.try_recv().is_err());

    harness.players.insert(FakePlayer::new(1, "main"));
    tokio::time::sleep(Duration::from_secs(4)).await;

    let event = harness.events.try_recv().unwrap();
    assert_eq!(event.guild_id(), Some(1));
    // Guild 2 never got a player.
    assert!(harness.events.try_recv().is_err());
}

#[tokio::test]
async fn undecodable_tracks_drop_only_their_event() {
    let mut harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);
    let player = harness.players.insert(FakePlayer::new(1, "main"));

    // Ends before the author, and not base64 at all.
    for encoded in ["QAAAAAEAAAA=", "not a track!"] {
        for event_type in ["TrackStartEvent", "TrackEndEvent", "TrackStuckEvent", "TrackExceptionEvent"] {
            let frame = json!({
                "op": "event",
                "type": event_type,
                "guildId": "1",
                "track": { "encoded": encoded, "info": {} },
                "reason": "finished",
                "thresholdMs": 10_000,
                "exception": { "message": "boom", "severity": "fault", "cause": "x" },
            });
            dispatcher.handle(&frame.to_string()).await.unwrap();
        }
    }

    assert!(harness.events.try_recv().is_err());
    assert!(player.events.lock().unwrap().is_empty());

    // Later events of the same player still arrive.
    dispatcher
        .handle(&track_event("TrackStartEvent", 1, json!({})))
        .await
        .unwrap();
    assert_eq!(harness.events.try_recv().unwrap().guild_id(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn finished_probes_are_forgotten() {
    let harness = Harness::new(node_config());
    let dispatcher = dispatcher(&harness);

    for guild_id in 1..=3 {
        dispatcher.schedule_probe(guild_id);
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
    dispatcher.schedule_probe(1);
    assert_eq!(dispatcher.pending_probes(), 3);

    // Guilds 2 and 3 have run; the replaced probe of guild 1 must not take
    // its replacement along.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(dispatcher.pending_probes(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(dispatcher.pending_probes(), 0);
}
