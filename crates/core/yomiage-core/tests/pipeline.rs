//! End-to-end behaviour of the readout pipeline against in-memory fakes

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use yomiage_core::testing::{FakeConnector, PcmTranscoder, ScriptedSynth, SynthStep};
use yomiage_core::*;

struct Pipeline {
    manager: GuildSessionManager,
    connector: FakeConnector,
    synth: Arc<ScriptedSynth>,
}

fn pipeline(synth: ScriptedSynth, settings: SessionSettings) -> Pipeline {
    let connector = FakeConnector::new();
    let synth = Arc::new(synth);
    let manager = GuildSessionManager::new(
        Arc::new(connector.clone()),
        synth.clone(),
        Arc::new(PcmTranscoder::new()),
        Arc::new(ReadoutMetrics::new()),
        settings,
    );
    Pipeline {
        manager,
        connector,
        synth,
    }
}

fn utterance(guild: GuildId, text: &str) -> Utterance {
    Utterance::new(guild, UserId(100), text, VoiceParams::default(), 40).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_playback_follows_submission_order() {
    let p = pipeline(
        ScriptedSynth::new().frames_per_call(4),
        SessionSettings::default(),
    );
    let session = p.manager.join(GuildId(1), ChannelId(10)).await.unwrap();

    let texts = ["一", "二", "三", "四", "五"];
    for text in texts {
        session.enqueue(utterance(GuildId(1), text)).unwrap();
    }

    let sink = p.connector.sink(GuildId(1)).unwrap();
    sink.wait_for_frames(20).await;

    assert_eq!(p.synth.calls(), texts);
    let tags = sink.frame_tags();
    assert!(tags.windows(2).all(|w| w[0] <= w[1]), "tags {:?}", tags);
    let seqs = sink.frame_seqs();
    for chunk in seqs.chunks(4) {
        assert_eq!(chunk, [0, 1, 2, 3]);
    }
    assert_eq!(p.synth.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_overflow_drops_oldest_and_plays_the_rest() {
    let p = pipeline(
        ScriptedSynth::new()
            .frames_per_call(2)
            .script("hold", SynthStep::Delay(Duration::from_secs(1))),
        SessionSettings {
            queue_capacity: 3,
            ..SessionSettings::default()
        },
    );
    let session = p.manager.join(GuildId(1), ChannelId(10)).await.unwrap();
    let mut state = session.subscribe_state();

    session.enqueue(utterance(GuildId(1), "hold")).unwrap();
    state
        .wait_for(|s| *s == DriverState::Synthesizing)
        .await
        .unwrap();

    for text in ["A", "B", "C"] {
        assert!(matches!(
            session.enqueue(utterance(GuildId(1), text)).unwrap(),
            Admission::Queued
        ));
    }
    match session.enqueue(utterance(GuildId(1), "D")).unwrap() {
        Admission::Displaced(old) => assert_eq!(old.text(), "A"),
        Admission::Queued => panic!("A should have been displaced"),
    }
    assert_eq!(session.queue().pending_texts(), vec!["B", "C", "D"]);

    let sink = p.connector.sink(GuildId(1)).unwrap();
    sink.wait_for_frames(8).await;
    assert_eq!(p.synth.calls(), vec!["hold", "B", "C", "D"]);
}

#[tokio::test(start_paused = true)]
async fn test_failure_is_scoped_to_one_utterance() {
    let p = pipeline(
        ScriptedSynth::new()
            .frames_per_call(3)
            .script("down", SynthStep::Unavailable)
            .script("rejected", SynthStep::Invalid)
            .script("garbled", SynthStep::Garbage),
        SessionSettings::default(),
    );
    let session = p.manager.join(GuildId(1), ChannelId(10)).await.unwrap();
    for text in ["down", "ok1", "rejected", "garbled", "ok2"] {
        session.enqueue(utterance(GuildId(1), text)).unwrap();
    }

    let sink = p.connector.sink(GuildId(1)).unwrap();
    sink.wait_for_frames(6).await;

    // call indices of the two good utterances
    let tags = sink.frame_tags();
    assert_eq!(tags, vec![1, 1, 1, 4, 4, 4]);

    let snap = p.manager.metrics().snapshot();
    assert_eq!(snap.synthesis_failures, 2);
    assert_eq!(snap.decode_failures, 1);
    assert_eq!(snap.utterances_completed, 2);
    assert!(p.manager.is_joined(GuildId(1)));
}

#[tokio::test(start_paused = true)]
async fn test_hung_backend_is_abandoned_after_timeout() {
    let mut settings = SessionSettings::default();
    settings.driver.synthesis_timeout = Duration::from_secs(2);
    let p = pipeline(
        ScriptedSynth::new().script("never", SynthStep::Hang),
        settings,
    );
    let session = p.manager.join(GuildId(1), ChannelId(10)).await.unwrap();
    let mut state = session.subscribe_state();

    let began = Instant::now();
    session.enqueue(utterance(GuildId(1), "never")).unwrap();
    state
        .wait_for(|s| *s == DriverState::Synthesizing)
        .await
        .unwrap();
    state.wait_for(|s| *s == DriverState::Idle).await.unwrap();

    let elapsed = began.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_millis(2100), "took {:?}", elapsed);
    assert_eq!(p.connector.sink(GuildId(1)).unwrap().frame_count(), 0);
    assert_eq!(p.manager.metrics().snapshot().synthesis_timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_leave_mid_stream_halts_frames() {
    let p = pipeline(
        ScriptedSynth::new().frames_per_call(1_000),
        SessionSettings::default(),
    );
    let session = p.manager.join(GuildId(1), ChannelId(10)).await.unwrap();
    let mut state = session.subscribe_state();
    session.enqueue(utterance(GuildId(1), "long story")).unwrap();
    session.enqueue(utterance(GuildId(1), "never heard")).unwrap();

    state
        .wait_for(|s| *s == DriverState::Streaming)
        .await
        .unwrap();
    let sink = p.connector.sink(GuildId(1)).unwrap();
    sink.wait_for_frames(25).await;

    let began = Instant::now();
    p.manager.leave(GuildId(1)).await.unwrap();
    assert!(began.elapsed() < Duration::from_millis(100));
    assert_eq!(*state.borrow(), DriverState::Terminated);
    assert!(sink.is_closed());

    let frozen = sink.frame_count();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(sink.frame_count(), frozen);
    assert_eq!(p.synth.calls(), vec!["long story"]);
    assert!(!p.manager.is_joined(GuildId(1)));
}

#[tokio::test(start_paused = true)]
async fn test_stuck_sink_is_bounded_by_teardown_timeout() {
    let mut settings = SessionSettings::default();
    settings.teardown_timeout = Duration::from_secs(1);
    let p = pipeline(ScriptedSynth::new().frames_per_call(50), settings);
    let session = p.manager.join(GuildId(1), ChannelId(10)).await.unwrap();
    let sink = p.connector.sink(GuildId(1)).unwrap();

    sink.set_stalled(true);
    session.enqueue(utterance(GuildId(1), "stuck")).unwrap();
    let mut state = session.subscribe_state();
    state
        .wait_for(|s| *s == DriverState::Streaming)
        .await
        .unwrap();

    // cancellation reaches the pending send, so leave never needs the abort
    p.manager.leave(GuildId(1)).await.unwrap();
    assert_eq!(sink.frame_count(), 0);
    assert!(p.connector.disconnects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_hung_guild_does_not_slow_another() {
    let p = pipeline(
        ScriptedSynth::new()
            .frames_per_call(100)
            .script("stuck", SynthStep::Hang),
        SessionSettings::default(),
    );
    let g1 = p.manager.join(GuildId(1), ChannelId(10)).await.unwrap();
    let g2 = p.manager.join(GuildId(2), ChannelId(20)).await.unwrap();

    g1.enqueue(utterance(GuildId(1), "stuck")).unwrap();
    let mut g1_state = g1.subscribe_state();
    g1_state
        .wait_for(|s| *s == DriverState::Synthesizing)
        .await
        .unwrap();

    g2.enqueue(utterance(GuildId(2), "flowing")).unwrap();
    let sink = p.connector.sink(GuildId(2)).unwrap();
    sink.wait_for_frames(100).await;

    // after the 5 frame lead, one frame every 20 ms
    let times = sink.frame_times();
    for pair in times[5..].windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= Duration::from_millis(19) && gap <= Duration::from_millis(21),
            "gap {:?}",
            gap
        );
    }
    assert_eq!(g1.driver_state(), DriverState::Synthesizing);
    assert_eq!(p.connector.sink(GuildId(1)).unwrap().frame_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_tears_session_down() {
    let p = pipeline(
        ScriptedSynth::new().frames_per_call(10),
        SessionSettings::default(),
    );
    let session = p.manager.join(GuildId(3), ChannelId(30)).await.unwrap();
    let sink = p.connector.sink(GuildId(3)).unwrap();
    sink.fail_after(3);

    let mut state = session.subscribe_state();
    session.enqueue(utterance(GuildId(3), "bye")).unwrap();
    state
        .wait_for(|s| *s == DriverState::Terminated)
        .await
        .unwrap();

    for _ in 0..100 {
        if !p.manager.is_joined(GuildId(3)) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!p.manager.is_joined(GuildId(3)));
    assert_eq!(p.manager.metrics().snapshot().sessions_left, 1);

    // the guild can be joined again
    p.manager.join(GuildId(3), ChannelId(31)).await.unwrap();
}
