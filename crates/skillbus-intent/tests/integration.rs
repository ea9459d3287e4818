//! Integration tests for the skillbus-intent crate.
//!
//! Every test drives a started [`IntentService`] purely through the bus:
//! an utterance goes in on `recognizer_loop:utterance` and the recorded
//! traffic is checked up to the `ovos.utterance.handled` marker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Value, json};
use skillbus_intent::{
    CommonQuerySkill, CoreSettings, FallbackHandler, IntentHandler, IntentMatch, IntentService,
    LegacyPlaySkill, MediaCandidate, MediaSearchSkill, MediaTier, MediaType, PlaybackType,
    QueryAnswer, QueryTier, Result, SessionStop, SkillContext, SkillHandle, UTTERANCE_TOPIC,
};
use skillbus_kernel::{Message, MessageBus, Session};
use tokio::sync::broadcast;

const EOF: &str = "ovos.utterance.handled";

fn settings() -> CoreSettings {
    CoreSettings {
        handler_timeout: Duration::from_millis(300),
        fallback_timeout: Duration::from_millis(300),
        query_timeout: Duration::from_millis(200),
        query_extension: Duration::from_millis(200),
        play_timeout: Duration::from_millis(200),
        ..CoreSettings::default()
    }
}

fn service() -> (MessageBus, IntentService) {
    let bus = MessageBus::new(256);
    let service = IntentService::with_settings(bus.clone(), settings());
    (bus, service)
}

/// Publish `message` and collect the traffic up to and including the first
/// EOF marker.
async fn dispatch(bus: &MessageBus, message: Message) -> Vec<Arc<Message>> {
    let mut rx = bus.subscribe();
    bus.publish(message);
    record_until_eof(&mut rx).await
}

async fn record_until_eof(rx: &mut broadcast::Receiver<Arc<Message>>) -> Vec<Arc<Message>> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while let Ok(Ok(m)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        let done = m.msg_type == EOF;
        seen.push(m);
        if done {
            break;
        }
    }
    seen
}

fn topics(seen: &[Arc<Message>]) -> Vec<&str> {
    seen.iter().map(|m| m.msg_type.as_str()).collect()
}

fn spoken(seen: &[Arc<Message>]) -> Vec<String> {
    seen.iter()
        .filter(|m| m.msg_type == "speak")
        .filter_map(|m| m.data_str("utterance").map(str::to_string))
        .collect()
}

fn utterance(text: &str) -> Message {
    Message::new(UTTERANCE_TOPIC, json!({ "utterances": [text] }))
}

// -- Fixture skills ---------------------------------------------------------

struct Say(&'static str);

#[async_trait]
impl IntentHandler for Say {
    async fn handle(&self, ctx: SkillContext, _intent: &IntentMatch) -> Result<()> {
        ctx.speak(self.0);
        Ok(())
    }
}

struct Verdict {
    handled: bool,
    calls: Arc<Mutex<Vec<&'static str>>>,
    name: &'static str,
}

#[async_trait]
impl FallbackHandler for Verdict {
    async fn handle_fallback(&self, ctx: SkillContext) -> Result<bool> {
        self.calls.lock().unwrap().push(self.name);
        if self.handled {
            ctx.speak(self.name);
        }
        Ok(self.handled)
    }
}

struct Forever;

#[async_trait]
impl FallbackHandler for Forever {
    async fn handle_fallback(&self, _ctx: SkillContext) -> Result<bool> {
        std::future::pending::<()>().await;
        Ok(true)
    }
}

struct Facts;

#[async_trait]
impl CommonQuerySkill for Facts {
    async fn match_query(&self, phrase: &str, _lang: &str) -> Option<QueryAnswer> {
        phrase.contains("capital of france").then(|| QueryAnswer {
            phrase: phrase.to_string(),
            tier: QueryTier::Exact,
            answer: "Paris is the capital of France".into(),
            payload: json!({ "image": "paris.png" }),
        })
    }
}

struct Jukebox;

#[async_trait]
impl LegacyPlaySkill for Jukebox {
    async fn match_query(&self, phrase: &str, _media_type: MediaType) -> Option<(String, MediaTier, Value)> {
        phrase
            .contains("metallica")
            .then(|| ("Metallica radio".to_string(), MediaTier::Artist, json!({ "station": 7 })))
    }

    async fn start(&self, ctx: SkillContext, _phrase: String, _payload: Value) -> Result<()> {
        ctx.speak("jukebox playing");
        Ok(())
    }
}

struct Catalog;

#[async_trait]
impl MediaSearchSkill for Catalog {
    fn search(&self, phrase: &str, media_type: MediaType) -> BoxStream<'static, MediaCandidate> {
        let hit = phrase.contains("metallica");
        let candidates = (0..2).filter(move |_| hit).map(move |i| MediaCandidate {
            title: format!("Master of Puppets take {i}"),
            tier: MediaTier::Exact,
            score: 95.0 - f64::from(i),
            media_type,
            playback: PlaybackType::Audio,
            uri: Some(format!("file://music/{i}.mp3")),
            metadata: json!({}),
            payload: json!({ "track": i }),
        });
        stream::iter(candidates).boxed()
    }

    async fn start(&self, ctx: SkillContext, candidate: MediaCandidate) -> Result<()> {
        ctx.speak(&format!("now playing {}", candidate.title));
        Ok(())
    }
}

#[derive(Default)]
struct Player {
    playing: Mutex<bool>,
}

#[async_trait]
impl SessionStop for Player {
    async fn stop_session(&self, _session: &Session) -> bool {
        std::mem::replace(&mut *self.playing.lock().unwrap(), false)
    }
}

#[async_trait]
impl IntentHandler for Player {
    async fn handle(&self, ctx: SkillContext, _intent: &IntentMatch) -> Result<()> {
        *self.playing.lock().unwrap() = true;
        ctx.speak("playing white noise");
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Terminal sequence
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn empty_skill_set_emits_failure_sequence() {
    let (bus, service) = service();
    let _tasks = service.start();

    let seen = dispatch(&bus, utterance("hello world")).await;
    assert_eq!(
        topics(&seen),
        vec![UTTERANCE_TOPIC, "mycroft.audio.play_sound", "complete_intent_failure", EOF]
    );
    assert_eq!(seen[1].data_str("uri"), Some("snd/error.mp3"));
}

#[tokio::test]
async fn routing_pair_is_preserved_on_every_message() {
    let (bus, service) = service();
    let _tasks = service.start();

    let msg = utterance("hello world").with_context(json!({ "source": "A", "destination": "B" }));
    let seen = dispatch(&bus, msg).await;
    assert_eq!(seen.len(), 4);
    for m in &seen {
        assert_eq!(m.source(), Some("A"), "{}", m.msg_type);
        assert_eq!(m.destination(), Some("B"), "{}", m.msg_type);
    }
}

#[tokio::test]
async fn one_eof_per_utterance() {
    let (bus, service) = service();
    service
        .register_skill(SkillHandle::new("hello").regex_intent("hi", r"^hi$", Arc::new(Say("hello"))))
        .unwrap();
    let _tasks = service.start();

    for text in ["hi", "nothing matches this", "hi"] {
        let seen = dispatch(&bus, utterance(text)).await;
        assert_eq!(topics(&seen).iter().filter(|t| **t == EOF).count(), 1);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Intents
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn alternatives_are_tried_in_order() {
    let (bus, service) = service();
    service
        .register_skill(
            SkillHandle::new("weather")
                .regex_entity("Location", r".*(at|in) (?P<Location>.+)$")
                .regex_intent("forecast", r"^(what is the )?weather\b.*$", Arc::new(Say("sunny"))),
        )
        .unwrap();
    let _tasks = service.start();

    let msg = Message::new(
        UTTERANCE_TOPIC,
        json!({ "utterances": ["whether in paris", "weather in paris"] }),
    );
    let seen = dispatch(&bus, msg).await;
    let intent = seen.iter().find(|m| m.msg_type == "weather:forecast").unwrap();
    assert_eq!(intent.data["entities"]["Location"], "paris");
    assert_eq!(spoken(&seen), vec!["sunny"]);
    assert!(topics(&seen).contains(&"mycroft.skill.handler.complete"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Arbiters
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn common_query_answer_is_spoken_before_eof() {
    let (bus, service) = service();
    service
        .register_skill(SkillHandle::new("facts").common_query(Arc::new(Facts)))
        .unwrap();
    let _tasks = service.start();

    let seen = dispatch(&bus, utterance("what is the capital of france")).await;
    assert_eq!(spoken(&seen), vec!["Paris is the capital of France"]);
    let t = topics(&seen);
    let complete = t.iter().position(|t| *t == "question:action.complete").unwrap();
    assert!(complete < t.len() - 1);
    assert!(!t.contains(&"complete_intent_failure"));
    assert_eq!(service.sessions().active_skills("default"), vec!["facts"]);
}

#[tokio::test]
async fn unanswered_query_reaches_fallbacks() {
    let (bus, service) = service();
    let calls = Arc::new(Mutex::new(Vec::new()));
    service
        .register_skill(SkillHandle::new("facts").common_query(Arc::new(Facts)))
        .unwrap();
    service
        .register_skill(SkillHandle::new("unknown").fallback(
            100,
            Arc::new(Verdict {
                handled: true,
                calls: Arc::clone(&calls),
                name: "unknown",
            }),
        ))
        .unwrap();
    let _tasks = service.start();

    let seen = dispatch(&bus, utterance("how tall is mount everest")).await;
    assert_eq!(spoken(&seen), vec!["unknown"]);
    assert_eq!(*calls.lock().unwrap(), vec!["unknown"]);
}

#[tokio::test]
async fn streaming_exact_candidate_beats_legacy_artist() {
    let (bus, service) = service();
    service
        .register_skill(SkillHandle::new("jukebox").legacy_play(Arc::new(Jukebox)))
        .unwrap();
    service
        .register_skill(SkillHandle::new("catalog").media_search(Arc::new(Catalog)))
        .unwrap();
    let _tasks = service.start();

    let seen = dispatch(&bus, utterance("play metallica")).await;
    assert_eq!(spoken(&seen), vec!["now playing Master of Puppets take 0"]);
    assert_eq!(service.sessions().active_skills("default"), vec!["catalog"]);
}

#[tokio::test]
async fn legacy_candidate_wins_alone() {
    let (bus, service) = service();
    service
        .register_skill(SkillHandle::new("jukebox").legacy_play(Arc::new(Jukebox)))
        .unwrap();
    let _tasks = service.start();

    let seen = dispatch(&bus, utterance("put on metallica")).await;
    assert_eq!(spoken(&seen), vec!["jukebox playing"]);
}

// ═══════════════════════════════════════════════════════════════════════
//  Fallbacks and cancellation
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn slow_fallback_is_cancelled_and_next_runs() {
    let (bus, service) = service();
    let calls = Arc::new(Mutex::new(Vec::new()));
    service
        .register_skill(SkillHandle::new("slow").fallback(20, Arc::new(Forever)))
        .unwrap();
    service
        .register_skill(SkillHandle::new("unknown").fallback(
            100,
            Arc::new(Verdict {
                handled: true,
                calls: Arc::clone(&calls),
                name: "unknown",
            }),
        ))
        .unwrap();
    let _tasks = service.start();

    let seen = dispatch(&bus, utterance("bork the zork")).await;
    assert_eq!(spoken(&seen), vec!["unknown"]);
    assert_eq!(topics(&seen).last(), Some(&EOF));
}

#[tokio::test]
async fn session_close_cancels_running_fallback() {
    let (bus, service) = service();
    service
        .register_skill(SkillHandle::new("slow").fallback(20, Arc::new(Forever)))
        .unwrap();

    let msg = utterance("bork").with_session("kitchen");
    let running = {
        let service = service.clone();
        tokio::spawn(async move { service.handle_utterance(&msg).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut rx = bus.subscribe();
    assert!(service.sessions().close("kitchen"));

    let outcome = running.await.unwrap();
    assert_eq!(outcome, skillbus_intent::DispatchOutcome::Cancelled);
    let seen = record_until_eof(&mut rx).await;
    assert_eq!(topics(&seen), vec!["ovos.session.closed", EOF]);
}

#[tokio::test]
async fn deactivated_fallback_is_skipped_until_reregistered() {
    let (bus, service) = service();
    let calls = Arc::new(Mutex::new(Vec::new()));

    struct Once;

    #[async_trait]
    impl FallbackHandler for Once {
        async fn handle_fallback(&self, ctx: SkillContext) -> Result<bool> {
            ctx.speak("once");
            ctx.deactivate_fallback();
            Ok(true)
        }
    }

    service
        .register_skill(SkillHandle::new("once").fallback(10, Arc::new(Once)))
        .unwrap();
    service
        .register_skill(SkillHandle::new("unknown").fallback(
            100,
            Arc::new(Verdict {
                handled: true,
                calls: Arc::clone(&calls),
                name: "unknown",
            }),
        ))
        .unwrap();
    let _tasks = service.start();

    assert_eq!(spoken(&dispatch(&bus, utterance("first")).await), vec!["once"]);
    assert_eq!(spoken(&dispatch(&bus, utterance("second")).await), vec!["unknown"]);
}

// ═══════════════════════════════════════════════════════════════════════
//  Stop
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stop_command_stops_active_session_skill() {
    let (bus, service) = service();
    let player = Arc::new(Player::default());
    service
        .register_skill(
            SkillHandle::new("noise")
                .regex_intent("start", r"^white noise$", player.clone())
                .session_stop(player.clone()),
        )
        .unwrap();
    let _tasks = service.start();

    dispatch(&bus, utterance("white noise").with_session("bedroom")).await;
    assert_eq!(service.sessions().active_skills("bedroom"), vec!["noise"]);

    let seen = dispatch(&bus, utterance("Stop!").with_session("bedroom")).await;
    let handled = seen.iter().find(|m| m.msg_type == "mycroft.stop.handled").unwrap();
    assert_eq!(handled.data_str("skill_id"), Some("noise"));
    assert!(!topics(&seen).contains(&"complete_intent_failure"));
    assert!(service.sessions().active_skills("bedroom").is_empty());
}

#[tokio::test]
async fn stop_with_nothing_to_stop_falls_through() {
    let (bus, service) = service();
    let _tasks = service.start();

    let seen = dispatch(&bus, utterance("stop")).await;
    assert!(topics(&seen).contains(&"complete_intent_failure"));
}
