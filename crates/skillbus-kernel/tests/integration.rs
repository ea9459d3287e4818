//! Integration tests for the skillbus-kernel crate.
//!
//! These tests exercise the message bus, session registry, configuration and
//! dialog library as integrated subsystems.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use skillbus_kernel::{
    ConfigLayer, Configuration, DialogLibrary, LayerKind, Message, MessageBus, SESSION_CLOSED,
    SessionRegistry,
};

// ═══════════════════════════════════════════════════════════════════════
//  Message bus integration
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn bus_firehose_sees_messages_in_publication_order() {
    let bus = MessageBus::new(64);
    let mut rx = bus.subscribe();

    for topic in ["a", "b", "c"] {
        bus.publish(Message::new(topic, json!({})));
    }

    for expected in ["a", "b", "c"] {
        let m = rx.recv().await.unwrap();
        assert_eq!(m.msg_type, expected);
    }
}

#[tokio::test]
async fn bus_handler_replies_keep_routing_pair() {
    let bus = MessageBus::new(64);
    let responder = bus.clone();
    bus.on("ping", move |m| {
        responder.publish(m.reply("pong", json!({})));
    });

    let request = Message::new("ping", json!({})).with_context(json!({
        "source": "A",
        "destination": "B",
    }));
    let reply = bus
        .emit_and_wait(request, "pong", Duration::from_secs(1))
        .await
        .expect("pong");

    assert_eq!(reply.source(), Some("B"));
    assert_eq!(reply.destination(), Some("A"));
}

#[tokio::test]
async fn bus_deferred_handler_runs_on_its_own_task() {
    let bus = MessageBus::new(64);
    let (_, mut rx) = bus.on_channel("work");
    let done = Arc::new(Mutex::new(Vec::new()));

    let d = Arc::clone(&done);
    let worker = tokio::spawn(async move {
        while let Some(m) = rx.recv().await {
            let n = m.data.get("n").and_then(|v| v.as_i64()).unwrap();
            d.lock().unwrap().push(n);
            if n == 2 {
                break;
            }
        }
    });

    for n in 0..3 {
        bus.publish(Message::new("work", json!({"n": n})));
    }
    worker.await.unwrap();
    assert_eq!(*done.lock().unwrap(), vec![0, 1, 2]);
}

// ═══════════════════════════════════════════════════════════════════════
//  Session registry integration
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn session_close_publishes_once_and_signals() {
    let bus = MessageBus::new(64);
    let (_, mut closed) = bus.on_channel(SESSION_CLOSED);
    let registry = SessionRegistry::new(bus.clone(), "en-us");

    registry.activate("car", "music");
    let mut signal = registry.closed_signal("car");

    assert!(registry.close("car"));
    assert!(!registry.close("car"));

    signal.changed().await.unwrap();
    assert!(*signal.borrow());

    let event = closed.recv().await.unwrap();
    assert_eq!(event.session_id(), "car");
    assert!(closed.try_recv().is_err());
}

#[tokio::test]
async fn session_sweeper_reclaims_expired_sessions() {
    let registry = SessionRegistry::with_ttl(MessageBus::new(16), "en-us", Duration::from_millis(10));
    registry.get_or_create("idle");

    let sweeper = registry.spawn_sweeper(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(120)).await;
    sweeper.abort();

    assert!(registry.get("idle").is_none());
}

#[test]
fn session_activation_lists_are_per_session() {
    let registry = SessionRegistry::new(MessageBus::new(16), "en-us");
    registry.activate("kitchen", "timer");
    registry.activate("kitchen", "music");
    registry.activate("bedroom", "alarm");

    assert_eq!(registry.active_skills("kitchen"), vec!["music", "timer"]);
    assert_eq!(registry.active_skills("bedroom"), vec!["alarm"]);
    assert_eq!(registry.list_active().len(), 2);
}

// ═══════════════════════════════════════════════════════════════════════
//  Configuration integration
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn config_stack_with_env_override() {
    let env = ConfigLayer::from_env_vars(
        "SKILLBUS",
        vec![("SKILLBUS__SKILLS__PRIORITY_SKILLS".to_string(), r#"["wiki"]"#.to_string())],
    );
    let config = Configuration::load(vec![ConfigLayer::defaults().unwrap(), env], false);

    assert_eq!(config.lookup_strings("skills.priority_skills", &[]), vec!["wiki"]);
    assert_eq!(config.lookup_str("lang", ""), "en-us");
}

#[tokio::test]
async fn config_subscribers_observe_cached_resolution() {
    let config = Configuration::new().unwrap();
    let mut rx = config.subscribe();

    let remote = ConfigLayer::new("remote", LayerKind::Remote, json!({"lang": "it-it"})).unwrap();
    let stack = vec![ConfigLayer::defaults().unwrap(), remote];
    config.resolve_stack(Some(stack.as_slice()), true, true);

    rx.changed().await.unwrap();
    assert_eq!(rx.borrow()["lang"], json!("it-it"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Dialog library integration
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn dialog_library_shared_between_clones() {
    let library = DialogLibrary::new();
    let clone = library.clone();
    clone.register("en-us", "unknown", ["I don't know how to help with that"]);

    assert_eq!(
        library.get_dialog("unknown", "en-us", &HashMap::new()),
        "I don't know how to help with that"
    );
}
