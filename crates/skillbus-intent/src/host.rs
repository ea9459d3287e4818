//! Skill host: bus wiring for the query and play capabilities.
//!
//! The arbiters only speak bus messages.  The host answers them on behalf of
//! registered skills:
//!
//! - `question:query` -- every common-query skill replies on
//!   `question:query.response`, first `searching: true`, then its final
//!   answer (or none) with `searching: false`.
//! - `ovos.common_play.query` -- one-shot skills reply once; streaming
//!   skills reply once per candidate pulled before the query's
//!   `timeout_ms` deadline.  Both end with `searching: false`.
//! - `question:action` / `ovos.common_play.start` -- routed to the named
//!   winner, followed by the matching `.complete` message.
//!
//! Every skill call runs bounded on its own task.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use skillbus_kernel::{Message, MessageBus};
use tokio::task::JoinHandle;

use crate::common_play::{PLAY_QUERY_TOPIC, PLAY_START_COMPLETE_TOPIC, PLAY_START_TOPIC};
use crate::common_query::{ACTION_COMPLETE_TOPIC, ACTION_TOPIC, QUERY_TOPIC};
use crate::error::IntentError;
use crate::invoke::{Invocation, deadline_after, invoke};
use crate::skill::{
    CommonQuerySkill, ContextFactory, MediaCandidate, MediaType, PlayCapability, QueryAnswer,
    QueryTier, SkillRegistry,
};

/// Answers arbiter traffic for the skills in a [`SkillRegistry`].
#[derive(Clone)]
pub struct SkillHost {
    bus: MessageBus,
    skills: SkillRegistry,
    contexts: ContextFactory,
    default_lang: String,
    call_timeout: Duration,
}

impl SkillHost {
    /// Create a host.  `call_timeout` bounds every skill call it makes.
    pub fn new(
        bus: MessageBus,
        skills: SkillRegistry,
        contexts: ContextFactory,
        default_lang: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            skills,
            contexts,
            default_lang: default_lang.into(),
            call_timeout,
        }
    }

    /// Subscribe to the arbiter topics and serve them until the returned
    /// tasks are aborted.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.serve(QUERY_TOPIC, |host, message| {
                tokio::spawn(async move { host.answer_query(message).await });
            }),
            self.serve(ACTION_TOPIC, |host, message| {
                tokio::spawn(async move { host.run_action(message).await });
            }),
            self.serve(PLAY_QUERY_TOPIC, |host, message| {
                tokio::spawn(async move { host.answer_play(message).await });
            }),
            self.serve(PLAY_START_TOPIC, |host, message| {
                tokio::spawn(async move { host.run_start(message).await });
            }),
        ]
    }

    // -- Private helpers ----------------------------------------------------

    fn serve<F>(&self, topic: &'static str, on_message: F) -> JoinHandle<()>
    where
        F: Fn(SkillHost, Arc<Message>) + Send + 'static,
    {
        let (subscription, mut rx) = self.bus.on_channel(topic);
        let host = self.clone();
        tokio::spawn(async move {
            tracing::debug!(topic, "skill host serving");
            while let Some(message) = rx.recv().await {
                on_message(host.clone(), message);
            }
            host.bus.remove(topic, subscription);
        })
    }

    fn lang_of(&self, message: &Message) -> String {
        message.lang().unwrap_or(&self.default_lang).to_string()
    }

    async fn answer_query(&self, message: Arc<Message>) {
        let phrase = message.data_str("phrase").unwrap_or_default().to_string();
        let query_id = message.data_str("query_id").unwrap_or_default().to_string();
        let lang = self.lang_of(&message);

        let responders = self.skills.with(|s| s.common_query.is_some());
        let mut tasks = Vec::with_capacity(responders.len());
        for handle in responders {
            let Some(skill) = handle.common_query.clone() else {
                continue;
            };
            let skill_id = handle.id().to_string();
            let (bus, message) = (self.bus.clone(), Arc::clone(&message));
            let (phrase, query_id, lang) = (phrase.clone(), query_id.clone(), lang.clone());
            let timeout = self.call_timeout;

            tasks.push(tokio::spawn(async move {
                let base = json!({ "phrase": phrase, "skill_id": skill_id, "query_id": query_id });
                bus.publish(message.response(with(&base, json!({ "searching": true }))));

                let call = {
                    let (phrase, lang) = (phrase.clone(), lang.clone());
                    async move { Ok::<_, IntentError>(skill.match_query(&phrase, &lang).await) }
                };
                let final_data = match invoke("common_query", &skill_id, timeout, None, call).await {
                    Invocation::Completed(Some(answer)) => with(
                        &base,
                        json!({
                            "searching": false,
                            "answer": answer.answer,
                            "tier": answer.tier,
                            "callback_data": answer.payload,
                        }),
                    ),
                    _ => with(&base, json!({ "searching": false })),
                };
                bus.publish(message.response(final_data));
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn run_action(&self, message: Arc<Message>) {
        let skill_id = message.data_str("skill_id").unwrap_or_default().to_string();
        let skill: Option<Arc<dyn CommonQuerySkill>> =
            self.skills.get(&skill_id).and_then(|h| h.common_query.clone());

        match skill {
            Some(skill) => {
                let answer = answer_from_action(&message);
                let ctx = self.contexts.context(&skill_id, &message, &self.lang_of(&message));
                let call = async move { skill.on_selected(ctx, answer).await };
                invoke("common_query_action", &skill_id, self.call_timeout, None, call).await;
            }
            None => tracing::warn!(skill_id = %skill_id, "question:action for unknown skill"),
        }
        self.bus
            .publish(message.forward(ACTION_COMPLETE_TOPIC, json!({ "skill_id": skill_id })));
    }

    async fn answer_play(&self, message: Arc<Message>) {
        let phrase = message.data_str("phrase").unwrap_or_default().to_string();
        let query_id = message.data_str("query_id").unwrap_or_default().to_string();
        let media_type: MediaType = message
            .data
            .get("media_type")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let window = message
            .data
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(self.call_timeout);

        let responders = self.skills.with(|s| s.common_play.is_some());
        let mut tasks = Vec::with_capacity(responders.len());
        for handle in responders {
            let Some(capability) = handle.common_play.clone() else {
                continue;
            };
            let skill_id = handle.id().to_string();
            let (bus, message) = (self.bus.clone(), Arc::clone(&message));
            let (phrase, query_id) = (phrase.clone(), query_id.clone());
            let timeout = self.call_timeout;

            tasks.push(tokio::spawn(async move {
                let base = json!({ "phrase": phrase, "skill_id": skill_id, "query_id": query_id });
                match capability {
                    PlayCapability::Legacy(skill) => {
                        let call = {
                            let phrase = phrase.clone();
                            async move { Ok::<_, IntentError>(skill.match_query(&phrase, media_type).await) }
                        };
                        if let Invocation::Completed(Some((title, tier, payload))) =
                            invoke("common_play", &skill_id, timeout, None, call).await
                        {
                            let result = json!({
                                "legacy": true,
                                "title": title,
                                "tier": tier,
                                "payload": payload,
                            });
                            bus.publish(message.response(with(
                                &base,
                                json!({ "searching": false, "result": result }),
                            )));
                            return;
                        }
                    }
                    PlayCapability::Streaming(skill) => {
                        let deadline = deadline_after(window);
                        let mut results = skill.search(&phrase, media_type);
                        let mut pulled = 0usize;
                        loop {
                            match tokio::time::timeout_at(deadline, results.next()).await {
                                Ok(Some(candidate)) => {
                                    pulled += 1;
                                    bus.publish(message.response(with(
                                        &base,
                                        json!({ "searching": true, "result": candidate }),
                                    )));
                                }
                                Ok(None) => break,
                                Err(_) => {
                                    tracing::debug!(skill_id = %skill_id, pulled, "search deadline passed, stream dropped");
                                    break;
                                }
                            }
                        }
                    }
                }
                bus.publish(message.response(with(&base, json!({ "searching": false }))));
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn run_start(&self, message: Arc<Message>) {
        let skill_id = message.data_str("skill_id").unwrap_or_default().to_string();
        let phrase = message.data_str("phrase").unwrap_or_default().to_string();
        let candidate: Option<MediaCandidate> = message
            .data
            .get("candidate")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());
        let capability = self.skills.get(&skill_id).and_then(|h| h.common_play.clone());
        let ctx = self.contexts.context(&skill_id, &message, &self.lang_of(&message));

        match (capability, candidate) {
            (Some(PlayCapability::Legacy(skill)), Some(candidate)) => {
                let call = async move { skill.start(ctx, phrase, candidate.payload).await };
                invoke("common_play_start", &skill_id, self.call_timeout, None, call).await;
            }
            (Some(PlayCapability::Streaming(skill)), Some(candidate)) => {
                let call = async move { skill.start(ctx, candidate).await };
                invoke("common_play_start", &skill_id, self.call_timeout, None, call).await;
            }
            _ => tracing::warn!(skill_id = %skill_id, "cannot start playback: unknown skill or candidate"),
        }
        self.bus
            .publish(message.forward(PLAY_START_COMPLETE_TOPIC, json!({ "skill_id": skill_id })));
    }
}

/// `base` with the fields of `extra` added.
fn with(base: &Value, extra: Value) -> Value {
    let mut merged = base.clone();
    if let (Value::Object(target), Value::Object(fields)) = (&mut merged, extra) {
        target.extend(fields);
    }
    merged
}

fn answer_from_action(message: &Message) -> QueryAnswer {
    message
        .data
        .get("candidate")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_else(|| QueryAnswer {
            phrase: message.data_str("phrase").unwrap_or_default().to_string(),
            tier: QueryTier::General,
            answer: message.data_str("answer").unwrap_or_default().to_string(),
            payload: message.data.get("callback_data").cloned().unwrap_or(Value::Null),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
