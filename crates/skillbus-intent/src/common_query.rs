//! Common-query arbitration.
//!
//! The arbiter broadcasts `question:query` and collects
//! `question:query.response` messages carrying the same `query_id` until the
//! collection window closes or every expected responder has sent its final
//! answer.  A response with `searching: true` is a "still thinking" signal:
//! the first one extends the window once.
//!
//! Selection: highest tier (exact, general, category), then the longest
//! answer, then first arrival.  The winner's answer is spoken and the skill
//! receives `question:action` for its follow-up; losers hear nothing.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::{Value, json};
use skillbus_kernel::{Message, MessageBus};
use uuid::Uuid;

use crate::invoke::{deadline_after, extend_deadline};
use crate::skill::{QueryAnswer, QueryTier};

/// Query broadcast topic.
pub const QUERY_TOPIC: &str = "question:query";
/// Skill responses to a query.
pub const QUERY_RESPONSE_TOPIC: &str = "question:query.response";
/// Selection sent to the winning skill.
pub const ACTION_TOPIC: &str = "question:action";
/// Published once the winner's follow-up finished.
pub const ACTION_COMPLETE_TOPIC: &str = "question:action.complete";

/// The arbitration winner.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySelection {
    /// Winning skill.
    pub skill_id: String,
    /// Its answer.
    pub answer: QueryAnswer,
}

/// Collects knowledge answers and picks one.
#[derive(Clone)]
pub struct CommonQueryArbiter {
    bus: MessageBus,
    window: Duration,
    extension: Duration,
    action_timeout: Duration,
}

impl CommonQueryArbiter {
    /// Create an arbiter.
    pub fn new(bus: MessageBus, window: Duration, extension: Duration, action_timeout: Duration) -> Self {
        Self {
            bus,
            window,
            extension,
            action_timeout,
        }
    }

    /// Ask `responders` about `phrase`.  Returns `None` when no answer
    /// arrived, so the caller moves on to the fallback chain.
    pub async fn ask(
        &self,
        message: &Message,
        phrase: &str,
        lang: &str,
        responders: &[String],
    ) -> Option<QuerySelection> {
        if responders.is_empty() {
            return None;
        }
        let query_id = Uuid::now_v7().to_string();
        let candidates = self.collect(message, phrase, lang, &query_id, responders).await;
        tracing::debug!(query_id = %query_id, candidates = candidates.len(), "common query window closed");

        let selection = select(candidates)?;
        tracing::info!(
            skill_id = %selection.skill_id,
            tier = ?selection.answer.tier,
            "common query answer selected"
        );

        self.bus.publish(message.forward(
            "speak",
            json!({
                "utterance": selection.answer.answer,
                "expect_response": false,
                "lang": lang,
                "meta": { "skill": selection.skill_id },
            }),
        ));
        let action = message.forward(
            ACTION_TOPIC,
            json!({
                "skill_id": selection.skill_id,
                "phrase": selection.answer.phrase,
                "answer": selection.answer.answer,
                "callback_data": selection.answer.payload,
                "candidate": selection.answer,
            }),
        );
        if self
            .bus
            .emit_and_wait(action, ACTION_COMPLETE_TOPIC, self.action_timeout)
            .await
            .is_none()
        {
            tracing::warn!(skill_id = %selection.skill_id, "common query follow-up did not complete");
        }
        Some(selection)
    }

    // -- Private helpers ----------------------------------------------------

    async fn collect(
        &self,
        message: &Message,
        phrase: &str,
        lang: &str,
        query_id: &str,
        responders: &[String],
    ) -> Vec<(String, QueryAnswer)> {
        let (subscription, mut rx) = self.bus.on_channel(QUERY_RESPONSE_TOPIC);
        self.bus.publish(message.forward(
            QUERY_TOPIC,
            json!({ "phrase": phrase, "lang": lang, "query_id": query_id }),
        ));

        let mut pending: HashSet<&str> = responders.iter().map(String::as_str).collect();
        let mut candidates = Vec::new();
        let mut deadline = deadline_after(self.window);
        let mut extended = false;

        while !pending.is_empty() {
            let response = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(response)) => response,
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(query_id = %query_id, missing = pending.len(), "common query window elapsed");
                    break;
                }
            };
            if response.data_str("query_id") != Some(query_id) {
                continue;
            }
            let Some(skill_id) = response.data_str("skill_id") else {
                continue;
            };

            if response.data_bool("searching") {
                if !extended {
                    extended = true;
                    deadline = extend_deadline(deadline, self.extension);
                    tracing::debug!(skill_id = %skill_id, "common query window extended");
                }
                continue;
            }

            pending.remove(skill_id);
            if let Some(answer) = parse_answer(&response, phrase) {
                candidates.push((skill_id.to_string(), answer));
            }
        }

        self.bus.remove(QUERY_RESPONSE_TOPIC, subscription);
        candidates
    }
}

/// Read a final response into a [`QueryAnswer`].  Responses without a
/// non-empty answer are not candidates.
fn parse_answer(response: &Message, phrase: &str) -> Option<QueryAnswer> {
    let answer = response.data_str("answer")?.trim();
    if answer.is_empty() {
        return None;
    }
    let tier = response
        .data
        .get("tier")
        .cloned()
        .and_then(|t| serde_json::from_value::<QueryTier>(t).ok())
        .unwrap_or(QueryTier::General);
    Some(QueryAnswer {
        phrase: response.data_str("phrase").unwrap_or(phrase).to_string(),
        tier,
        answer: answer.to_string(),
        payload: response
            .data
            .get("callback_data")
            .cloned()
            .unwrap_or(Value::Null),
    })
}

/// Best candidate in arrival order; later arrivals must be strictly better.
fn select(candidates: Vec<(String, QueryAnswer)>) -> Option<QuerySelection> {
    let mut best: Option<(String, QueryAnswer)> = None;
    for (skill_id, answer) in candidates {
        let better = best.as_ref().is_none_or(|(_, b)| {
            (answer.tier.rank(), answer.answer.chars().count()) > (b.tier.rank(), b.answer.chars().count())
        });
        if better {
            best = Some((skill_id, answer));
        }
    }
    best.map(|(skill_id, answer)| QuerySelection { skill_id, answer })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
