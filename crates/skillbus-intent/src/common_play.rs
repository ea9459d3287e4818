//! Common-play arbitration.
//!
//! A common-play frame is an utterance that opens with one of the configured
//! play verbs ("play", "put on", ...).  The arbiter broadcasts
//! `ovos.common_play.query` with the phrase after the verb and a
//! `timeout_ms` deadline, then collects `ovos.common_play.query.response`
//! messages until the window closes or every media skill sent its final
//! `searching: false`.
//!
//! Two result shapes arrive and are normalized here:
//!
//! - one-shot results (`legacy: true`) carry a title, a tier and a payload;
//!   their score is the tier's nominal score.
//! - streamed results carry a full candidate; a missing tier is derived
//!   from the score.
//!
//! Selection: highest tier, then highest score, then first arrival.  The
//! winning candidate goes back to its skill via `ovos.common_play.start`.

use std::collections::HashSet;
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::{Value, json};
use skillbus_kernel::{Message, MessageBus};
use uuid::Uuid;

use crate::invoke::deadline_after;
use crate::skill::{MediaCandidate, MediaTier, MediaType, PlaybackType};

/// Media query broadcast topic.
pub const PLAY_QUERY_TOPIC: &str = "ovos.common_play.query";
/// Skill responses to a media query.
pub const PLAY_RESPONSE_TOPIC: &str = "ovos.common_play.query.response";
/// Selection sent to the winning skill.
pub const PLAY_START_TOPIC: &str = "ovos.common_play.start";
/// Published once the winner started playback.
pub const PLAY_START_COMPLETE_TOPIC: &str = "ovos.common_play.start.complete";

/// The arbitration winner.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaySelection {
    /// Winning skill.
    pub skill_id: String,
    /// Its normalized candidate.
    pub candidate: MediaCandidate,
}

/// Detects play frames and arbitrates media candidates.
#[derive(Clone)]
pub struct CommonPlayArbiter {
    bus: MessageBus,
    window: Duration,
    start_timeout: Duration,
    frame: Option<Regex>,
}

impl CommonPlayArbiter {
    /// Create an arbiter recognizing `verbs` as frame openers.
    pub fn new(bus: MessageBus, window: Duration, start_timeout: Duration, verbs: &[String]) -> Self {
        Self {
            bus,
            window,
            start_timeout,
            frame: frame_regex(verbs),
        }
    }

    /// The phrase and media type of a play frame, or `None` when the
    /// utterance is not one.
    pub fn detect(&self, utterance: &str) -> Option<(String, MediaType)> {
        let caps = self.frame.as_ref()?.captures(utterance.trim())?;
        let phrase = caps.name("phrase")?.as_str().trim().to_lowercase();
        if phrase.is_empty() {
            return None;
        }
        let media_type = MediaType::detect(&phrase);
        Some((phrase, media_type))
    }

    /// Query `responders` for `phrase` and start the winner.
    pub async fn play(
        &self,
        message: &Message,
        phrase: &str,
        media_type: MediaType,
        responders: &[String],
    ) -> Option<PlaySelection> {
        if responders.is_empty() {
            return None;
        }
        let query_id = Uuid::now_v7().to_string();
        let candidates = self
            .collect(message, phrase, media_type, &query_id, responders)
            .await;
        tracing::debug!(query_id = %query_id, candidates = candidates.len(), "common play window closed");

        let selection = select(candidates)?;
        tracing::info!(
            skill_id = %selection.skill_id,
            title = %selection.candidate.title,
            tier = ?selection.candidate.tier,
            score = selection.candidate.score,
            "media candidate selected"
        );

        let start = message.forward(
            PLAY_START_TOPIC,
            json!({
                "skill_id": selection.skill_id,
                "phrase": phrase,
                "candidate": selection.candidate,
            }),
        );
        if self
            .bus
            .emit_and_wait(start, PLAY_START_COMPLETE_TOPIC, self.start_timeout)
            .await
            .is_none()
        {
            tracing::warn!(skill_id = %selection.skill_id, "media playback start did not complete");
        }
        Some(selection)
    }

    // -- Private helpers ----------------------------------------------------

    async fn collect(
        &self,
        message: &Message,
        phrase: &str,
        media_type: MediaType,
        query_id: &str,
        responders: &[String],
    ) -> Vec<(String, MediaCandidate)> {
        let (subscription, mut rx) = self.bus.on_channel(PLAY_RESPONSE_TOPIC);
        self.bus.publish(message.forward(
            PLAY_QUERY_TOPIC,
            json!({
                "phrase": phrase,
                "media_type": media_type,
                "query_id": query_id,
                "timeout_ms": u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX),
            }),
        ));

        let mut pending: HashSet<&str> = responders.iter().map(String::as_str).collect();
        let mut candidates = Vec::new();
        let deadline = deadline_after(self.window);

        while !pending.is_empty() {
            let response = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(response)) => response,
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(query_id = %query_id, missing = pending.len(), "common play window elapsed");
                    break;
                }
            };
            if response.data_str("query_id") != Some(query_id) {
                continue;
            }
            let Some(skill_id) = response.data_str("skill_id") else {
                continue;
            };

            if let Some(result) = response.data.get("result") {
                match normalize(result, media_type) {
                    Some(candidate) => candidates.push((skill_id.to_string(), candidate)),
                    None => tracing::debug!(skill_id = %skill_id, "unusable media result dropped"),
                }
            }
            if !response.data_bool("searching") {
                pending.remove(skill_id);
            }
        }

        self.bus.remove(PLAY_RESPONSE_TOPIC, subscription);
        candidates
    }
}

fn frame_regex(verbs: &[String]) -> Option<Regex> {
    let mut verbs: Vec<&String> = verbs.iter().filter(|v| !v.trim().is_empty()).collect();
    if verbs.is_empty() {
        return None;
    }
    // Longest first so "start playing" wins over "start".
    verbs.sort_by_key(|v| std::cmp::Reverse(v.len()));
    let alternatives: Vec<String> = verbs
        .iter()
        .map(|v| regex::escape(v.trim()).replace(' ', r"\s+"))
        .collect();
    let pattern = format!(r"^(?:{})\s+(?P<phrase>.+)$", alternatives.join("|"));
    match RegexBuilder::new(&pattern).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(error = %e, "play verb pattern rejected, common play disabled");
            None
        }
    }
}

#[derive(Deserialize)]
struct LegacyResult {
    title: String,
    tier: MediaTier,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct StreamedResult {
    title: String,
    score: f64,
    #[serde(default)]
    tier: Option<MediaTier>,
    #[serde(default)]
    media_type: Option<MediaType>,
    #[serde(default)]
    playback: PlaybackType,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    payload: Value,
}

/// Bring either result shape into a [`MediaCandidate`] with a finite score
/// in `0..=100`.
fn normalize(result: &Value, media_type: MediaType) -> Option<MediaCandidate> {
    if result.get("legacy").and_then(Value::as_bool).unwrap_or(false) {
        let legacy: LegacyResult = serde_json::from_value(result.clone()).ok()?;
        return Some(MediaCandidate {
            title: legacy.title,
            tier: legacy.tier,
            score: legacy.tier.nominal_score(),
            media_type,
            playback: PlaybackType::Skill,
            uri: None,
            metadata: Value::Null,
            payload: legacy.payload,
        });
    }

    let streamed: StreamedResult = serde_json::from_value(result.clone()).ok()?;
    let score = if streamed.score.is_finite() {
        streamed.score.clamp(0.0, 100.0)
    } else {
        0.0
    };
    Some(MediaCandidate {
        title: streamed.title,
        tier: streamed.tier.unwrap_or_else(|| MediaTier::from_score(score)),
        score,
        media_type: streamed.media_type.unwrap_or(media_type),
        playback: streamed.playback,
        uri: streamed.uri,
        metadata: streamed.metadata,
        payload: streamed.payload,
    })
}

/// Best candidate in arrival order; later arrivals must be strictly better.
fn select(candidates: Vec<(String, MediaCandidate)>) -> Option<PlaySelection> {
    let mut best: Option<(String, MediaCandidate)> = None;
    for (skill_id, candidate) in candidates {
        let better = best.as_ref().is_none_or(|(_, b)| {
            let (rank, best_rank) = (candidate.tier.rank(), b.tier.rank());
            rank > best_rank || (rank == best_rank && candidate.score > b.score)
        });
        if better {
            best = Some((skill_id, candidate));
        }
    }
    best.map(|(skill_id, candidate)| PlaySelection {
        skill_id,
        candidate,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
