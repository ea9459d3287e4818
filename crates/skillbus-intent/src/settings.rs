//! Typed view of the configuration keys the pipeline consumes.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skillbus_kernel::Configuration;

/// A stage of the dispatch pipeline, in the order given by
/// `intents.pipeline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Stop/cancel commands.
    Stop,
    /// Regex intents.
    Regex,
    /// Common-play media arbitration.
    CommonPlay,
    /// Common-query knowledge arbitration.
    CommonQuery,
    /// Keyword intents (registered intent handlers).
    Keyword,
    /// The fallback chain.
    Fallback,
}

impl FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "stop" => Ok(Self::Stop),
            "regex" => Ok(Self::Regex),
            "common_play" => Ok(Self::CommonPlay),
            "common_query" => Ok(Self::CommonQuery),
            "keyword" => Ok(Self::Keyword),
            "fallback" => Ok(Self::Fallback),
            other => Err(format!("unknown pipeline stage `{other}`")),
        }
    }
}

/// Settings resolved from [`Configuration`].
#[derive(Debug, Clone, Serialize)]
pub struct CoreSettings {
    /// Default language (`lang`).
    pub lang: String,
    /// Data directory (`data_dir`).
    pub data_dir: PathBuf,
    /// Skills iterated first in registry snapshots (`skills.priority_skills`).
    pub priority_skills: Vec<String>,
    /// GUI binding hint (`enclosure.extension`).
    pub gui_extension: String,
    /// Emit per-dispatch timing events (`server.metrics`).
    pub metrics: bool,
    /// Stage order (`intents.pipeline`).
    pub pipeline: Vec<PipelineStage>,
    /// Matcher threshold (`intents.min_confidence`).
    pub min_confidence: f64,
    /// Intent handler bound (`intents.handler_timeout`).
    pub handler_timeout: Duration,
    /// Stop command phrases (`intents.stop_vocabulary`).
    pub stop_vocabulary: Vec<String>,
    /// Per fallback handler bound (`fallback.timeout`).
    pub fallback_timeout: Duration,
    /// Common-query collection window (`common_query.timeout`).
    pub query_timeout: Duration,
    /// One-time window extension (`common_query.extension`).
    pub query_extension: Duration,
    /// Common-play collection window (`common_play.timeout`).
    pub play_timeout: Duration,
    /// Verbs that open a common-play frame (`common_play.verbs`).
    pub play_verbs: Vec<String>,
    /// Session inactivity timeout (`session.ttl`).
    pub session_ttl: Duration,
    /// Expiry sweep period (`session.sweep_interval`).
    pub sweep_interval: Duration,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            lang: "en-us".into(),
            data_dir: PathBuf::from("data"),
            priority_skills: Vec::new(),
            gui_extension: String::new(),
            metrics: false,
            pipeline: vec![
                PipelineStage::Stop,
                PipelineStage::Regex,
                PipelineStage::CommonPlay,
                PipelineStage::CommonQuery,
                PipelineStage::Keyword,
                PipelineStage::Fallback,
            ],
            min_confidence: 0.5,
            handler_timeout: Duration::from_secs(10),
            stop_vocabulary: [
                "stop", "cancel", "halt", "be quiet", "shut up", "never mind", "nevermind",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            fallback_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(2),
            query_extension: Duration::from_secs(2),
            play_timeout: Duration::from_secs(2),
            play_verbs: ["play", "put on", "listen to", "start playing"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            session_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl CoreSettings {
    /// Resolve every key, falling back to [`CoreSettings::default`] on a miss
    /// or a malformed value.
    pub fn from_config(config: &Configuration) -> Self {
        let d = Self::default();

        let pipeline = match config.lookup("intents.pipeline", serde_json::Value::Null) {
            serde_json::Value::Array(items) => {
                let stages: Vec<PipelineStage> = items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| match s.parse() {
                        Ok(stage) => Some(stage),
                        Err(reason) => {
                            tracing::warn!(%reason, "ignoring pipeline entry");
                            None
                        }
                    })
                    .collect();
                if stages.is_empty() { d.pipeline.clone() } else { stages }
            }
            _ => d.pipeline.clone(),
        };

        let min_confidence = config.lookup_f64("intents.min_confidence", d.min_confidence);
        let min_confidence = if min_confidence.is_finite() && min_confidence >= 0.0 {
            min_confidence.min(1.0)
        } else {
            d.min_confidence
        };

        let stop_refs: Vec<&str> = d.stop_vocabulary.iter().map(String::as_str).collect();
        let verb_refs: Vec<&str> = d.play_verbs.iter().map(String::as_str).collect();

        Self {
            lang: config.lookup_str("lang", &d.lang),
            data_dir: PathBuf::from(config.lookup_str("data_dir", &d.data_dir.to_string_lossy())),
            priority_skills: config.lookup_strings("skills.priority_skills", &[]),
            gui_extension: config.lookup_str("enclosure.extension", &d.gui_extension),
            metrics: config.lookup_bool("server.metrics", d.metrics),
            pipeline,
            min_confidence,
            handler_timeout: seconds(config, "intents.handler_timeout", d.handler_timeout),
            stop_vocabulary: lowercase(config.lookup_strings("intents.stop_vocabulary", &stop_refs)),
            fallback_timeout: seconds(config, "fallback.timeout", d.fallback_timeout),
            query_timeout: seconds(config, "common_query.timeout", d.query_timeout),
            query_extension: seconds(config, "common_query.extension", d.query_extension),
            play_timeout: seconds(config, "common_play.timeout", d.play_timeout),
            play_verbs: lowercase(config.lookup_strings("common_play.verbs", &verb_refs)),
            session_ttl: seconds(config, "session.ttl", d.session_ttl),
            sweep_interval: positive_seconds(config, "session.sweep_interval", d.sweep_interval),
        }
    }

    /// Whether `enclosure.extension` names a GUI.
    pub fn gui_available(&self) -> bool {
        let ext = self.gui_extension.trim();
        !ext.is_empty() && !ext.eq_ignore_ascii_case("none")
    }
}

/// Longest duration any setting accepts.
const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn seconds(config: &Configuration, key: &str, default: Duration) -> Duration {
    let secs = config.lookup_f64(key, default.as_secs_f64());
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if duration <= MAX_DURATION => duration,
        _ => {
            tracing::warn!(key = %key, secs, "invalid duration, using default");
            default
        }
    }
}

/// Like [`seconds`], but zero is also invalid.
fn positive_seconds(config: &Configuration, key: &str, default: Duration) -> Duration {
    match seconds(config, key, default) {
        duration if duration.is_zero() => {
            tracing::warn!(key = %key, "zero duration, using default");
            default
        }
        duration => duration,
    }
}

fn lowercase(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
