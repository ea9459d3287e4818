//! Media probe skills: one per common-play flavor.
//!
//! - [`RadioSkill`] answers one-shot: a single station or nothing.  Weak
//!   matches below [`RADIO_MIN_SCORE`] are not offered at all.
//! - [`CatalogSkill`] streams every scored track of a small catalog.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Value, json};
use skillbus_intent::{
    LegacyPlaySkill, MediaCandidate, MediaSearchSkill, MediaTier, MediaType, PlaybackType, Result,
    SkillContext, SkillHandle,
};

/// Skill id of the one-shot radio skill.
pub const RADIO_SKILL_ID: &str = "radio";
/// Skill id of the streaming catalog skill.
pub const CATALOG_SKILL_ID: &str = "catalog";
/// Scores below this produce no radio candidate.
pub const RADIO_MIN_SCORE: f64 = 50.0;

/// Published by both skills when playback starts.
pub const AUDIO_PLAY_TOPIC: &str = "mycroft.audio.service.play";

// ---------------------------------------------------------------------------
// Radio (one-shot)
// ---------------------------------------------------------------------------

struct Station {
    name: String,
    stream: String,
}

/// One-shot radio skill.
#[derive(Clone)]
pub struct RadioSkill {
    stations: Arc<Vec<Station>>,
    started: Arc<Mutex<Vec<String>>>,
}

impl Default for RadioSkill {
    fn default() -> Self {
        Self::with_stations([
            ("jazz radio", "http://radio.example/jazz"),
            ("classic rock radio", "http://radio.example/rock"),
            ("news radio", "http://radio.example/news"),
        ])
    }
}

impl RadioSkill {
    /// Build from `(name, stream url)` entries.
    pub fn with_stations<'a, I>(stations: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let stations = stations
            .into_iter()
            .map(|(name, stream)| Station {
                name: name.to_lowercase(),
                stream: stream.to_string(),
            })
            .collect();
        Self {
            stations: Arc::new(stations),
            started: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Stations started, oldest first.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Build the skill around a clone of `self`.
    pub fn skill(&self) -> SkillHandle {
        SkillHandle::new(RADIO_SKILL_ID).legacy_play(Arc::new(self.clone()))
    }

    /// Score a station name against the phrase: the share of the station's
    /// words present in the phrase, with a bonus for radio requests.
    fn score(station: &Station, phrase: &str, media_type: MediaType) -> f64 {
        let words: Vec<&str> = station.name.split_whitespace().collect();
        let hits = words.iter().filter(|w| phrase.split_whitespace().any(|p| p == **w)).count();
        let mut score = 90.0 * hits as f64 / words.len().max(1) as f64;
        if media_type == MediaType::Radio {
            score += 10.0;
        }
        score.min(100.0)
    }
}

#[async_trait]
impl LegacyPlaySkill for RadioSkill {
    async fn match_query(&self, phrase: &str, media_type: MediaType) -> Option<(String, MediaTier, Value)> {
        let phrase = phrase.to_lowercase();
        let (station, score) = self
            .stations
            .iter()
            .map(|s| (s, Self::score(s, &phrase, media_type)))
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        if score < RADIO_MIN_SCORE {
            return None;
        }
        Some((
            station.name.clone(),
            MediaTier::from_score(score),
            json!({ "station": station.name, "stream": station.stream }),
        ))
    }

    async fn start(&self, ctx: SkillContext, _phrase: String, payload: Value) -> Result<()> {
        let name = payload["station"].as_str().unwrap_or_default().to_string();
        let stream = payload["stream"].as_str().unwrap_or_default().to_string();
        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(name.clone());
        ctx.emit(AUDIO_PLAY_TOPIC, json!({ "tracks": [stream] }));
        ctx.speak(&format!("Playing {name}"));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Catalog (streaming)
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Track {
    title: String,
    artist: String,
    media_type: MediaType,
    uri: String,
}

/// Streaming catalog skill.
#[derive(Clone)]
pub struct CatalogSkill {
    tracks: Arc<Vec<Track>>,
    started: Arc<Mutex<Vec<String>>>,
}

impl Default for CatalogSkill {
    fn default() -> Self {
        Self::with_tracks([
            ("master of puppets", "metallica", MediaType::Music, "file://music/puppets.mp3"),
            ("enter sandman", "metallica", MediaType::Music, "file://music/sandman.mp3"),
            ("so what", "miles davis", MediaType::Music, "file://music/so-what.mp3"),
            ("hardcore history", "dan carlin", MediaType::Podcast, "file://podcasts/hh.mp3"),
        ])
    }
}

impl CatalogSkill {
    /// Build from `(title, artist, media type, uri)` entries.
    pub fn with_tracks<'a, I>(tracks: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str, MediaType, &'a str)>,
    {
        let tracks = tracks
            .into_iter()
            .map(|(title, artist, media_type, uri)| Track {
                title: title.to_lowercase(),
                artist: artist.to_lowercase(),
                media_type,
                uri: uri.to_string(),
            })
            .collect();
        Self {
            tracks: Arc::new(tracks),
            started: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Titles started, oldest first.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Build the skill around a clone of `self`.
    pub fn skill(&self) -> SkillHandle {
        SkillHandle::new(CATALOG_SKILL_ID).media_search(Arc::new(self.clone()))
    }

    fn candidate(track: &Track, phrase: &str, media_type: MediaType) -> Option<MediaCandidate> {
        let score = if phrase.contains(&track.title) {
            95.0
        } else if phrase.contains(&track.artist) {
            75.0
        } else if media_type != MediaType::Generic && media_type == track.media_type {
            55.0
        } else {
            return None;
        };
        Some(MediaCandidate {
            title: track.title.clone(),
            tier: MediaTier::from_score(score),
            score,
            media_type: track.media_type,
            playback: PlaybackType::Audio,
            uri: Some(track.uri.clone()),
            metadata: json!({ "artist": track.artist }),
            payload: json!({ "uri": track.uri }),
        })
    }
}

#[async_trait]
impl MediaSearchSkill for CatalogSkill {
    fn search(&self, phrase: &str, media_type: MediaType) -> BoxStream<'static, MediaCandidate> {
        let phrase = phrase.to_lowercase();
        let tracks = Arc::clone(&self.tracks);
        let indices = 0..tracks.len();
        stream::iter(indices)
            .filter_map(move |i| {
                let found = Self::candidate(&tracks[i], &phrase, media_type);
                async move { found }
            })
            .boxed()
    }

    async fn start(&self, ctx: SkillContext, candidate: MediaCandidate) -> Result<()> {
        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(candidate.title.clone());
        ctx.emit(AUDIO_PLAY_TOPIC, json!({ "tracks": [candidate.uri] }));
        ctx.speak(&format!("Now playing {}", candidate.title));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn weak_radio_matches_are_not_offered() {
        let radio = RadioSkill::default();
        assert!(radio.match_query("some jazz", MediaType::Generic).await.is_none());

        let (name, tier, _) = radio.match_query("jazz radio", MediaType::Radio).await.unwrap();
        assert_eq!(name, "jazz radio");
        assert_eq!(tier, MediaTier::Exact);
    }

    #[tokio::test]
    async fn catalog_streams_scored_candidates() {
        let catalog = CatalogSkill::default();
        let found: Vec<MediaCandidate> = catalog.search("metallica", MediaType::Music).collect().await;
        let titles: Vec<&str> = found.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["master of puppets", "enter sandman", "so what"]);
        assert_eq!(found[0].tier, MediaTier::Artist);
        assert_eq!(found[2].tier, MediaTier::Category);

        let found: Vec<MediaCandidate> = catalog
            .search("master of puppets", MediaType::Generic)
            .collect()
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tier, MediaTier::Exact);
    }
}
