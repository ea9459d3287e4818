//! Wiki skill: common-query answers from an in-memory fact table.
//!
//! A question whose topic equals a table key is an exact answer; one that
//! merely mentions a key is a general answer.  When selected with a GUI
//! attached the skill shows the topic's picture.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use skillbus_intent::{CommonQuerySkill, QueryAnswer, QueryTier, Result, SkillContext, SkillHandle};

/// Skill id.
pub const SKILL_ID: &str = "wiki";

/// Topic emitted to the GUI on selection.
pub const GUI_SHOW_TOPIC: &str = "gui.page.show";

const QUESTION_PREFIXES: [&str; 6] = [
    "what is ",
    "what are ",
    "who is ",
    "who was ",
    "tell me about ",
    "what's ",
];

struct Fact {
    topic: String,
    answer: String,
    image: Option<String>,
}

/// Knowledge skill over a fixed table.
#[derive(Clone)]
pub struct WikiSkill {
    facts: Arc<Vec<Fact>>,
    selected: Arc<Mutex<Vec<String>>>,
}

impl Default for WikiSkill {
    fn default() -> Self {
        Self::with_facts([
            (
                "the moon",
                "The Moon is Earth's only natural satellite, about 384,400 km away",
                Some("moon.png"),
            ),
            (
                "the capital of france",
                "Paris is the capital of France",
                Some("paris.png"),
            ),
            ("rust", "Rust is a systems programming language focused on safety", None),
        ])
    }
}

impl WikiSkill {
    /// Build from `(topic, answer, image)` entries.  Topics are matched
    /// lowercased.
    pub fn with_facts<'a, I>(facts: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str, Option<&'a str>)>,
    {
        let facts = facts
            .into_iter()
            .map(|(topic, answer, image)| Fact {
                topic: topic.trim().to_lowercase(),
                answer: answer.to_string(),
                image: image.map(str::to_string),
            })
            .collect();
        Self {
            facts: Arc::new(facts),
            selected: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Topics whose answer was selected, oldest first.
    pub fn selected(&self) -> Vec<String> {
        self.selected.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Build the skill around a clone of `self`.
    pub fn skill(&self) -> SkillHandle {
        SkillHandle::new(SKILL_ID).common_query(Arc::new(self.clone()))
    }
}

#[async_trait]
impl CommonQuerySkill for WikiSkill {
    async fn match_query(&self, phrase: &str, _lang: &str) -> Option<QueryAnswer> {
        let topic = question_topic(phrase);
        let (fact, tier) = self
            .facts
            .iter()
            .find(|f| f.topic == topic)
            .map(|f| (f, QueryTier::Exact))
            .or_else(|| {
                self.facts
                    .iter()
                    .find(|f| topic.contains(&f.topic))
                    .map(|f| (f, QueryTier::General))
            })?;

        Some(QueryAnswer {
            phrase: phrase.to_string(),
            tier,
            answer: fact.answer.clone(),
            payload: json!({ "topic": fact.topic, "image": fact.image }),
        })
    }

    async fn on_selected(&self, ctx: SkillContext, answer: QueryAnswer) -> Result<()> {
        let topic = answer.payload["topic"].as_str().unwrap_or_default().to_string();
        self.selected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(topic.clone());

        if !ctx.gui_available() {
            return Ok(());
        }
        if let Some(image) = answer.payload["image"].as_str() {
            ctx.emit(
                GUI_SHOW_TOPIC,
                json!({ "page": "wiki", "topic": topic, "image": image, "text": answer.answer }),
            );
        }
        Ok(())
    }
}

/// The question with its interrogative prefix and punctuation removed.
fn question_topic(phrase: &str) -> String {
    let lowered = phrase.trim().to_lowercase();
    let lowered = lowered.trim_end_matches(['?', '.', '!']);
    QUESTION_PREFIXES
        .iter()
        .find_map(|p| lowered.strip_prefix(p))
        .unwrap_or(lowered)
        .trim()
        .to_string()
}
