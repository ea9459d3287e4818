//! Weather skill: a regex intent plus a shared `Location` entity.
//!
//! The forecast comes from a fixed table; the skill exists to exercise slot
//! binding, not to fetch weather.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use skillbus_intent::{IntentHandler, IntentMatch, Result, SkillContext, SkillHandle};

/// Skill id.
pub const SKILL_ID: &str = "weather";

/// Entity pattern shared with every regex intent.
pub const LOCATION_PATTERN: &str = r".*(at|in) (?P<Location>.+)$";

/// Answers "what's the weather (in X)" from a fixed table.
pub struct WeatherSkill {
    forecasts: HashMap<String, String>,
}

impl Default for WeatherSkill {
    fn default() -> Self {
        let forecasts = [("paris", "sunny"), ("london", "raining"), ("lisbon", "clear")]
            .iter()
            .map(|(city, sky)| ((*city).to_string(), (*sky).to_string()))
            .collect();
        Self { forecasts }
    }
}

#[async_trait]
impl IntentHandler for WeatherSkill {
    async fn handle(&self, ctx: SkillContext, intent: &IntentMatch) -> Result<()> {
        let Some(location) = intent.entities.get("Location") else {
            ctx.speak_dialog("weather.here", &HashMap::new());
            return Ok(());
        };
        let sky = self
            .forecasts
            .get(location.trim_end_matches(['?', '.', '!']))
            .map(String::as_str)
            .unwrap_or("cloudy");
        let data = HashMap::from([
            ("location".to_string(), location.clone()),
            ("sky".to_string(), sky.to_string()),
        ]);
        ctx.speak_dialog("weather.location", &data);
        Ok(())
    }
}

/// Build the skill.
pub fn skill() -> SkillHandle {
    SkillHandle::new(SKILL_ID)
        .regex_entity("Location", LOCATION_PATTERN)
        .regex_intent(
            "current_weather",
            r"^(?:what is |what's |how is )?(?:the )?weather\b.*$",
            Arc::new(WeatherSkill::default()),
        )
        .dialog("en-us", "weather.here", ["It is sunny here"])
        .dialog("en-us", "weather.location", ["It is {sky} in {location}"])
}
