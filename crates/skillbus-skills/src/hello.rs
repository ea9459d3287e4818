//! Hello-world skill: keyword intents answered from dialog templates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use skillbus_intent::{IntentHandler, IntentMatch, KeywordIntent, Result, SkillContext, SkillHandle};

/// Skill id.
pub const SKILL_ID: &str = "hello-world";

/// Speaks a fixed dialog for whichever intent it is bound to.
pub struct DialogReply {
    dialog: &'static str,
}

#[async_trait]
impl IntentHandler for DialogReply {
    async fn handle(&self, ctx: SkillContext, _intent: &IntentMatch) -> Result<()> {
        ctx.speak_dialog(self.dialog, &HashMap::new());
        Ok(())
    }
}

/// Build the skill.
pub fn skill() -> SkillHandle {
    SkillHandle::new(SKILL_ID)
        .vocabulary("HelloWorldKeyword", ["hello world"])
        .vocabulary("HowAreYouKeyword", ["how are you", "how are you doing"])
        .vocabulary("ThankYouKeyword", ["thank you", "thanks"])
        .keyword_intent(
            "hello_world",
            KeywordIntent::require(["HelloWorldKeyword"]),
            Arc::new(DialogReply { dialog: "hello.world" }),
        )
        .keyword_intent(
            "how_are_you",
            KeywordIntent::require(["HowAreYouKeyword"]),
            Arc::new(DialogReply { dialog: "how.are.you" }),
        )
        .keyword_intent(
            "thank_you",
            KeywordIntent::require(["ThankYouKeyword"]),
            Arc::new(DialogReply { dialog: "welcome" }),
        )
        .dialog("en-us", "hello.world", ["Hello world", "Hi there, world"])
        .dialog("en-us", "how.are.you", ["I'm doing well, thanks for asking"])
        .dialog("en-us", "welcome", ["You're welcome", "Any time"])
}
