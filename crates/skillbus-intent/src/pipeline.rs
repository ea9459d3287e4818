//! Pipeline orchestrator.
//!
//! [`IntentService`] owns every dispatch component and runs one utterance
//! through the configured stages:
//!
//! | Stage          | Handled when                                         |
//! |----------------|------------------------------------------------------|
//! | `stop`         | the utterance is a stop command and a skill stopped  |
//! | `regex`        | a regex intent matched and its handler completed     |
//! | `common_play`  | the utterance is a play frame and a candidate won    |
//! | `common_query` | a knowledge skill answered                           |
//! | `keyword`      | a keyword intent matched and its handler completed   |
//! | `fallback`     | a fallback handler returned `true`                   |
//!
//! Every dispatch ends with exactly one `ovos.utterance.handled` message.
//! When nothing handled the utterance it is preceded by an error sound and
//! `complete_intent_failure`.  Every message a dispatch publishes is derived
//! from the inbound one, so its routing context is preserved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde_json::json;
use skillbus_kernel::{Configuration, DialogLibrary, Message, MessageBus, SessionRegistry};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::common_play::CommonPlayArbiter;
use crate::common_query::CommonQueryArbiter;
use crate::error::{IntentError, Result};
use crate::fallback::{FallbackChain, FallbackOutcome};
use crate::host::SkillHost;
use crate::invoke::{Invocation, invoke};
use crate::matcher::{IntentMatch, IntentMatcher, KeywordIntent, KeywordMatcher, PatternSpec, RegexMatcher};
use crate::settings::{CoreSettings, PipelineStage};
use crate::skill::{ContextFactory, IntentHandler, SkillHandle, SkillRegistry};
use crate::stop::{STOP_TOPIC, StopDispatcher, StopOutcome};
use crate::utterance::{UTTERANCE_TOPIC, UtteranceEvent};

/// Terminal marker of every dispatch.
pub const UTTERANCE_HANDLED_TOPIC: &str = "ovos.utterance.handled";
/// Failure event published when nothing handled an utterance.
pub const INTENT_FAILURE_TOPIC: &str = "complete_intent_failure";
/// Sound request topic.
pub const PLAY_SOUND_TOPIC: &str = "mycroft.audio.play_sound";
/// Sound played when nothing handled an utterance.
pub const ERROR_SOUND: &str = "snd/error.mp3";
/// Published before an intent handler runs.
pub const HANDLER_START_TOPIC: &str = "mycroft.skill.handler.start";
/// Published after an intent handler completed.
pub const HANDLER_COMPLETE_TOPIC: &str = "mycroft.skill.handler.complete";
/// Published when an intent handler failed or timed out.
pub const HANDLER_ERROR_TOPIC: &str = "mycroft.skill.handler.error";
/// Published when a skill becomes the session's most recent active skill.
pub const SKILL_ACTIVATED_TOPIC: &str = "intent.service.skills.activated";

/// How a dispatch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// An intent handler completed.
    Intent { skill_id: String, intent: String },
    /// A knowledge skill's answer was selected.
    CommonQuery { skill_id: String },
    /// A media candidate was selected and started.
    CommonPlay { skill_id: String, title: String },
    /// A fallback handler claimed the utterance.
    Fallback { skill_id: String },
    /// A stop request stopped something.
    Stop(StopOutcome),
    /// The session closed while a handler was running.
    Cancelled,
    /// Nothing handled the utterance.
    Unhandled,
}

impl DispatchOutcome {
    /// The skill that handled the utterance, if exactly one did.
    pub fn skill_id(&self) -> Option<&str> {
        match self {
            Self::Intent { skill_id, .. }
            | Self::CommonQuery { skill_id }
            | Self::CommonPlay { skill_id, .. }
            | Self::Fallback { skill_id } => Some(skill_id),
            Self::Stop(StopOutcome::Session { skill_id }) => Some(skill_id),
            Self::Stop(_) | Self::Cancelled | Self::Unhandled => None,
        }
    }

    /// Whether something handled the utterance.
    pub fn is_handled(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::Unhandled)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Intent { .. } => "intent",
            Self::CommonQuery { .. } => "common_query",
            Self::CommonPlay { .. } => "common_play",
            Self::Fallback { .. } => "fallback",
            Self::Stop(_) => "stop",
            Self::Cancelled => "cancelled",
            Self::Unhandled => "unhandled",
        }
    }
}

/// An installed intent handler.
#[derive(Clone)]
struct Route {
    skill_id: String,
    handler: Arc<dyn IntentHandler>,
}

/// Names a skill installed into the matchers.
#[derive(Default)]
struct Installed {
    regex: Vec<String>,
    keyword: Vec<String>,
    routes: Vec<String>,
}

/// Per-dispatch state.
struct Dispatch<'a> {
    message: &'a Message,
    event: UtteranceEvent,
    closed: watch::Receiver<bool>,
}

// ---------------------------------------------------------------------------
// Intent service
// ---------------------------------------------------------------------------

/// The dispatch pipeline.
///
/// Cheaply cloneable; every clone drives the same registries.
#[derive(Clone)]
pub struct IntentService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    bus: MessageBus,
    settings: CoreSettings,
    sessions: SessionRegistry,
    skills: SkillRegistry,
    regex: RegexMatcher,
    keyword: KeywordMatcher,
    routes: DashMap<String, Route>,
    fallback: FallbackChain,
    query: CommonQueryArbiter,
    play: CommonPlayArbiter,
    stop: StopDispatcher,
    contexts: ContextFactory,
    host: SkillHost,
}

impl IntentService {
    /// Build a pipeline on `bus` with settings resolved from `config`.
    pub fn new(bus: MessageBus, config: &Configuration) -> Self {
        Self::with_settings(bus, CoreSettings::from_config(config))
    }

    /// Build a pipeline on `bus` with explicit settings.
    pub fn with_settings(bus: MessageBus, settings: CoreSettings) -> Self {
        let sessions = SessionRegistry::with_ttl(bus.clone(), settings.lang.clone(), settings.session_ttl);
        let skills = SkillRegistry::new(settings.priority_skills.clone());
        let contexts = ContextFactory::new(bus.clone(), DialogLibrary::new(), settings.gui_available());

        let query = CommonQueryArbiter::new(
            bus.clone(),
            settings.query_timeout,
            settings.query_extension,
            settings.handler_timeout,
        );
        let play = CommonPlayArbiter::new(
            bus.clone(),
            settings.play_timeout,
            settings.handler_timeout,
            &settings.play_verbs,
        );
        let stop = StopDispatcher::new(
            bus.clone(),
            sessions.clone(),
            skills.clone(),
            settings.stop_vocabulary.clone(),
            settings.handler_timeout,
        );
        let host = SkillHost::new(
            bus.clone(),
            skills.clone(),
            contexts.clone(),
            settings.lang.clone(),
            settings.handler_timeout,
        );

        tracing::info!(
            lang = %settings.lang,
            pipeline = ?settings.pipeline,
            gui = settings.gui_available(),
            "intent service created"
        );

        Self {
            inner: Arc::new(ServiceInner {
                fallback: FallbackChain::new(bus.clone()),
                bus,
                settings,
                sessions,
                skills,
                regex: RegexMatcher::new(),
                keyword: KeywordMatcher::new(),
                routes: DashMap::new(),
                query,
                play,
                stop,
                contexts,
                host,
            }),
        }
    }

    /// The bus the pipeline runs on.
    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    /// Resolved settings.
    pub fn settings(&self) -> &CoreSettings {
        &self.inner.settings
    }

    /// The session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    /// The skill registry.
    pub fn skills(&self) -> &SkillRegistry {
        &self.inner.skills
    }

    /// The fallback chain.
    pub fn fallback(&self) -> &FallbackChain {
        &self.inner.fallback
    }

    /// Shared dialog templates.
    pub fn dialogs(&self) -> &DialogLibrary {
        self.inner.contexts.dialogs()
    }

    // -- Skill lifecycle ----------------------------------------------------

    /// Install every capability of `handle`.
    ///
    /// Either everything is installed or nothing is: a pattern that fails
    /// to register rolls back what was installed before it.
    pub fn register_skill(&self, handle: SkillHandle) -> Result<()> {
        let skill_id = handle.id().to_string();
        if self.inner.skills.contains(&skill_id) {
            return Err(IntentError::DuplicateSkill { skill_id });
        }

        let mut installed = Installed::default();
        if let Err(e) = self.install(&handle, &mut installed) {
            tracing::warn!(skill_id = %skill_id, error = %e, "skill registration rolled back");
            self.uninstall(&installed);
            return Err(e);
        }
        let fallback = handle.fallback.clone();
        let capabilities = handle.capabilities();

        if !self.inner.skills.insert(handle) {
            self.uninstall(&installed);
            return Err(IntentError::DuplicateSkill { skill_id });
        }
        if let Some((priority, handler)) = fallback {
            self.inner.fallback.register(&skill_id, priority, handler);
        }
        tracing::info!(skill_id = %skill_id, capabilities = ?capabilities, "skill registered");
        Ok(())
    }

    /// Remove every capability of `skill_id` and drop it from every
    /// session's active list.
    pub fn unregister_skill(&self, skill_id: &str) -> Result<()> {
        let handle = self
            .inner
            .skills
            .remove(skill_id)
            .ok_or_else(|| IntentError::SkillNotFound {
                skill_id: skill_id.to_string(),
            })?;

        self.uninstall(&Installed::of(&handle));
        self.inner.fallback.unregister(skill_id);
        for session in self.inner.sessions.list_active() {
            self.inner.sessions.deactivate(&session.session_id, skill_id);
        }
        tracing::info!(skill_id = %skill_id, "skill unregistered");
        Ok(())
    }

    // -- Runtime ------------------------------------------------------------

    /// Serve the bus: the skill host, inbound utterances, inbound
    /// `mycroft.stop`, and the session sweeper.  Abort the returned tasks
    /// to stop.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = self.inner.host.start();

        let (utterance_sub, mut utterances) = self.inner.bus.on_channel(UTTERANCE_TOPIC);
        let service = self.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(message) = utterances.recv().await {
                let service = service.clone();
                tokio::spawn(async move {
                    service.handle_utterance(&message).await;
                });
            }
            service.inner.bus.remove(UTTERANCE_TOPIC, utterance_sub);
        }));

        let (stop_sub, mut stops) = self.inner.bus.on_channel(STOP_TOPIC);
        let service = self.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(message) = stops.recv().await {
                let outcome = service.inner.stop.stop_global(&message).await;
                tracing::info!(outcome = ?outcome, "global stop request served");
            }
            service.inner.bus.remove(STOP_TOPIC, stop_sub);
        }));

        tasks.push(self.inner.sessions.spawn_sweeper(self.inner.settings.sweep_interval));
        tracing::info!(skills = self.inner.skills.len(), "intent service started");
        tasks
    }

    /// Dispatch one `recognizer_loop:utterance` message.
    ///
    /// Never fails: every error is contained in the stage that raised it.
    pub async fn handle_utterance(&self, message: &Message) -> DispatchOutcome {
        let started = Instant::now();
        let dispatch_id = Uuid::now_v7();
        let event = UtteranceEvent::from_message(message, &self.inner.settings.lang);
        let session_id = event.session_id.clone();

        self.inner.sessions.get_or_create(&session_id);
        self.inner.sessions.touch(&session_id);
        tracing::debug!(
            dispatch_id = %dispatch_id,
            session_id = %session_id,
            utterances = ?event.utterances,
            "dispatch started"
        );

        let outcome = if event.is_empty() {
            DispatchOutcome::Unhandled
        } else {
            let dispatch = Dispatch {
                message,
                closed: self.inner.sessions.closed_signal(&session_id),
                event,
            };
            self.run_stages(&dispatch).await
        };

        match &outcome {
            DispatchOutcome::Unhandled => {
                self.inner.bus.publish(message.forward(PLAY_SOUND_TOPIC, json!({ "uri": ERROR_SOUND })));
                self.inner.bus.publish(message.forward(INTENT_FAILURE_TOPIC, json!({})));
            }
            DispatchOutcome::Stop(_) | DispatchOutcome::Cancelled => {}
            handled => {
                if let Some(skill_id) = handled.skill_id() {
                    self.activate(message, &session_id, skill_id);
                }
            }
        }
        self.inner.bus.publish(message.forward(UTTERANCE_HANDLED_TOPIC, json!({})));

        let elapsed = started.elapsed();
        if self.inner.settings.metrics {
            tracing::info!(
                dispatch_id = %dispatch_id,
                outcome = outcome.label(),
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                "dispatch timing"
            );
        }
        tracing::debug!(dispatch_id = %dispatch_id, outcome = ?outcome, "dispatch finished");
        outcome
    }

    // -- Private helpers ----------------------------------------------------

    async fn run_stages(&self, dispatch: &Dispatch<'_>) -> DispatchOutcome {
        for stage in &self.inner.settings.pipeline {
            let outcome = match stage {
                PipelineStage::Stop => self.stop_stage(dispatch).await,
                PipelineStage::Regex => self.intent_stage(&self.inner.regex, dispatch).await,
                PipelineStage::Keyword => self.intent_stage(&self.inner.keyword, dispatch).await,
                PipelineStage::CommonPlay => self.play_stage(dispatch).await,
                PipelineStage::CommonQuery => self.query_stage(dispatch).await,
                PipelineStage::Fallback => self.fallback_stage(dispatch).await,
            };
            if let Some(outcome) = outcome {
                tracing::debug!(stage = ?stage, "stage handled utterance");
                return outcome;
            }
        }
        DispatchOutcome::Unhandled
    }

    async fn stop_stage(&self, dispatch: &Dispatch<'_>) -> Option<DispatchOutcome> {
        let stop = &self.inner.stop;
        if !dispatch.event.utterances.iter().any(|u| stop.is_stop_command(u)) {
            return None;
        }
        let outcome = stop.dispatch(dispatch.message).await;
        // Nothing to stop: the utterance continues down the pipeline.
        outcome.stopped().then_some(DispatchOutcome::Stop(outcome))
    }

    async fn intent_stage(&self, matcher: &dyn IntentMatcher, dispatch: &Dispatch<'_>) -> Option<DispatchOutcome> {
        let min_confidence = self.inner.settings.min_confidence;
        let mut failed: Vec<String> = Vec::new();
        for utterance in &dispatch.event.utterances {
            let matched = matcher.calculate_intent(utterance, min_confidence);
            // An intent whose handler already failed is not retried.
            if matched.is_unknown() || failed.contains(&matched.intent_name) {
                continue;
            }
            let intent = matched.intent_name.clone();
            match self.execute_intent(dispatch, matched).await {
                Some(outcome) => return Some(outcome),
                None => failed.push(intent),
            }
        }
        None
    }

    async fn execute_intent(&self, dispatch: &Dispatch<'_>, mut matched: IntentMatch) -> Option<DispatchOutcome> {
        let Some(route) = self.inner.routes.get(&matched.intent_name).map(|r| r.value().clone()) else {
            tracing::warn!(intent = %matched.intent_name, "matched intent has no handler");
            return None;
        };
        matched.entities = strip_namespace(&route.skill_id, std::mem::take(&mut matched.entities));

        let intent = matched.intent_name.clone();
        let bus = &self.inner.bus;
        let intent_message = dispatch.message.forward(
            intent.as_str(),
            json!({
                "intent_type": intent,
                "utterance": matched.utterance,
                "confidence": matched.confidence,
                "entities": matched.entities,
                "matcher": matched.matcher,
                "lang": dispatch.event.lang,
            }),
        );
        bus.publish(intent_message.clone());
        bus.publish(dispatch.message.forward(
            HANDLER_START_TOPIC,
            json!({ "name": intent, "skill_id": route.skill_id }),
        ));

        let ctx = self
            .inner
            .contexts
            .context(&route.skill_id, &intent_message, &dispatch.event.lang);
        let handler = route.handler;
        let call = async move { handler.handle(ctx, &matched).await };
        let result = invoke(
            "intent",
            &route.skill_id,
            self.inner.settings.handler_timeout,
            Some(dispatch.closed.clone()),
            call,
        )
        .await;

        match result {
            Invocation::Completed(()) => {
                bus.publish(dispatch.message.forward(
                    HANDLER_COMPLETE_TOPIC,
                    json!({ "name": intent, "skill_id": route.skill_id }),
                ));
                Some(DispatchOutcome::Intent {
                    skill_id: route.skill_id,
                    intent,
                })
            }
            Invocation::Failed(reason) => {
                self.handler_error(dispatch, &intent, &route.skill_id, &reason);
                None
            }
            Invocation::TimedOut => {
                self.handler_error(dispatch, &intent, &route.skill_id, "timed out");
                None
            }
            Invocation::Cancelled => Some(DispatchOutcome::Cancelled),
        }
    }

    async fn play_stage(&self, dispatch: &Dispatch<'_>) -> Option<DispatchOutcome> {
        let play = &self.inner.play;
        let (phrase, media_type) = dispatch.event.utterances.iter().find_map(|u| play.detect(u))?;
        let responders = self.responders(|h| h.common_play.is_some());
        let selection = play
            .play(dispatch.message, &phrase, media_type, &responders)
            .await?;
        Some(DispatchOutcome::CommonPlay {
            skill_id: selection.skill_id,
            title: selection.candidate.title,
        })
    }

    async fn query_stage(&self, dispatch: &Dispatch<'_>) -> Option<DispatchOutcome> {
        let phrase = dispatch.event.primary()?;
        let responders = self.responders(|h| h.common_query.is_some());
        let selection = self
            .inner
            .query
            .ask(dispatch.message, phrase, &dispatch.event.lang, &responders)
            .await?;
        Some(DispatchOutcome::CommonQuery {
            skill_id: selection.skill_id,
        })
    }

    async fn fallback_stage(&self, dispatch: &Dispatch<'_>) -> Option<DispatchOutcome> {
        let outcome = self
            .inner
            .fallback
            .dispatch(
                dispatch.message,
                &dispatch.event.lang,
                &self.inner.contexts,
                self.inner.settings.fallback_timeout,
                Some(dispatch.closed.clone()),
            )
            .await;
        match outcome {
            FallbackOutcome::Handled { skill_id } => Some(DispatchOutcome::Fallback { skill_id }),
            FallbackOutcome::Cancelled => Some(DispatchOutcome::Cancelled),
            FallbackOutcome::Exhausted => None,
        }
    }

    fn responders<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&SkillHandle) -> bool,
    {
        self.inner
            .skills
            .with(predicate)
            .iter()
            .map(|h| h.id().to_string())
            .collect()
    }

    fn handler_error(&self, dispatch: &Dispatch<'_>, intent: &str, skill_id: &str, reason: &str) {
        self.inner.bus.publish(dispatch.message.forward(
            HANDLER_ERROR_TOPIC,
            json!({ "name": intent, "skill_id": skill_id, "exception": reason }),
        ));
    }

    fn activate(&self, message: &Message, session_id: &str, skill_id: &str) {
        self.inner.sessions.activate(session_id, skill_id);
        self.inner.bus.publish(message.forward(
            SKILL_ACTIVATED_TOPIC,
            json!({ "skill_id": skill_id, "session_id": session_id }),
        ));
    }

    fn install(&self, handle: &SkillHandle, installed: &mut Installed) -> Result<()> {
        let inner = &self.inner;

        for (name, pattern) in &handle.regex_entities {
            let qualified = handle.qualify(name);
            inner.regex.register_pattern(&qualified, &PatternSpec::Entity(pattern.clone()))?;
            installed.regex.push(qualified);
        }
        for spec in &handle.regex_intents {
            let qualified = handle.qualify(&spec.name);
            inner.regex.register_pattern(&qualified, &PatternSpec::Regex(spec.pattern.clone()))?;
            installed.regex.push(qualified.clone());
            self.route(&qualified, handle.id(), &spec.handler, installed);
        }
        for (entity, phrases) in &handle.vocabulary {
            let qualified = handle.qualify(entity);
            inner.keyword.register_pattern(&qualified, &PatternSpec::Vocabulary(phrases.clone()))?;
            installed.keyword.push(qualified);
        }
        for spec in &handle.keyword_intents {
            let qualified = handle.qualify(&spec.name);
            let keywords = KeywordIntent {
                required: spec.keywords.required.iter().map(|e| handle.qualify(e)).collect(),
                optional: spec.keywords.optional.iter().map(|e| handle.qualify(e)).collect(),
            };
            inner.keyword.register_pattern(&qualified, &PatternSpec::Keywords(keywords))?;
            installed.keyword.push(qualified.clone());
            self.route(&qualified, handle.id(), &spec.handler, installed);
        }

        let dialogs = inner.contexts.dialogs();
        for (lang, name, variants) in &handle.dialogs {
            dialogs.register(lang, name, variants.iter().cloned());
        }
        Ok(())
    }

    fn route(&self, qualified: &str, skill_id: &str, handler: &Arc<dyn IntentHandler>, installed: &mut Installed) {
        self.inner.routes.insert(
            qualified.to_string(),
            Route {
                skill_id: skill_id.to_string(),
                handler: Arc::clone(handler),
            },
        );
        installed.routes.push(qualified.to_string());
    }

    fn uninstall(&self, installed: &Installed) {
        for name in &installed.regex {
            self.inner.regex.unregister(name);
        }
        for name in &installed.keyword {
            self.inner.keyword.unregister(name);
        }
        for name in &installed.routes {
            self.inner.routes.remove(name);
        }
    }
}

impl Installed {
    /// Everything `handle` installs when registered.
    fn of(handle: &SkillHandle) -> Self {
        let regex = handle
            .regex_entities
            .iter()
            .map(|(name, _)| handle.qualify(name))
            .chain(handle.regex_intents.iter().map(|s| handle.qualify(&s.name)))
            .collect();
        let keyword = handle
            .vocabulary
            .iter()
            .map(|(entity, _)| handle.qualify(entity))
            .chain(handle.keyword_intents.iter().map(|s| handle.qualify(&s.name)))
            .collect();
        let routes = handle
            .regex_intents
            .iter()
            .map(|s| handle.qualify(&s.name))
            .chain(handle.keyword_intents.iter().map(|s| handle.qualify(&s.name)))
            .collect();
        Self { regex, keyword, routes }
    }
}

/// Drop the `<skill_id>:` prefix keyword vocabulary carries internally.
fn strip_namespace(skill_id: &str, entities: HashMap<String, String>) -> HashMap<String, String> {
    let prefix = format!("{skill_id}:");
    entities
        .into_iter()
        .map(|(k, v)| match k.strip_prefix(&prefix) {
            Some(bare) => (bare.to_string(), v),
            None => (k, v),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
