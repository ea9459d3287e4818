//! Layered configuration.
//!
//! Configuration is a JSON value tree assembled from an ordered stack of
//! [`ConfigLayer`]s: the embedded defaults, then system and user files, then
//! environment overrides, then (optionally) a remote layer.  Later layers
//! deep-merge over earlier ones.
//!
//! [`Configuration`] is read-mostly.  Readers take an [`Arc`] snapshot and
//! never block writers for longer than a pointer swap; writers clone the tree
//! only when a snapshot is still shared (copy-on-write) and notify
//! subscribers through a [`tokio::sync::watch`] channel.
//!
//! Two lookup styles are supported:
//!
//! - [`Configuration::lookup`] -- mapping-style `lookup(key, default)` with
//!   dotted key paths.  A miss returns the default and is never an error.
//! - [`Configuration::resolve_stack`] -- the older positional
//!   `(configs, cache, remote)` form that re-merges a layer stack.
//!
//! The deprecated [`Configuration::get`] accepts either form through
//! [`GetArgs`] for callers that have not migrated yet.

use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::error::{KernelError, Result};

/// Built-in defaults for every key the core consumes.
pub const DEFAULT_CONFIG: &str = r#"
lang = "en-us"
data_dir = "data"

[skills]
priority_skills = []

[enclosure]
extension = ""

[server]
metrics = false

[intents]
pipeline = ["stop", "regex", "common_play", "common_query", "keyword", "fallback"]
min_confidence = 0.5
handler_timeout = 10.0
stop_vocabulary = ["stop", "cancel", "halt", "be quiet", "shut up", "never mind", "nevermind"]

[fallback]
timeout = 10.0

[common_query]
timeout = 2.0
extension = 2.0

[common_play]
timeout = 2.0
verbs = ["play", "put on", "listen to", "start playing"]

[session]
ttl = 300.0
sweep_interval = 30.0
"#;

/// Environment variable prefix for the environment layer.
pub const ENV_PREFIX: &str = "SKILLBUS";

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

/// Where a configuration layer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// The embedded [`DEFAULT_CONFIG`].
    Default,
    /// A machine-wide file.
    System,
    /// A per-user file.
    User,
    /// `SKILLBUS__*` environment variables.
    Environment,
    /// Settings fetched from a remote backend; skipped unless requested.
    Remote,
}

/// One named source in the configuration stack.
#[derive(Debug, Clone)]
pub struct ConfigLayer {
    /// Human-readable name (usually a path) used in diagnostics.
    pub name: String,
    /// Origin of the layer.
    pub kind: LayerKind,
    /// The layer's values; always a JSON object.
    pub values: Value,
}

impl ConfigLayer {
    /// Wrap a value tree as a layer.  The root must be an object.
    pub fn new(name: impl Into<String>, kind: LayerKind, values: Value) -> Result<Self> {
        let name = name.into();
        if !values.is_object() {
            return Err(KernelError::ConfigNotAMapping { name });
        }
        Ok(Self { name, kind, values })
    }

    /// An empty layer.
    pub fn empty(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            values: Value::Object(Map::new()),
        }
    }

    /// The embedded defaults.
    pub fn defaults() -> Result<Self> {
        Self::from_toml_str("defaults", LayerKind::Default, DEFAULT_CONFIG)
    }

    /// Parse a TOML document.
    pub fn from_toml_str(name: impl Into<String>, kind: LayerKind, raw: &str) -> Result<Self> {
        let name = name.into();
        let values: Value = toml::from_str(raw).map_err(|e| KernelError::ConfigParse {
            source_name: name.clone(),
            reason: e.to_string(),
        })?;
        Self::new(name, kind, values)
    }

    /// Parse a JSON document.
    pub fn from_json_str(name: impl Into<String>, kind: LayerKind, raw: &str) -> Result<Self> {
        let name = name.into();
        let values: Value = serde_json::from_str(raw).map_err(|e| KernelError::ConfigParse {
            source_name: name.clone(),
            reason: e.to_string(),
        })?;
        Self::new(name, kind, values)
    }

    /// Load a file: `.json` as JSON, anything else as TOML.
    ///
    /// A missing file yields an empty layer; only unreadable or malformed
    /// files are errors.
    pub fn from_file(path: &Path, kind: LayerKind) -> Result<Self> {
        let name = path.display().to_string();
        if !path.exists() {
            tracing::warn!(path = %name, "configuration file does not exist, skipping layer");
            return Ok(Self::empty(name, kind));
        }

        let raw = std::fs::read_to_string(path).map_err(|e| KernelError::ConfigRead {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let layer = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            Self::from_json_str(name, kind, &raw)?
        } else {
            Self::from_toml_str(name, kind, &raw)?
        };
        tracing::info!(path = %layer.name, ?kind, "configuration layer loaded");
        Ok(layer)
    }

    /// Build the environment layer from `PREFIX__A__B=value` pairs.
    ///
    /// Path segments are lowercased.  Values are parsed as JSON when valid
    /// (`true`, `1.5`, `["a"]`), otherwise kept as strings.
    pub fn from_env_vars<I>(prefix: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let marker = format!("{prefix}__");
        let mut values = Value::Object(Map::new());
        for (key, raw) in vars {
            let Some(path) = key.strip_prefix(&marker) else {
                continue;
            };
            let dotted = path
                .split("__")
                .map(str::to_lowercase)
                .collect::<Vec<_>>()
                .join(".");
            if dotted.is_empty() {
                continue;
            }
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            set_path(&mut values, &dotted, value);
        }
        Self {
            name: "environment".into(),
            kind: LayerKind::Environment,
            values,
        }
    }

    /// The environment layer from the process environment.
    pub fn from_env() -> Self {
        Self::from_env_vars(ENV_PREFIX, std::env::vars())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Arguments for the deprecated dual-form [`Configuration::get`].
#[derive(Debug, Clone)]
pub enum GetArgs {
    /// Mapping-style `get(key, default)`.
    Key { key: String, default: Value },
    /// Positional `get(configs, cache, remote)`; `configs: None` re-merges
    /// the loaded stack.
    Stack {
        configs: Option<Vec<ConfigLayer>>,
        cache: bool,
        remote: bool,
    },
}

/// Process-wide, read-mostly configuration.
#[derive(Debug)]
pub struct Configuration {
    current: watch::Sender<Arc<Value>>,
    layers: RwLock<Vec<ConfigLayer>>,
}

impl Configuration {
    /// Configuration holding only the embedded defaults.
    pub fn new() -> Result<Self> {
        Ok(Self::load(vec![ConfigLayer::defaults()?], false))
    }

    /// Merge `layers` in order and use the result as the current snapshot.
    /// Remote layers are included only when `remote` is true.
    pub fn load(layers: Vec<ConfigLayer>, remote: bool) -> Self {
        let merged = merge_layers(&layers, remote);
        let (current, _) = watch::channel(Arc::new(merged));
        Self {
            current,
            layers: RwLock::new(layers),
        }
    }

    /// Defaults, then each file in order as a user layer, then the
    /// environment.
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut layers = vec![ConfigLayer::defaults()?];
        for path in paths {
            layers.push(ConfigLayer::from_file(path.as_ref(), LayerKind::User)?);
        }
        layers.push(ConfigLayer::from_env());
        Ok(Self::load(layers, false))
    }

    /// The current value tree.
    pub fn snapshot(&self) -> Arc<Value> {
        Arc::clone(&self.current.borrow())
    }

    /// Subscribe to snapshot replacements.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Value>> {
        self.current.subscribe()
    }

    /// Look up a dotted key path (`"skills.priority_skills"`), returning
    /// `default` on a miss or an explicit `null`.
    pub fn lookup(&self, key: &str, default: Value) -> Value {
        let snapshot = self.snapshot();
        match get_path(&snapshot, key) {
            Some(v) if !v.is_null() => v.clone(),
            _ => {
                tracing::trace!(key = %key, "config lookup miss, using default");
                default
            }
        }
    }

    /// String value at `key`, or `default`.
    pub fn lookup_str(&self, key: &str, default: &str) -> String {
        match self.lookup(key, Value::Null) {
            Value::String(s) => s,
            _ => default.to_string(),
        }
    }

    /// Numeric value at `key`, or `default`.
    pub fn lookup_f64(&self, key: &str, default: f64) -> f64 {
        self.lookup(key, Value::Null).as_f64().unwrap_or(default)
    }

    /// Boolean value at `key`, or `default`.
    pub fn lookup_bool(&self, key: &str, default: bool) -> bool {
        self.lookup(key, Value::Null).as_bool().unwrap_or(default)
    }

    /// List of strings at `key`; non-string entries are skipped.
    pub fn lookup_strings(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.lookup(key, Value::Null) {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => default.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// Set a dotted key in the current snapshot.
    pub fn set(&self, key: &str, value: Value) {
        self.current.send_modify(|current| {
            set_path(Arc::make_mut(current), key, value);
        });
        tracing::debug!(key = %key, "configuration updated");
    }

    /// Merge a layer stack.
    ///
    /// `configs: None` re-merges the stack this configuration was loaded
    /// from.  Remote layers are skipped unless `remote` is true.  When
    /// `cache` is true the merged tree replaces the current snapshot (and,
    /// for an explicit stack, becomes the loaded stack).
    pub fn resolve_stack(&self, configs: Option<&[ConfigLayer]>, cache: bool, remote: bool) -> Value {
        let merged = match configs {
            Some(layers) => merge_layers(layers, remote),
            None => match self.layers.read() {
                Ok(layers) => merge_layers(&layers, remote),
                Err(poisoned) => merge_layers(&poisoned.into_inner(), remote),
            },
        };

        if cache {
            if let Some(layers) = configs {
                match self.layers.write() {
                    Ok(mut stored) => *stored = layers.to_vec(),
                    Err(poisoned) => *poisoned.into_inner() = layers.to_vec(),
                }
            }
            self.current.send_replace(Arc::new(merged.clone()));
            tracing::info!(remote, "configuration stack resolved and cached");
        }
        merged
    }

    /// Dual-form accessor kept for one migration cycle.
    #[deprecated(note = "use `lookup(key, default)` or `resolve_stack(configs, cache, remote)`")]
    pub fn get(&self, args: GetArgs) -> Value {
        match args {
            GetArgs::Key { key, default } => self.lookup(&key, default),
            GetArgs::Stack {
                configs,
                cache,
                remote,
            } => self.resolve_stack(configs.as_deref(), cache, remote),
        }
    }
}

// ---------------------------------------------------------------------------
// Value-tree helpers
// ---------------------------------------------------------------------------

fn merge_layers(layers: &[ConfigLayer], remote: bool) -> Value {
    let mut merged = Value::Object(Map::new());
    for layer in layers {
        if layer.kind == LayerKind::Remote && !remote {
            tracing::debug!(layer = %layer.name, "skipping remote configuration layer");
            continue;
        }
        deep_merge(&mut merged, &layer.values);
    }
    merged
}

/// Merge `overlay` into `base`: objects merge key by key, anything else
/// replaces.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

fn get_path<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |node, segment| node.get(segment))
}

fn set_path(root: &mut Value, key: &str, value: Value) {
    let segments: Vec<&str> = key.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut node = root;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert((*last).to_string(), value);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
