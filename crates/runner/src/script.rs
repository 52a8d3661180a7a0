//! Test scripts
//!
//! A script drives one bound [`Session`] and produces a [`ScriptValue`].
//! Scripts are either declarative step lists from `test.yaml` or Rust
//! implementations registered under a name in a [`ScriptRegistry`].

use async_trait::async_trait;
use serde::Deserialize;
use sightline_common::{Error, Outcome, Result, RunLogs, TestLog};
use sightline_screen::{KeyInput, Position, Session, Target};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Message of a script that finished without returning anything
pub const NO_RESULT: &str = "script returned no result";

/// What a script hands back
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    /// Explicit pass/fail with a message
    Verdict { passed: bool, message: String },
    /// Any value, judged by its truthiness
    Value(serde_json::Value),
    /// Nothing returned
    Unit,
}

impl ScriptValue {
    pub fn passed(message: impl Into<String>) -> Self {
        ScriptValue::Verdict {
            passed: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ScriptValue::Verdict {
            passed: false,
            message: message.into(),
        }
    }

    /// Outcome and message of the test
    pub fn verdict(self) -> (Outcome, String) {
        match self {
            ScriptValue::Verdict { passed, message } => (outcome(passed), message),
            ScriptValue::Value(value) => (outcome(truthy(&value)), stringify(&value)),
            ScriptValue::Unit => (Outcome::Passed, NO_RESULT.to_string()),
        }
    }
}

fn outcome(passed: bool) -> Outcome {
    if passed {
        Outcome::Passed
    } else {
        Outcome::Failed
    }
}

/// null, false, zero and empty strings or collections are false
fn truthy(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Result of a `return` step; a message is never dropped
fn returned(
    value: Option<&serde_json::Value>,
    passed: Option<bool>,
    message: Option<&str>,
) -> ScriptValue {
    match (passed, value, message) {
        (Some(passed), _, message) => ScriptValue::Verdict {
            passed,
            message: message.unwrap_or_default().to_string(),
        },
        (None, Some(value), Some(message)) => ScriptValue::Verdict {
            passed: truthy(value),
            message: message.to_string(),
        },
        (None, Some(value), None) => ScriptValue::Value(value.clone()),
        (None, None, Some(message)) => ScriptValue::passed(message),
        (None, None, None) => ScriptValue::Unit,
    }
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Everything a running script may touch
pub struct ScriptContext<'a> {
    pub session: &'a mut Session,
    pub log: &'a mut TestLog,
    logs: &'a RunLogs,
    index: usize,
    test: &'a str,
}

impl<'a> ScriptContext<'a> {
    pub fn new(
        session: &'a mut Session,
        log: &'a mut TestLog,
        logs: &'a RunLogs,
        index: usize,
        test: &'a str,
    ) -> Self {
        Self {
            session,
            log,
            logs,
            index,
            test,
        }
    }

    pub fn test(&self) -> &str {
        self.test
    }

    /// Path of a file stored next to the test's log
    pub fn artifact(&self, suffix: &str) -> PathBuf {
        self.logs.artifact(self.index, self.test, suffix)
    }
}

#[async_trait]
pub trait Script: Send + Sync {
    async fn run(&self, ctx: &mut ScriptContext<'_>) -> Result<ScriptValue>;
}

/// One image name or an ordered list of candidates
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ImageRef {
    One(String),
    Any(Vec<String>),
}

impl ImageRef {
    pub fn target(&self) -> Target {
        match self {
            ImageRef::One(name) => Target::from(name.as_str()),
            ImageRef::Any(names) => Target::Any(names.iter().map(|n| Target::from(n.as_str())).collect()),
        }
    }
}

/// A literal `[x, y]` point or images to find
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PointRef {
    Point([u32; 2]),
    Image(ImageRef),
}

impl PointRef {
    pub fn position(&self) -> Position {
        match self {
            PointRef::Point([x, y]) => Position::Point(*x, *y),
            PointRef::Image(image) => Position::Target(image.target()),
        }
    }
}

/// A token such as `"text"` or `"<enter>"`, or a key combination
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KeysRef {
    Token(String),
    Combo(Vec<String>),
}

impl KeysRef {
    pub fn input(&self) -> Result<KeyInput> {
        match self {
            KeysRef::Token(token) => Ok(KeyInput::parse(token)),
            KeysRef::Combo(tokens) => KeyInput::combo(tokens.as_slice()),
        }
    }
}

/// One step of a declarative script
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Wait {
        image: ImageRef,
        #[serde(default)]
        timeout_secs: Option<f64>,
    },
    Find {
        image: ImageRef,
        #[serde(default)]
        timeout_secs: Option<f64>,
    },
    Click {
        target: PointRef,
    },
    RightClick {
        target: PointRef,
    },
    DoubleClick {
        target: PointRef,
    },
    Hover {
        target: PointRef,
    },
    Type {
        keys: KeysRef,
    },
    Sleep {
        secs: f64,
    },
    /// Save the screen as `<test>-<name>.png` next to the test log
    LogScreen {
        name: String,
    },
    Log {
        message: String,
    },
    /// End the test as failed
    Fail {
        message: String,
    },
    Return {
        #[serde(default)]
        value: Option<serde_json::Value>,
        #[serde(default)]
        passed: Option<bool>,
        #[serde(default)]
        message: Option<String>,
    },
}

fn seconds(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| Error::usage(format!("{} is not a valid number of seconds", secs)))
}

fn timeout(secs: Option<f64>) -> Result<Option<Duration>> {
    secs.map(seconds).transpose()
}

/// Script made of `test.yaml` steps
#[derive(Debug, Clone)]
pub struct StepScript {
    steps: Vec<Step>,
}

impl StepScript {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

#[async_trait]
impl Script for StepScript {
    async fn run(&self, ctx: &mut ScriptContext<'_>) -> Result<ScriptValue> {
        for (i, step) in self.steps.iter().enumerate() {
            debug!("{} step {}: {:?}", ctx.test(), i + 1, step);
            match step {
                Step::Wait { image, timeout_secs } => {
                    ctx.session.wait(image.target(), timeout(*timeout_secs)?).await?;
                }
                Step::Find { image, timeout_secs } => {
                    let found = ctx.session.find(image.target(), timeout(*timeout_secs)?).await?;
                    ctx.log.info(format!(
                        "Found {} at ({}, {}), confidence {:.3}",
                        found.image.name(),
                        found.x,
                        found.y,
                        found.confidence
                    ));
                }
                Step::Click { target } => ctx.session.click(target.position()).await?,
                Step::RightClick { target } => ctx.session.right_click(target.position()).await?,
                Step::DoubleClick { target } => ctx.session.double_click(target.position()).await?,
                Step::Hover { target } => ctx.session.hover(target.position()).await?,
                Step::Type { keys } => ctx.session.type_input(&keys.input()?).await?,
                Step::Sleep { secs } => ctx.session.sleep(seconds(*secs)?).await,
                Step::LogScreen { name } => {
                    let path = ctx.artifact(&format!("-{}.png", name));
                    ctx.session.log_screen(&path).await?;
                    ctx.log.info(format!("Screen saved to {}", path.display()));
                }
                Step::Log { message } => ctx.log.info(message),
                Step::Fail { message } => return Err(Error::TestFailure(message.clone())),
                Step::Return {
                    value,
                    passed,
                    message,
                } => return Ok(returned(value.as_ref(), *passed, message.as_deref())),
            }
        }
        Ok(ScriptValue::Unit)
    }
}

/// Saves the screen once and passes: proves a machine boots to a display
#[derive(Debug, Default)]
pub struct CaptureScript;

#[async_trait]
impl Script for CaptureScript {
    async fn run(&self, ctx: &mut ScriptContext<'_>) -> Result<ScriptValue> {
        let path = ctx.artifact("-screen.png");
        ctx.session.log_screen(&path).await?;
        Ok(ScriptValue::passed(format!("screen captured to {}", path.display())))
    }
}

/// Rust scripts available to `builtin:` descriptors
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    scripts: BTreeMap<String, Arc<dyn Script>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the scripts shipped with the runner
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("capture", Arc::new(CaptureScript));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, script: Arc<dyn Script>) {
        self.scripts.insert(name.into(), script);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Script>> {
        self.scripts.get(name).cloned().ok_or_else(|| {
            Error::usage(format!(
                "unknown builtin script '{}' (known: {})",
                name,
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scripts.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn test_verdict_is_taken_verbatim() {
        let (outcome, message) = ScriptValue::failed("bad password").verdict();
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(message, "bad password");
    }

    #[test]
    fn test_unit_passes_with_sentinel() {
        assert_eq!(ScriptValue::Unit.verdict(), (Outcome::Passed, NO_RESULT.to_string()));
    }

    #[test_case(json!(42) => (Outcome::Passed, "42".to_string()) ; "number")]
    #[test_case(json!(0) => (Outcome::Failed, "0".to_string()) ; "zero")]
    #[test_case(json!(true) => (Outcome::Passed, "true".to_string()) ; "true")]
    #[test_case(json!(false) => (Outcome::Failed, "false".to_string()) ; "false")]
    #[test_case(json!("done") => (Outcome::Passed, "done".to_string()) ; "string")]
    #[test_case(json!("") => (Outcome::Failed, "".to_string()) ; "empty string")]
    #[test_case(json!([]) => (Outcome::Failed, "[]".to_string()) ; "empty list")]
    #[test_case(json!(null) => (Outcome::Failed, "null".to_string()) ; "null")]
    fn test_value_truthiness(value: serde_json::Value) -> (Outcome, String) {
        ScriptValue::Value(value).verdict()
    }

    #[test_case(None, Some(false), None => ScriptValue::failed("") ; "verdict only")]
    #[test_case(Some(json!(1)), Some(false), Some("no") => ScriptValue::failed("no") ; "verdict wins over value")]
    #[test_case(Some(json!(0)), None, Some("nothing found") => ScriptValue::failed("nothing found") ; "value with message")]
    #[test_case(Some(json!(7)), None, None => ScriptValue::Value(json!(7)) ; "value only")]
    #[test_case(None, None, Some("hub reached") => ScriptValue::passed("hub reached") ; "message only")]
    #[test_case(None, None, None => ScriptValue::Unit ; "nothing")]
    fn test_returned(
        value: Option<serde_json::Value>,
        passed: Option<bool>,
        message: Option<&str>,
    ) -> ScriptValue {
        returned(value.as_ref(), passed, message)
    }

    #[test]
    fn test_parse_steps() {
        let yaml = r#"
- { action: wait, image: grub }
- { action: wait, image: [user_completed, user_completed_white], timeout_secs: 10 }
- { action: click, target: continue }
- { action: click, target: [512, 384] }
- { action: type, keys: ["<alt>", "d"] }
- { action: type, keys: "<enter>" }
- { action: log_screen, name: after-user }
- { action: return, passed: false, message: bad password }
"#;
        let steps: Vec<Step> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(steps.len(), 8);

        match &steps[1] {
            Step::Wait { image, timeout_secs } => {
                assert_eq!(image.target().to_string(), "[user_completed, user_completed_white]");
                assert_eq!(*timeout_secs, Some(10.0));
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert!(matches!(
            &steps[3],
            Step::Click { target } if matches!(target.position(), Position::Point(512, 384))
        ));
        match &steps[4] {
            Step::Type { keys } => assert!(matches!(keys.input().unwrap(), KeyInput::Combo { .. })),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_malformed_combination_is_a_usage_error() {
        let keys = KeysRef::Combo(vec!["a".into(), "b".into()]);
        assert!(matches!(keys.input(), Err(Error::Usage(_))));
    }

    #[test]
    fn test_registry() {
        let registry = ScriptRegistry::with_builtins();
        assert!(registry.get("capture").is_ok());
        assert!(matches!(registry.get("nope"), Err(Error::Usage(_))));
    }
}
