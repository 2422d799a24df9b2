//! Deterministic fakes for every external collaborator.
//!
//! Used by the unit and integration tests and by offline CLI runs. Nothing
//! here talks to a real browser, vault, or model.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::driver::{AutomationDriver, DriverError, DriverResult, Locator, WaitCondition};
use crate::error::EngineError;
use crate::services::{
    AiJudge, AuditEntry, AuditLogger, CapabilityValidator, Credential, CredentialVault, JudgeContext, Validation,
};
use crate::types::Action;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct DriverState {
    permissive: bool,
    elements: HashSet<Locator>,
    page_text: String,
    url: String,
    dead: bool,
    failures: HashMap<&'static str, VecDeque<DriverError>>,
    delays: HashMap<&'static str, Duration>,
    delays_once: HashMap<&'static str, Duration>,
    calls: HashMap<&'static str, usize>,
    filled: Vec<String>,
    sessions: HashMap<String, bool>,
    screenshots: usize,
    eval_result: Option<Value>,
}

/// Programmable [`AutomationDriver`].
///
/// Elements exist only when added with [`Self::add_element`] (or always, for
/// [`Self::permissive`]). Failures and delays are queued per operation name
/// (`"click"`, `"fill"`, `"restart"`, ...).
#[derive(Debug, Default)]
pub struct ScriptedDriver {
    state: Mutex<DriverState>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every locator resolves and every script reports success.
    pub fn permissive() -> Self {
        let driver = Self::new();
        lock(&driver.state).permissive = true;
        driver
    }

    pub fn add_element(&self, locator: Locator) {
        lock(&self.state).elements.insert(locator);
    }

    pub fn remove_element(&self, locator: &Locator) {
        lock(&self.state).elements.remove(locator);
    }

    pub fn set_page_text(&self, text: impl Into<String>) {
        lock(&self.state).page_text = text.into();
    }

    pub fn set_url(&self, url: impl Into<String>) {
        lock(&self.state).url = url.into();
    }

    pub fn set_alive(&self, alive: bool) {
        lock(&self.state).dead = !alive;
    }

    /// Persisted session for `domain`; `authenticated` is what restore reports.
    pub fn set_session(&self, domain: impl Into<String>, authenticated: bool) {
        lock(&self.state).sessions.insert(domain.into(), authenticated);
    }

    pub fn has_session(&self, domain: &str) -> bool {
        lock(&self.state).sessions.contains_key(domain)
    }

    pub fn set_eval_result(&self, value: Value) {
        lock(&self.state).eval_result = Some(value);
    }

    /// Queue an error for the next call of `op`.
    pub fn fail_next(&self, op: &'static str, error: DriverError) {
        lock(&self.state).failures.entry(op).or_default().push_back(error);
    }

    /// Delay every call of `op`.
    pub fn set_delay(&self, op: &'static str, delay: Duration) {
        lock(&self.state).delays.insert(op, delay);
    }

    /// Delay only the next call of `op`.
    pub fn set_delay_once(&self, op: &'static str, delay: Duration) {
        lock(&self.state).delays_once.insert(op, delay);
    }

    pub fn calls(&self, op: &str) -> usize {
        lock(&self.state).calls.get(op).copied().unwrap_or(0)
    }

    /// Values passed to `fill`, in call order.
    pub fn filled_values(&self) -> Vec<String> {
        lock(&self.state).filled.clone()
    }

    async fn enter(&self, op: &'static str) -> DriverResult<()> {
        let (delay, failure) = {
            let mut s = lock(&self.state);
            *s.calls.entry(op).or_default() += 1;
            let delay = s.delays_once.remove(op).or_else(|| s.delays.get(op).copied());
            let failure = s.failures.get_mut(op).and_then(VecDeque::pop_front);
            (delay, failure)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn resolve(&self, locator: &Locator) -> DriverResult<()> {
        let s = lock(&self.state);
        if s.permissive || s.elements.contains(locator) {
            Ok(())
        } else {
            Err(DriverError::NotFound(locator.to_string()))
        }
    }
}

#[async_trait]
impl AutomationDriver for ScriptedDriver {
    async fn navigate(&self, url: &str) -> DriverResult<()> {
        self.enter("navigate").await?;
        lock(&self.state).url = url.to_string();
        Ok(())
    }

    async fn click(&self, target: &Locator, _force: bool) -> DriverResult<()> {
        self.enter("click").await?;
        self.resolve(target)
    }

    async fn fill(&self, target: &Locator, value: &str) -> DriverResult<()> {
        self.enter("fill").await?;
        self.resolve(target)?;
        lock(&self.state).filled.push(value.to_string());
        Ok(())
    }

    async fn select(&self, target: &Locator, _value: &str) -> DriverResult<()> {
        self.enter("select").await?;
        self.resolve(target)
    }

    async fn submit(&self, target: Option<&Locator>) -> DriverResult<()> {
        self.enter("submit").await?;
        match target {
            Some(t) => self.resolve(t),
            None => Ok(()),
        }
    }

    async fn extract_text(&self, target: Option<&Locator>) -> DriverResult<String> {
        self.enter("extract_text").await?;
        if let Some(t) = target {
            self.resolve(t)?;
        }
        Ok(lock(&self.state).page_text.clone())
    }

    async fn screenshot(&self) -> DriverResult<String> {
        self.enter("screenshot").await?;
        let mut s = lock(&self.state);
        s.screenshots += 1;
        Ok(format!("screenshot-{}", s.screenshots))
    }

    async fn scroll(&self, _delta_y: i64) -> DriverResult<()> {
        self.enter("scroll").await
    }

    async fn wait_for(&self, condition: &WaitCondition, timeout: Duration) -> DriverResult<()> {
        self.enter("wait_for").await?;
        match condition {
            WaitCondition::Element(locator) => self
                .resolve(locator)
                .map_err(|_| DriverError::Timeout(format!("{locator} after {}ms", timeout.as_millis()))),
            WaitCondition::NetworkIdle | WaitCondition::Delay => Ok(()),
        }
    }

    async fn text_content(&self) -> DriverResult<String> {
        self.enter("text_content").await?;
        Ok(lock(&self.state).page_text.clone())
    }

    async fn current_url(&self) -> DriverResult<String> {
        self.enter("current_url").await?;
        Ok(lock(&self.state).url.clone())
    }

    async fn evaluate(&self, _script: &str) -> DriverResult<Value> {
        self.enter("evaluate").await?;
        let s = lock(&self.state);
        Ok(s.eval_result.clone().unwrap_or(Value::Bool(s.permissive)))
    }

    async fn is_alive(&self) -> bool {
        let mut s = lock(&self.state);
        *s.calls.entry("is_alive").or_default() += 1;
        !s.dead
    }

    async fn close(&self) -> DriverResult<()> {
        self.enter("close").await?;
        lock(&self.state).dead = true;
        Ok(())
    }

    async fn restart(&self) -> DriverResult<()> {
        self.enter("restart").await?;
        lock(&self.state).dead = false;
        Ok(())
    }

    async fn restore_session(&self, domain: &str) -> DriverResult<bool> {
        self.enter("restore_session").await?;
        Ok(lock(&self.state).sessions.get(domain).copied().unwrap_or(false))
    }

    async fn clear_session(&self, domain: &str) -> DriverResult<()> {
        self.enter("clear_session").await?;
        lock(&self.state).sessions.remove(domain);
        Ok(())
    }
}

/// Returns the same verdict for every action.
pub struct StaticValidator {
    verdict: Validation,
}

impl StaticValidator {
    pub fn new(verdict: Validation) -> Self {
        Self { verdict }
    }
}

#[async_trait]
impl CapabilityValidator for StaticValidator {
    async fn validate(&self, _user_id: &str, _action: &Action) -> Validation {
        self.verdict.clone()
    }
}

/// In-memory credential vault keyed by (user, domain).
#[derive(Default)]
pub struct MapVault {
    creds: Mutex<HashMap<(String, String), Credential>>,
    refreshable: Mutex<bool>,
}

impl MapVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: &str, domain: &str, credential: Credential) {
        lock(&self.creds).insert((user_id.to_string(), domain.to_string()), credential);
    }

    /// Whether [`CredentialVault::refresh`] can renew expired entries.
    pub fn set_refreshable(&self, refreshable: bool) {
        *lock(&self.refreshable) = refreshable;
    }
}

#[async_trait]
impl CredentialVault for MapVault {
    async fn get(&self, user_id: &str, domain: &str) -> Result<Option<Credential>, EngineError> {
        Ok(lock(&self.creds)
            .get(&(user_id.to_string(), domain.to_string()))
            .cloned())
    }

    async fn refresh(&self, user_id: &str, domain: &str) -> Result<bool, EngineError> {
        if !*lock(&self.refreshable) {
            return Ok(false);
        }
        let mut creds = lock(&self.creds);
        match creds.get_mut(&(user_id.to_string(), domain.to_string())) {
            Some(c) => {
                c.expired = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Keeps every audit entry; can be switched to fail.
#[derive(Default)]
pub struct RecordingAuditLogger {
    entries: Mutex<Vec<AuditEntry>>,
    failing: bool,
}

impl RecordingAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every write fails.
    pub fn failing() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        lock(&self.entries).clone()
    }
}

impl AuditLogger for RecordingAuditLogger {
    fn log_step(&self, entry: AuditEntry) -> Result<(), String> {
        if self.failing {
            return Err("audit sink unavailable".to_string());
        }
        lock(&self.entries).push(entry);
        Ok(())
    }
}

/// Replays scripted judge replies in order; the last reply repeats.
pub struct ScriptedJudge {
    replies: Mutex<VecDeque<Result<String, EngineError>>>,
    last: Mutex<Option<Result<String, EngineError>>>,
    calls: Mutex<usize>,
}

impl ScriptedJudge {
    pub fn new(replies: Vec<Result<String, EngineError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            calls: Mutex::new(0),
        }
    }

    /// Judge that always answers with `reply`.
    pub fn always(reply: impl Into<String>) -> Self {
        Self::new(vec![Ok(reply.into())])
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl AiJudge for ScriptedJudge {
    async fn judge(&self, _screenshot_ref: &str, _context: &JudgeContext) -> Result<String, EngineError> {
        *lock(&self.calls) += 1;
        let next = lock(&self.replies).pop_front();
        match next {
            Some(reply) => {
                *lock(&self.last) = Some(reply.clone());
                reply
            }
            None => lock(&self.last)
                .clone()
                .unwrap_or_else(|| Err(EngineError::Transient("no scripted reply".into()))),
        }
    }
}
