//! Core data model: actions, step results, and task outcomes.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Kind of automation instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Navigate,
    Click,
    Fill,
    Select,
    Submit,
    Extract,
    Screenshot,
    Scroll,
    Wait,
    Verify,
    Login,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Click => "click",
            Self::Fill => "fill",
            Self::Select => "select",
            Self::Submit => "submit",
            Self::Extract => "extract",
            Self::Screenshot => "screenshot",
            Self::Scroll => "scroll",
            Self::Wait => "wait",
            Self::Verify => "verify",
            Self::Login => "login",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let t = match s.trim().to_ascii_lowercase().as_str() {
            "navigate" => Self::Navigate,
            "click" => Self::Click,
            "fill" => Self::Fill,
            "select" => Self::Select,
            "submit" => Self::Submit,
            "extract" => Self::Extract,
            "screenshot" => Self::Screenshot,
            "scroll" => Self::Scroll,
            "wait" => Self::Wait,
            "verify" => Self::Verify,
            "login" => Self::Login,
            _ => return None,
        };
        Some(t)
    }

    /// Actions that may trigger navigation or XHR traffic.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::Navigate | Self::Click | Self::Select | Self::Submit | Self::Login
        )
    }

    /// Meta steps skip the post-action evidence screenshot.
    pub fn is_meta(self) -> bool {
        matches!(self, Self::Wait | Self::Verify | Self::Screenshot)
    }

    /// Whether a failed step of this type is retried at step level.
    pub fn retried_at_step_level(self) -> bool {
        !matches!(self, Self::Verify | Self::Wait)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed parameters for an [`Action`]. Unused fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionParams {
    /// CSS (or `xpath=`-prefixed XPath) selector for the target element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Visible text, label, or accessible name of the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Value to fill or option to select.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Wait duration or wait-for timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Vertical scroll delta in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_y: Option<i64>,
}

/// One atomic automation instruction. Immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub params: ActionParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
}

impl Action {
    pub fn new(action_type: ActionType) -> Self {
        Self {
            action_type,
            params: ActionParams::default(),
            expected_outcome: None,
        }
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        let mut a = Self::new(ActionType::Navigate);
        a.params.url = Some(url.into());
        a
    }

    pub fn click(selector: impl Into<String>) -> Self {
        Self::new(ActionType::Click).with_selector(selector)
    }

    pub fn fill(selector: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(ActionType::Fill)
            .with_selector(selector)
            .with_value(value)
    }

    pub fn select(selector: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(ActionType::Select)
            .with_selector(selector)
            .with_value(value)
    }

    pub fn wait(ms: u64) -> Self {
        let mut a = Self::new(ActionType::Wait);
        a.params.timeout_ms = Some(ms);
        a
    }

    pub fn verify_text(text: impl Into<String>) -> Self {
        Self::new(ActionType::Verify).with_text(text)
    }

    pub fn login() -> Self {
        Self::new(ActionType::Login)
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.params.selector = Some(selector.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.params.text = Some(text.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.params.value = Some(value.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.params.username = Some(username.into());
        self.params.password = Some(password.into());
        self
    }

    pub fn with_expected_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.expected_outcome = Some(outcome.into());
        self
    }

    /// Short human-readable label for logs.
    pub fn describe(&self) -> String {
        let target = self
            .params
            .selector
            .as_deref()
            .or(self.params.text.as_deref())
            .or(self.params.url.as_deref());
        match target {
            Some(t) => format!("{} {}", self.action_type, t),
            None => self.action_type.to_string(),
        }
    }
}

/// Outcome of one step. The orchestrator keeps exactly one per step: a
/// retried step replaces its earlier attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub success: bool,
    pub action: Action,
    /// Fallback method that produced the result (e.g. `click_text`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_ref: Option<String>,
    pub duration_ms: u64,
    /// Step-level attempts consumed (1 = first try succeeded or failed terminally).
    pub attempts: u32,
}

impl StepResult {
    pub fn failed(step_index: usize, action: &Action, kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            step_index,
            success: false,
            action: action.clone(),
            method: None,
            data: None,
            error: Some(error.into()),
            error_kind: Some(kind),
            screenshot_ref: None,
            duration_ms: 0,
            attempts: 1,
        }
    }
}

/// Who is running the task, against which site, for what purpose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: String,
    pub user_id: String,
    /// Site domain used as the learning key (e.g. `example.com`).
    pub domain: String,
    /// Verification profile key (e.g. `booking`, `purchase`).
    pub task_type: String,
    /// Known-issues preamble injected before the first attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_issues: Option<String>,
    /// Hints from a previous failed attempt of the same task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub correction_hints: Vec<String>,
}

impl TaskContext {
    pub fn new(user_id: impl Into<String>, domain: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            domain: domain.into(),
            task_type: task_type.into(),
            known_issues: None,
            correction_hints: Vec::new(),
        }
    }
}

/// Structured result of running an action list. Failures carry the partial
/// log; a failed task is never reported as a partial success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub success: bool,
    pub steps: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Index of the step that ended the task, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<usize>,
    pub duration_ms: u64,
}

impl TaskOutcome {
    /// Percentage of logged steps that succeeded, if any ran.
    pub fn action_success_rate(&self) -> Option<f64> {
        if self.steps.is_empty() {
            return None;
        }
        let ok = self.steps.iter().filter(|s| s.success).count();
        Some(ok as f64 * 100.0 / self.steps.len() as f64)
    }

    /// Concatenated `extract` payloads, in step order.
    pub fn extracted(&self) -> Vec<&serde_json::Value> {
        self.steps
            .iter()
            .filter(|s| s.action.action_type == ActionType::Extract)
            .filter_map(|s| s.data.as_ref())
            .collect()
    }
}
