//! Automation driver boundary.
//!
//! Any browser backend that implements [`AutomationDriver`] plugs into the
//! fallback method chains. Element resolution is delegated to the driver via
//! [`Locator`] variants; the engine never inspects the DOM itself.
//!
//! Calls may block on the remote target. The engine always wraps them in a
//! timeout, so an unresponsive driver call is abandoned, never hard-killed.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the driver should find an element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum Locator {
    Css(String),
    XPath(String),
    /// Visible text content.
    Text(String),
    /// ARIA role plus accessible name.
    Role { role: String, name: String },
    /// Associated `<label>` text.
    Label(String),
    Placeholder(String),
    /// Form field `name` attribute.
    Name(String),
    /// Natural-language description resolved by a vision model.
    Vision(String),
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Css(s) => write!(f, "css={s}"),
            Self::XPath(s) => write!(f, "xpath={s}"),
            Self::Text(s) => write!(f, "text={s}"),
            Self::Role { role, name } => write!(f, "role={role}[{name}]"),
            Self::Label(s) => write!(f, "label={s}"),
            Self::Placeholder(s) => write!(f, "placeholder={s}"),
            Self::Name(s) => write!(f, "name={s}"),
            Self::Vision(s) => write!(f, "vision={s}"),
        }
    }
}

/// Condition for [`AutomationDriver::wait_for`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitCondition {
    /// Element becomes present.
    Element(Locator),
    /// No in-flight network requests.
    NetworkIdle,
    /// Fixed delay.
    Delay,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("session closed: {0}")]
    SessionClosed(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Failed(String),
}

impl DriverError {
    /// Short error class recorded in failure memory.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "timeout",
            Self::SessionClosed(_) => "session_closed",
            Self::Unauthorized(_) => "unauthorized",
            Self::Unsupported(_) => "unsupported",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_session_loss(&self) -> bool {
        matches!(self, Self::SessionClosed(_))
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

#[async_trait]
pub trait AutomationDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> DriverResult<()>;

    /// `force` skips actionability checks (visibility, overlap).
    async fn click(&self, target: &Locator, force: bool) -> DriverResult<()>;

    async fn fill(&self, target: &Locator, value: &str) -> DriverResult<()>;

    async fn select(&self, target: &Locator, value: &str) -> DriverResult<()>;

    /// Submit the form containing `target`, or the focused form when `None`.
    async fn submit(&self, target: Option<&Locator>) -> DriverResult<()>;

    /// Text of `target`, or of the whole page when `None`.
    async fn extract_text(&self, target: Option<&Locator>) -> DriverResult<String>;

    /// Capture the viewport; returns an opaque reference to the stored image.
    async fn screenshot(&self) -> DriverResult<String>;

    async fn scroll(&self, delta_y: i64) -> DriverResult<()>;

    async fn wait_for(&self, condition: &WaitCondition, timeout: Duration) -> DriverResult<()>;

    /// Full visible text of the current page.
    async fn text_content(&self) -> DriverResult<String>;

    async fn current_url(&self) -> DriverResult<String>;

    /// Run a script in the page and return its JSON result.
    async fn evaluate(&self, script: &str) -> DriverResult<serde_json::Value>;

    async fn is_alive(&self) -> bool;

    async fn close(&self) -> DriverResult<()>;

    /// Tear down and create a fresh session after [`Self::is_alive`] fails.
    async fn restart(&self) -> DriverResult<()>;

    /// Restore persisted cookies/storage for `domain`. `Ok(true)` means the
    /// restored session is authenticated.
    async fn restore_session(&self, _domain: &str) -> DriverResult<bool> {
        Ok(false)
    }

    /// Drop persisted session state for `domain`.
    async fn clear_session(&self, _domain: &str) -> DriverResult<()> {
        Ok(())
    }
}
