//! Fallback method chains.
//!
//! Each [`Method`] is one way of performing an action type against the
//! driver. [`chain_for`] gives the default order per action type; the action
//! executor may move a learned method to the front.
//!
//! | Action     | Chain                                                              |
//! |------------|--------------------------------------------------------------------|
//! | click      | css → xpath → text → role → label → force → js → vision            |
//! | fill       | standard → label → placeholder → name → js → react_hack → vision   |
//! | select     | standard → label → js                                              |
//! | submit     | button → form → js                                                 |
//! | navigate   | direct → js                                                        |
//! | extract    | selector → page                                                    |
//! | screenshot | standard                                                           |
//! | scroll     | standard → js                                                      |
//! | wait       | standard                                                           |
//! | verify     | text → url                                                         |
//! | login      | session_restore → vault_credentials → standard                     |

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::driver::{AutomationDriver, DriverError, Locator, WaitCondition};
use crate::error::EngineError;
use crate::services::CredentialVault;
use crate::types::{Action, ActionType, TaskContext};

const DEFAULT_WAIT_MS: u64 = 1_000;
const DEFAULT_ELEMENT_WAIT_MS: u64 = 5_000;
const DEFAULT_SCROLL_PX: i64 = 600;

const USERNAME_FIELD: &str =
    "input[type=email], input[name=username], input[name=email], input[autocomplete=username]";
const PASSWORD_FIELD: &str = "input[type=password]";
const SUBMIT_BUTTON: &str = "button[type=submit], input[type=submit]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    ClickCss,
    ClickXpath,
    ClickText,
    ClickRole,
    ClickLabel,
    ClickForce,
    ClickJs,
    ClickVision,
    FillStandard,
    FillLabel,
    FillPlaceholder,
    FillName,
    FillJs,
    FillReactHack,
    FillVision,
    SelectStandard,
    SelectLabel,
    SelectJs,
    SubmitButton,
    SubmitForm,
    SubmitJs,
    NavigateDirect,
    NavigateJs,
    ExtractSelector,
    ExtractPage,
    ScreenshotStandard,
    ScrollStandard,
    ScrollJs,
    WaitStandard,
    VerifyText,
    VerifyUrl,
    LoginSessionRestore,
    LoginVaultCredentials,
    LoginStandard,
}

const CLICK: &[Method] = &[
    Method::ClickCss,
    Method::ClickXpath,
    Method::ClickText,
    Method::ClickRole,
    Method::ClickLabel,
    Method::ClickForce,
    Method::ClickJs,
    Method::ClickVision,
];
const FILL: &[Method] = &[
    Method::FillStandard,
    Method::FillLabel,
    Method::FillPlaceholder,
    Method::FillName,
    Method::FillJs,
    Method::FillReactHack,
    Method::FillVision,
];
const SELECT: &[Method] = &[Method::SelectStandard, Method::SelectLabel, Method::SelectJs];
const SUBMIT: &[Method] = &[Method::SubmitButton, Method::SubmitForm, Method::SubmitJs];
const NAVIGATE: &[Method] = &[Method::NavigateDirect, Method::NavigateJs];
const EXTRACT: &[Method] = &[Method::ExtractSelector, Method::ExtractPage];
const SCREENSHOT: &[Method] = &[Method::ScreenshotStandard];
const SCROLL: &[Method] = &[Method::ScrollStandard, Method::ScrollJs];
const WAIT: &[Method] = &[Method::WaitStandard];
const VERIFY: &[Method] = &[Method::VerifyText, Method::VerifyUrl];
const LOGIN: &[Method] = &[
    Method::LoginSessionRestore,
    Method::LoginVaultCredentials,
    Method::LoginStandard,
];

/// Default fallback order for an action type.
pub fn chain_for(action_type: ActionType) -> &'static [Method] {
    match action_type {
        ActionType::Click => CLICK,
        ActionType::Fill => FILL,
        ActionType::Select => SELECT,
        ActionType::Submit => SUBMIT,
        ActionType::Navigate => NAVIGATE,
        ActionType::Extract => EXTRACT,
        ActionType::Screenshot => SCREENSHOT,
        ActionType::Scroll => SCROLL,
        ActionType::Wait => WAIT,
        ActionType::Verify => VERIFY,
        ActionType::Login => LOGIN,
    }
}

/// Inputs a method reads. Methods never mutate shared state beyond the driver.
pub struct MethodContext<'a> {
    pub driver: &'a dyn AutomationDriver,
    pub vault: &'a dyn CredentialVault,
    pub task: &'a TaskContext,
    pub action: &'a Action,
    /// Replacement selector from a learned fix.
    pub selector_override: Option<&'a str>,
}

impl MethodContext<'_> {
    fn selector(&self) -> Option<&str> {
        self.selector_override
            .or(self.action.params.selector.as_deref())
            .filter(|s| !s.trim().is_empty())
    }

    fn require_selector(&self) -> Result<&str, MethodError> {
        self.selector()
            .ok_or_else(|| MethodError::NotApplicable("no selector".into()))
    }

    /// Visible text of the target: explicit text, else derived from the selector.
    fn target_text(&self) -> Option<String> {
        self.action
            .params
            .text
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.selector().and_then(humanize_selector))
    }

    fn require_text(&self) -> Result<String, MethodError> {
        self.target_text()
            .ok_or_else(|| MethodError::NotApplicable("no target text".into()))
    }

    fn require_value(&self) -> Result<&str, MethodError> {
        self.action
            .params
            .value
            .as_deref()
            .ok_or_else(|| MethodError::NotApplicable("no value".into()))
    }

    /// Natural-language description for vision-guided methods.
    fn description(&self) -> Result<String, MethodError> {
        self.target_text()
            .or_else(|| self.action.expected_outcome.clone())
            .or_else(|| self.selector().map(str::to_string))
            .ok_or_else(|| MethodError::NotApplicable("nothing to describe".into()))
    }
}

#[derive(Debug, Clone, Error)]
pub enum MethodError {
    /// The method cannot be attempted with the action's parameters.
    #[error("not applicable: {0}")]
    NotApplicable(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Service(EngineError),
}

impl MethodError {
    pub fn is_session_loss(&self) -> bool {
        matches!(self, Self::Driver(e) if e.is_session_loss())
    }

    /// Short class recorded in failure memory.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::NotApplicable(_) => "not_applicable",
            Self::Driver(e) => e.error_type(),
            Self::Service(_) => "service",
        }
    }
}

impl Method {
    pub const ALL: &'static [Method] = &[
        Method::ClickCss,
        Method::ClickXpath,
        Method::ClickText,
        Method::ClickRole,
        Method::ClickLabel,
        Method::ClickForce,
        Method::ClickJs,
        Method::ClickVision,
        Method::FillStandard,
        Method::FillLabel,
        Method::FillPlaceholder,
        Method::FillName,
        Method::FillJs,
        Method::FillReactHack,
        Method::FillVision,
        Method::SelectStandard,
        Method::SelectLabel,
        Method::SelectJs,
        Method::SubmitButton,
        Method::SubmitForm,
        Method::SubmitJs,
        Method::NavigateDirect,
        Method::NavigateJs,
        Method::ExtractSelector,
        Method::ExtractPage,
        Method::ScreenshotStandard,
        Method::ScrollStandard,
        Method::ScrollJs,
        Method::WaitStandard,
        Method::VerifyText,
        Method::VerifyUrl,
        Method::LoginSessionRestore,
        Method::LoginVaultCredentials,
        Method::LoginStandard,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ClickCss => "click_css",
            Self::ClickXpath => "click_xpath",
            Self::ClickText => "click_text",
            Self::ClickRole => "click_role",
            Self::ClickLabel => "click_label",
            Self::ClickForce => "click_force",
            Self::ClickJs => "click_js",
            Self::ClickVision => "click_vision",
            Self::FillStandard => "fill_standard",
            Self::FillLabel => "fill_label",
            Self::FillPlaceholder => "fill_placeholder",
            Self::FillName => "fill_name",
            Self::FillJs => "fill_js",
            Self::FillReactHack => "fill_react_hack",
            Self::FillVision => "fill_vision",
            Self::SelectStandard => "select_standard",
            Self::SelectLabel => "select_label",
            Self::SelectJs => "select_js",
            Self::SubmitButton => "submit_button",
            Self::SubmitForm => "submit_form",
            Self::SubmitJs => "submit_js",
            Self::NavigateDirect => "navigate_direct",
            Self::NavigateJs => "navigate_js",
            Self::ExtractSelector => "extract_selector",
            Self::ExtractPage => "extract_page",
            Self::ScreenshotStandard => "screenshot_standard",
            Self::ScrollStandard => "scroll_standard",
            Self::ScrollJs => "scroll_js",
            Self::WaitStandard => "wait_standard",
            Self::VerifyText => "verify_text",
            Self::VerifyUrl => "verify_url",
            Self::LoginSessionRestore => "login_session_restore",
            Self::LoginVaultCredentials => "login_vault_credentials",
            Self::LoginStandard => "login_standard",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name() == name)
    }

    pub fn action_type(self) -> ActionType {
        match self {
            Self::ClickCss
            | Self::ClickXpath
            | Self::ClickText
            | Self::ClickRole
            | Self::ClickLabel
            | Self::ClickForce
            | Self::ClickJs
            | Self::ClickVision => ActionType::Click,
            Self::FillStandard
            | Self::FillLabel
            | Self::FillPlaceholder
            | Self::FillName
            | Self::FillJs
            | Self::FillReactHack
            | Self::FillVision => ActionType::Fill,
            Self::SelectStandard | Self::SelectLabel | Self::SelectJs => ActionType::Select,
            Self::SubmitButton | Self::SubmitForm | Self::SubmitJs => ActionType::Submit,
            Self::NavigateDirect | Self::NavigateJs => ActionType::Navigate,
            Self::ExtractSelector | Self::ExtractPage => ActionType::Extract,
            Self::ScreenshotStandard => ActionType::Screenshot,
            Self::ScrollStandard | Self::ScrollJs => ActionType::Scroll,
            Self::WaitStandard => ActionType::Wait,
            Self::VerifyText | Self::VerifyUrl => ActionType::Verify,
            Self::LoginSessionRestore | Self::LoginVaultCredentials | Self::LoginStandard => {
                ActionType::Login
            }
        }
    }

    /// Vision-guided method for an action type, if it has one.
    pub fn vision_for(action_type: ActionType) -> Option<Self> {
        match action_type {
            ActionType::Click => Some(Self::ClickVision),
            ActionType::Fill => Some(Self::FillVision),
            _ => None,
        }
    }

    /// Run this method once. `Ok` carries the step's data payload, if any.
    pub async fn run(self, ctx: &MethodContext<'_>) -> Result<Option<Value>, MethodError> {
        let d = ctx.driver;
        match self {
            Self::ClickCss => {
                let sel = ctx.require_selector()?;
                if is_xpath(sel) {
                    return Err(MethodError::NotApplicable("selector is xpath".into()));
                }
                d.click(&Locator::Css(sel.to_string()), false).await?;
            }
            Self::ClickXpath => {
                let xpath = match ctx.selector() {
                    Some(sel) if is_xpath(sel) => sel.trim_start_matches("xpath=").to_string(),
                    _ => text_xpath(&ctx.require_text()?),
                };
                d.click(&Locator::XPath(xpath), false).await?;
            }
            Self::ClickText => d.click(&Locator::Text(ctx.require_text()?), false).await?,
            Self::ClickRole => {
                let locator = Locator::Role {
                    role: "button".into(),
                    name: ctx.require_text()?,
                };
                d.click(&locator, false).await?;
            }
            Self::ClickLabel => d.click(&Locator::Label(ctx.require_text()?), false).await?,
            Self::ClickForce => {
                d.click(&Locator::Css(ctx.require_selector()?.to_string()), true)
                    .await?
            }
            Self::ClickJs => {
                let script = element_script(ctx.require_selector()?, "el.click();");
                expect_true(d.evaluate(&script).await?)?;
            }
            Self::ClickVision => d.click(&Locator::Vision(ctx.description()?), false).await?,

            Self::FillStandard => {
                let value = ctx.require_value()?;
                d.fill(&Locator::Css(ctx.require_selector()?.to_string()), value)
                    .await?;
            }
            Self::FillLabel => {
                let value = ctx.require_value()?;
                d.fill(&Locator::Label(ctx.require_text()?), value).await?;
            }
            Self::FillPlaceholder => {
                let value = ctx.require_value()?;
                d.fill(&Locator::Placeholder(ctx.require_text()?), value).await?;
            }
            Self::FillName => {
                let value = ctx.require_value()?;
                let name = field_name(ctx.require_selector()?)
                    .ok_or_else(|| MethodError::NotApplicable("no field name".into()))?;
                d.fill(&Locator::Name(name), value).await?;
            }
            Self::FillJs => {
                let value = js_string(ctx.require_value()?);
                let body = format!(
                    "el.value = {value}; el.dispatchEvent(new Event('input', {{ bubbles: true }}));"
                );
                let script = element_script(ctx.require_selector()?, &body);
                expect_true(d.evaluate(&script).await?)?;
            }
            Self::FillReactHack => {
                // Controlled inputs ignore direct `value` writes; go through the native setter.
                let value = js_string(ctx.require_value()?);
                let body = format!(
                    "const setter = Object.getOwnPropertyDescriptor(Object.getPrototypeOf(el), 'value').set; \
                     setter.call(el, {value}); \
                     el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
                     el.dispatchEvent(new Event('change', {{ bubbles: true }}));"
                );
                let script = element_script(ctx.require_selector()?, &body);
                expect_true(d.evaluate(&script).await?)?;
            }
            Self::FillVision => {
                let value = ctx.require_value()?;
                d.fill(&Locator::Vision(ctx.description()?), value).await?;
            }

            Self::SelectStandard => {
                let value = ctx.require_value()?;
                d.select(&Locator::Css(ctx.require_selector()?.to_string()), value)
                    .await?;
            }
            Self::SelectLabel => {
                let value = ctx.require_value()?;
                d.select(&Locator::Label(ctx.require_text()?), value).await?;
            }
            Self::SelectJs => {
                let value = js_string(ctx.require_value()?);
                let body = format!(
                    "el.value = {value}; el.dispatchEvent(new Event('change', {{ bubbles: true }}));"
                );
                let script = element_script(ctx.require_selector()?, &body);
                expect_true(d.evaluate(&script).await?)?;
            }

            Self::SubmitButton => {
                let sel = ctx.selector().unwrap_or(SUBMIT_BUTTON);
                d.click(&Locator::Css(sel.to_string()), false).await?;
            }
            Self::SubmitForm => {
                let target = ctx.selector().map(|s| Locator::Css(s.to_string()));
                d.submit(target.as_ref()).await?;
            }
            Self::SubmitJs => {
                let sel = ctx.selector().unwrap_or("form");
                let script = element_script(
                    sel,
                    "const form = el.closest('form') || el; \
                     if (form.requestSubmit) { form.requestSubmit(); } else { form.submit(); }",
                );
                expect_true(d.evaluate(&script).await?)?;
            }

            Self::NavigateDirect => d.navigate(require_url(ctx)?).await?,
            Self::NavigateJs => {
                let script = format!("window.location.href = {}; true", js_string(require_url(ctx)?));
                d.evaluate(&script).await?;
            }

            Self::ExtractSelector => {
                let sel = ctx.require_selector()?;
                let text = d.extract_text(Some(&Locator::Css(sel.to_string()))).await?;
                return Ok(Some(json!({ "selector": sel, "text": text })));
            }
            Self::ExtractPage => {
                let text = d.extract_text(None).await?;
                return Ok(Some(json!({ "text": text })));
            }

            Self::ScreenshotStandard => {
                let reference = d.screenshot().await?;
                return Ok(Some(json!({ "screenshot": reference })));
            }

            Self::ScrollStandard => {
                d.scroll(ctx.action.params.scroll_y.unwrap_or(DEFAULT_SCROLL_PX))
                    .await?
            }
            Self::ScrollJs => {
                let dy = ctx.action.params.scroll_y.unwrap_or(DEFAULT_SCROLL_PX);
                d.evaluate(&format!("window.scrollBy(0, {dy}); true")).await?;
            }

            Self::WaitStandard => match ctx.selector() {
                Some(sel) => {
                    let budget = ctx.action.params.timeout_ms.unwrap_or(DEFAULT_ELEMENT_WAIT_MS);
                    let condition = WaitCondition::Element(Locator::Css(sel.to_string()));
                    d.wait_for(&condition, Duration::from_millis(budget)).await?;
                }
                None => {
                    let ms = ctx.action.params.timeout_ms.unwrap_or(DEFAULT_WAIT_MS);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
            },

            Self::VerifyText => {
                let expected = ctx
                    .action
                    .params
                    .text
                    .as_deref()
                    .ok_or_else(|| MethodError::NotApplicable("no expected text".into()))?;
                let page = d.text_content().await?;
                if !page.to_lowercase().contains(&expected.to_lowercase()) {
                    return Err(DriverError::NotFound(format!("text '{expected}' not on page")).into());
                }
                return Ok(Some(json!({ "matched": expected })));
            }
            Self::VerifyUrl => {
                let expected = require_url(ctx)?;
                let url = d.current_url().await?;
                if !url.contains(expected) {
                    return Err(DriverError::NotFound(format!("url '{url}' does not contain '{expected}'")).into());
                }
                return Ok(Some(json!({ "url": url })));
            }

            Self::LoginSessionRestore => {
                if !d.restore_session(&ctx.task.domain).await? {
                    return Err(MethodError::NotApplicable("no stored session".into()));
                }
                return Ok(Some(json!({ "session": "restored" })));
            }
            Self::LoginVaultCredentials => {
                let p = &ctx.action.params;
                if p.username.is_some() && p.password.is_some() {
                    return Err(MethodError::NotApplicable("explicit credentials present".into()));
                }
                let cred = ctx
                    .vault
                    .get(&ctx.task.user_id, &ctx.task.domain)
                    .await
                    .map_err(MethodError::Service)?
                    .ok_or_else(|| MethodError::NotApplicable("no stored credential".into()))?;
                if cred.expired {
                    return Err(DriverError::Unauthorized("stored credential expired".into()).into());
                }
                submit_login(ctx, &cred.username, &cred.password).await?;
            }
            Self::LoginStandard => {
                let p = &ctx.action.params;
                let (Some(user), Some(pass)) = (p.username.as_deref(), p.password.as_deref()) else {
                    return Err(MethodError::NotApplicable("no explicit credentials".into()));
                };
                submit_login(ctx, user, pass).await?;
            }
        }
        Ok(None)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

async fn submit_login(ctx: &MethodContext<'_>, username: &str, password: &str) -> Result<(), MethodError> {
    let d = ctx.driver;
    if let Some(url) = ctx.action.params.url.as_deref() {
        d.navigate(url).await?;
    }
    d.fill(&Locator::Css(USERNAME_FIELD.into()), username).await?;
    d.fill(&Locator::Css(PASSWORD_FIELD.into()), password).await?;
    d.submit(None).await?;
    Ok(())
}

fn require_url<'a>(ctx: &'a MethodContext<'_>) -> Result<&'a str, MethodError> {
    ctx.action
        .params
        .url
        .as_deref()
        .ok_or_else(|| MethodError::NotApplicable("no url".into()))
}

fn is_xpath(selector: &str) -> bool {
    selector.starts_with("xpath=") || selector.starts_with("//") || selector.starts_with("(//")
}

/// XPath matching an element by its exact text.
fn text_xpath(text: &str) -> String {
    format!("//*[normalize-space(text())={}]", xpath_literal(text))
}

/// XPath 1.0 string literal for `text`. XPath has no escapes, so text with
/// both quote kinds is split into `concat()` pieces.
fn xpath_literal(text: &str) -> String {
    if !text.contains('\'') {
        return format!("'{text}'");
    }
    if !text.contains('"') {
        return format!("\"{text}\"");
    }
    let pieces: Vec<String> = text
        .split('\'')
        .map(|part| format!("'{part}'"))
        .collect();
    format!("concat({})", pieces.join(", \"'\", "))
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Script that runs `body` with `el` bound to the selector's element and
/// evaluates to `false` when the element is missing.
fn element_script(selector: &str, body: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({}); if (!el) return false; {body} return true; }})()",
        js_string(selector)
    )
}

fn expect_true(result: Value) -> Result<(), MethodError> {
    match result {
        Value::Bool(false) | Value::Null => Err(DriverError::NotFound("script found no element".into()).into()),
        _ => Ok(()),
    }
}

static ATTR_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[(?:name|id|aria-label|data-testid)\s*[*^$]?=\s*["']?([^"'\]]+)["']?\]"#)
        .expect("ATTR_VALUE_RE regex should compile")
});
static LAST_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[#.]([A-Za-z0-9_-]+)\s*$").expect("LAST_TOKEN_RE regex should compile"));

/// `name` attribute a selector most likely targets.
fn field_name(selector: &str) -> Option<String> {
    if let Some(c) = ATTR_VALUE_RE.captures(selector) {
        return Some(c[1].to_string());
    }
    LAST_TOKEN_RE.captures(selector).map(|c| c[1].to_string())
}

/// Best-guess visible text for a selector: `#place-order` → `Place order`.
pub fn humanize_selector(selector: &str) -> Option<String> {
    if is_xpath(selector) {
        return None;
    }
    let token = field_name(selector)?;
    let words = token
        .split(|c: char| c == '-' || c == '_')
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let mut chars = words.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_order_matches_documented_fallbacks() {
        let click: Vec<_> = chain_for(ActionType::Click).iter().map(|m| m.name()).collect();
        assert_eq!(
            click,
            [
                "click_css",
                "click_xpath",
                "click_text",
                "click_role",
                "click_label",
                "click_force",
                "click_js",
                "click_vision"
            ]
        );
        assert_eq!(chain_for(ActionType::Fill)[5], Method::FillReactHack);
        assert_eq!(chain_for(ActionType::Login)[0], Method::LoginSessionRestore);
    }

    #[test]
    fn test_every_chained_method_belongs_to_its_action() {
        for m in Method::ALL {
            assert!(chain_for(m.action_type()).contains(m), "{m} missing from its chain");
            assert_eq!(Method::from_name(m.name()), Some(*m));
        }
        assert_eq!(Method::from_name("click_teleport"), None);
    }

    #[test]
    fn test_humanize_selector() {
        assert_eq!(humanize_selector("#submit").as_deref(), Some("Submit"));
        assert_eq!(humanize_selector("button.place-order").as_deref(), Some("Place order"));
        assert_eq!(humanize_selector("input[name=\"first_name\"]").as_deref(), Some("First name"));
        assert_eq!(humanize_selector("//button[1]"), None);
    }

    #[test]
    fn test_field_name_from_selector() {
        assert_eq!(field_name("input[name='email']").as_deref(), Some("email"));
        assert_eq!(field_name("#zip").as_deref(), Some("zip"));
    }

    #[test]
    fn test_text_xpath_quotes_any_text() {
        assert_eq!(text_xpath("Place order"), "//*[normalize-space(text())='Place order']");
        assert_eq!(text_xpath("Don't stop"), "//*[normalize-space(text())=\"Don't stop\"]");
        assert_eq!(
            text_xpath(r#"Say "hi" to Bob's team"#),
            r#"//*[normalize-space(text())=concat('Say "hi" to Bob', "'", 's team')]"#
        );
    }

    #[test]
    fn test_element_script_escapes_selector() {
        let s = element_script("a[href=\"/x\"]", "el.click();");
        assert!(s.contains(r#"document.querySelector("a[href=\"/x\"]")"#));
    }
}
