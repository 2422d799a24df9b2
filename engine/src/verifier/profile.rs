//! Per-task-type verification profiles and quality tiers.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Aspirational quality level for a task type. Targets shape hints and the
/// number of task attempts; the pass threshold stays fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Financial,
    BrowserAction,
    Communication,
    Research,
    Simple,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierTarget {
    pub confidence: f64,
    pub max_attempts: u32,
    /// Force the vision review regardless of the composite score.
    pub always_vision: bool,
}

impl QualityTier {
    pub fn target(self) -> TierTarget {
        let (confidence, max_attempts, always_vision) = match self {
            Self::Financial => (99.0, 3, true),
            Self::BrowserAction => (95.0, 3, false),
            Self::Communication => (90.0, 2, false),
            Self::Research => (80.0, 2, false),
            Self::Simple => (70.0, 1, false),
        };
        TierTarget {
            confidence,
            max_attempts,
            always_vision,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Financial => "financial",
            Self::BrowserAction => "browser_action",
            Self::Communication => "communication",
            Self::Research => "research",
            Self::Simple => "simple",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What success and failure look like for one task type.
#[derive(Debug, Clone)]
pub struct TaskProfile {
    pub task_type: &'static str,
    pub tier: QualityTier,
    /// Lowercase phrases signalling completion.
    pub success_indicators: &'static [&'static str],
    /// Lowercase phrases signalling failure.
    pub error_indicators: &'static [&'static str],
    /// Structured proof such as confirmation or order ids.
    pub evidence_patterns: &'static [Regex],
    /// URL fragments of a success page.
    pub success_url_fragments: &'static [&'static str],
    pub requires_screenshot: bool,
}

macro_rules! patterns {
    ($name:ident, [$($re:expr),* $(,)?]) => {
        static $name: LazyLock<Vec<Regex>> = LazyLock::new(|| {
            vec![$(Regex::new($re).expect(concat!(stringify!($name), " regex should compile"))),*]
        });
    };
}

/// Reference id after a keyword: uppercase, at least four characters, at
/// least one digit. Case-sensitive even inside `(?i)` patterns.
macro_rules! reference_id {
    () => {
        r"(?-i:([A-Z0-9][A-Z0-9-]{2,}[0-9][A-Z0-9-]*|[0-9][A-Z0-9-]{3,}))"
    };
}

patterns!(BOOKING_RE, [
    concat!(
        r"(?i)\b(?:booking|reservation|confirmation)\s*(?:reference|number|code|no\.?|id|#)\s*[:#]?\s*",
        reference_id!()
    ),
]);
patterns!(PURCHASE_RE, [
    concat!(r"(?i)\border\s*(?:number|no\.?|id|#)\s*[:#]?\s*", reference_id!()),
    concat!(r"(?i)\btransaction\s*(?:id|number|#)\s*[:#]?\s*", reference_id!()),
]);
patterns!(PAYMENT_RE, [
    concat!(
        r"(?i)\b(?:transaction|payment|receipt)\s*(?:id|number|no\.?|#)\s*[:#]?\s*",
        reference_id!()
    ),
]);
patterns!(FORM_RE, [
    concat!(
        r"(?i)\b(?:submission|reference|ticket|case|request)\s*(?:id|number|no\.?|#)\s*[:#]?\s*",
        reference_id!()
    ),
]);
patterns!(LOGIN_RE, [r"(?i)\b(?:signed|logged)\s+in\s+as\s+(\S+)"]);
patterns!(EMAIL_RE, [r"(?i)\bmessage[- ]id\s*[:#]?\s*(\S+)"]);
patterns!(MESSAGE_RE, [r"(?i)\b(?:delivered|sent)\s+(?:at|on)\s+(\d[\d:/ .-]*)"]);
patterns!(SEARCH_RE, [r"(?i)\b(\d[\d,]*)\s+results?\b"]);
patterns!(RESEARCH_RE, [r"(https?://\S+)"]);

fn patterns(set: &'static LazyLock<Vec<Regex>>) -> &'static [Regex] {
    set.as_slice()
}

/// Profile for `task_type`; unknown types get the `generic` profile.
pub fn profile_for(task_type: &str) -> TaskProfile {
    match task_type.trim().to_ascii_lowercase().as_str() {
        "booking" | "reservation" => TaskProfile {
            task_type: "booking",
            tier: QualityTier::BrowserAction,
            success_indicators: &[
                "booking confirmed",
                "reservation confirmed",
                "booking reference",
                "confirmation number",
                "your booking is complete",
                "thank you for your reservation",
            ],
            error_indicators: &[
                "no availability",
                "fully booked",
                "sold out",
                "booking failed",
                "session expired",
                "payment declined",
            ],
            evidence_patterns: patterns(&BOOKING_RE),
            success_url_fragments: &["/confirmation", "/booking/complete", "/thank-you", "/success"],
            requires_screenshot: false,
        },
        "purchase" | "checkout" => TaskProfile {
            task_type: "purchase",
            tier: QualityTier::Financial,
            success_indicators: &[
                "order confirmed",
                "order placed",
                "thank you for your order",
                "order number",
                "purchase complete",
            ],
            error_indicators: &[
                "payment declined",
                "card declined",
                "out of stock",
                "checkout failed",
                "transaction failed",
            ],
            evidence_patterns: patterns(&PURCHASE_RE),
            success_url_fragments: &["/order-confirmation", "/checkout/success", "/thank-you", "/receipt"],
            requires_screenshot: true,
        },
        "payment" => TaskProfile {
            task_type: "payment",
            tier: QualityTier::Financial,
            success_indicators: &[
                "payment successful",
                "payment received",
                "payment complete",
                "transaction approved",
            ],
            error_indicators: &[
                "payment declined",
                "insufficient funds",
                "transaction failed",
                "card declined",
            ],
            evidence_patterns: patterns(&PAYMENT_RE),
            success_url_fragments: &["/payment/success", "/receipt", "/paid"],
            requires_screenshot: true,
        },
        "form_submit" | "form" => TaskProfile {
            task_type: "form_submit",
            tier: QualityTier::BrowserAction,
            success_indicators: &[
                "thank you",
                "submitted successfully",
                "submission received",
                "we have received",
            ],
            error_indicators: &[
                "required field",
                "please correct",
                "submission failed",
                "is invalid",
            ],
            evidence_patterns: patterns(&FORM_RE),
            success_url_fragments: &["/thank-you", "/success", "/submitted"],
            requires_screenshot: false,
        },
        "login" => TaskProfile {
            task_type: "login",
            tier: QualityTier::BrowserAction,
            success_indicators: &["welcome back", "sign out", "log out", "my account", "dashboard"],
            error_indicators: &[
                "invalid password",
                "incorrect password",
                "login failed",
                "invalid credentials",
                "account locked",
            ],
            evidence_patterns: patterns(&LOGIN_RE),
            success_url_fragments: &["/dashboard", "/account", "/home", "/inbox"],
            requires_screenshot: false,
        },
        "email" => TaskProfile {
            task_type: "email",
            tier: QualityTier::Communication,
            success_indicators: &["message sent", "email sent", "your message has been sent"],
            error_indicators: &["failed to send", "delivery failed", "invalid recipient"],
            evidence_patterns: patterns(&EMAIL_RE),
            success_url_fragments: &["/sent", "#sent"],
            requires_screenshot: false,
        },
        "message" | "sms" => TaskProfile {
            task_type: "message",
            tier: QualityTier::Communication,
            success_indicators: &["message sent", "delivered"],
            error_indicators: &["failed to send", "not delivered", "message failed"],
            evidence_patterns: patterns(&MESSAGE_RE),
            success_url_fragments: &["/messages", "/chat"],
            requires_screenshot: false,
        },
        "search" => TaskProfile {
            task_type: "search",
            tier: QualityTier::Research,
            success_indicators: &["results for", "results found", "showing results"],
            error_indicators: &["no results", "nothing found", "0 results"],
            evidence_patterns: patterns(&SEARCH_RE),
            success_url_fragments: &["/search", "?q=", "&q="],
            requires_screenshot: false,
        },
        "research" => TaskProfile {
            task_type: "research",
            tier: QualityTier::Research,
            success_indicators: &["summary", "sources", "according to"],
            error_indicators: &["access denied", "page not found", "404"],
            evidence_patterns: patterns(&RESEARCH_RE),
            success_url_fragments: &[],
            requires_screenshot: false,
        },
        _ => TaskProfile {
            task_type: "generic",
            tier: QualityTier::Simple,
            success_indicators: &["success", "completed", "done", "thank you"],
            error_indicators: &["error", "failed", "something went wrong"],
            evidence_patterns: &[],
            success_url_fragments: &["/success", "/complete"],
            requires_screenshot: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_targets() {
        let fin = QualityTier::Financial.target();
        assert_eq!((fin.confidence, fin.max_attempts, fin.always_vision), (99.0, 3, true));
        assert_eq!(QualityTier::Simple.target().max_attempts, 1);
        assert!(!QualityTier::BrowserAction.target().always_vision);
    }

    #[test]
    fn test_profiles_map_to_tiers() {
        assert_eq!(profile_for("purchase").tier, QualityTier::Financial);
        assert_eq!(profile_for("Booking").tier, QualityTier::BrowserAction);
        assert_eq!(profile_for("email").tier, QualityTier::Communication);
        assert_eq!(profile_for("unheard_of").task_type, "generic");
    }

    #[test]
    fn test_booking_reference_pattern() {
        let profile = profile_for("booking");
        let caps = profile.evidence_patterns[0]
            .captures("Booking Reference: AB12-9087")
            .unwrap();
        assert_eq!(&caps[1], "AB12-9087");
    }

    #[test]
    fn test_evidence_rejects_plain_words() {
        let booking = profile_for("booking");
        let re = &booking.evidence_patterns[0];
        assert!(!re.is_match("Your reservation number will be emailed."));
        assert!(!re.is_match("booking reference PENDING"));
        assert!(re.is_match("reservation number: 2024-118"));

        let purchase = profile_for("purchase");
        assert!(!purchase.evidence_patterns.iter().any(|re| re.is_match("order number unavailable")));
        assert!(purchase.evidence_patterns[0].is_match("Order number: 77-ABCD"));
        assert!(!profile_for("form_submit").evidence_patterns[0].is_match("Ticket number pending"));
    }
}
