//! Intent Classifier
//!
//! Maps raw command text to a [`ParsedCommand`]:
//! - Structured patterns per intent family, tried in family order. The first
//!   match wins with confidence 0.85-0.95 and full parameter extraction.
//! - Keyword scoring fallback: matched / total keywords per family, the best
//!   family wins with confidence `min(score * 0.7, 0.7)`. Ties and weak
//!   scores resolve to [`Intent::Unknown`] with confidence 0.
//!
//! Pure: no I/O, no state.

use crate::models::{Intent, ParsedCommand};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::{json, Map, Value};

/// Optional trailing clause introduced by a sequencing keyword. The keyword
/// must follow a separator (`,` `;` `.` or "and") or open a new action, so
/// "to the next door cafe" stays one recipient.
const SEQUENCE_TAIL: &str = concat!(
    r"(?:(?:\s*[,;.]\s*|\s+and\s+)(?:then|after\s+that|afterwards|finally|next)\b.*",
    r"|\s+(?:then|after\s+that|afterwards|finally|next)\s*,?\s+",
    r"(?:pay|send|transfer|tip|swap|exchange|convert|trade|buy|sell|long|short|open|check|show|get|view|find|discover|search|list|what|which|how|\d+(?:\.\d+)?\s*x)\b.*)?$"
);

const TOKEN: &str = r"([a-z][a-z0-9]{1,9})";
const AMOUNT: &str = r"(\d+(?:\.\d+)?)";

/// Minimum keyword score for the fallback path to accept a family.
const MIN_KEYWORD_SCORE: f64 = 0.15;
const KEYWORD_CONFIDENCE_SCALE: f64 = 0.7;
const KEYWORD_CONFIDENCE_CAP: f64 = 0.7;

/// Words that can never be a token symbol even if a pattern captures them.
const RESERVED_WORDS: &[&str] = &[
    "to", "at", "for", "with", "then", "next", "on", "into", "and", "my", "me",
];

const KNOWN_TOKENS: &[&str] = &[
    "USDC", "USDT", "CRO", "ETH", "BTC", "WBTC", "WETH", "DAI", "SOL", "ATOM",
];

pub const EXAMPLE_COMMANDS: &[&str] = &[
    "pay 0.10 USDC to API service",
    "swap 10 CRO for USDC",
    "long BTC with 100 USDC at 5x",
    "check my USDC balance",
    "find weather services",
    "swap 10 CRO for USDC then pay 5 USDC to service",
];

static PAYMENT_KEYWORDS: &[&str] = &["pay", "send", "transfer", "payment", "tip", "remit"];
static SWAP_KEYWORDS: &[&str] = &["swap", "exchange", "convert", "trade", "buy", "sell"];
static LEVERAGE_KEYWORDS: &[&str] = &["leverage", "long", "short", "margin", "perp", "position"];
static BALANCE_KEYWORDS: &[&str] = &["balance", "holdings", "funds", "wallet", "how much", "portfolio"];
static DISCOVERY_KEYWORDS: &[&str] = &["find", "discover", "service", "api", "provider", "search"];

type Extractor = fn(&Captures) -> Option<Map<String, Value>>;

struct IntentPattern {
    intent: Intent,
    confidence: f64,
    regex: Regex,
    extract: Extractor,
}

impl IntentPattern {
    fn new(intent: Intent, confidence: f64, pattern: &str, extract: Extractor) -> Self {
        let regex = Regex::new(&format!("(?i){}", pattern))
            .unwrap_or_else(|e| panic!("invalid intent pattern {:?}: {}", pattern, e));
        Self {
            intent,
            confidence,
            regex,
            extract,
        }
    }
}

lazy_static! {
    static ref PATTERNS: Vec<IntentPattern> = vec![
        // --- payment ---
        IntentPattern::new(
            Intent::Payment,
            0.95,
            &format!(r"\b(?:pay|send|transfer)\s+{AMOUNT}\s*{TOKEN}\s+to\s+(.+?){SEQUENCE_TAIL}"),
            |c| payment_params(c.get(1)?.as_str(), Some(c.get(2)?.as_str()), c.get(3)?.as_str()),
        ),
        IntentPattern::new(
            Intent::Payment,
            0.9,
            &format!(r"\b(?:pay|send)\s+(.+?)\s+{AMOUNT}\s*{TOKEN}{SEQUENCE_TAIL}"),
            |c| payment_params(c.get(2)?.as_str(), Some(c.get(3)?.as_str()), c.get(1)?.as_str()),
        ),
        IntentPattern::new(
            Intent::Payment,
            0.85,
            &format!(r"\b(?:pay|send|transfer)\s+\${AMOUNT}\s+to\s+(.+?){SEQUENCE_TAIL}"),
            |c| payment_params(c.get(1)?.as_str(), None, c.get(2)?.as_str()),
        ),
        // --- swap ---
        IntentPattern::new(
            Intent::Swap,
            0.95,
            &format!(r"\b(?:swap|exchange|convert|trade)\s+{AMOUNT}\s*{TOKEN}\s+(?:for|to|into)\s+{TOKEN}\b"),
            |c| swap_params(c.get(1)?.as_str(), c.get(2)?.as_str(), c.get(3)?.as_str()),
        ),
        IntentPattern::new(
            Intent::Swap,
            0.9,
            &format!(r"\bbuy\s+{TOKEN}\s+with\s+{AMOUNT}\s*{TOKEN}\b"),
            |c| swap_params(c.get(2)?.as_str(), c.get(3)?.as_str(), c.get(1)?.as_str()),
        ),
        // --- leveraged trade ---
        IntentPattern::new(
            Intent::LeveragedTrade,
            0.95,
            &format!(r"\b(long|short)\s+{TOKEN}\s+(?:with\s+)?{AMOUNT}\s*{TOKEN}\s+(?:at\s+)?{AMOUNT}\s*x\b"),
            |c| leverage_params(
                c.get(1)?.as_str(),
                c.get(2)?.as_str(),
                c.get(3)?.as_str(),
                c.get(4).map(|m| m.as_str()),
                Some(c.get(5)?.as_str()),
            ),
        ),
        IntentPattern::new(
            Intent::LeveragedTrade,
            0.9,
            &format!(r"\b{AMOUNT}\s*x\s+(long|short)\s+(?:on\s+)?{TOKEN}\s+(?:with\s+)?{AMOUNT}(?:\s*{TOKEN})?"),
            |c| leverage_params(
                c.get(2)?.as_str(),
                c.get(3)?.as_str(),
                c.get(4)?.as_str(),
                c.get(5).map(|m| m.as_str()),
                Some(c.get(1)?.as_str()),
            ),
        ),
        IntentPattern::new(
            Intent::LeveragedTrade,
            0.85,
            &format!(r"\bopen\s+(?:a\s+)?(long|short)\s+(?:position\s+)?(?:on\s+)?{TOKEN}\s+(?:with\s+)?{AMOUNT}(?:\s*{TOKEN})?"),
            |c| leverage_params(
                c.get(1)?.as_str(),
                c.get(2)?.as_str(),
                c.get(3)?.as_str(),
                c.get(4).map(|m| m.as_str()),
                None,
            ),
        ),
        // --- balance check ---
        IntentPattern::new(
            Intent::BalanceCheck,
            0.95,
            &format!(r"\b(?:check|show|get|view)\s+(?:my\s+)?(?:{TOKEN}\s+)?balances?\b"),
            |c| Some(balance_params(c.get(1).map(|m| m.as_str()))),
        ),
        IntentPattern::new(
            Intent::BalanceCheck,
            0.9,
            &format!(r"\bhow\s+much\s+{TOKEN}\s+do\s+i\s+have\b"),
            |c| Some(balance_params(c.get(1).map(|m| m.as_str()))),
        ),
        IntentPattern::new(
            Intent::BalanceCheck,
            0.85,
            &format!(r"\bwhat(?:'s|\s+is)\s+my\s+(?:{TOKEN}\s+)?balance\b"),
            |c| Some(balance_params(c.get(1).map(|m| m.as_str()))),
        ),
        // --- discovery ---
        IntentPattern::new(
            Intent::Discovery,
            0.9,
            r"\b(?:find|discover|search\s+for|list|show)\s+(?:me\s+)?(?:all\s+)?(?:available\s+)?(?:([a-z][a-z0-9-]{1,20})\s+)?(?:services|apis|providers|endpoints)\b",
            |c| Some(discovery_params(c.get(1).map(|m| m.as_str()))),
        ),
        IntentPattern::new(
            Intent::Discovery,
            0.85,
            r"\b(?:what|which)\s+(?:services|apis|providers)\s+(?:are\s+)?(?:available|exist)(?:\s+for\s+([a-z][a-z0-9-]{1,20}))?",
            |c| Some(discovery_params(c.get(1).map(|m| m.as_str()))),
        ),
    ];

    static ref NUMBER: Regex = Regex::new(r"\d+(?:\.\d+)?").unwrap_or_else(|e| panic!("{}", e));
    static ref WORD: Regex = Regex::new(r"[A-Za-z][A-Za-z0-9]{1,9}").unwrap_or_else(|e| panic!("{}", e));
    static ref RECIPIENT: Regex = Regex::new(r"(?i)\bto\s+(.+)$").unwrap_or_else(|e| panic!("{}", e));
    static ref ACTION_START: Regex = Regex::new(
        r"(?i)^\s*,?\s*(?:pay|send|transfer|tip|swap|exchange|convert|trade|buy|sell|long|short|open|check|show|get|view|find|discover|search|list|what|which|how|\d+(?:\.\d+)?\s*x)\b"
    )
    .unwrap_or_else(|e| panic!("{}", e));
}

/// True when `text` begins with a verb that starts a new action.
pub fn opens_action(text: &str) -> bool {
    ACTION_START.is_match(text)
}

/// Whole-word (or whole-phrase) keyword match over pre-split words.
fn contains_keyword(words: &[&str], keyword: &str) -> bool {
    let parts: Vec<&str> = keyword.split_whitespace().collect();
    !parts.is_empty() && words.windows(parts.len()).any(|window| window == parts.as_slice())
}

/// Intent classifier
pub struct IntentClassifier;

impl IntentClassifier {
    /// Classify raw command text.
    pub fn classify(text: &str) -> ParsedCommand {
        let normalized = normalize(text);

        for pattern in PATTERNS.iter() {
            let Some(captures) = pattern.regex.captures(&normalized) else {
                continue;
            };
            if let Some(parameters) = (pattern.extract)(&captures) {
                return ParsedCommand {
                    intent: pattern.intent,
                    action: action_name(pattern.intent).to_string(),
                    parameters,
                    confidence: pattern.confidence,
                    raw_text: text.to_string(),
                };
            }
        }

        Self::classify_by_keywords(text, &normalized)
    }

    /// Example commands offered when nothing could be resolved.
    pub fn suggestions() -> Vec<String> {
        EXAMPLE_COMMANDS.iter().map(|s| s.to_string()).collect()
    }

    fn classify_by_keywords(raw: &str, normalized: &str) -> ParsedCommand {
        let lowered = normalized.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|word| !word.is_empty())
            .collect();

        let families: [(Intent, &[&str]); 5] = [
            (Intent::Payment, PAYMENT_KEYWORDS),
            (Intent::Swap, SWAP_KEYWORDS),
            (Intent::LeveragedTrade, LEVERAGE_KEYWORDS),
            (Intent::BalanceCheck, BALANCE_KEYWORDS),
            (Intent::Discovery, DISCOVERY_KEYWORDS),
        ];

        let mut best: Option<(Intent, f64)> = None;
        let mut tied = false;

        for (intent, keywords) in families {
            let matched = keywords.iter().filter(|kw| contains_keyword(&words, kw)).count();
            let score = matched as f64 / keywords.len() as f64;

            match best {
                Some((_, best_score)) if score > best_score => {
                    best = Some((intent, score));
                    tied = false;
                }
                Some((_, best_score)) if score == best_score => tied = true,
                Some(_) => {}
                None => best = Some((intent, score)),
            }
        }

        match best {
            Some((intent, score)) if !tied && score >= MIN_KEYWORD_SCORE => ParsedCommand {
                intent,
                action: action_name(intent).to_string(),
                parameters: best_effort_params(intent, normalized),
                confidence: (score * KEYWORD_CONFIDENCE_SCALE).min(KEYWORD_CONFIDENCE_CAP),
                raw_text: raw.to_string(),
            },
            _ => ParsedCommand {
                intent: Intent::Unknown,
                action: action_name(Intent::Unknown).to_string(),
                parameters: Map::new(),
                confidence: 0.0,
                raw_text: raw.to_string(),
            },
        }
    }
}

pub fn action_name(intent: Intent) -> &'static str {
    match intent {
        Intent::Payment => "send_payment",
        Intent::Swap => "swap_tokens",
        Intent::LeveragedTrade => "open_position",
        Intent::BalanceCheck => "check_balance",
        Intent::Discovery => "discover_services",
        Intent::Unknown => "unknown",
    }
}

fn normalize(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(|c: char| matches!(c, '.' | '!' | '?'))
        .to_string()
}

fn parse_amount(raw: &str) -> Option<Value> {
    let value: f64 = raw.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    serde_json::Number::from_f64(value).map(Value::Number)
}

fn symbol(raw: &str) -> Option<String> {
    let lowered = raw.to_lowercase();
    if RESERVED_WORDS.contains(&lowered.as_str()) {
        None
    } else {
        Some(raw.to_uppercase())
    }
}

fn payment_params(amount: &str, token: Option<&str>, recipient: &str) -> Option<Map<String, Value>> {
    let recipient = recipient.trim();
    if recipient.is_empty() {
        return None;
    }
    let token = match token {
        Some(raw) => symbol(raw)?,
        None => "USDC".to_string(),
    };

    let mut params = Map::new();
    params.insert("amount".into(), parse_amount(amount)?);
    params.insert("token".into(), json!(token));
    params.insert("recipient".into(), json!(recipient));
    Some(params)
}

fn swap_params(amount: &str, from: &str, to: &str) -> Option<Map<String, Value>> {
    let mut params = Map::new();
    params.insert("amount".into(), parse_amount(amount)?);
    params.insert("from_token".into(), json!(symbol(from)?));
    params.insert("to_token".into(), json!(symbol(to)?));
    Some(params)
}

fn leverage_params(
    direction: &str,
    asset: &str,
    amount: &str,
    collateral: Option<&str>,
    leverage: Option<&str>,
) -> Option<Map<String, Value>> {
    let leverage = match leverage {
        Some(raw) => parse_amount(raw)?,
        None => json!(1.0),
    };
    let collateral = collateral.and_then(symbol).unwrap_or_else(|| "USDC".to_string());

    let mut params = Map::new();
    params.insert("direction".into(), json!(direction.to_lowercase()));
    params.insert("asset".into(), json!(symbol(asset)?));
    params.insert("amount".into(), parse_amount(amount)?);
    params.insert("collateral_token".into(), json!(collateral));
    params.insert("leverage".into(), leverage);
    Some(params)
}

fn balance_params(token: Option<&str>) -> Map<String, Value> {
    let mut params = Map::new();
    if let Some(token) = token.and_then(symbol) {
        params.insert("token".into(), json!(token));
    }
    params
}

fn discovery_params(category: Option<&str>) -> Map<String, Value> {
    let mut params = Map::new();
    if let Some(category) = category {
        let category = category.to_lowercase();
        if !matches!(category.as_str(), "available" | "all" | "me") {
            params.insert("category".into(), json!(category));
        }
    }
    params
}

/// Fallback extraction: whatever numbers and token symbols can be found.
fn best_effort_params(intent: Intent, text: &str) -> Map<String, Value> {
    let mut params = Map::new();

    let amount = NUMBER.find(text).and_then(|m| parse_amount(m.as_str()));
    let tokens: Vec<String> = WORD
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|word| {
            let upper = word.to_uppercase();
            KNOWN_TOKENS.contains(&upper.as_str())
                || (word.len() <= 6 && word.chars().all(|c| c.is_ascii_uppercase()))
        })
        .map(|word| word.to_uppercase())
        .collect();

    match intent {
        Intent::Payment => {
            if let Some(amount) = amount {
                params.insert("amount".into(), amount);
            }
            if let Some(token) = tokens.first() {
                params.insert("token".into(), json!(token));
            }
            if let Some(recipient) = RECIPIENT.captures(text).and_then(|c| c.get(1)) {
                params.insert("recipient".into(), json!(recipient.as_str().trim()));
            }
        }
        Intent::Swap => {
            if let Some(amount) = amount {
                params.insert("amount".into(), amount);
            }
            if let Some(from) = tokens.first() {
                params.insert("from_token".into(), json!(from));
            }
            if let Some(to) = tokens.get(1) {
                params.insert("to_token".into(), json!(to));
            }
        }
        Intent::LeveragedTrade => {
            if let Some(amount) = amount {
                params.insert("amount".into(), amount);
            }
            if let Some(asset) = tokens.first() {
                params.insert("asset".into(), json!(asset));
            }
        }
        Intent::BalanceCheck => {
            if let Some(token) = tokens.first() {
                params.insert("token".into(), json!(token));
            }
        }
        Intent::Discovery | Intent::Unknown => {}
    }

    params
}
