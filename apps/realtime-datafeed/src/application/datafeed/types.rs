//! REST payload types and parsing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::bars::{Bar, number_or_zero};

use super::DatafeedError;

const DEFAULT_RESOLUTIONS: [&str; 8] = ["1", "5", "15", "30", "60", "120", "240", "1D"];

fn default_resolutions() -> Vec<String> {
    DEFAULT_RESOLUTIONS.iter().map(ToString::to_string).collect()
}

const fn enabled() -> bool {
    true
}

// =============================================================================
// Configuration
// =============================================================================

/// Chart capabilities advertised by the backend, merged over defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatafeedConfiguration {
    /// Resolutions the chart may request.
    #[serde(default = "default_resolutions")]
    pub supported_resolutions: Vec<String>,
    /// Symbol search is available.
    #[serde(default = "enabled")]
    pub supports_search: bool,
    /// Group symbol requests are available.
    #[serde(default)]
    pub supports_group_request: bool,
    /// Bar marks are available.
    #[serde(default)]
    pub supports_marks: bool,
    /// Timescale marks are available.
    #[serde(default)]
    pub supports_timescale_marks: bool,
    /// Server time is available.
    #[serde(default = "enabled")]
    pub supports_time: bool,
    /// Any other keys the backend sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for DatafeedConfiguration {
    fn default() -> Self {
        Self {
            supported_resolutions: default_resolutions(),
            supports_search: true,
            supports_group_request: false,
            supports_marks: false,
            supports_timescale_marks: false,
            supports_time: true,
            extra: Map::new(),
        }
    }
}

impl DatafeedConfiguration {
    /// Merge a backend payload over the defaults. Unusable payloads yield
    /// the defaults.
    #[must_use]
    pub fn from_payload(payload: Value) -> Self {
        if !payload.is_object() {
            return Self::default();
        }
        serde_json::from_value(payload).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Malformed datafeed configuration, using defaults");
            Self::default()
        })
    }
}

// =============================================================================
// Symbols
// =============================================================================

/// Resolved instrument metadata.
///
/// Only the fields the client itself reads are typed; everything else is
/// kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Unique ticker, preferred over `name` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    /// Trading session selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsession_id: Option<String>,
    /// Remaining fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SymbolInfo {
    /// Symbol info with just a name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the trading session.
    #[must_use]
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.subsession_id = Some(session.into());
        self
    }

    /// Symbol used on the wire: the ticker, else the name.
    #[must_use]
    pub fn symbol(&self) -> Option<&str> {
        self.ticker
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .or_else(|| Some(self.name.trim()).filter(|n| !n.is_empty()))
    }

    /// Trading session, if set and non-empty.
    #[must_use]
    pub fn session(&self) -> Option<&str> {
        self.subsession_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Interpret a `/symbols` payload.
///
/// # Errors
///
/// Returns [`DatafeedError::SymbolNotFound`] for a null payload or one with
/// `s == "error"`.
pub fn parse_symbol(payload: Value) -> Result<SymbolInfo, DatafeedError> {
    if payload.is_null() || payload.get("s").and_then(Value::as_str) == Some("error") {
        let message = payload
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or("Symbol not found");
        return Err(DatafeedError::SymbolNotFound(message.to_string()));
    }
    serde_json::from_value(payload).map_err(|e| DatafeedError::InvalidSymbol(e.to_string()))
}

/// A symbol in a batch quote request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuoteSymbol {
    /// Bare symbol.
    Plain(String),
    /// Symbol with an optional session.
    WithSession {
        /// Symbol.
        symbol: String,
        /// Session selector.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
}

impl QuoteSymbol {
    /// Symbol with a session.
    #[must_use]
    pub fn with_session(symbol: impl Into<String>, session: impl Into<String>) -> Self {
        Self::WithSession {
            symbol: symbol.into(),
            session: Some(session.into()),
        }
    }

    /// Trimmed symbol name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Plain(symbol) | Self::WithSession { symbol, .. } => symbol.trim(),
        }
    }

    fn to_payload(&self) -> Value {
        match self {
            Self::Plain(_) => Value::String(self.name().to_string()),
            Self::WithSession { session, .. } => {
                let mut entry = Map::new();
                entry.insert("symbol".to_string(), Value::String(self.name().to_string()));
                if let Some(session) = session.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                    entry.insert("session".to_string(), Value::String(session.to_string()));
                }
                Value::Object(entry)
            }
        }
    }
}

impl From<&str> for QuoteSymbol {
    fn from(symbol: &str) -> Self {
        Self::Plain(symbol.to_string())
    }
}

impl From<String> for QuoteSymbol {
    fn from(symbol: String) -> Self {
        Self::Plain(symbol)
    }
}

/// Trimmed, non-empty symbol names, first occurrence kept.
#[must_use]
pub fn normalize_symbols(symbols: &[QuoteSymbol]) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(symbols.len());
    for name in symbols.iter().map(QuoteSymbol::name) {
        if !name.is_empty() && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Batch quote request entries, normalized like [`normalize_symbols`].
#[must_use]
pub fn quote_request_payload(symbols: &[QuoteSymbol]) -> Vec<Value> {
    let mut seen: Vec<&str> = Vec::with_capacity(symbols.len());
    let mut payload = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let name = symbol.name();
        if name.is_empty() || seen.contains(&name) {
            continue;
        }
        seen.push(name);
        payload.push(symbol.to_payload());
    }
    payload
}

// =============================================================================
// History
// =============================================================================

/// Range of a history request, in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeriodParams {
    /// Range start.
    pub from: i64,
    /// Range end.
    pub to: i64,
    /// Whether this is the chart's first request for the series.
    pub first_data_request: bool,
}

/// Bars returned for a history request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistoryResult {
    /// Bars in backend order.
    pub bars: Vec<Bar>,
    /// Nothing in the requested range.
    pub no_data: bool,
    /// Time of the next available bar before the range, if the backend knows.
    pub next_time: Option<i64>,
}

/// Interpret a `/history` payload.
///
/// # Errors
///
/// Returns [`DatafeedError::InvalidHistory`] unless the payload is
/// `s == "no_data"`, or `s == "ok"` with a `t` array.
#[allow(clippy::cast_possible_truncation)]
pub fn parse_history(payload: &Value) -> Result<HistoryResult, DatafeedError> {
    match payload.get("s").and_then(Value::as_str) {
        Some("no_data") => {
            let next_time = payload
                .get("nextTime")
                .and_then(|t| t.as_i64().or_else(|| t.as_f64().map(|f| f.round() as i64)));
            Ok(HistoryResult {
                bars: Vec::new(),
                no_data: true,
                next_time,
            })
        }
        Some("ok") => {
            let Some(times) = payload.get("t").and_then(Value::as_array) else {
                return Err(DatafeedError::InvalidHistory("missing t array".to_string()));
            };
            let column = |name: &str, index: usize| {
                number_or_zero(payload.get(name).and_then(|values| values.get(index)))
            };

            let bars: Vec<Bar> = times
                .iter()
                .enumerate()
                .map(|(index, time)| Bar {
                    time: (number_or_zero(Some(time)) * 1000.0).round() as i64,
                    open: column("o", index),
                    high: column("h", index),
                    low: column("l", index),
                    close: column("c", index),
                    volume: column("v", index),
                })
                .collect();

            Ok(HistoryResult {
                no_data: bars.is_empty(),
                bars,
                next_time: None,
            })
        }
        other => Err(DatafeedError::InvalidHistory(format!(
            "unexpected status {}",
            other.unwrap_or("<missing>")
        ))),
    }
}

/// Array payloads as a list, anything else as empty.
#[must_use]
pub fn array_or_empty(payload: Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items,
        _ => Vec::new(),
    }
}
