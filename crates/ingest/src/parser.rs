use std::fmt::Write;

use budget_core::{
    EventOrigin, SourceCursor, SourceFormat, TokenUsage, UsageEvent, session_id_from_source,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{ParseError, ParseErrorKind, SourceHandle};

pub const UNKNOWN_MODEL: &str = "unknown";

/// Result of parsing one line that was valid JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Usage(UsageEvent),
    /// A running session total; `event` holds the growth since the previous total, if any.
    CumulativeUsage {
        total: TokenUsage,
        event: Option<UsageEvent>,
    },
    /// Model announced for the following lines of the same stream.
    ModelHint(String),
    Ignored,
}

/// Per-line inputs that do not come from the line itself.
#[derive(Debug, Clone, Copy)]
pub struct LineContext<'a> {
    pub source: &'a str,
    pub session_id: &'a str,
    pub fallback_model: Option<&'a str>,
    /// Running total reported by the previous line of the stream.
    pub previous_total: Option<TokenUsage>,
}

/// Format-specific conversion of a decoded JSON line.
pub trait Parser: Send + Sync {
    fn format(&self) -> SourceFormat;

    fn parse_value(
        &self,
        value: &Value,
        line: &str,
        ctx: &LineContext<'_>,
    ) -> Result<ParsedLine, ParseError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeParser;

#[derive(Debug, Clone, Copy, Default)]
pub struct CodexParser;

pub fn parser_for(format: SourceFormat) -> &'static dyn Parser {
    match format {
        SourceFormat::ClaudeJsonl => &ClaudeParser,
        SourceFormat::CodexJsonl => &CodexParser,
    }
}

/// Parses one raw line. Pure: the same line and context always give the same result.
pub fn parse(
    format: SourceFormat,
    raw_line: &str,
    ctx: &LineContext<'_>,
) -> Result<ParsedLine, ParseError> {
    let line = raw_line.trim();
    if line.is_empty() {
        return Ok(ParsedLine::Ignored);
    }
    let value = parse_json_line(line)?;
    if !value.is_object() {
        return Ok(ParsedLine::Ignored);
    }
    parser_for(format).parse_value(&value, line, ctx)
}

pub(crate) fn parse_json_line(line: &str) -> Result<Value, ParseError> {
    serde_json::from_str(line).map_err(|err| {
        let kind = if err.is_eof() {
            ParseErrorKind::Truncated
        } else {
            ParseErrorKind::InvalidJson
        };
        ParseError::new(kind, err.to_string())
    })
}

impl Parser for ClaudeParser {
    fn format(&self) -> SourceFormat {
        SourceFormat::ClaudeJsonl
    }

    fn parse_value(
        &self,
        value: &Value,
        line: &str,
        ctx: &LineContext<'_>,
    ) -> Result<ParsedLine, ParseError> {
        if let Some(kind) = value.get("type").and_then(|value| value.as_str())
            && kind != "assistant"
        {
            return Ok(ParsedLine::Ignored);
        }
        let Some(message) = value.get("message") else {
            return Ok(ParsedLine::Ignored);
        };
        let Some(raw_usage) = message.get("usage").filter(|usage| usage.is_object()) else {
            return Ok(ParsedLine::Ignored);
        };
        let usage = TokenUsage {
            input_tokens: read_count(raw_usage, "input_tokens", true)?,
            output_tokens: read_count(raw_usage, "output_tokens", true)?,
            cache_read_tokens: read_count(raw_usage, "cache_read_input_tokens", false)?,
            cache_creation_tokens: read_count(raw_usage, "cache_creation_input_tokens", false)?,
        };
        if usage.is_empty() {
            return Ok(ParsedLine::Ignored);
        }
        let timestamp = extract_timestamp(value)?;
        let message_id = message
            .get("id")
            .and_then(|value| value.as_str())
            .map(str::to_string);
        let request_id =
            find_string(value, &[&["requestId"], &["request_id"]]).map(str::to_string);
        let id = match (&message_id, &request_id) {
            (Some(message_id), Some(request_id)) => format!("{}:{}", message_id, request_id),
            _ => hash_line(ctx.source, line),
        };
        let model = message
            .get("model")
            .and_then(|value| value.as_str())
            .filter(|model| !model.is_empty())
            .or(ctx.fallback_model)
            .unwrap_or(UNKNOWN_MODEL)
            .to_string();
        let session_id = find_string(value, &[&["sessionId"], &["session_id"]])
            .unwrap_or(ctx.session_id)
            .to_string();
        Ok(ParsedLine::Usage(UsageEvent {
            id,
            session_id,
            timestamp,
            model,
            usage,
            source: ctx.source.to_string(),
            origin: EventOrigin::Claude {
                message_id,
                request_id,
            },
        }))
    }
}

impl Parser for CodexParser {
    fn format(&self) -> SourceFormat {
        SourceFormat::CodexJsonl
    }

    fn parse_value(
        &self,
        value: &Value,
        line: &str,
        ctx: &LineContext<'_>,
    ) -> Result<ParsedLine, ParseError> {
        let top_type = value.get("type").and_then(|value| value.as_str());
        let payload = value.get("payload");
        let payload_type = payload
            .and_then(|payload| payload.get("type"))
            .and_then(|value| value.as_str());
        if top_type == Some("event_msg") && payload_type == Some("token_count") {
            let Some(info) = payload
                .and_then(|payload| payload.get("info"))
                .filter(|info| info.is_object())
            else {
                return Ok(ParsedLine::Ignored);
            };
            let total = codex_usage(info, "total_token_usage")?;
            let last = codex_usage(info, "last_token_usage")?;
            let usage = match (total, ctx.previous_total) {
                (Some(total), Some(previous)) if total.all_tokens() >= previous.all_tokens() => {
                    total.saturating_sub(previous)
                }
                // First total of the stream, or the counter restarted.
                (Some(total), _) => last.unwrap_or(total),
                (None, _) => match last {
                    Some(last) => last,
                    None => return Ok(ParsedLine::Ignored),
                },
            };
            if usage.is_empty() {
                return Ok(match total {
                    Some(total) => ParsedLine::CumulativeUsage { total, event: None },
                    None => ParsedLine::Ignored,
                });
            }
            let timestamp = extract_timestamp(value)?;
            let model = extract_model(value)
                .or_else(|| ctx.fallback_model.map(str::to_string))
                .unwrap_or_else(|| UNKNOWN_MODEL.to_string());
            let turn_id =
                find_string(value, &[&["payload", "turn_id"], &["turn_id"]]).map(str::to_string);
            let event = UsageEvent {
                id: hash_line(ctx.source, line),
                session_id: ctx.session_id.to_string(),
                timestamp,
                model,
                usage,
                source: ctx.source.to_string(),
                origin: EventOrigin::Codex { turn_id },
            };
            return Ok(match total {
                Some(total) => ParsedLine::CumulativeUsage {
                    total,
                    event: Some(event),
                },
                None => ParsedLine::Usage(event),
            });
        }
        match extract_model(value) {
            Some(model) => Ok(ParsedLine::ModelHint(model)),
            None => Ok(ParsedLine::Ignored),
        }
    }
}

/// Events and errors from a run of lines.
#[derive(Debug, Default)]
pub struct ParsedLines {
    pub events: Vec<UsageEvent>,
    pub errors: Vec<ParseError>,
}

impl ParsedLines {
    pub fn recoverable_errors(&self) -> u64 {
        self.errors.iter().filter(|err| err.recoverable).count() as u64
    }

    pub fn fatal_errors(&self) -> u64 {
        self.errors.iter().filter(|err| !err.recoverable).count() as u64
    }
}

/// Parses consecutive lines of one stream, carrying the latest model hint
/// and running total.
#[derive(Debug, Clone)]
pub struct StreamParser {
    source: String,
    session_id: String,
    format: SourceFormat,
    last_model: Option<String>,
    last_total: Option<TokenUsage>,
}

impl StreamParser {
    /// Resumes the stream state stored in `cursor`.
    pub fn new(handle: &SourceHandle, cursor: &SourceCursor) -> Self {
        Self {
            source: handle.id.clone(),
            session_id: session_id_from_source(&handle.id),
            format: handle.format,
            last_model: cursor.last_model.clone(),
            last_total: cursor.last_total,
        }
    }

    /// Parses one line. Running totals are folded into plain usage events.
    pub fn parse_line(&mut self, line: &str) -> Result<ParsedLine, ParseError> {
        let ctx = LineContext {
            source: &self.source,
            session_id: &self.session_id,
            fallback_model: self.last_model.as_deref(),
            previous_total: self.last_total,
        };
        match parse(self.format, line, &ctx)? {
            ParsedLine::ModelHint(model) => {
                self.last_model = Some(model.clone());
                Ok(ParsedLine::ModelHint(model))
            }
            ParsedLine::CumulativeUsage { total, event } => {
                self.last_total = Some(total);
                Ok(event.map_or(ParsedLine::Ignored, ParsedLine::Usage))
            }
            other => Ok(other),
        }
    }

    pub fn parse_lines<I, S>(&mut self, lines: I) -> ParsedLines
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = ParsedLines::default();
        for line in lines {
            match self.parse_line(line.as_ref()) {
                Ok(ParsedLine::Usage(event)) => out.events.push(event),
                Ok(_) => {}
                Err(err) => {
                    if err.recoverable {
                        tracing::debug!(source = %self.source, error = %err, "skipping truncated line");
                    } else {
                        tracing::warn!(source = %self.source, error = %err, "skipping malformed line");
                    }
                    out.errors.push(err);
                }
            }
        }
        out
    }

    pub fn last_model(&self) -> Option<&str> {
        self.last_model.as_deref()
    }

    pub fn last_total(&self) -> Option<TokenUsage> {
        self.last_total
    }

    /// Stores the stream state in `cursor` so the next read resumes it.
    pub fn carry_into(&self, cursor: &mut SourceCursor) {
        cursor.last_model = self.last_model.clone();
        cursor.last_total = self.last_total;
    }
}

/// Reads a Codex usage object, splitting cached tokens out of the input count.
fn codex_usage(info: &Value, key: &str) -> Result<Option<TokenUsage>, ParseError> {
    let Some(raw) = info.get(key).filter(|usage| usage.is_object()) else {
        return Ok(None);
    };
    let input = read_count(raw, "input_tokens", true)?;
    let cached = read_count(raw, "cached_input_tokens", false)?;
    let output = read_count(raw, "output_tokens", true)?;
    Ok(Some(TokenUsage {
        input_tokens: input.saturating_sub(cached),
        output_tokens: output,
        cache_read_tokens: cached,
        cache_creation_tokens: 0,
    }))
}

fn find_string<'a>(value: &'a Value, paths: &[&[&str]]) -> Option<&'a str> {
    for path in paths {
        let mut current = value;
        let mut ok = true;
        for key in *path {
            if let Some(next) = current.get(*key) {
                current = next;
            } else {
                ok = false;
                break;
            }
        }
        if ok && let Some(found) = current.as_str() {
            return Some(found);
        }
    }
    None
}

fn read_count(value: &Value, key: &str, required: bool) -> Result<u64, ParseError> {
    match value.get(key) {
        None | Some(Value::Null) => {
            if required {
                Err(ParseError::new(
                    ParseErrorKind::MissingField,
                    format!("missing {}", key),
                ))
            } else {
                Ok(0)
            }
        }
        Some(raw) => {
            if let Some(count) = raw.as_u64() {
                return Ok(count);
            }
            if let Some(float) = raw.as_f64()
                && float >= 0.0
                && float.fract() == 0.0
                && float <= u64::MAX as f64
            {
                return Ok(float as u64);
            }
            Err(ParseError::new(
                ParseErrorKind::InvalidNumber,
                format!("{} is not a token count: {}", key, raw),
            ))
        }
    }
}

fn normalize_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
    ] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(DateTime::<Utc>::from_naive_utc_and_offset(parsed, Utc));
        }
    }
    if !raw.is_empty()
        && raw.chars().all(|ch| ch.is_ascii_digit())
        && let Ok(value) = raw.parse::<i64>()
    {
        return timestamp_from_epoch(value, raw.len() > 10);
    }
    None
}

fn timestamp_from_epoch(value: i64, millis: bool) -> Option<DateTime<Utc>> {
    if millis {
        DateTime::<Utc>::from_timestamp_millis(value)
    } else {
        DateTime::<Utc>::from_timestamp(value, 0)
    }
}

fn extract_timestamp(value: &Value) -> Result<DateTime<Utc>, ParseError> {
    let raw = ["timestamp", "ts", "time"]
        .iter()
        .find_map(|key| value.get(*key).filter(|raw| !raw.is_null()));
    let Some(raw) = raw else {
        return Err(ParseError::new(
            ParseErrorKind::MissingField,
            "missing timestamp",
        ));
    };
    let parsed = match raw {
        Value::String(text) => normalize_timestamp(text.trim()),
        Value::Number(number) => number
            .as_i64()
            .and_then(|value| timestamp_from_epoch(value, value > 9_999_999_999)),
        _ => None,
    };
    parsed.ok_or_else(|| {
        ParseError::new(
            ParseErrorKind::InvalidTimestamp,
            format!("unrecognized timestamp {}", raw),
        )
    })
}

fn extract_model(value: &Value) -> Option<String> {
    find_string(
        value,
        &[
            &["model"],
            &["payload", "model"],
            &["payload", "info", "model"],
            &["payload", "info", "model_name"],
            &["payload", "info", "model_id"],
        ],
    )
    .filter(|model| !model.is_empty())
    .map(str::to_string)
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}

fn hash_line(source: &str, line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b":");
    hasher.update(line.as_bytes());
    hex_digest(&hasher.finalize())
}
