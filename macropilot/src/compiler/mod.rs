//! The DSL compiler: line-oriented script text in, step list out.
//!
//! Leading whitespace defines block nesting for `repeat N:` and
//! `try:`/`catch:` blocks, closed by a dedent or an explicit `end`.
//! `${Name[:args]}` macro invocations are expanded to concrete steps
//! here, with cycle detection; the runner never sees one.

pub mod naming;
pub mod step;
pub mod variables;

pub use naming::TargetCatalog;
pub use step::{ClickSpec, DomOp, ExternalOp, ParsedStep};
pub use variables::{MacroVariableDefinition, VariableRegistry};

use crate::errors::CompileError;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// The fixed set of OS-level command names a script may invoke through
/// `@system`. Anything else is a hard compile error.
pub const ALLOWED_SYSTEM_COMMANDS: &[&str] = &[
    "open_app",
    "close_app",
    "clipboard_read",
    "clipboard_write",
    "screenshot",
    "list_processes",
];

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Timeout applied to `within`-less wait-for-appear clicks.
    pub default_timeout: Duration,
    /// Delay between repeated clicks when no `every` clause is given.
    pub default_interval: Duration,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            default_interval: Duration::from_millis(100),
        }
    }
}

fn invocation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_]+)(?::([^}]*))?\}").unwrap())
}

#[derive(Debug, Clone)]
struct Line {
    number: usize,
    indent: usize,
    text: String,
}

/// Compiles script text into an executable step list.
#[instrument(skip_all, fields(bytes = script.len()))]
pub fn compile(
    script: &str,
    registry: &VariableRegistry,
    catalog: &TargetCatalog,
    opts: &CompileOptions,
) -> Result<Vec<ParsedStep>, CompileError> {
    let raw = read_lines(script);
    let mut expanded = Vec::new();
    for line in raw {
        let mut stack = Vec::new();
        expand_into(line, registry, &mut stack, &mut expanded)?;
    }

    let mut cursor = Cursor {
        lines: &expanded,
        pos: 0,
    };
    let base_indent = expanded.first().map(|l| l.indent).unwrap_or(0);
    let steps = parse_block(&mut cursor, base_indent, catalog, opts)?;
    if let Some(line) = cursor.peek() {
        return Err(CompileError::UnbalancedBlock {
            line: line.number,
            message: format!("unexpected '{}' outside any block", line.text),
        });
    }
    debug!(steps = steps.len(), "compiled script");
    Ok(steps)
}

fn read_lines(script: &str) -> Vec<Line> {
    let mut out = Vec::new();
    for (i, raw) in script.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = raw
            .chars()
            .take_while(|c| *c == ' ' || *c == '\t')
            .map(|c| if c == '\t' { 4 } else { 1 })
            .sum();
        out.push(Line {
            number: i + 1,
            indent,
            text: trimmed.to_string(),
        });
    }
    out
}

/// Expands one line, splicing whole-line macro invocations into their
/// body statements and substituting inline invocations textually. The
/// expansion stack carries the macros currently being expanded so a
/// self-referential chain fails instead of looping.
fn expand_into(
    line: Line,
    registry: &VariableRegistry,
    stack: &mut Vec<String>,
    out: &mut Vec<Line>,
) -> Result<(), CompileError> {
    let whole = invocation_re()
        .captures(&line.text)
        .filter(|caps| caps.get(0).map(|m| m.as_str()) == Some(line.text.as_str()));

    if let Some(caps) = whole {
        let name = caps[1].to_string();
        check_cycle(&name, stack)?;
        let def = registry
            .get(&name)
            .ok_or_else(|| CompileError::UnresolvedVariable(name.clone()))?;
        let args = parse_invocation_args(caps.get(2).map(|m| m.as_str()));
        let body = def.substitute(&args);

        stack.push(name);
        for body_raw in body.lines() {
            let trimmed = body_raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let body_indent = body_raw.chars().take_while(|c| *c == ' ').count();
            expand_into(
                Line {
                    number: line.number,
                    indent: line.indent + body_indent,
                    text: trimmed.to_string(),
                },
                registry,
                stack,
                out,
            )?;
        }
        stack.pop();
        return Ok(());
    }

    if line.text.contains("${") {
        let text = substitute_inline(&line.text, registry, stack)?;
        out.push(Line { text, ..line });
    } else {
        out.push(line);
    }
    Ok(())
}

/// Substitutes inline invocations left-to-right. Each occurrence gets
/// its own expansion branch so sibling macros never see each other on
/// the stack. Multi-line bodies used inline are joined with spaces.
fn substitute_inline(
    text: &str,
    registry: &VariableRegistry,
    stack: &mut Vec<String>,
) -> Result<String, CompileError> {
    let Some(caps) = invocation_re().captures(text) else {
        return Ok(text.to_string());
    };
    let full = caps.get(0).unwrap();
    let name = caps[1].to_string();
    check_cycle(&name, stack)?;
    let def = registry
        .get(&name)
        .ok_or_else(|| CompileError::UnresolvedVariable(name.clone()))?;
    let args = parse_invocation_args(caps.get(2).map(|m| m.as_str()));
    let body = def.substitute(&args).replace('\n', " ");

    stack.push(name);
    let expanded = substitute_inline(&body, registry, stack)?;
    stack.pop();

    let rest = substitute_inline(&text[full.end()..], registry, stack)?;
    Ok(format!("{}{}{}", &text[..full.start()], expanded, rest))
}

fn check_cycle(name: &str, stack: &[String]) -> Result<(), CompileError> {
    if stack.iter().any(|s| s.eq_ignore_ascii_case(name)) {
        let mut path: Vec<&str> = stack.iter().map(|s| s.as_str()).collect();
        path.push(name);
        return Err(CompileError::ExpansionCycle(path.join(" -> ")));
    }
    Ok(())
}

fn parse_invocation_args(raw: Option<&str>) -> Vec<String> {
    raw.map(|r| r.split(',').map(|a| a.trim().to_string()).collect())
        .unwrap_or_default()
}

struct Cursor<'a> {
    lines: &'a [Line],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&'a Line> {
        self.lines.get(self.pos)
    }

    fn advance(&mut self) -> Option<&'a Line> {
        let line = self.lines.get(self.pos);
        self.pos += 1;
        line
    }
}

fn parse_block(
    cursor: &mut Cursor,
    indent: usize,
    catalog: &TargetCatalog,
    opts: &CompileOptions,
) -> Result<Vec<ParsedStep>, CompileError> {
    let mut steps = Vec::new();
    while let Some(line) = cursor.peek() {
        if line.indent < indent || line.text == "end" || line.text == "catch:" {
            break;
        }
        if line.indent > indent {
            return Err(CompileError::Malformed {
                line: line.number,
                message: "unexpected indentation".into(),
            });
        }

        if let Some(count_text) = line
            .text
            .strip_prefix("repeat ")
            .and_then(|r| r.strip_suffix(':'))
        {
            let count: u32 = count_text.trim().parse().map_err(|_| CompileError::Malformed {
                line: line.number,
                message: format!("invalid repeat count '{}'", count_text.trim()),
            })?;
            cursor.advance();
            let body = parse_nested(cursor, indent, catalog, opts)?;
            consume_end(cursor, indent);
            steps.push(ParsedStep::Repeat { count, body });
            continue;
        }

        if line.text == "try:" {
            let try_line = line.number;
            cursor.advance();
            let body = parse_nested(cursor, indent, catalog, opts)?;
            match cursor.peek() {
                Some(l) if l.text == "catch:" => {
                    cursor.advance();
                }
                _ => {
                    return Err(CompileError::UnbalancedBlock {
                        line: try_line,
                        message: "'try:' block without a matching 'catch:'".into(),
                    })
                }
            }
            let recovery = parse_nested(cursor, indent, catalog, opts)?;
            consume_end(cursor, indent);
            steps.push(ParsedStep::TryCatch { body, recovery });
            continue;
        }

        let line = cursor.advance().expect("peeked line exists");
        if let Some(step) = parse_statement(line, catalog, opts)? {
            steps.push(step);
        }
    }
    Ok(steps)
}

/// Parses the body of a block: everything at the next deeper indent
/// level. An immediately-following dedent or `end` means an empty body.
fn parse_nested(
    cursor: &mut Cursor,
    parent_indent: usize,
    catalog: &TargetCatalog,
    opts: &CompileOptions,
) -> Result<Vec<ParsedStep>, CompileError> {
    match cursor.peek() {
        Some(line) if line.indent > parent_indent => {
            parse_block(cursor, line.indent, catalog, opts)
        }
        _ => Ok(Vec::new()),
    }
}

fn consume_end(cursor: &mut Cursor, indent: usize) {
    if let Some(line) = cursor.peek() {
        if line.text == "end" && line.indent >= indent {
            cursor.advance();
        }
    }
}

fn parse_statement(
    line: &Line,
    catalog: &TargetCatalog,
    opts: &CompileOptions,
) -> Result<Option<ParsedStep>, CompileError> {
    let text = &line.text;
    let (keyword, rest) = match text.split_once(char::is_whitespace) {
        Some((k, r)) => (k, r.trim()),
        None => (text.as_str(), ""),
    };

    let step = match keyword.to_lowercase().as_str() {
        "open" => {
            require_args(line, rest, "open <application>")?;
            ParsedStep::SystemCommand {
                name: "open_app".into(),
                args: vec![rest.to_string()],
            }
        }
        "click" => parse_click(line, rest, catalog, opts)?,
        "type" => ParsedStep::Type {
            text: rest.to_string(),
        },
        "press" => {
            require_args(line, rest, "press <key>")?;
            ParsedStep::Key {
                name: rest.to_lowercase(),
            }
        }
        "hotkey" => {
            require_args(line, rest, "hotkey <key>+<key>")?;
            ParsedStep::Hotkey {
                keys: rest.split('+').map(|k| k.trim().to_lowercase()).collect(),
            }
        }
        "wait" => {
            let duration =
                step::parse_duration(rest).ok_or_else(|| CompileError::Malformed {
                    line: line.number,
                    message: format!("invalid wait duration '{rest}'"),
                })?;
            ParsedStep::Wait { duration }
        }
        "scroll" => parse_scroll(line, rest)?,
        "dom" => parse_dom(line, rest)?,
        "read" => {
            let (target, bind) = split_as(rest).ok_or_else(|| CompileError::Malformed {
                line: line.number,
                message: "expected 'read <target> as <variable>'".into(),
            })?;
            ParsedStep::External(ExternalOp::Ocr {
                target: catalog.resolve(&target).unwrap_or(target),
                bind,
            })
        }
        "ask" => {
            let (prompt, bind) = split_as(rest).ok_or_else(|| CompileError::Malformed {
                line: line.number,
                message: "expected 'ask <prompt> as <variable>'".into(),
            })?;
            ParsedStep::External(ExternalOp::Generate { prompt, bind })
        }
        "skip" => ParsedStep::SkipRemaining,
        "@system" => {
            let mut args = split_args(rest);
            if args.is_empty() {
                return Err(CompileError::Malformed {
                    line: line.number,
                    message: "expected '@system <name> [args...]'".into(),
                });
            }
            let name = args.remove(0);
            if !ALLOWED_SYSTEM_COMMANDS.contains(&name.as_str()) {
                return Err(CompileError::ForbiddenCommand(name));
            }
            ParsedStep::SystemCommand { name, args }
        }
        other => {
            // Unrecognized keywords are skipped with a warning, never
            // rejected.
            warn!(line = line.number, keyword = other, "unknown keyword, line skipped");
            return Ok(None);
        }
    };
    Ok(Some(step))
}

fn require_args(line: &Line, rest: &str, usage: &str) -> Result<(), CompileError> {
    if rest.is_empty() {
        return Err(CompileError::Malformed {
            line: line.number,
            message: format!("expected '{usage}'"),
        });
    }
    Ok(())
}

/// `click <target>[#N][@T] [xR [every I]] [within D]`
fn parse_click(
    line: &Line,
    rest: &str,
    catalog: &TargetCatalog,
    opts: &CompileOptions,
) -> Result<ParsedStep, CompileError> {
    let mut tokens = rest.split_whitespace();
    let target_token = tokens.next().ok_or_else(|| CompileError::Malformed {
        line: line.number,
        message: "expected 'click <target>'".into(),
    })?;
    let (name, match_index, match_threshold) = parse_target_token(line, target_token)?;

    let mut spec = ClickSpec {
        target: catalog.resolve(&name).unwrap_or(name),
        repeat_count: 1,
        interval: opts.default_interval,
        wait_for_appear: false,
        timeout: opts.default_timeout,
        match_threshold,
        match_index,
    };

    while let Some(token) = tokens.next() {
        match token.to_lowercase().as_str() {
            t if t.starts_with('x') && t.len() > 1 => {
                spec.repeat_count = t[1..].parse().map_err(|_| CompileError::Malformed {
                    line: line.number,
                    message: format!("invalid repeat count '{token}'"),
                })?;
            }
            "every" => {
                let value = tokens.next().ok_or_else(|| CompileError::Malformed {
                    line: line.number,
                    message: "'every' requires a duration".into(),
                })?;
                spec.interval =
                    step::parse_duration(value).ok_or_else(|| CompileError::Malformed {
                        line: line.number,
                        message: format!("invalid interval '{value}'"),
                    })?;
            }
            "within" => {
                let value = tokens.next().ok_or_else(|| CompileError::Malformed {
                    line: line.number,
                    message: "'within' requires a duration".into(),
                })?;
                spec.wait_for_appear = true;
                spec.timeout =
                    step::parse_duration(value).ok_or_else(|| CompileError::Malformed {
                        line: line.number,
                        message: format!("invalid timeout '{value}'"),
                    })?;
            }
            other => {
                return Err(CompileError::Malformed {
                    line: line.number,
                    message: format!("unexpected click modifier '{other}'"),
                })
            }
        }
    }
    Ok(ParsedStep::Click(spec))
}

/// Splits `Target#2@0.9` into name, match index and threshold.
fn parse_target_token(
    line: &Line,
    token: &str,
) -> Result<(String, usize, Option<f64>), CompileError> {
    let mut name_end = token.len();
    let mut match_index = 0usize;
    let mut threshold = None;

    if let Some(at) = token.find('@') {
        let mut value = &token[at + 1..];
        if let Some(hash) = value.find('#') {
            value = &value[..hash];
        }
        threshold = Some(value.parse().map_err(|_| CompileError::Malformed {
            line: line.number,
            message: format!("invalid match threshold '{value}'"),
        })?);
        name_end = name_end.min(at);
    }
    if let Some(hash) = token.find('#') {
        let mut value = &token[hash + 1..];
        if let Some(at) = value.find('@') {
            value = &value[..at];
        }
        match_index = value.parse().map_err(|_| CompileError::Malformed {
            line: line.number,
            message: format!("invalid match index '{value}'"),
        })?;
        name_end = name_end.min(hash);
    }
    Ok((token[..name_end].to_string(), match_index, threshold))
}

/// `scroll <direction> [amount] [xR]`
fn parse_scroll(line: &Line, rest: &str) -> Result<ParsedStep, CompileError> {
    let mut tokens = rest.split_whitespace();
    let direction = tokens
        .next()
        .ok_or_else(|| CompileError::Malformed {
            line: line.number,
            message: "expected 'scroll <direction>'".into(),
        })?
        .parse()
        .map_err(|e: String| CompileError::Malformed {
            line: line.number,
            message: e,
        })?;

    let mut amount = 3;
    let mut repeat_count = 1;
    for token in tokens {
        if let Some(r) = token.strip_prefix('x').filter(|r| !r.is_empty()) {
            repeat_count = r.parse().map_err(|_| CompileError::Malformed {
                line: line.number,
                message: format!("invalid scroll repeat '{token}'"),
            })?;
        } else {
            amount = token.parse().map_err(|_| CompileError::Malformed {
                line: line.number,
                message: format!("invalid scroll amount '{token}'"),
            })?;
        }
    }
    Ok(ParsedStep::Scroll {
        direction,
        amount,
        repeat_count,
    })
}

/// `dom click <selector>` / `dom type <selector> <text>` /
/// `dom extract <selector> as <var>`
fn parse_dom(line: &Line, rest: &str) -> Result<ParsedStep, CompileError> {
    let malformed = |message: String| CompileError::Malformed {
        line: line.number,
        message,
    };
    let (op_token, rest) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| malformed("expected 'dom <op> <selector>'".into()))?;
    let rest = rest.trim();

    let op = match op_token.to_lowercase().as_str() {
        "click" => DomOp::Click,
        "type" => DomOp::Type,
        "extract" => DomOp::Extract,
        other => return Err(malformed(format!("unknown dom operation '{other}'"))),
    };

    let external = match op {
        DomOp::Click => ExternalOp::Dom {
            op,
            selector: rest.to_string(),
            text: None,
            bind: None,
        },
        DomOp::Type => {
            let (selector, text) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| malformed("expected 'dom type <selector> <text>'".into()))?;
            ExternalOp::Dom {
                op,
                selector: selector.to_string(),
                text: Some(text.trim().to_string()),
                bind: None,
            }
        }
        DomOp::Extract => {
            let (selector, bind) = split_as(rest)
                .ok_or_else(|| malformed("expected 'dom extract <selector> as <var>'".into()))?;
            ExternalOp::Dom {
                op,
                selector,
                text: None,
                bind: Some(bind),
            }
        }
    };
    Ok(ParsedStep::External(external))
}

/// Splits `<payload> as <variable>` on the final `as` clause.
fn split_as(rest: &str) -> Option<(String, String)> {
    let idx = rest.rfind(" as ")?;
    let payload = rest[..idx].trim();
    let bind = rest[idx + 4..].trim();
    if payload.is_empty() || bind.is_empty() || bind.contains(char::is_whitespace) {
        return None;
    }
    Some((payload.to_string(), bind.to_string()))
}

/// Whitespace-splits respecting double quotes, for `@system` arguments.
fn split_args(rest: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in rest.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}
