//! Console buffer - bounded, thread-safe transcript of server output
//!
//! The drain task appends every stdout/stderr line here; readers take
//! windowed views without blocking the writer for longer than a copy.
//! - Retention: trimmed back to `TRIM_TO` lines whenever `MAX_RETAINED` is exceeded
//! - `snapshot()` exposes at most the last `VISIBLE_LINES` lines
//! - `since(id)` for incremental polling, `subscribe()` for live followers

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::utils::unix_now;

/// Internal store grows up to this many lines before being trimmed.
pub const MAX_RETAINED: usize = 5000;
/// Number of lines kept after a trim (most recent ones).
pub const TRIM_TO: usize = 4000;
/// Upper bound of the consumer-facing transcript.
pub const VISIBLE_LINES: usize = 1000;

/// Minecraft log tag, e.g. `[12:00:00] [Server thread/WARN]: ...`
const MC_LEVEL_PATTERN: &str = r"/(?P<level>INFO|WARN|WARNING|ERROR|DEBUG|TRACE|FATAL)\]";

// ─── Line Types ──────────────────────────────────────────────

/// A single line of console output. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleLine {
    /// Sequential ID for polling (`GET /console?since=<id>`)
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: LineSource,
    pub content: String,
    pub level: LineLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineSource {
    Stdout,
    Stderr,
    /// Messages written by the supervisor itself (start, exit, crash)
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineLevel {
    Info,
    Warn,
    Error,
    Debug,
}

// ─── Buffer ──────────────────────────────────────────────────

struct Lines {
    lines: VecDeque<ConsoleLine>,
    next_id: u64,
}

pub struct ConsoleBuffer {
    inner: Mutex<Lines>,
    level_pattern: Regex,
    live: broadcast::Sender<ConsoleLine>,
}

impl ConsoleBuffer {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Lines {
                lines: VecDeque::with_capacity(MAX_RETAINED + 1),
                next_id: 1,
            }),
            // 고정 패턴이므로 컴파일 실패는 불가능
            level_pattern: Regex::new(MC_LEVEL_PATTERN).expect("static console level pattern"),
            live,
        }
    }

    /// 포이즌된 락도 그대로 사용 (콘솔 기록은 부분 갱신이 없음)
    fn lock(&self) -> MutexGuard<'_, Lines> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a line of process output; the level is parsed from the Minecraft tag.
    pub fn append(&self, source: LineSource, content: impl Into<String>) -> ConsoleLine {
        let content = content.into();
        let mut level = parse_line_level(&content, &self.level_pattern);
        // stderr lines default to at least Warn
        if source == LineSource::Stderr && level == LineLevel::Info {
            level = LineLevel::Warn;
        }
        self.push(source, content, level)
    }

    /// Append a supervisor-generated message.
    pub fn system(&self, content: impl Into<String>) -> ConsoleLine {
        self.push(LineSource::System, content.into(), LineLevel::Info)
    }

    fn push(&self, source: LineSource, content: String, level: LineLevel) -> ConsoleLine {
        let line = {
            let mut inner = self.lock();
            let line = ConsoleLine {
                id: inner.next_id,
                timestamp: unix_now(),
                source,
                content,
                level,
            };
            inner.next_id += 1;
            inner.lines.push_back(line.clone());
            if inner.lines.len() > MAX_RETAINED {
                let excess = inner.lines.len() - TRIM_TO;
                inner.lines.drain(..excess);
            }
            line
        };
        // no subscribers is fine
        let _ = self.live.send(line.clone());
        line
    }

    /// The visible transcript: the last `VISIBLE_LINES` lines joined by newlines.
    pub fn snapshot(&self) -> String {
        let inner = self.lock();
        let skip = inner.lines.len().saturating_sub(VISIBLE_LINES);
        inner
            .lines
            .iter()
            .skip(skip)
            .map(|l| l.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// All retained lines with `id > since_id`, capped to the visible window.
    pub fn since(&self, since_id: u64) -> Vec<ConsoleLine> {
        let inner = self.lock();
        let newer: Vec<ConsoleLine> = inner
            .lines
            .iter()
            .filter(|l| l.id > since_id)
            .cloned()
            .collect();
        let skip = newer.len().saturating_sub(VISIBLE_LINES);
        newer.into_iter().skip(skip).collect()
    }

    /// The most recent `count` lines (never more than the visible window).
    pub fn recent(&self, count: usize) -> Vec<ConsoleLine> {
        let inner = self.lock();
        let count = count.min(VISIBLE_LINES);
        inner.lines.iter().rev().take(count).rev().cloned().collect()
    }

    /// Iterate retained line contents, oldest first.
    pub fn contents(&self) -> Vec<String> {
        self.lock().lines.iter().map(|l| l.content.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// ID of the newest line, 0 if nothing was ever appended.
    pub fn last_id(&self) -> u64 {
        self.lock().next_id - 1
    }

    pub fn clear(&self) {
        self.lock().lines.clear();
    }

    /// Subscribe to lines as they are appended.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleLine> {
        self.live.subscribe()
    }
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Helpers ─────────────────────────────────────────────────

/// Map the `level` capture of a Minecraft log line to a severity; unmatched lines are Info.
fn parse_line_level(line: &str, pattern: &Regex) -> LineLevel {
    if let Some(level) = pattern.captures(line).and_then(|caps| caps.name("level")) {
        return match level.as_str() {
            "ERROR" | "FATAL" => LineLevel::Error,
            "WARN" | "WARNING" => LineLevel::Warn,
            "DEBUG" | "TRACE" => LineLevel::Debug,
            _ => LineLevel::Info,
        };
    }
    LineLevel::Info
}
