//! Engine log aggregation.
//!
//! The engine writes one log file per category into the session working
//! directory (`general.log`, `parser.log`, `render.log`), one
//! `HH:MM:SS|LEVEL|message` line per entry, and may additionally push lines
//! through its log callback. Files are only ever appended to, so every poll
//! re-reads them in full; a per-session set of already-seen event identities
//! makes sure each event is emitted at most once.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::OnceLock;

use bitflags::bitflags;
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use regex::Regex;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Set of levels an observer wants to see.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct LogLevels: u8 {
        const INFO = 1;
        const WARNING = 2;
        const ERROR = 4;
    }
}

impl Default for LogLevels {
    fn default() -> Self {
        LogLevels::WARNING | LogLevels::ERROR
    }
}

bitflags! {
    /// Set of log categories to read.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct LogSources: u8 {
        const GENERAL = 1;
        const PARSER = 2;
        const RENDER = 4;
    }
}

impl Default for LogSources {
    fn default() -> Self {
        LogSources::all()
    }
}

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    /// Unrecognized level; never emitted.
    Silent,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Map a level label from a log file. Unknown labels are `Silent`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "INFO" => LogLevel::Info,
            "WARNING" => LogLevel::Warning,
            "ERROR" => LogLevel::Error,
            _ => LogLevel::Silent,
        }
    }

    /// Map a level label from a pushed log line. Pushed lines are lenient:
    /// anything unrecognized is informational.
    fn from_pushed_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "warn" | "warning" => LogLevel::Warning,
            "error" | "fatal" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn flags(self) -> LogLevels {
        match self {
            LogLevel::Silent => LogLevels::empty(),
            LogLevel::Info => LogLevels::INFO,
            LogLevel::Warning => LogLevels::WARNING,
            LogLevel::Error => LogLevels::ERROR,
        }
    }
}

/// Log category, one file each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogSource {
    General,
    Parser,
    Render,
}

impl LogSource {
    pub const ALL: [LogSource; 3] = [LogSource::General, LogSource::Parser, LogSource::Render];

    pub fn file_name(self) -> &'static str {
        match self {
            LogSource::General => "general.log",
            LogSource::Parser => "parser.log",
            LogSource::Render => "render.log",
        }
    }

    pub fn flag(self) -> LogSources {
        match self {
            LogSource::General => LogSources::GENERAL,
            LogSource::Parser => LogSources::PARSER,
            LogSource::Render => LogSources::RENDER,
        }
    }

    /// Attribute a pushed line by the stem of the file it names.
    /// Unrecognized names count as `General`.
    pub fn from_file_name(name: &str) -> Self {
        let stem = Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match stem.as_str() {
            "parser" => LogSource::Parser,
            "render" => LogSource::Render,
            _ => LogSource::General,
        }
    }
}

/// One parsed engine log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub timestamp: NaiveDateTime,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
}

impl LogEvent {
    /// Deduplication identity: a hash of the formatted event.
    ///
    /// The source is not part of it, so the same entry showing up in two
    /// categories is reported once.
    pub fn identity(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.to_string().hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {:?} {}",
            self.timestamp.format("%H:%M:%S"),
            self.level,
            self.message
        )
    }
}

fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d{2}):(\d{2}):(\d{2})\|([^|]*)\|(.*)$").expect("log line pattern is valid")
    })
}

/// Interpret `HH`, `MM`, `SS` on `date`.
///
/// Out-of-range fields (e.g. `24:00:61`) are folded into the same day rather
/// than rejected, so a given line always maps to the same timestamp.
fn same_day_time(date: NaiveDate, hours: u32, minutes: u32, seconds: u32) -> NaiveDateTime {
    let time = NaiveTime::from_hms_opt(hours, minutes, seconds).unwrap_or_else(|| {
        let folded = (hours * 3600 + minutes * 60 + seconds) % 86_400;
        NaiveTime::from_num_seconds_from_midnight_opt(folded, 0).unwrap_or(NaiveTime::MIN)
    });
    date.and_time(time)
}

/// Parse one `HH:MM:SS|LEVEL|message` line. Returns `None` for lines that
/// don't have that shape.
pub fn parse_line(line: &str, source: LogSource, date: NaiveDate) -> Option<LogEvent> {
    let caps = line_pattern().captures(line.trim_end_matches(['\r', '\n']))?;
    let field = |i: usize| caps[i].parse::<u32>().unwrap_or(0);
    Some(LogEvent {
        timestamp: same_day_time(date, field(1), field(2), field(3)),
        level: LogLevel::from_label(&caps[4]),
        source,
        message: caps[5].to_string(),
    })
}

fn now_to_the_second() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Parse a line pushed through the log callback. It may carry a full
/// timestamp, just `LEVEL|message`, or plain text.
pub fn parse_pushed(file: &str, message: &str, date: NaiveDate) -> LogEvent {
    let source = LogSource::from_file_name(file);
    if let Some(event) = parse_line(message, source, date) {
        return event;
    }

    let timestamp = date.and_time(now_to_the_second().time());
    match message.split_once('|') {
        Some((label, text)) => LogEvent {
            timestamp,
            level: LogLevel::from_pushed_label(label),
            source,
            message: text.to_string(),
        },
        None => LogEvent {
            timestamp,
            level: LogLevel::Info,
            source,
            message: message.to_string(),
        },
    }
}

/// Merges, orders, deduplicates and filters engine log output.
#[derive(Debug)]
pub struct LogAggregator {
    levels: LogLevels,
    sources: LogSources,
    date: NaiveDate,
    seen: HashSet<u64>,
}

impl LogAggregator {
    pub fn new(levels: LogLevels, sources: LogSources) -> Self {
        Self::with_date(levels, sources, Local::now().date_naive())
    }

    /// Like [`LogAggregator::new`] with a fixed calendar day for timestamps.
    pub fn with_date(levels: LogLevels, sources: LogSources, date: NaiveDate) -> Self {
        Self {
            levels,
            sources,
            date,
            seen: HashSet::new(),
        }
    }

    pub fn levels(&self) -> LogLevels {
        self.levels
    }

    pub fn set_levels(&mut self, levels: LogLevels) {
        self.levels = levels;
    }

    pub fn sources(&self) -> LogSources {
        self.sources
    }

    pub fn set_sources(&mut self, sources: LogSources) {
        self.sources = sources;
    }

    /// Number of distinct events seen so far.
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Re-read every configured log file in `dir` and return the events not
    /// seen before that pass the level filter, oldest first.
    pub fn poll(&mut self, dir: &Path) -> Vec<LogEvent> {
        let mut events = Vec::new();
        for source in LogSource::ALL {
            if !self.sources.contains(source.flag()) {
                continue;
            }
            let path = dir.join(source.file_name());
            match fs::read_to_string(&path) {
                Ok(content) => events.extend(
                    content
                        .lines()
                        .filter_map(|line| parse_line(line, source, self.date)),
                ),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Could not read engine log {}: {}", path.display(), e),
            }
        }

        events.sort_by_key(|event| event.timestamp);
        events
            .into_iter()
            .filter_map(|event| self.admit(event))
            .collect()
    }

    /// Handle a line pushed by the engine's log callback.
    pub fn push(&mut self, file: &str, message: &str) -> Option<LogEvent> {
        let event = parse_pushed(file, message, self.date);
        if !self.sources.contains(event.source.flag()) {
            return None;
        }
        self.admit(event)
    }

    /// Record `event` as seen; return it if it is new and passes the level
    /// filter.
    fn admit(&mut self, event: LogEvent) -> Option<LogEvent> {
        if !self.seen.insert(event.identity()) {
            return None;
        }
        if !self.levels.intersects(event.level.flags()) {
            return None;
        }
        mirror(&event);
        Some(event)
    }
}

fn mirror(event: &LogEvent) {
    let level = match event.level {
        LogLevel::Info => log::Level::Info,
        LogLevel::Warning => log::Level::Warn,
        LogLevel::Error => log::Level::Error,
        LogLevel::Silent => return,
    };
    log::log!(target: "flamebridge::engine", level, "[{:?}] {}", event.source, event.message);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn verbose() -> LogAggregator {
        LogAggregator::with_date(LogLevels::all(), LogSources::all(), day())
    }

    #[test]
    fn test_parse_line() {
        let event = parse_line("10:00:01|error|fail: x|y", LogSource::Render, day()).unwrap();
        assert_eq!(event.level, LogLevel::Error);
        assert_eq!(event.message, "fail: x|y");
        assert_eq!(event.timestamp.time(), NaiveTime::from_hms_opt(10, 0, 1).unwrap());
        assert!(parse_line("garbage", LogSource::General, day()).is_none());
    }

    #[test]
    fn test_unknown_level_is_silent() {
        let event = parse_line("10:00:00|NOTICE|hello", LogSource::General, day()).unwrap();
        assert_eq!(event.level, LogLevel::Silent);
        assert!(event.level.flags().is_empty());
    }

    #[test]
    fn test_out_of_range_time_folds_into_same_day() {
        let event = parse_line("24:00:05|INFO|late", LogSource::General, day()).unwrap();
        assert_eq!(event.timestamp.date(), day());
        assert_eq!(event.timestamp.time(), NaiveTime::from_hms_opt(0, 0, 5).unwrap());
    }

    #[test]
    fn test_streams_merge_in_time_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("render.log"), "10:00:01|ERROR|fail\n").unwrap();
        fs::write(dir.path().join("general.log"), "10:00:00|INFO|start\n").unwrap();

        let events = verbose().poll(dir.path());
        assert_eq!(events.len(), 2);
        assert_eq!((events[0].level, events[0].message.as_str()), (LogLevel::Info, "start"));
        assert_eq!((events[1].level, events[1].message.as_str()), (LogLevel::Error, "fail"));
        assert_eq!(events[1].source, LogSource::Render);
    }

    #[test]
    fn test_repeated_polls_emit_once() {
        let dir = tempfile::tempdir().unwrap();
        let general = dir.path().join("general.log");
        fs::write(&general, "10:00:00|WARNING|low memory\n").unwrap();

        let mut agg = verbose();
        assert_eq!(agg.poll(dir.path()).len(), 1);
        assert!(agg.poll(dir.path()).is_empty());

        fs::write(
            &general,
            "10:00:00|WARNING|low memory\n10:00:02|INFO|resumed\n",
        )
        .unwrap();
        // Same entry in a second file is still a duplicate.
        fs::write(dir.path().join("parser.log"), "10:00:00|WARNING|low memory\n").unwrap();

        let events = agg.poll(dir.path());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "resumed");
    }

    #[test]
    fn test_level_and_source_filters() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("general.log"),
            "10:00:00|INFO|quiet\n10:00:01|ERROR|loud\n",
        )
        .unwrap();
        fs::write(dir.path().join("parser.log"), "10:00:02|ERROR|parse\n").unwrap();

        let mut agg = LogAggregator::with_date(LogLevels::default(), LogSources::GENERAL, day());
        let events = agg.poll(dir.path());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "loud");
        // Filtered-out info line was still recorded as seen.
        assert_eq!(agg.seen_count(), 2);
    }

    #[test]
    fn test_missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        assert!(verbose().poll(dir.path()).is_empty());
    }

    #[test]
    fn test_pushed_lines() {
        let mut agg = verbose();
        let event = agg.push("parser.log", "warn|bad token").unwrap();
        assert_eq!(event.level, LogLevel::Warning);
        assert_eq!(event.source, LogSource::Parser);
        assert_eq!(event.message, "bad token");

        let event = agg.push("render.log", "11:00:00|INFO|done").unwrap();
        assert_eq!(event.timestamp.time(), NaiveTime::from_hms_opt(11, 0, 0).unwrap());
        assert!(agg.push("render.log", "11:00:00|INFO|done").is_none());

        let event = agg.push("whatever", "plain text").unwrap();
        assert_eq!(event.level, LogLevel::Info);
        assert_eq!(event.source, LogSource::General);
    }

    #[test]
    fn test_identity_ignores_source() {
        let a = parse_line("10:00:00|INFO|x", LogSource::General, day()).unwrap();
        let b = parse_line("10:00:00|INFO|x", LogSource::Render, day()).unwrap();
        let c = parse_line("10:00:00|ERROR|x", LogSource::Render, day()).unwrap();
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
    }
}
