//! C3: prompt auto-responder, per `SPEC_FULL.md` §4.5.
//!
//! Scans a session capture for a confirmation prompt, classifies its
//! risk, and answers it after a risk-tuned randomized delay. Falls back
//! to a keyword heuristic when no compiled pattern matches, and learns
//! pattern-behavior shifts from the occurrence history.

use std::collections::HashMap;

use architect_types::{PatternChange, PatternChangeKind, PatternType, PromptOccurrence, PromptPattern, PromptRisk};
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use regex::Regex;

const CANCEL_MARKERS: &[&str] = &["Esc to cancel", "Tab to amend"];
const BUSY_TOKENS: &[&str] = &[
    "thinking", "running", "searching", "executing", "analyzing", "processing", "loading", "fetching",
];

/// Strip ANSI escape sequences and common Unicode box-drawing characters
/// from a terminal capture before pattern matching, per step 1 of §4.5's
/// detection pipeline.
pub fn sanitize_capture(raw: &str) -> String {
    let ansi = Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("valid regex");
    let stripped = ansi.replace_all(raw, "");
    stripped
        .chars()
        .filter(|c| !matches!(c, '\u{2500}'..='\u{257F}'))
        .collect()
}

/// A compiled [`PromptPattern`], cached per §4.5's pattern cache.
pub struct CompiledPattern {
    pub pattern: PromptPattern,
    pub regex: Regex,
}

/// An in-memory cache of compiled patterns grouped by tool name, refreshed
/// on the caller's `CACHE_REFRESH_INTERVAL`.
#[derive(Default)]
pub struct PatternCache {
    by_tool: HashMap<String, Vec<CompiledPattern>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the cache from the currently active patterns. Invalid
    /// regexes are skipped rather than failing the whole refresh.
    pub fn refresh(&mut self, patterns: Vec<PromptPattern>) {
        let mut by_tool: HashMap<String, Vec<CompiledPattern>> = HashMap::new();
        for pattern in patterns {
            if !pattern.active {
                continue;
            }
            match Regex::new(&pattern.pattern_regex) {
                Ok(regex) => by_tool.entry(pattern.tool_name.clone()).or_default().push(CompiledPattern { pattern, regex }),
                Err(e) => tracing::warn!(pattern = %pattern.pattern_name, error = %e, "skipping pattern with invalid regex"),
            }
        }
        self.by_tool = by_tool;
    }

    pub fn for_tool(&self, tool_name: &str) -> &[CompiledPattern] {
        self.by_tool.get(tool_name).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// Outcome of running the detection pipeline against one session capture.
#[derive(Debug, PartialEq)]
pub enum Detection {
    /// Nothing matched; no action.
    None,
    /// A pattern matched `action=skip`; no response is sent.
    Skip,
    /// A pattern (or the legacy heuristic) matched and should be answered.
    Confirm { pattern_id: Option<i64>, send_key: String, risk: PromptRisk },
}

/// Run the §4.5 detection pipeline: sanitize, try compiled patterns for
/// `tool_name`, else fall back to the legacy heuristic.
pub fn detect(raw_capture: &str, tool_name: &str, cache: &PatternCache) -> Detection {
    let capture = sanitize_capture(raw_capture);
    let tail = tail_window(&capture, 15);

    for compiled in cache.for_tool(tool_name) {
        if !compiled.regex.is_match(&tail) {
            continue;
        }
        if compiled.pattern.action == "skip" {
            return Detection::Skip;
        }
        if let Some(key) = compiled.pattern.action.strip_prefix("send_key:") {
            let risk = classify_risk(&tail);
            return Detection::Confirm { pattern_id: Some(compiled.pattern.id), send_key: key.to_string(), risk };
        }
        // alert:* and wait_for_options actions don't self-answer.
        return Detection::None;
    }

    if legacy_heuristic_matches(&tail) {
        Detection::Confirm { pattern_id: None, send_key: "1".to_string(), risk: classify_risk(&tail) }
    } else {
        Detection::None
    }
}

fn tail_window(capture: &str, lines: usize) -> String {
    let all: Vec<&str> = capture.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// The legacy fallback heuristic: both numbered option lines plus a
/// cancel-instruction substring, and no busy token in the window.
fn legacy_heuristic_matches(window: &str) -> bool {
    let lower = window.to_lowercase();
    if BUSY_TOKENS.iter().any(|t| lower.contains(t)) {
        return false;
    }
    let has_option_one = window.lines().any(|l| l.trim_start().starts_with("1. Yes"));
    let has_option_two = window
        .lines()
        .any(|l| {
            let t = l.trim_start();
            t.starts_with("2. Yes") || t.starts_with("2. No")
        });
    let has_cancel = CANCEL_MARKERS.iter().any(|m| window.contains(m));
    has_option_one && has_option_two && has_cancel
}

/// Keyword-scan risk classification for the legacy heuristic path, per
/// §4.5's risk table.
fn classify_risk(window: &str) -> PromptRisk {
    let lower = window.to_lowercase();
    let high = ["write", "bash", "execute", "delete"];
    let medium = ["edit", "patch", "accept"];
    let low = ["read", "grep", "glob", "list", "search"];

    if high.iter().any(|k| lower.contains(k)) {
        PromptRisk::High
    } else if medium.iter().any(|k| lower.contains(k)) {
        PromptRisk::Medium
    } else if low.iter().any(|k| lower.contains(k)) {
        PromptRisk::Low
    } else {
        PromptRisk::Medium
    }
}

/// Draw a uniformly random delay (in milliseconds) within `risk`'s window.
pub fn sample_delay_ms(risk: PromptRisk) -> u64 {
    let (low, high) = risk.delay_window_ms();
    if low >= high {
        return low;
    }
    rand::thread_rng().gen_range(low..=high)
}

/// Per-session cooldown tracking so a redrawn UI is never double-confirmed.
#[derive(Default)]
pub struct CooldownTracker {
    until: HashMap<String, chrono::DateTime<Utc>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, session: &str, cooldown: ChronoDuration) {
        self.until.insert(session.to_string(), Utc::now() + cooldown);
    }

    pub fn in_cooldown(&self, session: &str) -> bool {
        self.until.get(session).map(|t| Utc::now() < *t).unwrap_or(false)
    }

    /// Drop entries whose cooldown expired over an hour ago (stale from a
    /// crash), per §4.5.
    pub fn sweep_stale(&mut self) {
        let cutoff = Utc::now() - ChronoDuration::hours(1);
        self.until.retain(|_, until| *until >= cutoff);
    }
}

/// Compute `pattern_changes` from a pattern's recent occurrence history,
/// per §4.5's learning loop.
pub fn detect_pattern_changes(
    pattern: &PromptPattern,
    occurrences_24h: &[PromptOccurrence],
    first_occurrence_ever: Option<chrono::DateTime<Utc>>,
) -> Option<PatternChange> {
    let now = Utc::now();

    if occurrences_24h.is_empty() {
        return Some(PatternChange {
            id: 0,
            change_type: PatternChangeKind::PatternDisappeared,
            pattern_id: Some(pattern.id),
            description: format!("pattern '{}' had no occurrences in the last 24h", pattern.pattern_name),
            detected_at: now,
            acknowledged: false,
        });
    }

    if occurrences_24h.len() >= 5 {
        let successes = occurrences_24h.iter().filter(|o| o.response_success).count();
        let rate = successes as f64 / occurrences_24h.len() as f64;
        if rate < 0.5 {
            return Some(PatternChange {
                id: 0,
                change_type: PatternChangeKind::LowSuccessRate,
                pattern_id: Some(pattern.id),
                description: format!(
                    "pattern '{}' success rate {:.0}% over {} occurrences",
                    pattern.pattern_name, rate * 100.0, occurrences_24h.len()
                ),
                detected_at: now,
                acknowledged: false,
            });
        }
    }

    if let Some(first) = first_occurrence_ever {
        if now - first < ChronoDuration::hours(1) {
            return Some(PatternChange {
                id: 0,
                change_type: PatternChangeKind::NewPatternDetected,
                pattern_id: Some(pattern.id),
                description: format!("new pattern '{}' first seen within the last hour", pattern.pattern_name),
                detected_at: now,
                acknowledged: false,
            });
        }
    }

    None
}

fn sample_pattern(action: &str) -> PromptPattern {
    PromptPattern {
        id: 1,
        pattern_type: PatternType::PermissionPrompt,
        pattern_name: "claude_bash_confirm".into(),
        pattern_regex: r"Do you want to run this command\?".into(),
        tool_name: "claude".into(),
        description: String::new(),
        action: action.into(),
        confidence_threshold: 0.6,
        active: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_capture_strips_ansi_and_box_drawing() {
        let raw = "\x1b[31mred\x1b[0m \u{2500}\u{2500} text";
        let clean = sanitize_capture(raw);
        assert_eq!(clean, "red  text");
    }

    #[test]
    fn pattern_cache_matches_by_tool() {
        let mut cache = PatternCache::new();
        cache.refresh(vec![sample_pattern("send_key:1")]);
        let capture = "Do you want to run this command?\n1. Yes\n2. Yes and don't ask again\nEsc to cancel";
        let detection = detect(capture, "claude", &cache);
        assert!(matches!(detection, Detection::Confirm { risk: PromptRisk::High, .. }));
    }

    #[test]
    fn pattern_cache_skip_action_produces_skip() {
        let mut cache = PatternCache::new();
        cache.refresh(vec![sample_pattern("skip")]);
        let capture = "Do you want to run this command?\nrunning...";
        assert_eq!(detect(capture, "claude", &cache), Detection::Skip);
    }

    #[test]
    fn legacy_heuristic_requires_all_three_markers() {
        let cache = PatternCache::new();
        let capture = "Write to file?\n1. Yes\n2. Yes, don't ask again\nEsc to cancel";
        let detection = detect(capture, "unknown-tool", &cache);
        assert!(matches!(detection, Detection::Confirm { pattern_id: None, risk: PromptRisk::High, .. }));
    }

    #[test]
    fn legacy_heuristic_skips_busy_window() {
        let cache = PatternCache::new();
        let capture = "Thinking...\n1. Yes\n2. Yes, don't ask again\nEsc to cancel";
        assert_eq!(detect(capture, "unknown-tool", &cache), Detection::None);
    }

    #[test]
    fn classify_risk_buckets_keywords() {
        assert_eq!(classify_risk("Read this file?"), PromptRisk::Low);
        assert_eq!(classify_risk("Edit this file?"), PromptRisk::Medium);
        assert_eq!(classify_risk("Delete this file?"), PromptRisk::High);
        assert_eq!(classify_risk("Do something else?"), PromptRisk::Medium);
    }

    #[test]
    fn sample_delay_respects_window() {
        for _ in 0..50 {
            let d = sample_delay_ms(PromptRisk::Low);
            assert!((50..=200).contains(&d));
        }
    }

    #[test]
    fn cooldown_tracker_marks_and_expires() {
        let mut tracker = CooldownTracker::new();
        tracker.mark("s1", ChronoDuration::seconds(3));
        assert!(tracker.in_cooldown("s1"));
        assert!(!tracker.in_cooldown("s2"));
    }

    #[test]
    fn pattern_disappeared_when_no_occurrences() {
        let pattern = sample_pattern("send_key:1");
        let change = detect_pattern_changes(&pattern, &[], None).expect("change");
        assert_eq!(change.change_type, PatternChangeKind::PatternDisappeared);
    }

    #[test]
    fn low_success_rate_detected_over_threshold() {
        let pattern = sample_pattern("send_key:1");
        let occurrences: Vec<PromptOccurrence> = (0..6)
            .map(|i| PromptOccurrence {
                id: i,
                pattern_id: pattern.id,
                session_name: "s1".into(),
                matched_text: String::new(),
                context: String::new(),
                timestamp: Utc::now(),
                response_action: "send_key:1".into(),
                response_success: i < 2,
            })
            .collect();
        let change = detect_pattern_changes(&pattern, &occurrences, None).expect("change");
        assert_eq!(change.change_type, PatternChangeKind::LowSuccessRate);
    }

    #[test]
    fn new_pattern_detected_within_last_hour() {
        let pattern = sample_pattern("send_key:1");
        let occurrence = PromptOccurrence {
            id: 1,
            pattern_id: pattern.id,
            session_name: "s1".into(),
            matched_text: String::new(),
            context: String::new(),
            timestamp: Utc::now(),
            response_action: "send_key:1".into(),
            response_success: true,
        };
        let change = detect_pattern_changes(&pattern, &[occurrence], Some(Utc::now())).expect("change");
        assert_eq!(change.change_type, PatternChangeKind::NewPatternDetected);
    }

    #[test]
    fn no_change_when_healthy() {
        let pattern = sample_pattern("send_key:1");
        let occurrence = PromptOccurrence {
            id: 1,
            pattern_id: pattern.id,
            session_name: "s1".into(),
            matched_text: String::new(),
            context: String::new(),
            timestamp: Utc::now(),
            response_action: "send_key:1".into(),
            response_success: true,
        };
        let old = Utc::now() - ChronoDuration::days(30);
        assert!(detect_pattern_changes(&pattern, &[occurrence], Some(old)).is_none());
    }
}
