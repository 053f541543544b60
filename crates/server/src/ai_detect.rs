//! AI activity detection from terminal pane text.
//!
//! Pure and table-driven: each assistant tool is one [`ToolProfile`] row
//! naming its executables, its "working" markers and its [`WaitingRule`].
//! Supporting a new tool is a new row in [`TOOL_PROFILES`].

use std::sync::LazyLock;

use arbor_protocol::{AiStatus, AiTool};
use regex::Regex;

/// Number of trailing non-empty pane lines inspected.
const TAIL_LINES: usize = 30;

/// How a tool shows that it needs a decision from the user
#[derive(Debug, Clone, Copy)]
pub enum WaitingRule {
    /// A selection glyph plus an enumerated option list matching `options`.
    ChoicePrompt {
        glyph: &'static str,
        options: &'static str,
    },
    /// The input affordance disappears while a prompt is up.
    MissingAffordance { affordance: &'static str },
    /// An explicit phrase.
    Phrase { phrase: &'static str },
}

#[derive(Debug, Clone, Copy)]
pub struct ToolProfile {
    pub tool: AiTool,
    pub executables: &'static [&'static str],
    pub working_markers: &'static [&'static str],
    pub waiting: WaitingRule,
}

pub static TOOL_PROFILES: &[ToolProfile] = &[
    ToolProfile {
        tool: AiTool::Claude,
        executables: &["claude"],
        working_markers: &["esc to interrupt"],
        waiting: WaitingRule::ChoicePrompt {
            glyph: "❯",
            options: r"(?m)^[\s│|]*(?:❯\s*)?\d+\.\s+\S",
        },
    },
    ToolProfile {
        tool: AiTool::Codex,
        executables: &["codex"],
        working_markers: &["esc to interrupt", "working ("],
        waiting: WaitingRule::MissingAffordance { affordance: "send" },
    },
    ToolProfile {
        tool: AiTool::Gemini,
        executables: &["gemini"],
        working_markers: &["esc to cancel"],
        waiting: WaitingRule::Phrase {
            phrase: "waiting for user confirmation",
        },
    },
];

/// Compiled `ChoicePrompt` regexes, indexed like [`TOOL_PROFILES`].
static OPTION_PATTERNS: LazyLock<Vec<Option<Regex>>> = LazyLock::new(|| {
    TOOL_PROFILES
        .iter()
        .map(|profile| match profile.waiting {
            WaitingRule::ChoicePrompt { options, .. } => Regex::new(options).ok(),
            _ => None,
        })
        .collect()
});

fn profile_index(tool: AiTool) -> Option<usize> {
    TOOL_PROFILES.iter().position(|profile| profile.tool == tool)
}

/// Identify the assistant from a pane's process command lines.
pub fn detect_tool(command_line: &str) -> AiTool {
    let lower = command_line.to_ascii_lowercase();
    TOOL_PROFILES
        .iter()
        .find(|profile| profile.executables.iter().any(|exe| lower.contains(exe)))
        .map(|profile| profile.tool)
        .unwrap_or(AiTool::None)
}

/// Classify what `tool` is doing given the captured pane text.
pub fn detect(pane_text: &str, tool: AiTool) -> AiStatus {
    let Some(index) = profile_index(tool) else {
        return AiStatus::NotRunning;
    };
    let profile = &TOOL_PROFILES[index];

    let tail = pane_tail(pane_text, TAIL_LINES);
    let lower = tail.to_lowercase();

    if profile
        .working_markers
        .iter()
        .any(|marker| lower.contains(marker))
    {
        return AiStatus::Working;
    }

    let waiting = match profile.waiting {
        WaitingRule::ChoicePrompt { glyph, .. } => {
            tail.contains(glyph)
                && OPTION_PATTERNS[index]
                    .as_ref()
                    .is_some_and(|re| re.is_match(&tail))
        }
        WaitingRule::MissingAffordance { affordance } => {
            !tail.trim().is_empty() && !lower.contains(affordance)
        }
        WaitingRule::Phrase { phrase } => lower.contains(phrase),
    };

    if waiting {
        AiStatus::Waiting
    } else {
        AiStatus::Idle
    }
}

fn pane_tail(text: &str, lines: usize) -> String {
    let kept: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect();
    let start = kept.len().saturating_sub(lines);
    kept[start..].join("\n")
}
