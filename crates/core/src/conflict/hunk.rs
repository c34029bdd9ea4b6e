//! Conflict-marker parsing and per-hunk resolution.
//!
//! A conflicted file is split into plain segments and [`Hunk`]s. Lines keep
//! their original terminators, so reconstructing a file from its segments
//! and resolved hunks is byte-exact outside the hunks themselves.

use serde::{Deserialize, Serialize};

use super::Disposition;
use crate::errors::ValidationError;

const OURS_MARKER: &str = "<<<<<<<";
const BASE_MARKER: &str = "|||||||";
const SPLIT_MARKER: &str = "=======";
const THEIRS_MARKER: &str = ">>>>>>>";

/// A contiguous block of conflicting lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub index: usize,
    pub ours_text: String,
    pub theirs_text: String,
    /// Common-ancestor text, present with `merge.conflictStyle=diff3`.
    pub base_text: Option<String>,
    /// Lines immediately preceding the hunk.
    pub context_lines: Vec<String>,
    #[serde(default)]
    pub ours_label: String,
    #[serde(default)]
    pub theirs_label: String,
}

impl Hunk {
    pub(crate) fn whole_file() -> Self {
        Self {
            index: 0,
            ours_text: String::new(),
            theirs_text: String::new(),
            base_text: None,
            context_lines: Vec::new(),
            ours_label: String::new(),
            theirs_label: String::new(),
        }
    }
}

/// A conflicted file split into `segments.len() == hunks.len() + 1` plain
/// segments around its hunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedConflicts {
    pub segments: Vec<String>,
    pub hunks: Vec<Hunk>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn strip_eol(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

/// `<<<<<<<`, `|||||||` and `>>>>>>>` may carry a label after a space.
fn labelled_marker<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let body = strip_eol(line);
    let rest = body.strip_prefix(marker)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix(' ').map(str::trim)
    }
}

fn is_split(line: &str) -> bool {
    strip_eol(line) == SPLIT_MARKER
}

#[derive(Clone, Copy)]
enum Section {
    Ours,
    Base,
    Theirs,
}

struct Open {
    raw: String,
    ours: String,
    base: Option<String>,
    theirs: String,
    ours_label: String,
    section: Section,
}

/// Split `text` into plain segments and conflict hunks.
///
/// `context` is how many preceding lines each hunk records. A marker block
/// that never closes is kept as plain text.
pub fn parse_conflicts(text: &str, context: usize) -> ParsedConflicts {
    let mut segments = Vec::new();
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current = String::new();
    let mut open: Option<Open> = None;

    for line in text.split_inclusive('\n') {
        let Some(block) = open.as_mut() else {
            if let Some(label) = labelled_marker(line, OURS_MARKER) {
                open = Some(Open {
                    raw: line.to_string(),
                    ours: String::new(),
                    base: None,
                    theirs: String::new(),
                    ours_label: label.to_string(),
                    section: Section::Ours,
                });
            } else {
                current.push_str(line);
            }
            continue;
        };

        block.raw.push_str(line);
        let section = block.section;
        match section {
            Section::Ours if labelled_marker(line, BASE_MARKER).is_some() => {
                block.base = Some(String::new());
                block.section = Section::Base;
            }
            Section::Ours | Section::Base if is_split(line) => block.section = Section::Theirs,
            Section::Ours => block.ours.push_str(line),
            Section::Base => {
                if let Some(base) = block.base.as_mut() {
                    base.push_str(line);
                }
            }
            Section::Theirs => {
                if let Some(label) = labelled_marker(line, THEIRS_MARKER) {
                    let theirs_label = label.to_string();
                    if let Some(done) = open.take() {
                        hunks.push(Hunk {
                            index: hunks.len(),
                            ours_text: done.ours,
                            theirs_text: done.theirs,
                            base_text: done.base,
                            context_lines: trailing_lines(&current, context),
                            ours_label: done.ours_label,
                            theirs_label,
                        });
                        segments.push(std::mem::take(&mut current));
                    }
                } else {
                    block.theirs.push_str(line);
                }
            }
        }
    }

    if let Some(unterminated) = open {
        current.push_str(&unterminated.raw);
    }
    segments.push(current);
    ParsedConflicts { segments, hunks }
}

fn trailing_lines(segment: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = segment.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| l.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Reject manual text that is empty or still carries conflict markers.
pub fn validate_manual(text: &str) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::EmptyManualResolution);
    }
    for (i, line) in text.lines().enumerate() {
        let leftover = labelled_marker(line, OURS_MARKER).is_some()
            || labelled_marker(line, BASE_MARKER).is_some()
            || labelled_marker(line, THEIRS_MARKER).is_some()
            || is_split(line);
        if leftover {
            return Err(ValidationError::LeftoverConflictMarker { line: i + 1 });
        }
    }
    Ok(())
}

/// Terminator used by the hunk's own lines.
fn line_ending(hunk: &Hunk) -> &'static str {
    if hunk.ours_text.contains("\r\n") || hunk.theirs_text.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

/// Apply one disposition to one hunk.
///
/// Returns `Ok(None)` for [`Disposition::Skip`]: the hunk stays unresolved.
pub fn resolve(hunk: &Hunk, disposition: &Disposition) -> Result<Option<String>, ValidationError> {
    let text = match disposition {
        Disposition::Ours => hunk.ours_text.clone(),
        Disposition::Theirs => hunk.theirs_text.clone(),
        Disposition::Both => format!("{}{}", hunk.ours_text, hunk.theirs_text),
        Disposition::Manual(text) => {
            validate_manual(text)?;
            let eol = line_ending(hunk);
            let mut text = if eol == "\r\n" {
                text.replace("\r\n", "\n").replace('\n', "\r\n")
            } else {
                text.clone()
            };
            let hunk_ends_line = hunk.ours_text.ends_with('\n') || hunk.theirs_text.ends_with('\n');
            if hunk_ends_line && !text.ends_with('\n') {
                text.push_str(eol);
            }
            text
        }
        Disposition::Skip => return Ok(None),
    };
    Ok(Some(text))
}

/// Rebuild file content from segments and per-hunk decisions.
///
/// Returns `Ok(None)` while any hunk lacks a non-Skip decision.
pub fn reconstruct(
    segments: &[String],
    hunks: &[Hunk],
    decisions: &std::collections::BTreeMap<usize, Disposition>,
) -> Result<Option<String>, ValidationError> {
    let mut out = String::new();
    for (i, segment) in segments.iter().enumerate() {
        out.push_str(segment);
        let Some(hunk) = hunks.get(i) else {
            continue;
        };
        let Some(decision) = decisions.get(&hunk.index) else {
            return Ok(None);
        };
        match resolve(hunk, decision)? {
            Some(text) => out.push_str(&text),
            None => return Ok(None),
        }
    }
    Ok(Some(out))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
