//! Reads the answer key back out of a generated variant.
//!
//! The model is asked to put an answer section right after the exam. Entries come in
//! a few shapes: compact runs (`1.A 2.B 3.C`), labelled lines (`Question 12: B ...`,
//! `Câu 12: 0.5`), numbered lines (`12. C`), table rows (`| 12 | C |`) and horizontal
//! tables where a `| Câu | 1 | 2 |` row is followed by an `| Đáp án | A | B |` row.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

static ANSWER_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(answer key|answers|solutions|đáp án|hướng dẫn giải)").expect("valid regex")
});

static EXAM_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*#{1,6}.*\b(exam|đề)\b").expect("valid regex"));

static TABLE_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*\|\s*(?:câu|question|q)?\s*(\d{1,3})\s*\|\s*([^|]+?)\s*\|")
        .expect("valid regex")
});

static COMPACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[\s,;(*])(?:câu|question|q)?\s*(\d{1,3})\s*[.:)\-]\s*\**\s*([A-D])\b")
        .expect("valid regex")
});

static LABELLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*[-*+]?\s*\**\s*(?:câu|question|q)\s*(\d{1,3})\s*\**\s*[.:)\-]?\s*\**\s*(.*)$")
        .expect("valid regex")
});

static NUMBERED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*+]?\s*\**(\d{1,3})\s*[.:)]\**\s*(.+)$").expect("valid regex")
});

static QUESTION_CELL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\**\s*(câu hỏi|câu|questions|question|q)\s*\**$").expect("valid regex")
});

static ANSWER_CELL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\**\s*(đáp án|answers|answer|ans)\s*\**$").expect("valid regex")
});

static ANSWER_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:answer|đáp án)\s*[:.]?\s*").expect("valid regex")
});

/// One numbered answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerEntry {
    pub number: u32,
    pub answer: String,
    /// Whether worked reasoning accompanies the answer.
    pub has_reasoning: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerKey {
    entries: Vec<AnswerEntry>,
}

impl AnswerKey {
    pub fn entries(&self) -> &[AnswerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn numbers(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.number).collect()
    }

    pub fn get(&self, number: u32) -> Option<&AnswerEntry> {
        self.entries.iter().find(|e| e.number == number)
    }

    fn push(&mut self, seen: &mut HashSet<u32>, number: &str, answer: &str, has_reasoning: bool) {
        let Ok(number) = number.parse::<u32>() else {
            return;
        };
        if seen.insert(number) {
            self.entries.push(AnswerEntry {
                number,
                answer: answer.to_string(),
                has_reasoning,
            });
        }
    }
}

fn is_heading(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') || trimmed.starts_with("**") {
        return true;
    }
    let letters: Vec<char> = trimmed.chars().filter(|c| c.is_alphabetic()).collect();
    !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
}

/// Cells of a `| a | b |` row, trimmed. `None` for lines that are not table rows.
fn table_cells(line: &str) -> Option<Vec<&str>> {
    let inner = line.trim().strip_prefix('|')?;
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    Some(inner.split('|').map(str::trim).collect())
}

fn is_separator(cells: &[&str]) -> bool {
    cells
        .iter()
        .all(|c| !c.is_empty() && c.chars().all(|ch| matches!(ch, '-' | ':')))
}

/// Splits `B. because ...` into the answer token and the remaining explanation.
fn split_answer(rest: &str) -> (String, &str) {
    let rest = rest.trim().trim_start_matches('*').trim();
    let rest = match ANSWER_LABEL.find(rest) {
        Some(m) => &rest[m.end()..],
        None => rest,
    };
    let (token, tail) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let answer = token.trim_end_matches(['.', ',', ':', ';', '*']);
    let tail = tail.trim_start_matches(|c: char| c.is_whitespace() || ".,:;-*".contains(c));
    (answer.to_string(), tail.trim_end())
}

/// Entries of the first answer section in `text`. Empty when there is none.
pub fn parse(text: &str) -> AnswerKey {
    let mut key = AnswerKey::default();
    let mut seen = HashSet::new();
    let mut lines = text.lines();
    // question numbers from the header row of a horizontal table
    let mut header: Vec<String> = Vec::new();

    if !lines
        .by_ref()
        .any(|line| is_heading(line) && ANSWER_HEADING.is_match(line))
    {
        return key;
    }

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        if EXAM_HEADING.is_match(line) && !ANSWER_HEADING.is_match(line) {
            break;
        }

        if let Some(cells) = table_cells(line) {
            if is_separator(&cells) {
                continue;
            }
            if let Some((first, rest)) = cells.split_first() {
                if QUESTION_CELL.is_match(first)
                    && !rest.is_empty()
                    && rest.iter().all(|c| c.parse::<u32>().is_ok())
                {
                    header = rest.iter().map(|c| c.to_string()).collect();
                    continue;
                }
                if ANSWER_CELL.is_match(first) && !header.is_empty() {
                    for (number, cell) in header.iter().zip(rest) {
                        let (answer, _) = split_answer(cell);
                        if !answer.is_empty() {
                            key.push(&mut seen, number, &answer, false);
                        }
                    }
                    header.clear();
                    continue;
                }
            }
        }

        if let Some(caps) = TABLE_ROW.captures(line) {
            let (answer, tail) = split_answer(&caps[2]);
            key.push(&mut seen, &caps[1], &answer, tail.len() >= 4);
            continue;
        }

        let compact: Vec<_> = COMPACT.captures_iter(line).collect();
        if compact.len() > 1 {
            for caps in compact {
                key.push(&mut seen, &caps[1], &caps[2], false);
            }
            continue;
        }

        if let Some(caps) = LABELLED
            .captures(line)
            .or_else(|| NUMBERED.captures(line))
        {
            let (answer, tail) = split_answer(&caps[2]);
            if !answer.is_empty() {
                key.push(&mut seen, &caps[1], &answer, tail.chars().count() >= 4);
                continue;
            }
        }

        // continuation text belongs to the previous entry
        if let Some(last) = key.entries.last_mut() {
            last.has_reasoning = true;
        }
    }
    key
}
