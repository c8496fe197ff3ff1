//! The Turn Record: one user turn and the job outputs it produced.
//!
//! ```text
//! #TURN_ID:<id>#
//! #USER_START#
//! <user text>
//! #USER_END#
//! #JOB_START:<name>#
//! <job output>
//! #JOB_END:<name>#
//! #TURN_COMPLETE#            (or #TURN_INCOMPLETE:<reason>#)
//! ```
//!
//! Content lines beginning with `#` are escaped (see `shared::tagged`), so only
//! real tags start with `#`. A segment cut off by a crash has no end tag and is
//! dropped by the parser.

use crate::shared::ids::random_hex;
use crate::shared::tagged::{join_content, push_segment};

pub const USER_START: &str = "#USER_START#";
pub const USER_END: &str = "#USER_END#";
pub const TURN_COMPLETE: &str = "#TURN_COMPLETE#";
const TURN_ID_PREFIX: &str = "#TURN_ID:";
const JOB_START_PREFIX: &str = "#JOB_START:";
const JOB_END_PREFIX: &str = "#JOB_END:";
const INCOMPLETE_PREFIX: &str = "#TURN_INCOMPLETE:";

pub fn job_start_tag(name: &str) -> String {
    format!("{JOB_START_PREFIX}{name}#")
}

pub fn job_end_tag(name: &str) -> String {
    format!("{JOB_END_PREFIX}{name}#")
}

/// In-memory accumulation; callers persist `as_str()` as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRecord {
    id: String,
    text: String,
}

impl TurnRecord {
    /// Starts a record under a fresh turn id, so identical text in a later
    /// turn is still told apart from this one.
    pub fn begin(user_input: &str) -> Self {
        let id = random_hex(8);
        let mut text = format!("{TURN_ID_PREFIX}{id}#\n");
        push_segment(&mut text, USER_START, USER_END, user_input);
        Self { id, text }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn push_job(&mut self, name: &str, output: &str) {
        push_segment(
            &mut self.text,
            &job_start_tag(name),
            &job_end_tag(name),
            output,
        );
    }

    pub fn complete(&mut self) {
        self.text.push_str(TURN_COMPLETE);
        self.text.push('\n');
    }

    pub fn incomplete(&mut self, reason: &str) {
        let reason: String = reason
            .chars()
            .map(|ch| if ch == '#' || ch.is_control() { ' ' } else { ch })
            .collect();
        self.text
            .push_str(&format!("{INCOMPLETE_PREFIX}{}#\n", reason.trim()));
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TurnStatus {
    #[default]
    InProgress,
    Complete,
    Incomplete(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSegment {
    pub name: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedTurn {
    pub turn_id: Option<String>,
    pub user: Option<String>,
    pub jobs: Vec<JobSegment>,
    pub status: TurnStatus,
}

impl ParsedTurn {
    pub fn last_output(&self) -> Option<&str> {
        self.jobs.last().map(|segment| segment.output.as_str())
    }

    /// User text and every job output, in record order.
    pub fn contents(&self) -> Vec<&str> {
        self.user
            .iter()
            .map(String::as_str)
            .chain(self.jobs.iter().map(|segment| segment.output.as_str()))
            .collect()
    }
}

enum Open<'a> {
    Idle,
    User(Vec<&'a str>),
    Job(&'a str, Vec<&'a str>),
}

fn is_tag(line: &str) -> bool {
    line.starts_with('#')
}

pub fn parse_turn_record(raw: &str) -> ParsedTurn {
    let mut parsed = ParsedTurn::default();
    let mut open = Open::Idle;

    for line in raw.split('\n') {
        match &mut open {
            Open::Idle => {}
            Open::User(lines) => {
                if line == USER_END {
                    parsed.user = Some(join_content(lines));
                    open = Open::Idle;
                    continue;
                }
                if !is_tag(line) {
                    lines.push(line);
                    continue;
                }
                open = Open::Idle;
            }
            Open::Job(name, lines) => {
                if line.strip_prefix(JOB_END_PREFIX).and_then(|rest| rest.strip_suffix('#'))
                    == Some(*name)
                {
                    parsed.jobs.push(JobSegment {
                        name: name.to_string(),
                        output: join_content(lines),
                    });
                    open = Open::Idle;
                    continue;
                }
                if !is_tag(line) {
                    lines.push(line);
                    continue;
                }
                open = Open::Idle;
            }
        }

        if let Some(id) = line
            .strip_prefix(TURN_ID_PREFIX)
            .and_then(|rest| rest.strip_suffix('#'))
        {
            parsed.turn_id = Some(id.to_string());
        } else if line == USER_START {
            open = Open::User(Vec::new());
        } else if let Some(name) = line
            .strip_prefix(JOB_START_PREFIX)
            .and_then(|rest| rest.strip_suffix('#'))
        {
            open = Open::Job(name, Vec::new());
        } else if line == TURN_COMPLETE {
            parsed.status = TurnStatus::Complete;
        } else if let Some(reason) = line
            .strip_prefix(INCOMPLETE_PREFIX)
            .and_then(|rest| rest.strip_suffix('#'))
        {
            parsed.status = TurnStatus::Incomplete(reason.to_string());
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_record_parses_back_with_status() {
        let mut record = TurnRecord::begin("What's 2+2?\n#not a tag");
        record.push_job("extract_facts", "user asks arithmetic: 2+2");
        record.push_job("final_output", "4");
        record.complete();

        let parsed = parse_turn_record(record.as_str());
        assert_eq!(parsed.turn_id.as_deref(), Some(record.id()));
        assert_eq!(parsed.user.as_deref(), Some("What's 2+2?\n#not a tag"));
        assert_eq!(parsed.jobs.len(), 2);
        assert_eq!(parsed.jobs[0].name, "extract_facts");
        assert_eq!(parsed.last_output(), Some("4"));
        assert_eq!(parsed.status, TurnStatus::Complete);
    }

    #[test]
    fn interrupted_job_segment_is_ignored() {
        let raw = "#USER_START#\nhello\n#USER_END#\n#JOB_START:a#\ndone\n#JOB_END:a#\n#JOB_START:b#\npartial out";
        let parsed = parse_turn_record(raw);
        assert_eq!(parsed.user.as_deref(), Some("hello"));
        assert_eq!(
            parsed.jobs,
            vec![JobSegment {
                name: "a".to_string(),
                output: "done".to_string()
            }]
        );
        assert_eq!(parsed.status, TurnStatus::InProgress);
    }

    #[test]
    fn segment_cut_by_next_tag_is_dropped_and_next_tag_still_counts() {
        let raw = "#USER_START#\nhi\n#USER_END#\n#JOB_START:a#\nhalf\n#JOB_START:b#\nfull\n#JOB_END:b#\n#TURN_INCOMPLETE:model failed on c#\n";
        let parsed = parse_turn_record(raw);
        assert_eq!(parsed.jobs.len(), 1);
        assert_eq!(parsed.jobs[0].name, "b");
        assert_eq!(
            parsed.status,
            TurnStatus::Incomplete("model failed on c".to_string())
        );
    }

    #[test]
    fn incomplete_reason_cannot_break_the_tag() {
        let mut record = TurnRecord::begin("x");
        record.incomplete("bad #thing\nhappened");
        let parsed = parse_turn_record(record.as_str());
        assert_eq!(
            parsed.status,
            TurnStatus::Incomplete("bad  thing happened".to_string())
        );
    }

    #[test]
    fn crlf_content_round_trips() {
        let mut record = TurnRecord::begin("line one\r\nline two\r");
        record.push_job("reply_job", "a\r\nb");
        let parsed = parse_turn_record(record.as_str());
        assert_eq!(parsed.user.as_deref(), Some("line one\r\nline two\r"));
        assert_eq!(parsed.last_output(), Some("a\r\nb"));
    }

    #[test]
    fn each_record_gets_its_own_turn_id() {
        let first = TurnRecord::begin("same");
        let second = TurnRecord::begin("same");
        assert_ne!(first.id(), second.id());
        assert_eq!(first.id().len(), 16);
    }
}
