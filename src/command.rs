//! Label commands embedded in a moderator's report comment.
//!
//! A comment such as `add spam, nsfw remove -account old-label` carries one
//! command per `add`/`remove` keyword. Keywords are matched case-insensitively
//! as whole words. A command may be scoped with `-post`/`-p` or `-account`/`-a`
//! and lists its labels separated by commas.
use std::fmt;

/// Whether a command applies or negates its labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Add,
    Remove,
}

impl Action {
    /// The keyword that introduces this action in a comment.
    const fn keyword(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }

    /// Past tense, used in event comments.
    pub const fn past_tense(self) -> &'static str {
        match self {
            Self::Add => "added",
            Self::Remove => "removed",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// The scope a command applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    /// Whatever the report was filed against.
    Default,
    Post,
    Account,
}

/// A parsed label command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelCommand {
    pub action: Action,
    pub target: Target,
    /// Never empty.
    pub labels: Vec<String>,
}

impl LabelCommand {
    /// An implicit `add` command for labels implied by the report reason.
    pub fn implied(labels: Vec<String>) -> Option<Self> {
        (!labels.is_empty()).then_some(Self {
            action: Action::Add,
            target: Target::Default,
            labels,
        })
    }
}

/// Parse every command in `comment`.
///
/// All `add` commands are returned first, in comment order, followed by all
/// `remove` commands. A command's labels end at the next keyword of either kind.
pub fn parse(comment: &str) -> Vec<LabelCommand> {
    let keywords = scan_keywords(comment);

    let mut adds = Vec::new();
    let mut removes = Vec::new();
    for (i, &(action, start)) in keywords.iter().enumerate() {
        let end = keywords
            .get(i + 1)
            .map_or(comment.len(), |&(next, next_start)| {
                next_start - next.keyword().len()
            });

        let Some(command) = parse_span(action, &comment[start..end]) else {
            continue;
        };
        match action {
            Action::Add => adds.push(command),
            Action::Remove => removes.push(command),
        }
    }

    adds.extend(removes);
    adds
}

/// Find every keyword in one pass, returning each action with the byte offset
/// just past its keyword.
fn scan_keywords(comment: &str) -> Vec<(Action, usize)> {
    let bytes = comment.as_bytes();
    let is_word = |i: usize| bytes.get(i).is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_');

    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let at_boundary = i == 0 || !is_word(i - 1);
        let matched = at_boundary
            .then(|| {
                [Action::Add, Action::Remove].into_iter().find(|action| {
                    let kw = action.keyword().as_bytes();
                    bytes
                        .get(i..i + kw.len())
                        .is_some_and(|s| s.eq_ignore_ascii_case(kw))
                        && !is_word(i + kw.len())
                })
            })
            .flatten();

        match matched {
            Some(action) => {
                i += action.keyword().len();
                found.push((action, i));
            }
            None => i += 1,
        }
    }

    found
}

fn parse_span(action: Action, span: &str) -> Option<LabelCommand> {
    let span = span.trim();
    if span.is_empty() {
        return None;
    }

    let (target, rest) = if let Some(rest) = strip_flag(span, &["-account", "-a"]) {
        (Target::Account, rest)
    } else if let Some(rest) = strip_flag(span, &["-post", "-p"]) {
        (Target::Post, rest)
    } else {
        (Target::Default, span)
    };

    let labels: Vec<String> = rest
        .split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect();

    (!labels.is_empty()).then_some(LabelCommand {
        action,
        target,
        labels,
    })
}

/// Strip a leading flag that must be followed by a space.
fn strip_flag<'a>(span: &'a str, flags: &[&str]) -> Option<&'a str> {
    flags.iter().find_map(|flag| {
        span.strip_prefix(flag)
            .filter(|rest| rest.starts_with(' '))
            .map(str::trim_start)
    })
}
