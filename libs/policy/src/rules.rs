//! Loading and evaluation of classifier rules.
//!
//! Rules are continued lines of the form `CLASS[/annotation...]:
//! EXPRESSION`. The annotations are `nonterminal` (aka `nt`), `always`,
//! `label=NAME`, or bare `label` (which uses the expression text itself).
//!
//! Matching tries each rule in file order and stops after the first
//! matching rule not marked nonterminal, except that rules marked `always`
//! are always evaluated. All matching rules come back in match order; a
//! non-empty result gains a synthetic final match against `GLOBAL`.

use std::fmt;
use std::io::Read;
use std::path::Path;

use crate::contread::{self, ContreadError};
use crate::hostinfo::HostInfo;
use crate::memo::Memos;
use crate::parser::{self, Expr, ParseError};

pub const GLOBAL_CLASS: &str = "GLOBAL";

#[derive(Debug, thiserror::Error)]
pub enum BadInput {
    #[error("too few elements in rule")]
    TooFewElements,
    #[error("class name does not end with a ':'")]
    MissingColon,
    #[error("class name section has no actual name")]
    EmptyClassName,
    #[error("empty label on rule")]
    EmptyLabel,
    #[error("multiple labels on rule")]
    MultipleLabels,
    #[error("unrecognized rule note `{0}`")]
    UnknownAnnotation(String),
    #[error("{0}")]
    Expression(#[from] ParseError),
    #[error("{file}: {source}")]
    Read {
        file: String,
        source: ContreadError,
    },
    #[error("error parsing {file} line {lineno}: {source}")]
    Line {
        file: String,
        lineno: usize,
        source: Box<BadInput>,
    },
    #[error("cannot open {file}: {source}")]
    Open {
        file: String,
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct Rule {
    pub lineno: usize,
    pub class: String,
    pub nonterminal: bool,
    pub always: bool,
    pub label: Option<String>,
    pub expr: Expr,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class)?;
        if self.nonterminal {
            f.write_str("/nt")?;
        }
        if self.always {
            f.write_str("/always")?;
        }
        if let Some(label) = &self.label {
            write!(f, "/label={label}")?;
        }
        write!(f, ": {}", self.expr)
    }
}

/// The slice of a matched rule that the action engine needs. Cheap to
/// clone out of the rule root, so results can outlive a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRule {
    pub class: String,
    pub lineno: i64,
    pub label: Option<String>,
}

impl MatchedRule {
    fn of(rule: &Rule) -> Self {
        Self {
            class: rule.class.clone(),
            lineno: rule.lineno as i64,
            label: rule.label.clone(),
        }
    }

    /// A synthetic match, used for `GLOBAL` and the worker-overflow class.
    pub fn synthetic(class: &str) -> Self {
        Self {
            class: class.to_owned(),
            lineno: -1,
            label: None,
        }
    }
}

fn apply_annotations(rule: &mut Rule, notes: &str, rulestr: &str) -> Result<(), BadInput> {
    for note in notes.split('/') {
        match note {
            "nt" | "nonterminal" => rule.nonterminal = true,
            "always" => rule.always = true,
            "label" => rule.label = Some(rulestr.to_owned()),
            _ => {
                let Some(name) = note.strip_prefix("label=") else {
                    return Err(BadInput::UnknownAnnotation(note.to_owned()));
                };
                if name.is_empty() {
                    return Err(BadInput::EmptyLabel);
                }
                if rule.label.as_deref().is_some_and(|l| l != name) {
                    return Err(BadInput::MultipleLabels);
                }
                rule.label = Some(name.to_owned());
            }
        }
    }

    Ok(())
}

fn parse_line(line: &str, lineno: usize, memos: &mut Memos) -> Result<Rule, BadInput> {
    let Some((head, rest)) = line.split_once(char::is_whitespace) else {
        return Err(BadInput::TooFewElements);
    };
    let Some(head) = head.strip_suffix(':') else {
        return Err(BadInput::MissingColon);
    };
    if head.starts_with('/') {
        return Err(BadInput::EmptyClassName);
    }
    let rulestr = rest.trim();
    if rulestr.is_empty() {
        return Err(BadInput::TooFewElements);
    }

    let mut rule = Rule {
        lineno,
        class: String::new(),
        nonterminal: false,
        always: false,
        label: None,
        expr: Expr::Or(Vec::new()),
    };
    let name = match head.split_once('/') {
        Some((name, notes)) => {
            apply_annotations(&mut rule, notes, rulestr)?;
            name
        }
        None => head,
    };
    rule.class = name.to_owned();
    rule.expr = parser::parse(rulestr, memos)?;

    Ok(rule)
}

#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    have_always: bool,
}

impl RuleSet {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn add(&mut self, rule: Rule) {
        self.have_always |= rule.always;
        self.rules.push(rule);
    }

    pub fn class_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for rule in &self.rules {
            if !names.contains(&rule.class.as_str()) {
                names.push(rule.class.as_str());
            }
        }

        names
    }

    /// Evaluates the rules against one connection, in file order.
    ///
    /// Rules marked `always` are always evaluated; otherwise matching
    /// stops at the first successful rule not marked nonterminal. A given
    /// class succeeds only once; after that, further rules for it are
    /// skipped.
    pub fn eval(&self, hi: &mut HostInfo) -> Vec<MatchedRule> {
        let mut matching = Vec::new();
        let mut matched = false;
        for rule in &self.rules {
            if (matched && !rule.always) || hi.classes().iter().any(|c| *c == rule.class) {
                continue;
            }
            if !rule.expr.eval(hi) {
                continue;
            }
            matching.push(MatchedRule::of(rule));
            hi.add_class(&rule.class);
            if !rule.nonterminal {
                matched = true;
                // Break out early if there are no always rules anywhere;
                // this wins on early or middle matches.
                if !self.have_always {
                    break;
                }
            }
        }
        if !matching.is_empty() {
            matching.push(MatchedRule::synthetic(GLOBAL_CLASS));
        }

        matching
    }

    pub fn from_reader<R: Read>(
        reader: R,
        fname: &str,
        memos: &mut Memos,
    ) -> Result<Self, BadInput> {
        let result = Self::load(reader, fname, memos);
        // Memoized compilations age on success; on errors everything is
        // dead.
        match &result {
            Ok(_) => memos.age(),
            Err(_) => memos.discard(),
        }

        result
    }

    fn load<R: Read>(reader: R, fname: &str, memos: &mut Memos) -> Result<Self, BadInput> {
        let lines = contread::logical_lines(reader).map_err(|source| BadInput::Read {
            file: fname.to_owned(),
            source,
        })?;

        let mut rules = RuleSet::default();
        for line in lines {
            let rule =
                parse_line(&line.text, line.lineno, memos).map_err(|source| BadInput::Line {
                    file: fname.to_owned(),
                    lineno: line.lineno,
                    source: Box::new(source),
                })?;
            rules.add(rule);
        }

        Ok(rules)
    }

    pub fn parse_file(path: &Path, memos: &mut Memos) -> Result<Self, BadInput> {
        let file = std::fs::File::open(path).map_err(|source| BadInput::Open {
            file: path.display().to_string(),
            source,
        })?;

        Self::from_reader(file, &path.display().to_string(), memos)
    }
}

impl fmt::Display for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rule in &self.rules {
            writeln!(f, "{rule}")?;
        }

        Ok(())
    }
}
