//! Loading and interpretation of action classes.
//!
//! Rule evaluation produces a list of matching classes; classes without a
//! corresponding action are ignored. To succeed, a connection must pass the
//! `reject`/`ipmax`/`connmax` limits of all remaining classes, following
//! `see` chains. On success the first matching class with a `drop`, `msg`,
//! or `run` directive supplies the action; on failure the first failing
//! class supplies `failmsg`/`failrun`, with the `DEFAULT-*` and
//! `DEFAULTMSGS` classes as message-only fallbacks. In all cases matching
//! classes with `record` templates get them formatted and logged.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::conntrack::ConnTrack;
use crate::contread::{self, ContreadError};
use crate::hostinfo::HostInfo;
use crate::rules::MatchedRule;
use crate::template::{self, TemplateError};

#[derive(Debug, thiserror::Error)]
pub enum BadAction {
    #[error("too few elements in action")]
    TooFewElements,
    #[error("class name does not end with a ':'")]
    MissingColon,
    #[error("unknown directive {0}")]
    UnknownDirective(String),
    #[error("wrong number of arguments for directive {0}")]
    WrongArgCount(String),
    #[error("not an integer: {0}")]
    NotAnInteger(String),
    #[error("multiple specification of directive {0}")]
    DuplicateDirective(String),
    #[error("setenv of variable more than once: {0}")]
    DuplicateEnv(String),
    #[error("subst variable specified more than once: {0}")]
    DuplicateSubst(String),
    #[error("cannot specify both msg and run in one action")]
    MsgAndRun,
    #[error("cannot specify both failmsg and failrun in one action")]
    FailmsgAndFailrun,
    #[error("duplicate class line for class {0}")]
    DuplicateClass(String),
    #[error("class {0} says to see class '{1}', but there is no such class")]
    MissingSeeTarget(String, String),
    #[error("see loop in {0}: saw {1} again")]
    SeeLoop(String, String),
    #[error("cannot format the string `{0}`: {1}")]
    Format(String, TemplateError),
    #[error("{file}: {source}")]
    Read {
        file: String,
        source: ContreadError,
    },
    #[error("error parsing {file} line {lineno}: {source}")]
    Line {
        file: String,
        lineno: usize,
        source: Box<BadAction>,
    },
    #[error("error loading {file}: {source}")]
    Consistency {
        file: String,
        source: Box<BadAction>,
    },
    #[error("cannot open {file}: {source}")]
    Open {
        file: String,
        source: std::io::Error,
    },
}

/// The ways a connection can fail its limit checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Reject,
    IpMax,
    ConnMax,
}

impl LimitKind {
    pub const ALL: [LimitKind; 3] = [LimitKind::Reject, LimitKind::IpMax, LimitKind::ConnMax];

    pub fn as_str(self) -> &'static str {
        match self {
            LimitKind::Reject => "reject",
            LimitKind::IpMax => "ipmax",
            LimitKind::ConnMax => "connmax",
        }
    }

    /// The fallback classes consulted for failure messages of this kind.
    fn default_classes(self) -> [&'static str; 2] {
        let specific = match self {
            LimitKind::Reject => "DEFAULT-REJECT",
            LimitKind::IpMax => "DEFAULT-IPMAX",
            LimitKind::ConnMax => "DEFAULT-CONNMAX",
        };

        [specific, "DEFAULTMSGS"]
    }

    fn builtin_log(self) -> &'static str {
        match self {
            LimitKind::Reject => template::LOG_REJECT,
            LimitKind::IpMax | LimitKind::ConnMax => template::LOG_LIMITS,
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One action class: its directives, environment additions, and extra
/// substitutions.
#[derive(Debug, Default, Clone)]
pub struct ActionRule {
    pub name: String,
    reject: bool,
    drop: bool,
    quiet: bool,
    norepeatlog: bool,
    ipmax: Option<u32>,
    connmax: Option<u32>,
    log: Option<String>,
    faillog: Option<String>,
    record: Option<String>,
    msg: Option<String>,
    run: Option<String>,
    failmsg: Option<String>,
    failrun: Option<String>,
    see: Option<String>,
    setenv: BTreeMap<String, String>,
    subst: BTreeMap<String, String>,
}

impl ActionRule {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    fn has_limit(&self, kind: LimitKind) -> bool {
        match kind {
            LimitKind::Reject => self.reject,
            LimitKind::IpMax => self.ipmax.is_some(),
            LimitKind::ConnMax => self.connmax.is_some(),
        }
    }

    /// Whether this class's `kind` limit fails the connection. The
    /// `connmax` count is taken against `base`, the class the match
    /// actually landed on, not the see-chain ancestor carrying the limit.
    fn limit_fails(
        &self,
        kind: LimitKind,
        hi: &HostInfo,
        base: &ActionRule,
        conntrack: &ConnTrack,
    ) -> bool {
        match kind {
            LimitKind::Reject => self.reject,
            LimitKind::IpMax => self
                .ipmax
                .is_some_and(|max| conntrack.ip_count(hi.ip()) >= max as usize),
            LimitKind::ConnMax => self
                .connmax
                .is_some_and(|max| conntrack.class_count(&base.name) >= max as usize),
        }
    }
}

impl fmt::Display for ActionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        // Alphabetical directive order, for a stable reproduction.
        if let Some(max) = self.connmax {
            parts.push(format!("connmax {max}"));
        }
        if self.drop {
            parts.push("drop".to_owned());
        }
        if let Some(t) = &self.faillog {
            parts.push(format!("faillog {t}"));
        }
        if let Some(t) = &self.failmsg {
            parts.push(format!("failmsg {t}"));
        }
        if let Some(t) = &self.failrun {
            parts.push(format!("failrun {t}"));
        }
        if let Some(max) = self.ipmax {
            parts.push(format!("ipmax {max}"));
        }
        if let Some(t) = &self.log {
            if t.is_empty() {
                parts.push("log".to_owned());
            } else {
                parts.push(format!("log {t}"));
            }
        }
        if let Some(t) = &self.msg {
            parts.push(format!("msg {t}"));
        }
        if self.norepeatlog {
            parts.push("norepeatlog".to_owned());
        }
        if self.quiet {
            parts.push("quiet".to_owned());
        }
        if let Some(t) = &self.record {
            parts.push(format!("record {t}"));
        }
        if self.reject {
            parts.push("reject".to_owned());
        }
        if let Some(t) = &self.run {
            parts.push(format!("run {t}"));
        }
        if let Some(t) = &self.see {
            parts.push(format!("see {t}"));
        }
        for (name, value) in &self.setenv {
            parts.push(format!("setenv {name} {value}"));
        }
        for (name, value) in &self.subst {
            parts.push(format!("subst {name} {value}"));
        }

        write!(f, "{}: {}", self.name, parts.join(" : "))
    }
}

/// What a connection's action turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActKind {
    Msg,
    Run,
    FailMsg,
    FailRun,
}

impl ActKind {
    pub fn is_run(self) -> bool {
        matches!(self, ActKind::Run | ActKind::FailRun)
    }
}

/// The fully resolved outcome for one connection: lines to log, an
/// optional thing to do, and the environment for `run` children.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Act {
    pub log_msgs: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub what: Option<ActKind>,
    /// The formatted message (`msg`/`failmsg`) or command line.
    pub arg: Option<String>,
    /// The command line split on whitespace, each element formatted
    /// individually. Substitution values never re-tokenize.
    pub argv: Option<Vec<String>>,
}

/// Mutable evaluation context owned by the caller: the live-connection
/// index, the substitution switch, and the last-logged line used for
/// `norepeatlog` suppression.
pub struct ActionCtx<'a> {
    pub conntrack: &'a ConnTrack,
    pub substitute: bool,
    pub last_log: &'a mut Option<String>,
}

fn parse_count(keyword: &str, rest: &str) -> Result<u32, BadAction> {
    if rest.split_whitespace().count() != 1 {
        return Err(BadAction::WrongArgCount(keyword.to_owned()));
    }

    rest.parse::<u32>()
        .map_err(|_| BadAction::NotAnInteger(rest.to_owned()))
}

fn parse_pair(keyword: &str, rest: &str) -> Result<(String, String), BadAction> {
    let Some((name, value)) = rest.split_once(char::is_whitespace) else {
        return Err(BadAction::WrongArgCount(keyword.to_owned()));
    };

    Ok((name.to_owned(), value.trim_start().to_owned()))
}

/// Directive separators are a space, a colon, and a space.
static DIRECTIVE_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s:\s").expect("static regex compiles"));

fn parse_line(line: &str) -> Result<ActionRule, BadAction> {
    let Some((head, rest)) = line.split_once(char::is_whitespace) else {
        return Err(BadAction::TooFewElements);
    };
    let Some(name) = head.strip_suffix(':') else {
        return Err(BadAction::MissingColon);
    };

    let mut act = ActionRule::new(name);
    for comp in DIRECTIVE_SPLIT.split(rest) {
        let comp = comp.trim();
        let (keyword, rest) = comp
            .split_once(char::is_whitespace)
            .map(|(k, r)| (k, r.trim()))
            .unwrap_or((comp, ""));

        let duplicate = || BadAction::DuplicateDirective(keyword.to_owned());
        let no_arg = |set: &mut bool| {
            if !rest.is_empty() {
                return Err(BadAction::WrongArgCount(keyword.to_owned()));
            }
            if *set {
                return Err(duplicate());
            }
            *set = true;

            Ok(())
        };
        // Everything except `log` (which may be empty), the flags, and the
        // two-argument forms takes one non-empty template string.
        let template = |slot: &mut Option<String>| {
            if rest.is_empty() {
                return Err(BadAction::WrongArgCount(keyword.to_owned()));
            }
            if slot.is_some() {
                return Err(duplicate());
            }
            *slot = Some(rest.to_owned());

            Ok(())
        };

        match keyword {
            "reject" => no_arg(&mut act.reject)?,
            "drop" => no_arg(&mut act.drop)?,
            "quiet" => no_arg(&mut act.quiet)?,
            "norepeatlog" => no_arg(&mut act.norepeatlog)?,
            "log" => {
                if act.log.is_some() {
                    return Err(duplicate());
                }
                act.log = Some(rest.to_owned());
            }
            "ipmax" => {
                if act.ipmax.is_some() {
                    return Err(duplicate());
                }
                act.ipmax = Some(parse_count(keyword, rest)?);
            }
            "connmax" => {
                if act.connmax.is_some() {
                    return Err(duplicate());
                }
                act.connmax = Some(parse_count(keyword, rest)?);
            }
            "run" => template(&mut act.run)?,
            "msg" => template(&mut act.msg)?,
            "failrun" => template(&mut act.failrun)?,
            "failmsg" => template(&mut act.failmsg)?,
            "faillog" => template(&mut act.faillog)?,
            "record" => template(&mut act.record)?,
            "see" => {
                if rest.is_empty() || rest.split_whitespace().count() != 1 {
                    return Err(BadAction::WrongArgCount(keyword.to_owned()));
                }
                if act.see.is_some() {
                    return Err(duplicate());
                }
                act.see = Some(rest.to_owned());
            }
            "setenv" => {
                let (name, value) = parse_pair(keyword, rest)?;
                if act.setenv.contains_key(&name) {
                    return Err(BadAction::DuplicateEnv(name));
                }
                act.setenv.insert(name, value);
            }
            "subst" => {
                let (name, value) = parse_pair(keyword, rest)?;
                if act.subst.contains_key(&name) {
                    return Err(BadAction::DuplicateSubst(name));
                }
                act.subst.insert(name, value);
            }
            _ => return Err(BadAction::UnknownDirective(keyword.to_owned())),
        }
    }

    if act.msg.is_some() && act.run.is_some() {
        return Err(BadAction::MsgAndRun);
    }
    if act.failmsg.is_some() && act.failrun.is_some() {
        return Err(BadAction::FailmsgAndFailrun);
    }

    Ok(act)
}

/// The loaded action classes.
#[derive(Debug, Default)]
pub struct ActionSet {
    rules: BTreeMap<String, ActionRule>,
}

impl ActionSet {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    fn add(&mut self, act: ActionRule) -> Result<(), BadAction> {
        if self.rules.contains_key(&act.name) {
            return Err(BadAction::DuplicateClass(act.name));
        }
        self.rules.insert(act.name.clone(), act);

        Ok(())
    }

    /// The see chain starting at `start`, in order. With a failure kind,
    /// the applicable `DEFAULT-*`/`DEFAULTMSGS` classes are appended;
    /// callers that must not default (limit checks, `failrun`) pass
    /// `None`.
    fn see_list(
        &self,
        start: &ActionRule,
        fail: Option<LimitKind>,
    ) -> Result<Vec<&ActionRule>, BadAction> {
        let mut list = Vec::new();
        let mut seen: Vec<&str> = Vec::new();
        let mut cursor = start;
        loop {
            if seen.contains(&cursor.name.as_str()) {
                return Err(BadAction::SeeLoop(
                    start.name.clone(),
                    cursor.name.clone(),
                ));
            }
            seen.push(&cursor.name);
            // The walk has to use our stored rule so identity stays
            // within this set.
            let Some(stored) = self.rules.get(&cursor.name) else {
                // A start rule from elsewhere; chains are validated
                // against this set at load time.
                return Err(BadAction::MissingSeeTarget(
                    start.name.clone(),
                    cursor.name.clone(),
                ));
            };
            list.push(stored);
            let Some(target) = &stored.see else {
                break;
            };
            cursor = self.rules.get(target).ok_or_else(|| {
                BadAction::MissingSeeTarget(stored.name.clone(), target.clone())
            })?;
        }

        if let Some(kind) = fail {
            for name in kind.default_classes() {
                if let Some(rule) = self.rules.get(name) {
                    list.push(rule);
                }
            }
        }

        Ok(list)
    }

    /// The first rule on the chain that carries the attribute `pick`
    /// selects, if any.
    fn chain_find<'a, T>(
        &'a self,
        start: &'a ActionRule,
        fail: Option<LimitKind>,
        pick: impl Fn(&'a ActionRule) -> Option<T>,
    ) -> Result<Option<T>, BadAction> {
        Ok(self.see_list(start, fail)?.into_iter().find_map(pick))
    }

    /// Checks every matched class's limits, following see chains. Each of
    /// `ipmax` and `connmax` is consumed by the first chain entry that
    /// carries it and passes; `reject` can never pass, so it re-applies
    /// all the way up the chain.
    fn try_to_fail<'m>(
        &self,
        hi: &HostInfo,
        matched: &'m [MatchedRule],
        conntrack: &ConnTrack,
    ) -> Result<Option<(LimitKind, &'m MatchedRule)>, BadAction> {
        for mr in matched {
            let base = &self.rules[&mr.class];
            let mut tests = LimitKind::ALL.to_vec();
            for link in self.see_list(base, None)? {
                let carried = tests
                    .iter()
                    .copied()
                    .filter(|t| link.has_limit(*t))
                    .collect::<Vec<_>>();
                for test in carried {
                    if link.limit_fails(test, hi, base, conntrack) {
                        return Ok(Some((test, mr)));
                    }
                    tests.retain(|t| *t != test);
                }
            }
        }

        Ok(None)
    }

    /// The first matched class whose chain carries an action. `drop` is
    /// checked first within each rule because it can be combined with
    /// `msg` or `run`.
    fn find_first_action<'m>(
        &self,
        matched: &'m [MatchedRule],
    ) -> Result<Option<(&'m MatchedRule, ActionChoice)>, BadAction> {
        for mr in matched {
            let base = &self.rules[&mr.class];
            for link in self.see_list(base, None)? {
                if link.drop {
                    return Ok(Some((mr, ActionChoice::Drop)));
                }
                if link.msg.is_some() {
                    return Ok(Some((mr, ActionChoice::Msg)));
                }
                if link.run.is_some() {
                    return Ok(Some((mr, ActionChoice::Run)));
                }
            }
        }

        Ok(None)
    }

    /// The fail action and its carrying rule: the first `failmsg` along
    /// the chain plus defaults, or the first `failrun` along the chain
    /// alone. The two walk in tandem because `failrun` must not default.
    fn fail_action(
        &self,
        start: &ActionRule,
        kind: LimitKind,
    ) -> Result<Option<(&ActionRule, ActKind)>, BadAction> {
        let plain = self.see_list(start, None)?;
        for link in self.see_list(start, Some(kind))? {
            if link.failmsg.is_some() {
                return Ok(Some((link, ActKind::FailMsg)));
            }
            if !plain.iter().any(|p| std::ptr::eq(*p, link)) {
                // Into the default classes now; they never supply failrun.
                break;
            }
            if link.failrun.is_some() {
                return Ok(Some((link, ActKind::FailRun)));
            }
        }

        Ok(None)
    }

    fn format(
        &self,
        template: &str,
        hi: &HostInfo,
        rule: Option<&MatchedRule>,
        sdict: Option<&BTreeMap<String, String>>,
        extras: &[(&str, &str)],
        substitute: bool,
    ) -> Result<String, BadAction> {
        if !substitute {
            return Ok(template.to_owned());
        }

        template::format(template, hi, rule, sdict, extras)
            .map_err(|e| BadAction::Format(template.to_owned(), e))
    }

    /// Gathers the `subst` maps along a chain into one dictionary,
    /// formatting values on the way. Later chain entries cannot override
    /// earlier ones; chain ancestors can rely on being expanded with the
    /// substitutions accumulated so far.
    fn gather_subst(
        &self,
        start: &ActionRule,
        hi: &HostInfo,
        rule: &MatchedRule,
        out: &mut BTreeMap<String, String>,
        substitute: bool,
    ) -> Result<(), BadAction> {
        for link in self.see_list(start, None)? {
            for (name, value) in &link.subst {
                if out.contains_key(name) {
                    continue;
                }
                let formatted = self.format(value, hi, Some(rule), Some(out), &[], substitute)?;
                out.insert(name.clone(), formatted);
            }
        }

        Ok(())
    }

    /// Gathers the `setenv` maps along a chain, first occurrence winning.
    /// Values run through substitution with the subst dictionary.
    fn gather_env(
        &self,
        start: &ActionRule,
        hi: &HostInfo,
        rule: &MatchedRule,
        sdict: &BTreeMap<String, String>,
        out: &mut BTreeMap<String, String>,
        substitute: bool,
    ) -> Result<(), BadAction> {
        for link in self.see_list(start, None)? {
            for (name, value) in &link.setenv {
                if out.contains_key(name) {
                    continue;
                }
                let formatted =
                    self.format(value, hi, Some(rule), Some(sdict), &[], substitute)?;
                out.insert(name.clone(), formatted);
            }
        }

        Ok(())
    }

    /// Resolves the matched rule list into an [`Act`], or `None` when
    /// nothing at all is to be done for this connection.
    pub fn evaluate(
        &self,
        hi: &HostInfo,
        matched: &[MatchedRule],
        ctx: &mut ActionCtx<'_>,
    ) -> Result<Option<Act>, BadAction> {
        // Matched classes with no action rule may occur in setups using
        // the class: matcher to simplify life; ignore them.
        let matched = matched
            .iter()
            .filter(|m| self.rules.contains_key(&m.class))
            .cloned()
            .collect::<Vec<_>>();
        if matched.is_empty() {
            return Ok(None);
        }

        let fail = self.try_to_fail(hi, &matched, ctx.conntrack)?;
        let success = match fail {
            Some(_) => None,
            None => self.find_first_action(&matched)?,
        };
        let acted_on = fail.map(|(_, mr)| mr).or(success.map(|(mr, _)| mr));

        // Everything that wants to record something does, whether or not
        // an action came out.
        let recording = matched
            .iter()
            .map(|mr| {
                let base = &self.rules[&mr.class];
                Ok((mr, self.chain_find(base, None, |r| r.record.as_deref())?))
            })
            .collect::<Result<Vec<_>, BadAction>>()?
            .into_iter()
            .filter_map(|(mr, rec)| rec.map(|r| (mr, r)))
            .collect::<Vec<_>>();

        if acted_on.is_none() && recording.is_empty() {
            return Ok(None);
        }

        let mut act = Act::default();
        for &(mr, rec) in &recording {
            act.log_msgs
                .push(self.format(rec, hi, Some(mr), None, &[], ctx.substitute)?);
        }
        // With no terminal rule, all that happens is the record logging.
        let Some(acted_on) = acted_on else {
            return Ok(Some(act));
        };

        let base = &self.rules[&acted_on.class];
        let mut sdict = BTreeMap::new();
        self.gather_subst(base, hi, acted_on, &mut sdict, ctx.substitute)?;

        // The summary log line for the success or the failure.
        let log_template = match fail {
            None => self
                .chain_find(base, None, |r| r.log.as_deref())?
                .map(|t| if t.is_empty() { template::LOG_CONNECT } else { t }),
            Some((kind, _)) => {
                let quiet = self.chain_find(base, None, |r| r.quiet.then_some(()))?;
                if quiet.is_some() {
                    self.chain_find(base, None, |r| r.faillog.as_deref())?
                } else {
                    self.chain_find(base, Some(kind), |r| r.faillog.as_deref())?
                        .or(Some(kind.builtin_log()))
                }
            }
        };
        if let Some(template) = log_template {
            let fail_extra = fail.map(|(kind, _)| [("limit", kind.as_str())]);
            let extras: &[(&str, &str)] = fail_extra.as_ref().map_or(&[], |e| e.as_slice());
            let line = self.format(template, hi, Some(acted_on), Some(&sdict), extras, ctx.substitute)?;
            let norepeat = self
                .chain_find(base, None, |r| r.norepeatlog.then_some(()))?
                .is_some();
            if !(norepeat && ctx.last_log.as_deref() == Some(line.as_str())) {
                act.log_msgs.push(line.clone());
            }
            // The most recent line is remembered whether or not it was
            // suppressed.
            *ctx.last_log = Some(line);
        }

        // Decide what actually happens. Because of fail-message
        // defaulting, the rule supplying the argument may not be the one
        // the match landed on.
        let chosen: Option<(&ActionRule, ActKind)> = match (fail, success) {
            (Some((kind, _)), _) => self.fail_action(base, kind)?,
            (None, Some((_, ActionChoice::Drop))) => None,
            (None, Some((_, ActionChoice::Msg))) => self
                .chain_find(base, None, |r| r.msg.is_some().then_some(r))?
                .map(|r| (r, ActKind::Msg)),
            (None, Some((_, ActionChoice::Run))) => self
                .chain_find(base, None, |r| r.run.is_some().then_some(r))?
                .map(|r| (r, ActKind::Run)),
            (None, None) => None,
        };

        if let Some((source, what)) = chosen {
            let template = match what {
                ActKind::Msg => source.msg.as_deref(),
                ActKind::Run => source.run.as_deref(),
                ActKind::FailMsg => source.failmsg.as_deref(),
                ActKind::FailRun => source.failrun.as_deref(),
            }
            .unwrap_or_default();
            act.what = Some(what);
            act.arg = Some(self.format(
                template,
                hi,
                Some(acted_on),
                Some(&sdict),
                &[],
                ctx.substitute,
            )?);
            if what.is_run() {
                // Split first, format each word after: substitution
                // values never re-tokenize into extra arguments.
                let argv = template
                    .split_whitespace()
                    .map(|word| {
                        self.format(word, hi, Some(acted_on), Some(&sdict), &[], ctx.substitute)
                    })
                    .collect::<Result<Vec<_>, BadAction>>()?;
                act.argv = Some(argv);
            }
        }

        self.gather_env(base, hi, acted_on, &sdict, &mut act.env, ctx.substitute)?;

        Ok(Some(act))
    }

    /// Load-time consistency: every `see` goes somewhere and no chain
    /// loops. Neither can be checked before the end of the file; there is
    /// no define-before-see requirement.
    fn check_consistency(&self) -> Result<(), BadAction> {
        for rule in self.rules.values() {
            self.see_list(rule, None)?;
        }

        Ok(())
    }

    pub fn from_reader<R: Read>(reader: R, fname: &str) -> Result<Self, BadAction> {
        let lines = contread::logical_lines(reader).map_err(|source| BadAction::Read {
            file: fname.to_owned(),
            source,
        })?;

        let mut set = ActionSet::default();
        for line in lines {
            let wrap = |source: BadAction| BadAction::Line {
                file: fname.to_owned(),
                lineno: line.lineno,
                source: Box::new(source),
            };
            let act = parse_line(&line.text).map_err(wrap)?;
            set.add(act).map_err(wrap)?;
        }
        set.check_consistency()
            .map_err(|source| BadAction::Consistency {
                file: fname.to_owned(),
                source: Box::new(source),
            })?;

        Ok(set)
    }

    pub fn parse_file(path: &Path) -> Result<Self, BadAction> {
        let file = std::fs::File::open(path).map_err(|source| BadAction::Open {
            file: path.display().to_string(),
            source,
        })?;

        Self::from_reader(file, &path.display().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionChoice {
    Drop,
    Msg,
    Run,
}

impl fmt::Display for ActionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // BTreeMap iteration gives the consistent order.
        for rule in self.rules.values() {
            writeln!(f, "{rule}")?;
        }

        Ok(())
    }
}
