#![cfg_attr(test, allow(clippy::unwrap_used))]

//! The policy engine of doorman: classifier rules, action classes, and the
//! per-connection host information they evaluate against.

pub mod actions;
pub mod conntrack;
pub mod contread;
pub mod hostinfo;
pub mod identd;
pub mod iptime;
pub mod lexer;
pub mod matchers;
pub mod memo;
pub mod parser;
pub mod rules;
pub mod services;
pub mod template;
pub mod util;

#[cfg(test)]
mod testing;

pub use actions::{Act, ActKind, ActionCtx, ActionSet, BadAction, LimitKind};
pub use conntrack::{ConnTrack, DuplicatePid};
pub use hostinfo::{HostInfo, HostnameStatus};
pub use iptime::IpTimeCache;
pub use memo::Memos;
pub use rules::{BadInput, GLOBAL_CLASS, MatchedRule, RuleSet};
pub use services::{HostServices, SystemServices};
