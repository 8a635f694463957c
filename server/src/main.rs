#![cfg_attr(test, allow(clippy::unwrap_used))]

//! doorman: a per-connection policy gatekeeper for inbound TCP.
//!
//! Startup is: parse arguments, establish logging, read the configuration
//! file, bind the server sockets, drop privileges, then enter the service
//! loop, which keeps the rule and action files fresh and dispatches every
//! accepted connection through them.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use doorman_logging::LogTarget;
use doorman_policy::{ActionSet, Memos, RuleSet};

use crate::config::Config;
use crate::eventloop::Server;
use crate::spawn::StackLimit;

mod config;
mod eventloop;
mod listeners;
mod reloader;
mod spawn;

#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
struct Cli {
    /// Configuration file.
    config: PathBuf,

    /// Debug verbosity; repeat for more.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Set the debug verbosity level directly.
    #[arg(short = 'V', long = "verbosity", value_name = "NUM")]
    verbosity: Option<u8>,

    /// Log to the journal instead of stderr.
    #[arg(short = 'l', long = "journald")]
    journald: bool,

    /// Log identifier.
    #[arg(short = 'p', long = "ident", default_value = "doorman")]
    ident: String,

    /// Load and lint the configuration, then exit.
    #[arg(short = 'C', long = "check")]
    check: bool,

    /// Override the configured worker-pool limit.
    #[arg(short = 'M', long = "max-workers", value_name = "N")]
    max_workers: Option<usize>,

    /// Stack-size rlimit in KiB, or `unlimited`.
    #[arg(short = 'S', long = "stack-size", value_name = "KIB")]
    stack_size: Option<StackLimit>,

    /// Emit JSON log lines on stderr.
    #[arg(long, env = "DOORMAN_LOG_FORMAT_JSON", default_value_t = false)]
    log_json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let target = if cli.journald {
        LogTarget::Journald
    } else if cli.log_json {
        LogTarget::StderrJson
    } else {
        LogTarget::Stderr
    };
    let level = cli.verbosity.unwrap_or(cli.verbose);
    let directives = doorman_logging::verbosity_directives(level);
    #[expect(clippy::print_stderr, reason = "No logger has been set up yet")]
    if let Err(e) = doorman_logging::setup_global_subscriber(&directives, target, &cli.ident) {
        eprintln!("{}: cannot set up logging: {e:#}", cli.ident);
        return ExitCode::FAILURE;
    }

    // Set RLIMIT_STACK. Thanks, glibc!
    if let Some(limit) = cli.stack_size
        && let Err(e) = spawn::set_stack_limit(limit)
    {
        tracing::error!("could not set stack limit: {e:#}");
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let cfg = Config::parse_file(&cli.config).context("cannot load conf file")?;

    if cli.check {
        check_config(&cfg)?;
        tracing::debug!("no problems found.");
        return Ok(());
    }

    // Binding needs whatever privileges we started with; dropping them
    // comes right after.
    let bound = listeners::bind_all(&cfg.listen)?;
    if let Some(user) = &cfg.user {
        spawn::drop_privileges(user)
            .with_context(|| format!("could not drop privileges to {user}"))?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    runtime.block_on(async {
        let listeners = listeners::Listeners::register(bound)?;
        Server::new(cfg, listeners, cli.max_workers).run().await
    })
}

/// Classes that legitimately appear in the action file with no classifier
/// rule.
const ACTION_ONLY_OK: [&str; 5] = [
    "GLOBAL",
    "DEFAULTMSGS",
    "DEFAULT-REJECT",
    "DEFAULT-IPMAX",
    "DEFAULT-CONNMAX",
];

/// `-C`: load both files and cross-check their class names.
fn check_config(cfg: &Config) -> Result<()> {
    let mut memos = Memos::new();
    let rules = RuleSet::parse_file(&cfg.rule_file, &mut memos)
        .map_err(|e| tracing::error!("error loading rules file: {e}"))
        .ok();
    let actions = ActionSet::parse_file(&cfg.action_file)
        .map_err(|e| tracing::error!("error loading actions file: {e}"))
        .ok();
    let (Some(rules), Some(actions)) = (rules, actions) else {
        bail!("configuration files did not load");
    };

    if rules.is_empty() {
        tracing::error!("no rules in the rules file.");
    }
    if actions.is_empty() {
        tracing::error!("no actions in the actions file.");
    }
    if rules.is_empty() || actions.is_empty() {
        bail!("empty configuration files");
    }

    let rule_classes: BTreeSet<&str> = rules.class_names().into_iter().collect();
    let action_classes: BTreeSet<&str> = actions.class_names().collect();
    let ok_set: BTreeSet<&str> = ACTION_ONLY_OK.into_iter().collect();

    let only_rules: Vec<&str> = rule_classes.difference(&action_classes).copied().collect();
    let only_actions: Vec<&str> = action_classes
        .difference(&rule_classes)
        .filter(|c| !ok_set.contains(*c))
        .copied()
        .collect();
    let rules_for_defaults: Vec<&str> = rule_classes.intersection(&ok_set).copied().collect();

    if !only_rules.is_empty() {
        tracing::error!("rules-only classes: {}", only_rules.join(" "));
    }
    if !only_actions.is_empty() {
        tracing::error!("actions-only classes: {}", only_actions.join(" "));
    }
    if !rules_for_defaults.is_empty() {
        tracing::error!(
            "default actions classes with rules: {}",
            rules_for_defaults.join(" ")
        );
    }
    if !(only_rules.is_empty() && only_actions.is_empty() && rules_for_defaults.is_empty()) {
        bail!("rule and action files disagree about classes");
    }

    Ok(())
}
