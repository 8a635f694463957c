//! The main service loop.
//!
//! One task owns everything that mutates shared state: accepting, action
//! selection, child spawning, ConnTrack bookkeeping, and swapping the
//! reload roots. Rule evaluation can stall on DNS, identd, and probe
//! traffic, so it runs on the blocking pool under a configurable cap;
//! finished evaluations come back over a channel the loop selects on,
//! alongside the listeners, child exits, and the signal streams.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{Context as _, Result};
use doorman_policy::rules::GLOBAL_CLASS;
use doorman_policy::{
    ActKind, ActionCtx, ActionSet, ConnTrack, HostInfo, HostServices, IpTimeCache, MatchedRule,
    Memos, RuleSet,
};
use tokio::net::TcpStream;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::listeners::Listeners;
use crate::reloader::Reloader;
use crate::spawn;

/// Counters for the status report. Shared with the evaluation workers.
#[derive(Debug, Default)]
struct Stats {
    /// Connections that got as far as rule handling. Overflow-class
    /// connections do not count here.
    total_connects: AtomicU64,
    /// Connections actually run through the classifier.
    total_rules: AtomicU64,
    rule_time_micros: AtomicU64,
    /// Raw accepted connections, overflow included.
    total_conns: AtomicU64,
    worker_high: AtomicUsize,
}

/// A finished rule evaluation, waiting for action selection on the main
/// task.
struct Evaluated {
    stream: TcpStream,
    hi: HostInfo,
    matched: Vec<MatchedRule>,
}

pub struct Server {
    cfg: Config,
    listeners: Listeners,
    rules: Reloader<RuleSet>,
    actions: Reloader<ActionSet>,
    memos: Memos,
    conntrack: ConnTrack,
    iptimes: Arc<IpTimeCache>,
    services: Arc<dyn HostServices>,
    stats: Arc<Stats>,
    last_log: Option<String>,

    max_workers: usize,
    worker_count: Arc<AtomicUsize>,
    results_tx: mpsc::UnboundedSender<Evaluated>,
    results_rx: mpsc::UnboundedReceiver<Evaluated>,
    reap_tx: mpsc::UnboundedSender<u32>,
    reap_rx: mpsc::UnboundedReceiver<u32>,
}

fn conninfo(hi: &HostInfo, classes: &[MatchedRule]) -> String {
    if classes.is_empty() {
        format!("{} -> {}@{}", hi.ip(), hi.local_port(), hi.local_ip())
    } else {
        let names = classes
            .iter()
            .map(|m| m.class.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        format!("{}/{}", hi.ip(), names)
    }
}

/// Classifies one connection: build the host view, run the rules, keep
/// the result only if something matched. Runs on the blocking pool when
/// workers are enabled, inline otherwise.
fn evaluate_rules(
    stream: TcpStream,
    local: SocketAddrV4,
    peer: SocketAddrV4,
    roots: (Option<Arc<RuleSet>>, Option<Arc<ActionSet>>),
    services: Arc<dyn HostServices>,
    iptimes: Arc<IpTimeCache>,
    stats: &Stats,
) -> Option<Evaluated> {
    let mut hi = HostInfo::new(local, peer, services, iptimes);
    stats.total_connects.fetch_add(1, Ordering::Relaxed);

    // With either root missing nothing can ever match an action, so the
    // connection is not worth classifying.
    let (Some(rules), Some(_)) = roots else {
        tracing::debug!("a root is missing or empty, dropping {}", conninfo(&hi, &[]));
        return None;
    };

    stats.total_rules.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let matched = rules.eval(&mut hi);
    stats
        .rule_time_micros
        .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);

    if matched.is_empty() {
        tracing::debug!("nothing matched {}", conninfo(&hi, &[]));
        return None;
    }

    Some(Evaluated {
        stream,
        hi,
        matched,
    })
}

impl Server {
    pub fn new(cfg: Config, listeners: Listeners, worker_override: Option<usize>) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (reap_tx, reap_rx) = mpsc::unbounded_channel();

        let max_workers = worker_override.or(cfg.max_workers).unwrap_or(0);
        let rules = Reloader::new(cfg.rule_file.clone(), "rules", cfg.on_file_error);
        let actions = Reloader::new(cfg.action_file.clone(), "actions", cfg.on_file_error);
        let iptimes = Arc::new(IpTimeCache::new(cfg.drop_ip_after));

        Self {
            cfg,
            listeners,
            rules,
            actions,
            memos: Memos::new(),
            conntrack: ConnTrack::new(),
            iptimes,
            services: Arc::new(doorman_policy::SystemServices),
            stats: Arc::new(Stats::default()),
            last_log: None,
            max_workers,
            worker_count: Arc::new(AtomicUsize::new(0)),
            results_tx,
            results_rx,
            reap_tx,
            reap_rx,
        }
    }

    fn reload_roots(&mut self) {
        let memos = &mut self.memos;
        self.rules
            .current(|path| RuleSet::parse_file(path, memos));
        self.actions.current(ActionSet::parse_file);
    }

    pub async fn run(mut self) -> Result<()> {
        let mut usr1 =
            signal(SignalKind::user_defined1()).context("could not install SIGUSR1 handler")?;
        let mut usr2 =
            signal(SignalKind::user_defined2()).context("could not install SIGUSR2 handler")?;

        // First load now rather than on the first connection, for startup
        // feedback about broken files.
        self.reload_roots();

        let expiry_period = self.cfg.expiry_period();
        let mut last_expiry = Instant::now();

        loop {
            tokio::select! {
                (stream, peer) = self.listeners.accept() => {
                    self.reload_roots();
                    self.dispatch(stream, peer);
                }
                Some(done) = self.results_rx.recv() => {
                    self.reload_roots();
                    self.apply_action(done);
                }
                Some(pid) = self.reap_rx.recv() => {
                    tracing::debug!("reaped PID {pid}");
                    self.conntrack.down(pid);
                }
                _ = usr1.recv() => {
                    tracing::debug!("force-clearing IP times");
                    self.iptimes.clear();
                }
                _ = usr2.recv() => {
                    self.report_status();
                }
            }

            // Periodic sweeps happen on whatever wake comes next; there is
            // nothing to expire while nothing is happening.
            if let Some(period) = expiry_period
                && last_expiry.elapsed().as_secs() as i64 >= period
            {
                tracing::trace!("expiring the IP times info");
                last_expiry = Instant::now();
                self.iptimes.expire(doorman_policy::iptime::unix_now());
            }
        }
    }

    fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.stats.total_conns.fetch_add(1, Ordering::Relaxed);

        let (SocketAddr::V4(peer), Ok(SocketAddr::V4(local))) = (peer, stream.local_addr())
        else {
            tracing::debug!("could not get a v4 address pair, passing");
            return;
        };

        if self.max_workers > 0 {
            if self.worker_count.load(Ordering::Relaxed) < self.max_workers {
                self.dispatch_to_worker(stream, local, peer);
                return;
            }
            if let Some(class) = self.cfg.after_max_workers.clone() {
                tracing::debug!("too many workers, putting {} connection in {class}", peer.ip());
                let hi = HostInfo::new(local, peer, self.services.clone(), self.iptimes.clone());
                // The synthetic list still carries GLOBAL; the overflow
                // class may key actions off it.
                let matched = vec![
                    MatchedRule::synthetic(&class),
                    MatchedRule::synthetic(GLOBAL_CLASS),
                ];
                self.apply_action(Evaluated {
                    stream,
                    hi,
                    matched,
                });
                return;
            }
            tracing::debug!("too many workers, handling new socket directly");
        }

        // Workers off or over the limit with no overflow class: classify
        // inline, stalling the loop exactly like a single-threaded server.
        let roots = (self.rules.cached(), self.actions.cached());
        if let Some(done) = evaluate_rules(
            stream,
            local,
            peer,
            roots,
            self.services.clone(),
            self.iptimes.clone(),
            &self.stats,
        ) {
            self.apply_action(done);
        }
    }

    fn dispatch_to_worker(&mut self, stream: TcpStream, local: SocketAddrV4, peer: SocketAddrV4) {
        // Count up before the spawn so admission stays bounded no matter
        // how the pool schedules us.
        let admitted = self.worker_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.worker_high.fetch_max(admitted, Ordering::Relaxed);

        // Workers capture the roots at submission time; a mid-flight
        // reload does not affect an evaluation already underway.
        let roots = (self.rules.cached(), self.actions.cached());
        let services = self.services.clone();
        let iptimes = self.iptimes.clone();
        let stats = self.stats.clone();
        let worker_count = self.worker_count.clone();
        let results_tx = self.results_tx.clone();

        tokio::task::spawn_blocking(move || {
            let result = evaluate_rules(stream, local, peer, roots, services, iptimes, &stats);
            worker_count.fetch_sub(1, Ordering::Relaxed);
            if let Some(done) = result {
                // The send doubles as the wakeup for the main task; a
                // closed channel means the server is gone, which is fine.
                let _ = results_tx.send(done);
            }
        });
    }

    fn apply_action(&mut self, done: Evaluated) {
        // While rules were being evaluated the actions may have vanished.
        let Some(actions) = self.actions.cached() else {
            return;
        };

        let act = {
            let mut ctx = ActionCtx {
                conntrack: &self.conntrack,
                substitute: self.cfg.substitutions,
                last_log: &mut self.last_log,
            };
            actions.evaluate(&done.hi, &done.matched, &mut ctx)
        };
        let act = match act {
            Ok(Some(act)) => act,
            Ok(None) => {
                tracing::debug!("no actions for {}", conninfo(&done.hi, &done.matched));
                return;
            }
            Err(e) => {
                tracing::error!(
                    "error preparing action for {}: {e}",
                    conninfo(&done.hi, &done.matched)
                );
                return;
            }
        };

        for line in &act.log_msgs {
            tracing::info!("{line}");
        }

        let Some(what) = act.what else {
            tracing::debug!("dropping {}", conninfo(&done.hi, &done.matched));
            return;
        };

        match what {
            ActKind::Msg | ActKind::FailMsg => {
                // Message connections are short-lived and untracked.
                let body = act.arg.unwrap_or_default();
                tokio::spawn(spawn::send_message(done.stream, body));
            }
            ActKind::Run | ActKind::FailRun => {
                self.run_handler(done, act.argv.unwrap_or_default(), act.env);
            }
        }
    }

    fn run_handler(
        &mut self,
        done: Evaluated,
        argv: Vec<String>,
        env: std::collections::BTreeMap<String, String>,
    ) {
        let summary = conninfo(&done.hi, &done.matched);
        let stream = match done.stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("cannot detach socket for {summary}: {e}");
                return;
            }
        };
        let mut child = match spawn::spawn_handler(stream, &argv, &env) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("cannot start action for {summary}: {e}");
                return;
            }
        };
        // The pid is present until the child is awaited.
        let Some(pid) = child.id() else {
            tracing::error!("started child for {summary} but it has no pid");
            return;
        };
        tracing::debug!("started PID {pid} for {summary}: {}", argv.join(" "));

        let classes = done
            .matched
            .iter()
            .map(|m| m.class.clone())
            .collect::<Vec<_>>();
        if let Err(e) = self.conntrack.up(pid, done.hi.ip(), classes) {
            tracing::error!("cannot track {summary}: {e}");
        }

        // Reaping stays on the main task; the waiter only reports.
        let reap_tx = self.reap_tx.clone();
        tokio::spawn(async move {
            let _ = child.wait().await;
            let _ = reap_tx.send(pid);
        });
        // Our copy of the socket went into the child's stdio; nothing to
        // close here.
    }

    fn report_status(&mut self) {
        let stats = &self.stats;
        tracing::info!(
            "status: total lifetime connections: {}",
            stats.total_connects.load(Ordering::Relaxed)
        );
        if self.conntrack.is_empty() {
            tracing::info!("status: no active connections.");
        } else {
            tracing::info!("status: {} active connections:", self.conntrack.len());
            for conn in self.conntrack.connections() {
                tracing::info!("status: {conn}");
            }
        }
        tracing::info!(
            "status: per IP first/last connection times entries: {}",
            self.iptimes.len()
        );
        let workers = self.worker_count.load(Ordering::Relaxed);
        let high = stats.worker_high.load(Ordering::Relaxed);
        if workers > 0 || high > 1 {
            tracing::info!(
                "status: {workers} active rules evaluation workers ({high} highwater)."
            );
        }
        let rules = stats.total_rules.load(Ordering::Relaxed);
        let micros = stats.rule_time_micros.load(Ordering::Relaxed);
        if rules > 0 && micros > 0 {
            tracing::info!(
                "status: average rule evaluation time over {rules} evals: {:.4} seconds",
                micros as f64 / rules as f64 / 1e6
            );
        }
        tracing::info!(
            "status: {} raw connections accepted",
            stats.total_conns.load(Ordering::Relaxed)
        );
    }
}
