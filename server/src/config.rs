//! The daemon configuration file.
//!
//! Line-oriented with continuation lines and `#` comments; every directive
//! takes exactly one argument. Only `listen` may repeat. Existence of the
//! referenced files and users is not checked here.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use doorman_policy::contread;
use doorman_policy::util::{duration_secs, parse_host_port};

/// What a reload does when the new file fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileErrorPolicy {
    /// Drop the old root; connections are silently closed until a good
    /// file appears.
    Drop,
    /// Keep serving with the previous root.
    #[default]
    UseOld,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Bind addresses; a `None` host is the IPv4 wildcard.
    pub listen: Vec<(Option<Ipv4Addr>, u16)>,
    pub rule_file: PathBuf,
    pub action_file: PathBuf,
    pub user: Option<String>,
    /// IPTimeCache retention in seconds.
    pub drop_ip_after: Option<i64>,
    /// Expiry cadence in seconds; zero is every wake, negative disables.
    pub expire_every: Option<i64>,
    pub max_workers: Option<usize>,
    pub after_max_workers: Option<String>,
    pub on_file_error: FileErrorPolicy,
    pub substitutions: bool,
}

impl Config {
    pub fn parse_file(path: &Path) -> Result<Self> {
        let lines = contread::logical_lines_from_file(path)
            .with_context(|| format!("cannot read {}", path.display()))?;

        let mut cfg = Config {
            substitutions: true,
            ..Config::default()
        };
        let mut seen: Vec<String> = Vec::new();
        for line in lines {
            cfg.parse_line(&line.text, &mut seen).with_context(|| {
                format!("error parsing {} line {}", path.display(), line.lineno)
            })?;
        }
        cfg.ensure_complete()
            .with_context(|| format!("incomplete configuration in {}", path.display()))?;

        Ok(cfg)
    }

    fn parse_line(&mut self, line: &str, seen: &mut Vec<String>) -> Result<()> {
        let mut words = line.split_whitespace();
        let (Some(directive), Some(arg), None) = (words.next(), words.next(), words.next())
        else {
            bail!("badly formatted line");
        };

        // Every directive except listen can only be given once.
        if directive != "listen" {
            if seen.iter().any(|s| s == directive) {
                bail!("can only give one {directive} directive");
            }
            seen.push(directive.to_owned());
        }

        match directive {
            "rulefile" => self.rule_file = PathBuf::from(arg),
            "actionfile" => self.action_file = PathBuf::from(arg),
            "user" => self.user = Some(arg.to_owned()),
            "aftermaxthreads" => self.after_max_workers = Some(arg.to_owned()),
            "dropipafter" => {
                self.drop_ip_after =
                    Some(duration_secs(arg).with_context(|| format!("bad dropipafter `{arg}`"))?);
            }
            "expireevery" => {
                self.expire_every =
                    Some(duration_secs(arg).with_context(|| format!("bad expireevery `{arg}`"))?);
            }
            "maxthreads" => {
                self.max_workers = Some(
                    arg.parse::<usize>()
                        .with_context(|| format!("bad maxthreads `{arg}`"))?,
                );
            }
            "listen" => {
                let Some((host, port)) = parse_host_port(arg) else {
                    bail!("bad argument to listen");
                };
                let Some(port) = port else {
                    bail!("listen requires a port");
                };
                self.listen.push((host, port));
            }
            "onfileerror" => {
                self.on_file_error = match arg {
                    "drop" => FileErrorPolicy::Drop,
                    "use-old" => FileErrorPolicy::UseOld,
                    _ => bail!("unknown option for onfileerror"),
                };
            }
            "substitutions" => {
                self.substitutions = match arg {
                    "on" => true,
                    "off" => false,
                    _ => bail!("substitutions must be off or on"),
                };
            }
            _ => bail!("unknown config file directive {directive}"),
        }

        Ok(())
    }

    /// A complete configuration has at least one listen plus both file
    /// directives. `dropipafter` with expiry turned off makes no sense.
    fn ensure_complete(&self) -> Result<()> {
        if self.listen.is_empty() {
            bail!("no listen directives specified");
        }
        if self.rule_file.as_os_str().is_empty() {
            bail!("no rulefile directive given");
        }
        if self.action_file.as_os_str().is_empty() {
            bail!("no actionfile directive given");
        }
        if self.drop_ip_after.is_some() && self.expire_every.is_some_and(|e| e < 0) {
            bail!("dropipafter conflicts with an expireevery that turns expiry processing off");
        }

        Ok(())
    }

    /// The expiry cadence in effect: `None` when expiry is off entirely.
    pub fn expiry_period(&self) -> Option<i64> {
        self.drop_ip_after?;
        let period = self.expire_every.unwrap_or(60);
        if period < 0 {
            return None;
        }

        Some(period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn parse(text: &str) -> Result<Config> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();

        Config::parse_file(file.path())
    }

    const MINIMAL: &str = "listen 2525\nrulefile /tmp/r\nactionfile /tmp/a\n";

    #[test]
    fn minimal_config_loads() {
        let cfg = parse(MINIMAL).unwrap();

        assert_eq!(cfg.listen, vec![(None, 2525)]);
        assert_eq!(cfg.rule_file, PathBuf::from("/tmp/r"));
        assert_eq!(cfg.action_file, PathBuf::from("/tmp/a"));
        assert!(cfg.substitutions);
        assert_eq!(cfg.on_file_error, FileErrorPolicy::UseOld);
        assert_eq!(cfg.expiry_period(), None);
    }

    #[test]
    fn listen_may_repeat_and_take_hosts() {
        let cfg = parse(
            "listen 25@127.0.0.1\nlisten 2525@*\nlisten 26\nrulefile r\nactionfile a\n",
        )
        .unwrap();

        assert_eq!(
            cfg.listen,
            vec![
                (Some("127.0.0.1".parse().unwrap()), 25),
                (None, 2525),
                (None, 26),
            ]
        );
    }

    #[test]
    fn all_directives_parse() {
        let cfg = parse(
            "listen 25\nrulefile r\nactionfile a\nuser nobody\ndropipafter 1h\n\
             expireevery 5m\nmaxthreads 16\naftermaxthreads overflow\n\
             onfileerror drop\nsubstitutions off\n",
        )
        .unwrap();

        assert_eq!(cfg.user.as_deref(), Some("nobody"));
        assert_eq!(cfg.drop_ip_after, Some(3600));
        assert_eq!(cfg.expire_every, Some(300));
        assert_eq!(cfg.expiry_period(), Some(300));
        assert_eq!(cfg.max_workers, Some(16));
        assert_eq!(cfg.after_max_workers.as_deref(), Some("overflow"));
        assert_eq!(cfg.on_file_error, FileErrorPolicy::Drop);
        assert!(!cfg.substitutions);
    }

    #[test]
    fn repeated_singleton_directives_error() {
        assert!(parse(&format!("{MINIMAL}user a\nuser b\n")).is_err());
    }

    #[test]
    fn incomplete_configs_error() {
        assert!(parse("rulefile r\nactionfile a\n").is_err());
        assert!(parse("listen 25\nactionfile a\n").is_err());
        assert!(parse("listen 25\nrulefile r\n").is_err());
    }

    #[test]
    fn dropipafter_with_disabled_expiry_errors() {
        assert!(parse(&format!("{MINIMAL}dropipafter 1h\nexpireevery -1s\n")).is_err());
        // Disabled expiry alone is fine.
        assert!(parse(&format!("{MINIMAL}expireevery -1s\n")).is_ok());
    }

    #[test]
    fn expiry_defaults_to_a_minute_with_retention_set() {
        let cfg = parse(&format!("{MINIMAL}dropipafter 1h\n")).unwrap();

        assert_eq!(cfg.expiry_period(), Some(60));
    }

    #[test]
    fn bad_lines_error() {
        assert!(parse(&format!("{MINIMAL}frobnicate on\n")).is_err());
        assert!(parse(&format!("{MINIMAL}listen nope\n")).is_err());
        assert!(parse(&format!("{MINIMAL}listen 127.0.0.1\n")).is_err());
        assert!(parse(&format!("{MINIMAL}dropipafter 5w\n")).is_err());
        assert!(parse(&format!("{MINIMAL}maxthreads many\n")).is_err());
        assert!(parse(&format!("{MINIMAL}onfileerror sometimes\n")).is_err());
        assert!(parse(&format!("{MINIMAL}user\n")).is_err());
        assert!(parse(&format!("{MINIMAL}user a b\n")).is_err());
    }
}
