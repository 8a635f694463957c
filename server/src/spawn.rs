//! Process mangling: privilege drop, rlimits, message children, and the
//! fork-exec handoff for `run` actions.

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use nix::sys::resource::{Resource, getrlimit, setrlimit};
use nix::unistd::{User, getgid, getuid, initgroups, setgid, setuid};
use tokio::io::AsyncWriteExt as _;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

/// How long a message child may take before it is abandoned.
const MESSAGE_DEADLINE: Duration = Duration::from_secs(2);

/// Drops privileges to `user`. Must run after the sockets are bound.
///
/// The order matters: setuid comes last, and setgid before initgroups
/// because initgroups only sets the supplementary groups. The result is
/// verified because a partial drop is worse than a refusal to start.
pub fn drop_privileges(user: &str) -> Result<()> {
    let info = User::from_name(user)
        .context("user lookup failed")?
        .with_context(|| format!("unknown user {user}"))?;

    setgid(info.gid).context("setgid failed")?;
    let username = std::ffi::CString::new(user).context("bad user name")?;
    initgroups(&username, info.gid).context("initgroups failed")?;
    setuid(info.uid).context("setuid failed")?;

    if getuid() != info.uid || getgid() != info.gid {
        bail!("after dropping privileges, UID or GID was not that of {user}");
    }

    Ok(())
}

/// The `-S` stack-size setting, in KiB or unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackLimit {
    KiB(u64),
    Unlimited,
}

impl std::str::FromStr for StackLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "unlimited" {
            return Ok(StackLimit::Unlimited);
        }
        let kib = s
            .parse::<u64>()
            .with_context(|| format!("bad stack limit '{s}'"))?;

        Ok(StackLimit::KiB(kib))
    }
}

/// Sets the soft stack rlimit, preserving the hard limit.
pub fn set_stack_limit(limit: StackLimit) -> Result<()> {
    let (_, hard) = getrlimit(Resource::RLIMIT_STACK).context("getrlimit failed")?;
    let soft = match limit {
        StackLimit::KiB(kib) => kib * 1024,
        StackLimit::Unlimited => nix::sys::resource::RLIM_INFINITY,
    };
    setrlimit(Resource::RLIMIT_STACK, soft, hard).context("setrlimit failed")?;

    Ok(())
}

/// Writes a `msg`/`failmsg` body to the peer and closes the connection.
///
/// A trailing `\r\n` is supplied unless the text already ends in `\r` or
/// `\n`; the whole exchange is bounded by a two-second deadline, after
/// which the connection is abandoned. Errors are the peer's problem.
pub async fn send_message(mut stream: TcpStream, mut text: String) {
    if !text.ends_with(['\r', '\n']) {
        text.push_str("\r\n");
    }

    let write = async {
        stream.write_all(text.as_bytes()).await?;
        stream.flush().await?;
        stream.shutdown().await
    };
    match tokio::time::timeout(MESSAGE_DEADLINE, write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("message write failed: {e}"),
        Err(_) => tracing::debug!("message write timed out"),
    }
}

/// Spawns a handler program with the connection as its stdio.
///
/// The child gets the socket as descriptors 0 through 2 and inherits our
/// environment overlaid with the action's additions; every other
/// descriptor is close-on-exec and vanishes across the exec.
pub fn spawn_handler(
    stream: std::net::TcpStream,
    argv: &[String],
    env: &BTreeMap<String, String>,
) -> Result<Child> {
    let (program, args) = argv.split_first().context("empty handler command")?;

    // The socket came out of the reactor nonblocking; the handler expects
    // ordinary blocking stdio.
    stream
        .set_nonblocking(false)
        .context("could not restore blocking mode")?;
    let stdin = stream.try_clone().context("could not dup socket")?;
    let stdout = stream.try_clone().context("could not dup socket")?;

    Command::new(program)
        .args(args)
        .envs(env)
        .stdin(Stdio::from(OwnedFd::from(stdin)))
        .stdout(Stdio::from(OwnedFd::from(stdout)))
        .stderr(Stdio::from(OwnedFd::from(stream)))
        .spawn()
        .with_context(|| format!("could not start {program}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use std::net::TcpListener;
    use tokio::io::AsyncReadExt as _;

    fn socket_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        (TcpStream::from_std(server).unwrap(), client)
    }

    #[tokio::test]
    async fn messages_gain_a_line_ending() {
        let (server, mut client) = socket_pair();
        send_message(server, "go away".to_owned()).await;

        let mut got = String::new();
        client.read_to_string(&mut got).unwrap();
        assert_eq!(got, "go away\r\n");
    }

    #[tokio::test]
    async fn messages_with_endings_pass_through() {
        let (server, mut client) = socket_pair();
        send_message(server, "bye\n".to_owned()).await;

        let mut got = String::new();
        client.read_to_string(&mut got).unwrap();
        assert_eq!(got, "bye\n");
    }

    #[tokio::test]
    async fn handlers_get_the_socket_as_stdio() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client =
            TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().unwrap();

        let argv = vec!["/bin/sh".to_owned(), "-c".to_owned(), "echo $GREETING".to_owned()];
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_owned(), "hi from child".to_owned());
        let mut child = spawn_handler(server, &argv, &env).unwrap();

        let mut got = String::new();
        client.read_to_string(&mut got).await.unwrap();
        assert_eq!(got, "hi from child\n");
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn missing_programs_error_at_spawn() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let argv = vec!["/no/such/program".to_owned()];
        assert!(spawn_handler(server, &argv, &BTreeMap::new()).is_err());
    }

    #[test]
    fn stack_limits_parse() {
        assert_eq!("unlimited".parse::<StackLimit>().unwrap(), StackLimit::Unlimited);
        assert_eq!("8192".parse::<StackLimit>().unwrap(), StackLimit::KiB(8192));
        assert!("lots".parse::<StackLimit>().is_err());
    }
}
