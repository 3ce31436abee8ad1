//! Hosts reached over SSH.
//!
//! Every operation runs a shell command on a fresh channel of one shared
//! session: `cat` to read and write, `md5sum` to hash, `grep -E` to search.
//! Remote exit statuses are mapped the same way the local backend maps
//! local ones, so assertions evaluate identically on either.

use super::auth::{self, AuthMethod, AuthPrompter, PASSWORD_PROMPT};
use super::{FileSink, Target, grep_outcome, parse_hash_output, shell_quote};
use crate::config::{HostKeyPolicy, Machine};
use crate::error::{Error, Result};
use crate::paths;
use ssh2::{
    Channel, CheckResult, KeyboardInteractivePrompt, KnownHostFileKind, Prompt, Session,
};
use std::io::{self, Cursor, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Port used when the destination does not name one
pub const DEFAULT_SSH_PORT: u16 = 22;

const KNOWN_HOSTS_PATH: &str = "~/.ssh/known_hosts";

/// Sleep between polls while a remote command has nothing to read
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Output of one remote command
struct RemoteOutput {
    status: i32,
    stdout: Vec<u8>,
    stderr: String,
}

/// SSH host as an assertion target
pub struct RemoteTarget {
    name: String,
    destination: String,
    session: Session,
    timeout: Option<Duration>,
}

impl RemoteTarget {
    /// Open and authenticate a session to `machine`.
    ///
    /// Auth methods are built (and key files read) before dialing; a key
    /// that cannot be read or parsed aborts here.
    pub fn connect(name: &str, machine: &Machine, prompter: &mut dyn AuthPrompter) -> Result<Self> {
        let methods = auth::build_methods(&machine.auth)?;
        let (host, port) = parse_destination(&machine.destination)?;
        info!("{}: connecting to {}:{} as {}", name, host, port, machine.username);

        let tcp = open_tcp(&host, port, machine.timeout())?;
        let mut session = Session::new()?;
        if let Some(timeout) = machine.timeout() {
            session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        }
        session.set_tcp_stream(tcp);
        session.handshake()?;

        verify_host_key(&session, machine, &host, port)?;
        authenticate(&session, machine, &methods, prompter)?;
        info!("{}: authenticated as {}", name, machine.username);

        Ok(Self {
            name: name.to_string(),
            destination: machine.destination.clone(),
            session,
            timeout: machine.timeout(),
        })
    }

    /// Run `command` to completion on a new channel
    fn exec(&self, command: &str) -> Result<RemoteOutput> {
        debug!("{}: remote exec {}", self.name, command);
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        // Both streams are read together: a command that fills the stderr
        // window blocks until someone reads it
        self.session.set_blocking(false);
        let drained = drain_streams(
            &mut channel.stream(0),
            &mut channel.stderr(),
            || channel.eof(),
            self.timeout,
        );
        self.session.set_blocking(true);
        let (stdout, stderr) = drained?;
        channel.wait_close()?;
        let status = channel.exit_status()?;
        debug!("{}: remote exit status {}", self.name, status);

        Ok(RemoteOutput {
            status,
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

/// Collect two non-blocking streams until both reach end of stream.
///
/// A zero-length read only counts as end of stream once `eof` reports the
/// remote side is done. `timeout` bounds how long both streams may stay idle.
fn drain_streams(
    stdout: &mut impl Read,
    stderr: &mut impl Read,
    eof: impl Fn() -> bool,
    timeout: Option<Duration>,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let (mut out_open, mut err_open) = (true, true);
    let mut buf = [0u8; 16 * 1024];
    let mut idle_since = Instant::now();

    while out_open || err_open {
        let mut progressed = false;
        if out_open {
            match read_ready(stdout, &mut buf, &mut out)? {
                Some(0) if eof() => out_open = false,
                Some(0) | None => {}
                Some(_) => progressed = true,
            }
        }
        if err_open {
            match read_ready(stderr, &mut buf, &mut err)? {
                Some(0) if eof() => err_open = false,
                Some(0) | None => {}
                Some(_) => progressed = true,
            }
        }

        if progressed {
            idle_since = Instant::now();
        } else if out_open || err_open {
            if timeout.is_some_and(|limit| idle_since.elapsed() >= limit) {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "remote command stopped responding",
                ));
            }
            thread::sleep(DRAIN_POLL);
        }
    }
    Ok((out, err))
}

/// One read that may find nothing ready (`None`)
fn read_ready(reader: &mut impl Read, buf: &mut [u8], into: &mut Vec<u8>) -> io::Result<Option<usize>> {
    match reader.read(buf) {
        Ok(n) => {
            into.extend_from_slice(&buf[..n]);
            Ok(Some(n))
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn remote_command_error(command: String, status: i32, stderr: &str) -> Error {
    Error::RemoteCommand {
        command,
        status,
        stderr: stderr.trim().to_string(),
    }
}

fn read_command(path: &str) -> String {
    format!("cat -- {}", shell_quote(path))
}

fn write_command(path: &str) -> String {
    format!("cat - > {}", shell_quote(path))
}

fn hash_command(path: &str) -> String {
    format!("md5sum -- {}", shell_quote(path))
}

fn grep_command(path: &str, pattern: &str) -> String {
    format!(
        "grep -q -E -e {} -- {}",
        shell_quote(pattern),
        shell_quote(path)
    )
}

/// `cat` exit status 1 means the file could not be opened
fn read_result(path: &str, command: String, output: RemoteOutput) -> Result<Vec<u8>> {
    match output.status {
        0 => Ok(output.stdout),
        1 => Err(Error::not_found(path)),
        status => Err(remote_command_error(command, status, &output.stderr)),
    }
}

fn hash_result(command: String, output: &RemoteOutput) -> Result<Vec<u8>> {
    if output.status != 0 {
        return Err(remote_command_error(command, output.status, &output.stderr));
    }
    parse_hash_output(&output.stdout)
}

fn grep_result(command: String, output: &RemoteOutput) -> Result<bool> {
    grep_outcome(Some(output.status))
        .ok_or_else(|| remote_command_error(command, output.status, &output.stderr))
}

/// A remote write only counts once `cat` exits cleanly
fn write_result(command: String, status: i32, stderr: &str) -> Result<()> {
    match status {
        0 => Ok(()),
        status => Err(remote_command_error(command, status, stderr)),
    }
}

impl Target for RemoteTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_for_read(&mut self, path: &str) -> Result<Box<dyn Read>> {
        let command = read_command(path);
        let output = self.exec(&command)?;
        let contents = read_result(path, command, output)?;
        Ok(Box::new(Cursor::new(contents)))
    }

    fn open_for_write(&mut self, path: &str) -> Result<Box<dyn FileSink>> {
        let command = write_command(path);
        debug!("{}: remote exec {}", self.name, command);
        let mut channel = self.session.channel_session()?;
        if let Err(err) = channel.exec(&command) {
            let _ = channel.close();
            return Err(err.into());
        }
        Ok(Box::new(ChannelSink {
            channel: Some(channel),
            command,
        }))
    }

    fn hash(&mut self, path: &str) -> Result<Vec<u8>> {
        let command = hash_command(path);
        let output = self.exec(&command)?;
        hash_result(command, &output)
    }

    fn contains_pattern(&mut self, path: &str, pattern: &str) -> Result<bool> {
        let command = grep_command(path, pattern);
        let output = self.exec(&command)?;
        grep_result(command, &output)
    }

    fn close(&mut self) -> Result<()> {
        info!("{}: disconnecting from {}", self.name, self.destination);
        self.session.disconnect(None, "machassert finished", None)?;
        Ok(())
    }
}

/// Remote `cat - > path` fed through the channel's stdin
struct ChannelSink {
    channel: Option<Channel>,
    command: String,
}

impl ChannelSink {
    fn channel(&mut self) -> io::Result<&mut Channel> {
        self.channel
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "remote writer already closed"))
    }
}

impl Write for ChannelSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.channel()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.channel()?.flush()
    }
}

impl FileSink for ChannelSink {
    fn finish(mut self: Box<Self>) -> Result<()> {
        let Some(mut channel) = self.channel.take() else {
            return Ok(());
        };
        channel.flush()?;
        channel.send_eof()?;
        channel.wait_eof()?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;
        channel.close()?;
        channel.wait_close()?;

        let status = channel.exit_status()?;
        write_result(std::mem::take(&mut self.command), status, &stderr)
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            debug!("closing unfinished remote writer for `{}`", self.command);
            let _ = channel.close();
            let _ = channel.wait_close();
        }
    }
}

/// Split `host[:port]`, defaulting the port to 22
pub fn parse_destination(destination: &str) -> Result<(String, u16)> {
    let invalid = |reason: &str| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid destination {destination:?}: {reason}"),
        ))
    };
    let destination = destination.trim();
    match destination.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
            if host.is_empty() {
                return Err(invalid("missing host"));
            }
            Ok((host.to_string(), port))
        }
        None if destination.is_empty() => Err(invalid("missing host")),
        None => Ok((destination.to_string(), DEFAULT_SSH_PORT)),
    }
}

fn open_tcp(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream> {
    let Some(timeout) = timeout else {
        return Ok(TcpStream::connect((host, port))?);
    };
    let mut last_error = None;
    for address in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&address, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_error = Some(err),
        }
    }
    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"))
        .into())
}

fn verify_host_key(session: &Session, machine: &Machine, host: &str, port: u16) -> Result<()> {
    let reject = |reason: String| Error::HostKey {
        destination: machine.destination.clone(),
        reason,
    };

    match machine.host_key {
        HostKeyPolicy::AcceptAny => {
            warn!(
                "Accepting any host key for {} (host_key = \"accept-any\")",
                machine.destination
            );
            Ok(())
        }
        HostKeyPolicy::KnownHosts => {
            let (key, _) = session
                .host_key()
                .ok_or_else(|| reject("server presented no host key".to_string()))?;
            let mut known_hosts = session.known_hosts()?;
            let file = paths::expand(KNOWN_HOSTS_PATH);
            known_hosts
                .read_file(&file, KnownHostFileKind::OpenSSH)
                .map_err(|e| reject(format!("reading {}: {}", file.display(), e)))?;

            match known_hosts.check_port(host, port, key) {
                CheckResult::Match => Ok(()),
                CheckResult::Mismatch => Err(reject(format!(
                    "host key does not match the entry in {}",
                    file.display()
                ))),
                CheckResult::NotFound => Err(reject(format!(
                    "host is not listed in {}",
                    file.display()
                ))),
                CheckResult::Failure => Err(reject("known hosts check failed".to_string())),
            }
        }
    }
}

/// Try each method in order until the server accepts one
fn authenticate(
    session: &Session,
    machine: &Machine,
    methods: &[AuthMethod],
    prompter: &mut dyn AuthPrompter,
) -> Result<()> {
    let username = machine.username.as_str();
    // libssh2 reports an error here when "none" auth already succeeded
    let advertised = match session.auth_methods(username) {
        Ok(methods) => methods.to_string(),
        Err(_) if session.authenticated() => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    for method in methods {
        if !advertised.split(',').any(|m| m == method.protocol_name()) {
            debug!("Server does not offer {}, skipping {:?}", method.protocol_name(), method);
            continue;
        }

        let attempt = match method {
            AuthMethod::Password(password) => session.userauth_password(username, password),
            AuthMethod::PasswordPrompt => {
                let password = prompter.password(PASSWORD_PROMPT)?;
                session.userauth_password(username, &password)
            }
            AuthMethod::KeyboardInteractive => {
                let mut prompts = InteractivePrompts {
                    prompter: &mut *prompter,
                    error: None,
                };
                let attempt = session.userauth_keyboard_interactive(username, &mut prompts);
                if let Some(err) = prompts.error {
                    return Err(err);
                }
                attempt
            }
            AuthMethod::PrivateKey { pem, .. } => {
                session.userauth_pubkey_memory(username, None, pem, None)
            }
        };

        match attempt {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => debug!("{:?} accepted but session not authenticated", method),
            Err(err) => debug!("{:?} rejected: {}", method, err),
        }
    }

    Err(Error::AuthenticationFailed {
        username: username.to_string(),
        destination: machine.destination.clone(),
    })
}

/// Routes keyboard-interactive challenges to an [`AuthPrompter`]
struct InteractivePrompts<'p> {
    prompter: &'p mut dyn AuthPrompter,
    error: Option<Error>,
}

impl KeyboardInteractivePrompt for InteractivePrompts<'_> {
    fn prompt<'a>(
        &mut self,
        username: &str,
        instructions: &str,
        prompts: &[Prompt<'a>],
    ) -> Vec<String> {
        if self.error.is_some() {
            return Vec::new();
        }
        let questions: Vec<String> = prompts.iter().map(|p| p.text.to_string()).collect();
        let echos: Vec<bool> = prompts.iter().map(|p| p.echo).collect();
        match self
            .prompter
            .keyboard_interactive(username, instructions, &questions, &echos)
        {
            Ok(answers) => answers,
            Err(err) => {
                self.error = Some(err);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_defaults_port() {
        assert_eq!(
            parse_destination("10.5.32.1").unwrap(),
            ("10.5.32.1".to_string(), 22)
        );
        assert_eq!(
            parse_destination("build.internal:2222").unwrap(),
            ("build.internal".to_string(), 2222)
        );
    }

    #[test]
    fn test_bad_destinations() {
        assert!(parse_destination("").is_err());
        assert!(parse_destination(":22").is_err());
        assert!(parse_destination("host:ssh").is_err());
        assert!(parse_destination("host:70000").is_err());
    }

    // =========================================================================
    // Exit status mapping
    // =========================================================================

    fn output(status: i32, stdout: &[u8], stderr: &str) -> RemoteOutput {
        RemoteOutput {
            status,
            stdout: stdout.to_vec(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_read_status_mapping() {
        let contents = read_result("/etc/motd", read_command("/etc/motd"), output(0, b"hi\n", "")).unwrap();
        assert_eq!(contents, b"hi\n");

        let err = read_result("/etc/motd", read_command("/etc/motd"), output(1, b"", "No such file")).unwrap_err();
        assert!(err.is_not_found());

        let err = read_result("/etc/motd", read_command("/etc/motd"), output(126, b"", " denied \n")).unwrap_err();
        assert!(!err.is_not_found());
        let Error::RemoteCommand { command, status, stderr } = err else {
            panic!("expected a remote command error");
        };
        assert_eq!((command.as_str(), status, stderr.as_str()), ("cat -- /etc/motd", 126, "denied"));
    }

    #[test]
    fn test_hash_status_mapping() {
        let digest = hash_result(
            hash_command("/etc/motd"),
            &output(0, b"b1946ac92492d2347c6235b4d2611184  /etc/motd\n", ""),
        )
        .unwrap();
        assert_eq!(hex::encode(digest), "b1946ac92492d2347c6235b4d2611184");

        let err = hash_result(hash_command("/nope"), &output(1, b"", "md5sum: /nope: No such file")).unwrap_err();
        assert!(matches!(err, Error::RemoteCommand { status: 1, .. }));
        assert!(!err.is_not_found());

        let err = hash_result(hash_command("/x"), &output(0, b"not-a-digest", "")).unwrap_err();
        assert!(matches!(err, Error::HashParse { .. }));
    }

    #[test]
    fn test_grep_status_mapping() {
        let command = grep_command("/etc/ssh/sshd_config", "^Port");
        assert!(grep_result(command.clone(), &output(0, b"", "")).unwrap());
        assert!(!grep_result(command.clone(), &output(1, b"", "")).unwrap());
        let err = grep_result(command, &output(2, b"", "grep: /etc/ssh/sshd_config: Permission denied")).unwrap_err();
        assert!(matches!(err, Error::RemoteCommand { status: 2, .. }));
    }

    #[test]
    fn test_write_status_mapping() {
        assert!(write_result(write_command("/etc/motd"), 0, "").is_ok());
        let err = write_result(write_command("/ro/motd"), 1, "sh: /ro/motd: Read-only file system\n").unwrap_err();
        let Error::RemoteCommand { command, stderr, .. } = err else {
            panic!("expected a remote command error");
        };
        assert_eq!(command, "cat - > /ro/motd");
        assert_eq!(stderr, "sh: /ro/motd: Read-only file system");
    }

    #[test]
    fn test_commands_end_options_before_paths() {
        assert_eq!(read_command("-rf"), "cat -- -rf");
        assert_eq!(hash_command("-n"), "md5sum -- -n");
        assert_eq!(grep_command("-v", "--help"), "grep -q -E -e --help -- -v");
        assert_eq!(read_command("~/my file"), "cat -- ~/'my file'");
    }

    // =========================================================================
    // Draining command output
    // =========================================================================

    /// Hands out scripted reads; `None` entries report WouldBlock
    struct Scripted(std::collections::VecDeque<Option<Vec<u8>>>);

    impl Scripted {
        fn new(steps: &[Option<&str>]) -> Self {
            Self(steps.iter().map(|s| s.map(|s| s.as_bytes().to_vec())).collect())
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Some(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Some(None) => Err(io::ErrorKind::WouldBlock.into()),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn test_drain_interleaves_streams() {
        // stderr keeps producing while stdout is stalled
        let noise = "e".repeat(4096);
        let noise = Some(noise.as_str());
        let mut stdout = Scripted::new(&[None, None, None, Some("done")]);
        let mut stderr = Scripted::new(&[noise, noise, noise, None]);

        let (out, err) = drain_streams(&mut stdout, &mut stderr, || true, None).unwrap();
        assert_eq!(out, b"done");
        assert_eq!(err.len(), 3 * 4096);
    }

    #[test]
    fn test_drain_waits_for_eof() {
        use std::cell::Cell;

        // Early empty reads are not end of stream until the remote side says so
        let polls = Cell::new(0);
        let mut stdout = Scripted::new(&[Some(""), Some(""), Some("late")]);
        let mut stderr = Scripted::new(&[]);
        let eof = || {
            polls.set(polls.get() + 1);
            polls.get() > 4
        };

        let (out, err) = drain_streams(&mut stdout, &mut stderr, eof, None).unwrap();
        assert_eq!(out, b"late");
        assert!(err.is_empty());
    }

    #[test]
    fn test_drain_times_out_when_idle() {
        let mut stdout = Scripted::new(&[None; 10_000]);
        let mut stderr = Scripted::new(&[None; 10_000]);
        let err = drain_streams(&mut stdout, &mut stderr, || false, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    // =========================================================================
    // Keyboard-interactive prompts
    // =========================================================================

    #[derive(Default)]
    struct ScriptedPrompter {
        calls: Vec<(String, String, Vec<String>, Vec<bool>)>,
        fail: bool,
    }

    impl AuthPrompter for ScriptedPrompter {
        fn password(&mut self, _prompt: &str) -> Result<String> {
            unreachable!("keyboard-interactive never asks for a bare password")
        }

        fn keyboard_interactive(
            &mut self,
            user: &str,
            instruction: &str,
            questions: &[String],
            echos: &[bool],
        ) -> Result<Vec<String>> {
            self.calls.push((
                user.to_string(),
                instruction.to_string(),
                questions.to_vec(),
                echos.to_vec(),
            ));
            if self.fail {
                return Err(Error::Io(io::Error::other("terminal closed")));
            }
            Ok(questions.iter().map(|q| format!("answer to {q}")).collect())
        }
    }

    fn prompt(text: &'static str, echo: bool) -> Prompt<'static> {
        Prompt {
            text: std::borrow::Cow::Borrowed(text),
            echo,
        }
    }

    #[test]
    fn test_interactive_prompts_forward_each_challenge() {
        let mut prompter = ScriptedPrompter::default();
        let mut prompts = InteractivePrompts {
            prompter: &mut prompter,
            error: None,
        };

        let answers = prompts.prompt(
            "deploy",
            "Two factor",
            &[prompt("Password: ", false), prompt("Token name: ", true)],
        );
        assert_eq!(answers, vec!["answer to Password: ", "answer to Token name: "]);
        let answers = prompts.prompt("deploy", "", &[prompt("Code: ", false)]);
        assert_eq!(answers, vec!["answer to Code: "]);
        assert!(prompts.error.is_none());

        assert_eq!(prompter.calls.len(), 2);
        let (user, instruction, questions, echos) = &prompter.calls[0];
        assert_eq!((user.as_str(), instruction.as_str()), ("deploy", "Two factor"));
        assert_eq!(questions, &["Password: ", "Token name: "]);
        assert_eq!(echos, &[false, true]);
    }

    #[test]
    fn test_interactive_prompt_error_stops_prompting() {
        let mut prompter = ScriptedPrompter {
            fail: true,
            ..Default::default()
        };
        let mut prompts = InteractivePrompts {
            prompter: &mut prompter,
            error: None,
        };

        assert!(prompts.prompt("deploy", "", &[prompt("Password: ", false)]).is_empty());
        assert!(prompts.prompt("deploy", "", &[prompt("Password: ", false)]).is_empty());
        assert!(matches!(prompts.error, Some(Error::Io(_))));
        assert_eq!(prompter.calls.len(), 1);
    }
}
