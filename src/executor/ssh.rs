// Multi-hop SSH connections over libssh2, and the SSH-backed task runner

use async_trait::async_trait;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ssh2::{Channel, Session};
use tracing::{debug, warn};

use super::auth::Authenticator;
use super::{sftp, shell, Action, Task, TaskOutcome, TaskRunner};
use crate::inventory::Host;
use crate::output::errors::{ssh_connection_suggestion, DsshError};
use crate::output::TerminalOutput;

const IDLE_WAIT: Duration = Duration::from_millis(2);

/// Authenticated sessions for every hop of a target, outermost first
///
/// Each session after the first runs over a `direct-tcpip` channel of the
/// one before it. Dropping the chain closes the sessions innermost first.
pub struct SessionChain {
    sessions: Vec<Session>,
    tunnels: Vec<Tunnel>,
    target: String,
}

impl SessionChain {
    /// Connect through `host`'s jump chain and then to `host` itself
    pub fn connect(host: &Host, auth: &Authenticator) -> Result<Self, DsshError> {
        let mut chain = SessionChain {
            sessions: Vec::new(),
            tunnels: Vec::new(),
            target: host.summary(),
        };

        // On error the partially built chain is dropped, closing what was opened
        for hop in host.connection_path() {
            let session = match chain.sessions.last() {
                None => handshake(hop, dial(hop)?)?,
                Some(previous) => {
                    let (stream, tunnel) = open_tunnel(previous, hop)?;
                    chain.tunnels.push(tunnel);
                    handshake(hop, stream)?
                }
            };
            auth.authenticate(&session, hop)?;
            debug!(hop = %hop.summary(), depth = chain.sessions.len(), "connected");
            chain.sessions.push(session);
        }

        Ok(chain)
    }

    /// Session of the target itself
    pub fn session(&self) -> &Session {
        // connect() always pushes at least the target
        &self.sessions[self.sessions.len() - 1]
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn err(&self, message: impl Into<String>) -> DsshError {
        DsshError::ssh(self.target.clone(), message)
    }

    /// Run `command` non-interactively, streaming its output to the local stdout/stderr
    pub fn exec_streaming(&self, command: &str) -> Result<i32, DsshError> {
        let session = self.session();
        let mut channel = session
            .channel_session()
            .map_err(|e| self.err(format!("Failed to open channel: {}", e)))?;

        if let Err(e) = channel.request_auth_agent_forwarding() {
            debug!(target = %self.target, "agent forwarding not available: {}", e);
        }

        channel
            .exec(command)
            .map_err(|e| self.err(format!("Failed to execute command: {}", e)))?;

        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = stdout.lock();
        let mut err = stderr.lock();

        // Set non-blocking
        session.set_blocking(false);

        let mut stdout_buf = [0u8; 4096];
        let mut stderr_buf = [0u8; 4096];
        let result = loop {
            let mut activity = false;

            match channel.read(&mut stdout_buf) {
                Ok(0) => {}
                Ok(n) => {
                    let _ = out.write_all(&stdout_buf[..n]);
                    let _ = out.flush();
                    activity = true;
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => break Err(self.err(format!("Failed to read output: {}", e))),
            }

            match channel.stderr().read(&mut stderr_buf) {
                Ok(0) => {}
                Ok(n) => {
                    let _ = err.write_all(&stderr_buf[..n]);
                    let _ = err.flush();
                    activity = true;
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => break Err(self.err(format!("Failed to read output: {}", e))),
            }

            if channel.eof() {
                break Ok(());
            }

            if !activity {
                std::thread::sleep(IDLE_WAIT);
            }
        };

        session.set_blocking(true);
        result?;

        // Whatever arrived together with EOF
        let mut rest = Vec::new();
        if channel.read_to_end(&mut rest).is_ok() {
            let _ = out.write_all(&rest);
        }
        rest.clear();
        if channel.stderr().read_to_end(&mut rest).is_ok() {
            let _ = err.write_all(&rest);
        }
        let _ = out.flush();
        let _ = err.flush();

        channel
            .wait_close()
            .map_err(|e| self.err(format!("Failed to close channel: {}", e)))?;
        channel
            .exit_status()
            .map_err(|e| self.err(format!("Failed to read exit status: {}", e)))
    }
}

impl Drop for SessionChain {
    fn drop(&mut self) {
        // A hop that failed after its tunnel was opened leaves one tunnel too many
        while !self.tunnels.is_empty() && self.tunnels.len() >= self.sessions.len() {
            drop(self.tunnels.pop());
        }

        // Innermost first: the session, then the tunnel carrying it
        while let Some(session) = self.sessions.pop() {
            session.set_blocking(true);
            let _ = session.disconnect(None, "closed by dssh", None);
            drop(session);
            drop(self.tunnels.pop());
        }
    }
}

/// TCP connection to the first hop, bounded by its timeout when set
fn dial(host: &Host) -> Result<TcpStream, DsshError> {
    let addrs: Vec<SocketAddr> = (host.address.as_str(), host.port)
        .to_socket_addrs()
        .map_err(|e| DsshError::Ssh {
            host: host.summary(),
            message: format!("Invalid address: {}", e),
            suggestion: Some("Check the host address format".to_string()),
        })?
        .collect();

    let connected = if host.timeout > 0 {
        let timeout = Duration::from_secs(host.timeout);
        let mut last = None;
        let mut stream = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last = Some(e),
            }
        }
        stream.ok_or_else(|| {
            last.unwrap_or_else(|| std::io::Error::new(ErrorKind::NotFound, "no address resolved"))
        })
    } else {
        TcpStream::connect(&addrs[..])
    };

    connected.map_err(|e| DsshError::Ssh {
        host: host.summary(),
        message: format!("Connection failed: {}", e),
        suggestion: ssh_connection_suggestion(&e),
    })
}

fn handshake<S>(host: &Host, stream: S) -> Result<Session, DsshError>
where
    S: 'static + std::os::unix::io::AsRawFd,
{
    let mut session = Session::new().map_err(|e| DsshError::Ssh {
        host: host.summary(),
        message: format!("Failed to create SSH session: {}", e),
        suggestion: None,
    })?;

    session.set_tcp_stream(stream);
    session.handshake().map_err(|e| DsshError::Ssh {
        host: host.summary(),
        message: format!("SSH handshake failed: {}", e),
        suggestion: Some("Check SSH service is running on the target".to_string()),
    })?;

    Ok(session)
}

/// Background pump between a `direct-tcpip` channel and one end of a socket pair
struct Tunnel {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Ask `via` to dial `hop` and expose the channel as a local stream
fn open_tunnel(via: &Session, hop: &Host) -> Result<(UnixStream, Tunnel), DsshError> {
    let channel = via
        .channel_direct_tcpip(&hop.address, hop.port, None)
        .map_err(|e| DsshError::Ssh {
            host: hop.summary(),
            message: format!("Jump connection failed: {}", e),
            suggestion: Some("Check the jump host can reach this address".to_string()),
        })?;

    let io_err = |e: std::io::Error| DsshError::Ssh {
        host: hop.summary(),
        message: format!("Failed to set up tunnel: {}", e),
        suggestion: None,
    };

    let (local, remote) = UnixStream::pair().map_err(io_err)?;
    remote.set_nonblocking(true).map_err(io_err)?;

    // From here on only the pump thread touches `via`
    via.set_blocking(false);

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let name = hop.summary();
    let handle = std::thread::Builder::new()
        .name(format!("tunnel {}", name))
        .spawn(move || pump(channel, remote, flag, name))
        .map_err(io_err)?;

    Ok((
        local,
        Tunnel {
            stop,
            handle: Some(handle),
        },
    ))
}

enum Flow {
    Moved,
    Idle,
    Closed,
}

/// Move bytes from `from` to `to`, keeping unwritten bytes in `pending`
fn relay(from: &mut impl Read, to: &mut impl Write, pending: &mut Vec<u8>, buf: &mut [u8]) -> Flow {
    let mut moved = false;

    if pending.is_empty() {
        match from.read(buf) {
            Ok(0) => return Flow::Closed,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                moved = true;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(_) => return Flow::Closed,
        }
    }

    if !pending.is_empty() {
        match to.write(pending) {
            Ok(n) => {
                pending.drain(..n);
                moved = true;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(_) => return Flow::Closed,
        }
    }

    if moved {
        Flow::Moved
    } else {
        Flow::Idle
    }
}

fn pump(mut channel: Channel, mut socket: UnixStream, stop: Arc<AtomicBool>, name: String) {
    let mut buf = vec![0u8; 32 * 1024];
    let mut to_socket = Vec::new();
    let mut to_channel = Vec::new();

    while !stop.load(Ordering::Relaxed) {
        let down = if channel.eof() && to_socket.is_empty() {
            Flow::Closed
        } else {
            relay(&mut channel, &mut socket, &mut to_socket, &mut buf)
        };
        let up = relay(&mut socket, &mut channel, &mut to_channel, &mut buf);

        match (down, up) {
            (Flow::Closed, _) | (_, Flow::Closed) => break,
            (Flow::Idle, Flow::Idle) => std::thread::sleep(IDLE_WAIT),
            _ => {}
        }
    }

    debug!(hop = %name, "tunnel closed");
    let _ = channel.send_eof();
    let _ = channel.close();
}

/// Runs tasks over real SSH connections
#[derive(Clone)]
pub struct SshRunner {
    auth: Authenticator,
    output: TerminalOutput,
}

impl SshRunner {
    pub fn new(auth: Authenticator, output: TerminalOutput) -> Self {
        SshRunner { auth, output }
    }
}

#[async_trait]
impl TaskRunner for SshRunner {
    async fn run(&self, task: &Task) -> Result<TaskOutcome, DsshError> {
        if task.action == Action::Shell {
            shell::open_shell(task.target.clone(), self.auth.clone()).await?;
            return Ok(TaskOutcome::Done);
        }

        // libssh2 calls block, keep them off the runtime threads
        let owned = task.clone();
        let auth = self.auth.clone();
        let output = self.output.clone();
        tokio::task::spawn_blocking(move || run_blocking(&owned, &auth, &output))
            .await
            .map_err(|e| DsshError::ssh(task.target.summary(), format!("task aborted: {}", e)))?
    }
}

fn run_blocking(
    task: &Task,
    auth: &Authenticator,
    output: &TerminalOutput,
) -> Result<TaskOutcome, DsshError> {
    let chain = SessionChain::connect(&task.target, auth)?;

    match &task.action {
        Action::Upload { local, remote } => {
            sftp::upload(&chain, local, remote, output)?;
            Ok(TaskOutcome::Done)
        }
        Action::Download { remote, local } => {
            sftp::download(&chain, remote, local, output)?;
            Ok(TaskOutcome::Done)
        }
        action => match action.remote_command() {
            Some(command) => {
                let code = chain.exec_streaming(command)?;
                if code != 0 {
                    warn!(target = %chain.target(), code, "remote exit status");
                }
                Ok(TaskOutcome::Exited(code))
            }
            None => Ok(TaskOutcome::Done),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Accepts at most `limit` bytes per write, then reports WouldBlock once
    struct Choppy {
        data: Vec<u8>,
        limit: usize,
        blocked: bool,
    }

    impl Write for Choppy {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.blocked {
                self.blocked = false;
                return Err(ErrorKind::WouldBlock.into());
            }
            self.blocked = true;
            let n = buf.len().min(self.limit);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_relay_keeps_partial_writes() {
        let mut from = Cursor::new(b"hello tunnel".to_vec());
        let mut to = Choppy {
            data: Vec::new(),
            limit: 5,
            blocked: false,
        };
        let mut pending = Vec::new();
        let mut buf = [0u8; 64];

        let mut rounds = 0;
        loop {
            match relay(&mut from, &mut to, &mut pending, &mut buf) {
                Flow::Closed => break,
                Flow::Moved | Flow::Idle => rounds += 1,
            }
            assert!(rounds < 20, "relay did not finish");
        }

        assert_eq!(to.data, b"hello tunnel");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_dial_refused_has_suggestion() {
        // Bind then drop to get a port nothing listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let host = Host::new("127.0.0.1").with_user("ops").with_port(port);

        match dial(&host) {
            Err(DsshError::Ssh { host, suggestion, .. }) => {
                assert_eq!(host, format!("ops@127.0.0.1:{}", port));
                assert!(suggestion.is_some());
            }
            other => panic!("expected connection failure, got {:?}", other.map(|_| ())),
        }
    }
}
