// Interactive shell: PTY, raw terminal, window title and resize relay

use std::io::{self, ErrorKind, IsTerminal, Read, Write};
use std::os::unix::io::AsFd;
use std::sync::mpsc::{Receiver, Sender};
use std::time::Duration;

use crossterm::terminal::SetTitle;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use ssh2::{Channel, PtyModeOpcode, PtyModes, Session};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::debug;

use super::auth::Authenticator;
use super::ssh::SessionChain;
use crate::inventory::Host;
use crate::output::errors::DsshError;

const TERM: &str = "xterm-256color";
const IDLE_WAIT: Duration = Duration::from_millis(5);

/// (columns, rows)
pub type TerminalSize = (u16, u16);

/// Forwards SIGWINCH as terminal sizes until dropped
pub struct ResizeListener {
    handle: JoinHandle<()>,
}

impl ResizeListener {
    pub fn spawn(sizes: Sender<TerminalSize>) -> Result<Self, DsshError> {
        let mut sigwinch = signal(SignalKind::window_change()).map_err(|e| DsshError::Io {
            message: format!("Failed to watch terminal resizes: {}", e),
            path: None,
        })?;

        let handle = tokio::spawn(async move {
            while sigwinch.recv().await.is_some() {
                if let Ok(size) = crossterm::terminal::size() {
                    debug!(cols = size.0, rows = size.1, "terminal resized");
                    if sizes.send(size).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(ResizeListener { handle })
    }
}

impl Drop for ResizeListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Restores cooked mode when dropped
struct RawMode;

impl RawMode {
    fn enable() -> Result<Self, DsshError> {
        crossterm::terminal::enable_raw_mode().map_err(|e| DsshError::Io {
            message: format!("Failed to enable raw mode: {}", e),
            path: None,
        })?;
        Ok(RawMode)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

/// Terminal window title for the duration of a session
struct WindowTitle;

impl WindowTitle {
    fn set(title: &str) -> Self {
        let _ = crossterm::execute!(std::io::stderr(), SetTitle(title));
        WindowTitle
    }
}

impl Drop for WindowTitle {
    fn drop(&mut self) {
        let _ = crossterm::execute!(std::io::stderr(), SetTitle(""));
    }
}

/// Open an interactive shell on `target`, through its jump chain
pub async fn open_shell(target: Host, auth: Authenticator) -> Result<(), DsshError> {
    let size = crossterm::terminal::size().unwrap_or((80, 24));
    let (tx, rx) = std::sync::mpsc::channel();
    let listener = ResizeListener::spawn(tx)?;

    let summary = target.summary();
    let result = tokio::task::spawn_blocking(move || interactive(&target, &auth, size, rx)).await;

    // The listener belongs to this session only
    drop(listener);

    result.map_err(|e| DsshError::ssh(summary, format!("shell aborted: {}", e)))?
}

fn interactive(
    target: &Host,
    auth: &Authenticator,
    size: TerminalSize,
    resizes: Receiver<TerminalSize>,
) -> Result<(), DsshError> {
    let chain = SessionChain::connect(target, auth)?;
    let session = chain.session();
    let err = |what: &str, e: ssh2::Error| DsshError::ssh(target.summary(), format!("{}: {}", what, e));

    let mut channel = session
        .channel_session()
        .map_err(|e| err("Failed to open channel", e))?;

    if let Err(e) = channel.request_auth_agent_forwarding() {
        debug!(target = %target.summary(), "agent forwarding not available: {}", e);
    }

    let tty = std::io::stdin().is_terminal();
    if tty {
        channel
            .request_pty(TERM, Some(pty_modes()), Some(pty_dim(size)))
            .map_err(|e| err("Failed to request PTY", e))?;
    }
    channel
        .shell()
        .map_err(|e| err("Failed to start shell", e))?;

    let _title = WindowTitle::set(&target.address);
    let _raw = if tty { Some(RawMode::enable()?) } else { None };

    relay_terminal(session, &mut channel, resizes)
        .map_err(|e| DsshError::ssh(target.summary(), format!("Shell I/O failed: {}", e)))?;

    session.set_blocking(true);
    let _ = channel.wait_close();
    Ok(())
}

fn pty_modes() -> PtyModes {
    let mut modes = PtyModes::new();
    modes.set_boolean(PtyModeOpcode::ECHO, true);
    modes.set_u32(PtyModeOpcode::TTY_OP_ISPEED, 14400);
    modes.set_u32(PtyModeOpcode::TTY_OP_OSPEED, 14400);
    modes
}

fn pty_dim((cols, rows): TerminalSize) -> (u32, u32, u32, u32) {
    (cols as u32, rows as u32, 0, 0)
}

/// The remote end of an interactive session
trait RemoteShell {
    fn read_out(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn read_err(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn send(&mut self, data: &[u8]) -> io::Result<()>;
    fn close_input(&mut self);
    fn resize(&mut self, size: TerminalSize);
    fn finished(&self) -> bool;
}

/// Local keyboard input that never blocks
trait Keyboard {
    /// `None` when nothing is waiting, `Some(0)` at end of input
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

struct ChannelShell<'a> {
    session: &'a Session,
    channel: &'a mut Channel,
}

impl ChannelShell<'_> {
    /// Run `f` with the session in blocking mode
    fn blocking<T>(&mut self, f: impl FnOnce(&mut Channel) -> T) -> T {
        self.session.set_blocking(true);
        let result = f(&mut *self.channel);
        self.session.set_blocking(false);
        result
    }
}

impl RemoteShell for ChannelShell<'_> {
    fn read_out(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.read(buf)
    }

    fn read_err(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.stderr().read(buf)
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.blocking(|channel| {
            channel.write_all(data)?;
            channel.flush()
        })
    }

    fn close_input(&mut self) {
        let _ = self.blocking(|channel| channel.send_eof());
    }

    fn resize(&mut self, size: TerminalSize) {
        let (cols, rows, _, _) = pty_dim(size);
        let _ = self.blocking(|channel| channel.request_pty_size(cols, rows, None, None));
    }

    fn finished(&self) -> bool {
        self.channel.eof()
    }
}

struct Stdin(io::Stdin);

impl Keyboard for Stdin {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut fds = [PollFd::new(self.0.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(0) | Err(nix::errno::Errno::EINTR) => Ok(None),
            Ok(_) => self.0.lock().read(buf).map(Some),
            Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
}

fn relay_terminal(
    session: &Session,
    channel: &mut Channel,
    resizes: Receiver<TerminalSize>,
) -> io::Result<()> {
    session.set_blocking(false);
    let mut remote = ChannelShell { session, channel };
    relay(
        &mut remote,
        &mut Stdin(io::stdin()),
        &mut io::stdout(),
        &mut io::stderr(),
        &resizes,
    )
}

/// Shuttle bytes both ways until the remote shell exits
///
/// Keyboard input is checked on every pass, busy remote or not.
fn relay<R, K, O, E>(
    remote: &mut R,
    keyboard: &mut K,
    out: &mut O,
    err: &mut E,
    resizes: &Receiver<TerminalSize>,
) -> io::Result<()>
where
    R: RemoteShell,
    K: Keyboard,
    O: Write,
    E: Write,
{
    let mut buf = [0u8; 8192];
    let mut input_open = true;

    loop {
        while let Ok(size) = resizes.try_recv() {
            remote.resize(size);
        }

        let mut activity = false;

        let n = nonblocking(remote.read_out(&mut buf))?;
        if n > 0 {
            out.write_all(&buf[..n])?;
            out.flush()?;
            activity = true;
        }
        let n = nonblocking(remote.read_err(&mut buf))?;
        if n > 0 {
            err.write_all(&buf[..n])?;
            err.flush()?;
            activity = true;
        }

        if remote.finished() {
            return Ok(());
        }

        if input_open {
            match keyboard.try_read(&mut buf)? {
                Some(0) => {
                    input_open = false;
                    remote.close_input();
                }
                Some(n) => {
                    remote.send(&buf[..n])?;
                    activity = true;
                }
                None => {}
            }
        }

        if !activity {
            std::thread::sleep(IDLE_WAIT);
        }
    }
}

/// Nothing to read yet counts as zero bytes
fn nonblocking(read: io::Result<usize>) -> io::Result<usize> {
    match read {
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pty_dim() {
        assert_eq!(pty_dim((120, 40)), (120, 40, 0, 0));
    }

    /// Writes a line on every read, like `yes`, until it sees Ctrl-C
    struct Chatty {
        reads: usize,
        sent: Vec<u8>,
        resized: Vec<TerminalSize>,
    }

    impl RemoteShell for Chatty {
        fn read_out(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            buf[..2].copy_from_slice(b"y\n");
            Ok(2)
        }

        fn read_err(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(ErrorKind::WouldBlock.into())
        }

        fn send(&mut self, data: &[u8]) -> io::Result<()> {
            self.sent.extend_from_slice(data);
            Ok(())
        }

        fn close_input(&mut self) {}

        fn resize(&mut self, size: TerminalSize) {
            self.resized.push(size);
        }

        fn finished(&self) -> bool {
            self.sent.contains(&0x03) || self.reads > 1000
        }
    }

    /// Hands out queued keystrokes, one poll at a time
    struct Keys(std::collections::VecDeque<Option<Vec<u8>>>);

    impl Keyboard for Keys {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            match self.0.pop_front().flatten() {
                Some(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(Some(bytes.len()))
                }
                None => Ok(None),
            }
        }
    }

    #[test]
    fn test_keystrokes_reach_a_busy_remote() {
        let mut remote = Chatty {
            reads: 0,
            sent: Vec::new(),
            resized: Vec::new(),
        };
        let mut keys = Keys(vec![None, None, Some(b"q".to_vec()), None, Some(vec![0x03])].into());
        let mut out = Vec::new();
        let mut err = Vec::new();
        let (tx, rx) = std::sync::mpsc::channel();
        tx.send((100, 30)).unwrap();

        relay(&mut remote, &mut keys, &mut out, &mut err, &rx).unwrap();

        assert_eq!(remote.sent, vec![b'q', 0x03]);
        assert!(remote.reads <= 6, "took {} reads", remote.reads);
        assert!(out.starts_with(b"y\ny\n"));
        assert!(err.is_empty());
        assert_eq!(remote.resized, vec![(100, 30)]);
    }

    #[test]
    fn test_nonblocking_read() {
        assert_eq!(nonblocking(Err(ErrorKind::WouldBlock.into())).unwrap(), 0);
        assert_eq!(nonblocking(Ok(3)).unwrap(), 3);
        assert!(nonblocking(Err(ErrorKind::BrokenPipe.into())).is_err());
    }

    #[tokio::test]
    async fn test_resize_listener_stops_on_drop() {
        let (tx, rx) = std::sync::mpsc::channel();
        let listener = ResizeListener::spawn(tx).unwrap();
        assert!(matches!(
            rx.try_recv(),
            Err(std::sync::mpsc::TryRecvError::Empty)
        ));

        drop(listener);

        // The sender goes away with the aborted task
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            rx.try_recv(),
            Err(std::sync::mpsc::TryRecvError::Disconnected)
        ));
    }
}
