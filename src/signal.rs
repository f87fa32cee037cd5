//! Signal handling: handlers set a flag and poke a self-pipe, the event
//! loop reads the pipe through the same multiplexer as the protocol
//! socket and acts on the flags between iterations.

use std::io::{self, Read};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_io::Async;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::{flag, low_level::pipe};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Signal {
    /// TERM, HUP or INT: release, unconfigure and exit.
    Exit,
    /// USR1 (and INFO where the platform has it): log a status dump.
    Dump,
    /// USR2: refresh interface indices and reopen the log file.
    Reload,
}

pub struct Signals {
    pipe: Async<UnixStream>,
    exit: Arc<AtomicBool>,
    dump: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl Signals {
    pub fn new() -> io::Result<Self> {
        let (tx, rx) = UnixStream::pair()?;
        tx.set_nonblocking(true)?;

        let exit = Arc::new(AtomicBool::new(false));
        let dump = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));

        for sig in [SIGTERM, SIGHUP, SIGINT] {
            flag::register(sig, exit.clone())?;
            pipe::register(sig, tx.try_clone()?)?;
        }

        flag::register(SIGUSR1, dump.clone())?;
        pipe::register(SIGUSR1, tx.try_clone()?)?;

        flag::register(SIGUSR2, reload.clone())?;
        pipe::register(SIGUSR2, tx.try_clone()?)?;

        #[cfg(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        {
            flag::register(signal_hook::consts::SIGINFO, dump.clone())?;
            pipe::register(signal_hook::consts::SIGINFO, tx.try_clone()?)?;
        }

        Ok(Self {
            pipe: Async::new(rx)?,
            exit,
            dump,
            reload,
        })
    }

    /// Resolves once at least one signal has been delivered since the
    /// last drain.
    pub async fn wait(&mut self) -> io::Result<()> {
        let mut buf = [0; 16];

        self.pipe.read_with(|mut s| s.read(&mut buf)).await?;

        Ok(())
    }

    /// The most urgent pending signal, if any. Call repeatedly to drain.
    pub fn take(&mut self) -> Option<Signal> {
        if self.exit.swap(false, Ordering::SeqCst) {
            Some(Signal::Exit)
        } else if self.reload.swap(false, Ordering::SeqCst) {
            Some(Signal::Reload)
        } else if self.dump.swap(false, Ordering::SeqCst) {
            Some(Signal::Dump)
        } else {
            None
        }
    }
}
