//! The top-level exchange with the host.
//!
//! ```text
//! AwaitStart -> SendReady -> AwaitCommand -> Dispatch -> SendResult -+-> AwaitCommand
//!     ^                                                              |
//!     +------------------------- (failure) --------------------------+-> (FINISHED) done
//! ```
//!
//! Every failure short of a dead port restarts from the top, with no limit on attempts.

use std::io::{Read, Write};

use log::{debug, info, warn};

use super::image::{receive_image, ReceivedImage};
use super::{token, wire::Link, Command};
use crate::arena::Arena;
use crate::config::PlatformConfig;
use crate::error::{Error, Result, TransportError};
use crate::target::FlashTarget;

/// Everything one flashing session owns: the link, the receive arena, and the configuration
#[derive(Debug)]
pub struct SessionContext<P> {
    pub link: Link<P>,
    pub arena: Arena,
    pub config: PlatformConfig,
    entry_point: u32,
}

#[derive(Debug)]
enum State {
    AwaitStart,
    SendReady,
    AwaitCommand,
    Dispatch(u32),
    SendResult { outcome: Result<u32>, finished: bool },
}

impl<P: Read + Write> SessionContext<P> {
    pub fn new(port: P, config: PlatformConfig) -> Self {
        Self {
            link: Link::new(port),
            arena: Arena::new(config.arena_size),
            config,
            entry_point: 0,
        }
    }

    /// Entry point reported by the last successful command
    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    /// Run the nested header-and-data exchange for one image
    pub fn receive_image(&mut self) -> Result<ReceivedImage> {
        receive_image(&mut self.link, &mut self.arena, &self.config)
    }

    pub fn send(&mut self, token: &str) -> Result<()> {
        Ok(self.link.send_token(token)?)
    }

    /// Report one finished chunk to the host
    pub fn progress(&mut self) -> Result<()> {
        self.send(token::SENDING)
    }

    /// Announce the size of an upcoming operation
    pub fn send_size(&mut self, size: u32) -> Result<()> {
        self.send(token::SIZE)?;
        Ok(self.link.send_hex_u32(size)?)
    }

    fn initial_state(&self) -> State {
        if self.config.wait_for_start {
            State::AwaitStart
        } else {
            State::SendReady
        }
    }

    /// Decide where to go after `error`: back to the top, or out of the session entirely
    fn restart(&self, error: Error) -> Result<State> {
        if error.is_fatal() {
            return Err(error);
        }
        match error {
            Error::Transport(TransportError::Timeout) => debug!("link idle, restarting"),
            e => warn!("restarting session: {e} (code {})", e.error_code()),
        }
        Ok(self.initial_state())
    }

    fn recv_command(&mut self) -> Result<u32> {
        self.link.expect_token(token::CMD)?;
        let word = self.link.recv_hex_u32()?;
        self.link.send_token(token::DONE)?;
        Ok(word)
    }

    /// Serve the host until it sends FINISHED, dispatching commands to `target`.
    ///
    /// Returns the entry point recorded by the last command. Only a failure of the port itself
    /// ends the session early.
    pub fn run<T: FlashTarget>(&mut self, target: &mut T) -> Result<u32> {
        info!("serving {:?}", target.handle());
        let mut state = self.initial_state();

        loop {
            state = match state {
                State::AwaitStart => match self.link.expect_token(token::START) {
                    Ok(()) => State::SendReady,
                    Err(e) => self.restart(e.into())?,
                },

                State::SendReady => match self.send(token::BOOTUBL) {
                    Ok(()) => State::AwaitCommand,
                    Err(e) => self.restart(e)?,
                },

                State::AwaitCommand => match self.recv_command() {
                    Ok(word) => State::Dispatch(word),
                    Err(e) => self.restart(e)?,
                },

                State::Dispatch(word) => match Command::from_word(word) {
                    Some(Command::Finished) => State::SendResult {
                        outcome: Ok(self.entry_point),
                        finished: true,
                    },
                    Some(command) => {
                        info!("executing {command:?}");
                        State::SendResult {
                            outcome: target.execute(command, self),
                            finished: false,
                        }
                    }
                    None => State::SendResult {
                        outcome: Err(Error::UnsupportedCommand(word)),
                        finished: false,
                    },
                },

                State::SendResult {
                    outcome: Ok(entry_point),
                    finished,
                } => {
                    self.entry_point = entry_point;
                    match self.send(token::DONE) {
                        Ok(()) if finished => {
                            info!("session finished, entry point {entry_point:#010x}");
                            return Ok(entry_point);
                        }
                        Ok(()) => State::AwaitCommand,
                        Err(e) => self.restart(e)?,
                    }
                }

                State::SendResult { outcome: Err(e), .. } => {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    self.send(token::FAIL)?;
                    self.restart(e)?
                }
            };
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::target::{DeviceHandle, DeviceKind, Geometry};
    use crate::testing::{HostScript, ScriptedPort};

    /// Records commands; optionally fails the first one
    struct Recorder {
        handle: DeviceHandle,
        seen: Vec<Command>,
        fail_first: bool,
    }

    impl Recorder {
        fn new(fail_first: bool) -> Self {
            Self {
                handle: DeviceHandle::new(DeviceKind::Sdmmc, Geometry::Sdmmc { blocks: 0 }),
                seen: Vec::new(),
                fail_first,
            }
        }
    }

    impl FlashTarget for Recorder {
        fn handle(&self) -> &DeviceHandle {
            &self.handle
        }

        fn execute<P: Read + Write>(
            &mut self,
            command: Command,
            ctx: &mut SessionContext<P>,
        ) -> Result<u32> {
            self.seen.push(command);
            if std::mem::take(&mut self.fail_first) {
                return Err(Error::StorageNotFound);
            }
            ctx.progress()?;
            Ok(0x8000_0000 + self.seen.len() as u32)
        }
    }

    fn session(script: Vec<u8>) -> SessionContext<ScriptedPort> {
        let mut config = PlatformConfig::default();
        config.arena_size = 0x1000;
        SessionContext::new(ScriptedPort::new(&script).hang_up_when_drained(), config)
    }

    #[test]
    fn test_finished_only() -> anyhow::Result<()> {
        let script = HostScript::new()
            .start()
            .command(Command::Finished)
            .build();
        let mut ctx = session(script);
        let mut target = Recorder::new(false);

        assert_eq!(ctx.run(&mut target)?, 0);
        assert!(target.seen.is_empty());
        assert_eq!(
            ctx.link.get_mut().fields(),
            [token::BOOTUBL, token::DONE, token::DONE]
        );
        Ok(())
    }

    #[test]
    fn test_entry_point_of_last_command() -> anyhow::Result<()> {
        let script = HostScript::new()
            .start()
            .command(Command::Erase)
            .command(Command::FlashNoUbl)
            .command(Command::Finished)
            .build();
        let mut ctx = session(script);
        let mut target = Recorder::new(false);

        assert_eq!(ctx.run(&mut target)?, 0x8000_0002);
        assert_eq!(target.seen, [Command::Erase, Command::FlashNoUbl]);
        assert_eq!(
            ctx.link.get_mut().fields(),
            [
                token::BOOTUBL,
                token::DONE,
                token::SENDING,
                token::DONE,
                token::DONE,
                token::SENDING,
                token::DONE,
                token::DONE,
                token::DONE,
            ]
        );
        Ok(())
    }

    #[test]
    fn test_failure_restarts() -> anyhow::Result<()> {
        let script = HostScript::new()
            .start()
            .command(Command::Flash)
            .start()
            .command(Command::Flash)
            .command(Command::Finished)
            .build();
        let mut ctx = session(script);
        let mut target = Recorder::new(true);

        assert_eq!(ctx.run(&mut target)?, 0x8000_0002);
        assert_eq!(
            ctx.link.get_mut().fields(),
            [
                token::BOOTUBL,
                token::DONE,
                token::FAIL,
                token::BOOTUBL,
                token::DONE,
                token::SENDING,
                token::DONE,
                token::DONE,
                token::DONE,
            ]
        );
        Ok(())
    }

    #[test]
    fn test_unknown_command() -> anyhow::Result<()> {
        let script = HostScript::new()
            .start()
            .command_word(0x1234_5678)
            .start()
            .command(Command::Finished)
            .build();
        let mut ctx = session(script);
        let mut target = Recorder::new(false);

        ctx.run(&mut target)?;
        assert!(target.seen.is_empty());
        assert_eq!(
            ctx.link.get_mut().fields(),
            [
                token::BOOTUBL,
                token::DONE,
                token::FAIL,
                token::BOOTUBL,
                token::DONE,
                token::DONE,
            ]
        );
        Ok(())
    }

    #[test]
    fn test_garbage_before_start() -> anyhow::Result<()> {
        let script = HostScript::new()
            .token("  HELLO")
            .start()
            .command(Command::Finished)
            .build();
        let mut ctx = session(script);

        ctx.run(&mut Recorder::new(false))?;
        assert_eq!(
            ctx.link.get_mut().fields(),
            [token::BOOTUBL, token::DONE, token::DONE]
        );
        Ok(())
    }

    #[test]
    fn test_hang_up_is_fatal() {
        let script = HostScript::new().start().command(Command::Erase).build();
        let mut ctx = session(script);

        let result = ctx.run(&mut Recorder::new(false));
        assert!(matches!(result, Err(e) if e.is_fatal()));
    }

    #[test]
    fn test_without_start_token() -> anyhow::Result<()> {
        let script = HostScript::new().command(Command::Finished).build();
        let mut ctx = session(script);
        ctx.config.wait_for_start = false;

        ctx.run(&mut Recorder::new(false))?;
        assert_eq!(
            ctx.link.get_mut().fields(),
            [token::BOOTUBL, token::DONE, token::DONE]
        );
        Ok(())
    }
}
