//! Remote control session.
//!
//! A token protocol over two independent byte streams: commands arrive
//! on the input stream (stdin in practice), feedback tokens leave on a
//! named pipe. Tokens are space-delimited and short; `LOAD` is followed
//! by a decimal byte count and then exactly that many raw SMF bytes.
//! An unknown command is fatal, since a corrupted command stream cannot
//! be safely resumed.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;

use crossbeam::channel::Receiver;
use tracing::{debug, error, warn};

use crate::clock::Transport;
use crate::error::{Error, Result};
use crate::loader;
use crate::playback::{Notice, Player};
use crate::song::Song;

/// Maximum token length, terminator included.
pub const MAX_TOKEN_LENGTH: usize = 30;
pub const TOKEN_SEPARATOR: u8 = b' ';

const FEEDBACK_BARNUM: &str = "BAR_NUMBER";
const FEEDBACK_LINENUM: &str = "LINE_NUMBER";
const FEEDBACK_SONGEND: &str = "SONG_END";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Load,
    Play,
    PlayBar,
    PlayBars,
    Stop,
    PauseOn,
    PauseOff,
    LoopOn,
    LoopOff,
    TransportOn,
    TransportOff,
    IntroLength,
    Finish,
}

impl Command {
    fn parse(token: &str) -> Option<Command> {
        match token {
            "LOAD" => Some(Command::Load),
            "PLAY" => Some(Command::Play),
            "PLAY_BAR" => Some(Command::PlayBar),
            "PLAY_BARS" => Some(Command::PlayBars),
            "STOP" => Some(Command::Stop),
            "PAUSE_ON" => Some(Command::PauseOn),
            "PAUSE_OFF" => Some(Command::PauseOff),
            "LOOP_ON" => Some(Command::LoopOn),
            "LOOP_OFF" => Some(Command::LoopOff),
            "TRANSPORT_ON" => Some(Command::TransportOn),
            "TRANSPORT_OFF" => Some(Command::TransportOff),
            "INTRO_LENGTH" => Some(Command::IntroLength),
            "FINISH" => Some(Command::Finish),
            _ => None,
        }
    }
}

/// One remote-control session over a command stream.
pub struct Session<R: Read> {
    input: R,
    player: Player,
    transport: Arc<dyn Transport + Send + Sync>,
    pub(crate) source: Option<Song>,
}

impl<R: Read> Session<R> {
    pub fn new(input: R, player: Player, transport: Arc<dyn Transport + Send + Sync>) -> Self {
        Self {
            input,
            player,
            transport,
            source: None,
        }
    }

    /// Drive the command loop until FINISH or a fatal protocol error.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let token = next_token(&mut self.input)?;
            let Some(command) = Command::parse(&token) else {
                return Err(Error::Protocol(format!("unknown command '{}'", token)));
            };
            debug!(?command, "remote command");
            if !self.dispatch(command)? {
                return Ok(());
            }
        }
    }

    /// Returns `false` when the session is finished.
    fn dispatch(&mut self, command: Command) -> Result<bool> {
        let player = self.player.clone();
        match command {
            Command::Load => self.load()?,
            Command::Play => player.play(self.source()?, &*self.transport)?,
            Command::PlayBar => {
                let bar = self.number_arg()?;
                player.play_from_bar(self.source()?, bar, &*self.transport)?;
            }
            Command::PlayBars => {
                let start = self.number_arg()?;
                let end = self.number_arg()?;
                player.play_bars(self.source()?, start, end, &*self.transport)?;
            }
            Command::Stop => player.stop(&*self.transport),
            Command::PauseOn => player.pause(true, &*self.transport),
            Command::PauseOff => player.pause(false, &*self.transport),
            Command::LoopOn => player.set_looping(true),
            Command::LoopOff => player.set_looping(false),
            Command::TransportOn => player.set_follow_transport(true),
            Command::TransportOff => player.set_follow_transport(false),
            Command::IntroLength => {
                let bars = self.number_arg()?;
                debug!("intro length = {}", bars);
                player.set_intro_bars(bars);
            }
            Command::Finish => return Ok(false),
        }
        Ok(true)
    }

    fn load(&mut self) -> Result<()> {
        let count = self.number_arg()? as usize;
        debug!("MIDI data length = {}", count);
        let mut data = vec![0u8; count];
        self.input.read_exact(&mut data).map_err(|e| {
            Error::Load(format!("expected {} bytes of MIDI data: {}", count, e))
        })?;
        debug!("MIDI data {} bytes read", count);
        self.source = Some(loader::load_bytes(&data)?);
        Ok(())
    }

    fn number_arg(&mut self) -> Result<u32> {
        let token = next_token(&mut self.input)?;
        token
            .parse()
            .map_err(|_| Error::Protocol(format!("expected a number, got '{}'", token)))
    }

    fn source(&self) -> Result<&Song> {
        self.source
            .as_ref()
            .ok_or_else(|| Error::Protocol("no document loaded".into()))
    }
}

/// Read one space-delimited token.
fn next_token<R: Read>(input: &mut R) -> Result<String> {
    let mut token = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match input.read_exact(&mut byte) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                if token.is_empty() {
                    return Err(Error::Protocol("command stream closed".into()));
                }
                break;
            }
            Err(e) => return Err(e.into()),
        }
        if byte[0] == TOKEN_SEPARATOR {
            break;
        }
        token.push(byte[0]);
        if token.len() >= MAX_TOKEN_LENGTH - 1 {
            break;
        }
    }
    String::from_utf8(token).map_err(|_| Error::Protocol("token is not valid UTF-8".into()))
}

/// Drain notices from the real-time path onto the feedback stream.
///
/// Runs on its own thread; returns when every notice sender is gone.
/// Feedback tokens are flushed immediately. A write failure is fatal to
/// playback: it arms the shutdown drain, like any other broken pipe on
/// the control surface.
pub fn forward_notices<W: Write>(player: &Player, notices: &Receiver<Notice>, mut out: W) {
    for notice in notices.iter() {
        let result = match notice {
            Notice::BarNumber(n) => send_number(&mut out, FEEDBACK_BARNUM, n),
            Notice::LineNumber(n) => send_number(&mut out, FEEDBACK_LINENUM, n),
            Notice::SongEnd => send_token(&mut out, FEEDBACK_SONGEND),
            Notice::Warn(message) => {
                warn!("{}", message);
                Ok(())
            }
        };
        if let Err(e) = result {
            error!("failed to send feedback token: {}", e);
            player.request_abort();
            return;
        }
    }
}

fn send_token<W: Write>(out: &mut W, token: &str) -> io::Result<()> {
    write!(out, "{}{}", token, TOKEN_SEPARATOR as char)?;
    out.flush()
}

fn send_number<W: Write>(out: &mut W, token: &str, number: u32) -> io::Result<()> {
    send_token(out, token)?;
    send_token(out, &number.to_string())
}
