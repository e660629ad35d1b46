//! Operator interaction during a calibration run.
//!
//! The sequencer only ever blocks in two places: while the output settles after a set-point
//! write, and while it waits for the operator. Both go through [`Operator`] so a run can be
//! driven from the console or from a script.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    style::{style, Print, Stylize},
    terminal,
};

use crate::error::CalError;

pub trait Operator {
    /// Shows `message` and blocks until the operator confirms.
    fn wait_for_enter(&mut self, message: &str) -> Result<(), CalError>;

    /// Asks the operator to type a reading from an external meter.
    fn read_reading(&mut self, prompt: &str) -> Result<f64, CalError>;

    /// Waits for the output to settle. The operator may abort while waiting.
    fn settle(&mut self, duration: Duration) -> Result<(), CalError>;

    /// Fails with [`CalError::OperatorAbort`] if the operator interrupted the run while it
    /// was busy talking to the instruments.
    fn check_abort(&mut self) -> Result<(), CalError> {
        Ok(())
    }
}

impl<O: Operator + ?Sized> Operator for &mut O {
    fn wait_for_enter(&mut self, message: &str) -> Result<(), CalError> {
        (**self).wait_for_enter(message)
    }

    fn read_reading(&mut self, prompt: &str) -> Result<f64, CalError> {
        (**self).read_reading(prompt)
    }

    fn settle(&mut self, duration: Duration) -> Result<(), CalError> {
        (**self).settle(duration)
    }

    fn check_abort(&mut self) -> Result<(), CalError> {
        (**self).check_abort()
    }
}

/// Interrupt request raised outside of an operator prompt, e.g. by Ctrl-C while a reading
/// is in progress.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    /// A flag raised by every SIGINT (Ctrl-C) delivered to the process.
    ///
    /// Replaces the default handler, so Ctrl-C no longer terminates the process. Only one
    /// such flag can exist per process.
    pub fn on_interrupt() -> Result<Self, ctrlc::Error> {
        let flag = AbortFlag::default();
        let handler_flag = flag.clone();
        ctrlc::set_handler(move || handler_flag.raise())?;
        Ok(flag)
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), CalError> {
        if self.is_raised() {
            Err(CalError::OperatorAbort)
        } else {
            Ok(())
        }
    }
}

fn parse_reading(text: &str) -> Result<f64, CalError> {
    let trimmed = text.trim();
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(CalError::InvalidOperatorInput(trimmed.to_string())),
    }
}

/// Keeps the terminal in raw mode for as long as it lives.
struct RawMode;

impl RawMode {
    fn enable() -> Result<Self, CalError> {
        terminal::enable_raw_mode()?;
        Ok(RawMode)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

fn is_abort(key: &KeyEvent) -> bool {
    match key.code {
        KeyCode::Esc => true,
        KeyCode::Char('c') | KeyCode::Char('d') => key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}

/// Interactive operator on the controlling terminal.
///
/// Input is read in raw mode so that Ctrl-C or Esc become [`CalError::OperatorAbort`]
/// instead of killing the process with the PSU still in calibration mode. Outside of
/// prompts a Ctrl-C arrives as a signal and is picked up through the [`AbortFlag`].
pub struct ConsoleOperator {
    out: io::Stdout,
    interrupt: AbortFlag,
}

impl ConsoleOperator {
    pub fn new() -> Self {
        Self::with_abort_flag(AbortFlag::default())
    }

    pub fn with_abort_flag(interrupt: AbortFlag) -> Self {
        Self {
            out: io::stdout(),
            interrupt,
        }
    }

    fn read_line(&mut self) -> Result<String, CalError> {
        let _raw = RawMode::enable()?;
        let mut line = String::new();

        loop {
            let key = match event::read()? {
                Event::Key(key) if key.kind != KeyEventKind::Release => key,
                _ => continue,
            };

            if is_abort(&key) {
                execute!(self.out, Print("^C\r\n"))?;
                return Err(CalError::OperatorAbort);
            }

            match key.code {
                KeyCode::Enter => {
                    execute!(self.out, Print("\r\n"))?;
                    return Ok(line);
                }
                KeyCode::Backspace => {
                    if line.pop().is_some() {
                        execute!(self.out, Print("\u{8} \u{8}"))?;
                    }
                }
                KeyCode::Char(c) => {
                    line.push(c);
                    execute!(self.out, Print(c))?;
                }
                _ => {}
            }
        }
    }
}

impl Default for ConsoleOperator {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for ConsoleOperator {
    fn wait_for_enter(&mut self, message: &str) -> Result<(), CalError> {
        self.interrupt.check()?;
        execute!(
            self.out,
            Print("\n"),
            Print(style(message).bold()),
            Print("\n"),
            Print("Press enter to continue: ")
        )?;
        self.read_line().map(|_| ())
    }

    fn read_reading(&mut self, prompt: &str) -> Result<f64, CalError> {
        self.interrupt.check()?;
        execute!(self.out, Print(style(prompt).yellow()), Print(": "))?;
        let line = self.read_line()?;
        parse_reading(&line)
    }

    fn settle(&mut self, duration: Duration) -> Result<(), CalError> {
        self.interrupt.check()?;
        let _raw = RawMode::enable()?;
        let deadline = Instant::now() + duration;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if event::poll(remaining)? {
                if let Event::Key(key) = event::read()? {
                    if is_abort(&key) {
                        execute!(self.out, Print("^C\r\n"))?;
                        return Err(CalError::OperatorAbort);
                    }
                }
            }
        }

        self.out.flush()?;
        Ok(())
    }

    fn check_abort(&mut self) -> Result<(), CalError> {
        self.interrupt.check()
    }
}

/// One scripted operator action.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Confirm a press-enter prompt.
    Confirm,
    /// Type this text at a reading prompt.
    Type(String),
    /// Cancel at the next prompt.
    Abort,
}

/// What a [`ScriptedOperator`] was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Interaction {
    Prompt(String),
    Reading(String),
    Settle(Duration),
}

/// Operator that replays canned responses and never sleeps.
///
/// Prompts beyond the end of the script are confirmed, readings beyond the end of the script
/// abort the run. Text scripted for a press-enter prompt is a broken script and panics.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    responses: VecDeque<Response>,
    history: Vec<Interaction>,
    interrupt: AbortFlag,
}

impl ScriptedOperator {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Response>,
    {
        Self {
            responses: responses.into_iter().collect(),
            history: Vec::new(),
            interrupt: AbortFlag::default(),
        }
    }

    /// Aborts at the next check once `interrupt` is raised.
    pub fn with_abort_flag(mut self, interrupt: AbortFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn history(&self) -> &[Interaction] {
        &self.history
    }

    /// Messages of every press-enter prompt shown so far.
    pub fn prompts(&self) -> Vec<&str> {
        self.history
            .iter()
            .filter_map(|interaction| match interaction {
                Interaction::Prompt(message) => Some(message.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl Operator for ScriptedOperator {
    fn wait_for_enter(&mut self, message: &str) -> Result<(), CalError> {
        self.history.push(Interaction::Prompt(message.to_string()));
        match self.responses.pop_front() {
            Some(Response::Abort) => Err(CalError::OperatorAbort),
            Some(Response::Type(text)) => panic!("script typed '{}' at prompt '{}'", text, message),
            Some(Response::Confirm) | None => Ok(()),
        }
    }

    fn read_reading(&mut self, prompt: &str) -> Result<f64, CalError> {
        self.history.push(Interaction::Reading(prompt.to_string()));
        match self.responses.pop_front() {
            Some(Response::Type(text)) => parse_reading(&text),
            Some(Response::Confirm) => Err(CalError::InvalidOperatorInput(String::new())),
            Some(Response::Abort) | None => Err(CalError::OperatorAbort),
        }
    }

    fn settle(&mut self, duration: Duration) -> Result<(), CalError> {
        self.history.push(Interaction::Settle(duration));
        Ok(())
    }

    fn check_abort(&mut self) -> Result<(), CalError> {
        self.interrupt.check()
    }
}
