//! # Bench Simulator
//!
//! In-process stand-ins for a DP832 and a Keithley 2000. Each one keeps the internal state
//! of the simulated instrument and processes the same SCPI text the drivers send, returning
//! the replies the real hardware would give. Both implement [`ScpiLink`], so the real
//! drivers run unchanged on top of them.
//!
//! The two instruments share a [`Probe`]: whatever the simulated supply drives into its
//! output is what the simulated meter reads.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::rc::Rc;

use log::debug;

use crate::{error::CalError, scpi::ScpiLink};

// Custom error types for command processing.
#[derive(Debug, PartialEq)]
pub enum CommandError {
    /// The command line is blank.
    Empty,
    /// No command with this header exists on the instrument.
    UnknownHeader(String),
    /// A parameter the command needs is absent.
    MissingParameter,
    /// A parameter could not be parsed.
    InvalidParameter(String),
    /// Calibration command for a channel that has not been unlocked.
    Locked(u8),
    /// `CALibration:Start` with the wrong unlock code.
    WrongCode(String),
    /// `CALibration:MEAS` that does not answer the last `CALibration:Set` of the channel.
    UnmatchedMeasure(u8),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Empty => write!(f, "empty command"),
            CommandError::UnknownHeader(header) => write!(f, "undefined header '{}'", header),
            CommandError::MissingParameter => write!(f, "missing parameter"),
            CommandError::InvalidParameter(param) => write!(f, "invalid parameter '{}'", param),
            CommandError::Locked(channel) => write!(f, "calibration of CH{} is locked", channel),
            CommandError::WrongCode(code) => write!(f, "wrong calibration code '{}'", code),
            CommandError::UnmatchedMeasure(channel) => {
                write!(f, "measurement for CH{} does not match the last set point", channel)
            }
        }
    }
}

impl std::error::Error for CommandError {}

fn into_link_error(err: CommandError) -> CalError {
    CalError::InstrumentCommunication(io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))
}

/// What is currently present at the simulated supply's terminals.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ProbeReading {
    pub volts: f64,
    pub amps: f64,
}

/// Connection between the simulated supply's output and the simulated meter's inputs.
#[derive(Debug, Default, Clone)]
pub struct Probe(Rc<RefCell<ProbeReading>>);

impl Probe {
    pub fn get(&self) -> ProbeReading {
        *self.0.borrow()
    }

    fn set(&self, reading: ProbeReading) {
        *self.0.borrow_mut() = reading;
    }
}

/// Matches one SCPI header node against its `LONGform` spelling, accepting the uppercase
/// short form or the full word in any case.
fn node_matches(node: &str, pattern: &str) -> bool {
    let short: String = pattern.chars().filter(|c| c.is_ascii_uppercase() || *c == '*' || *c == '?').collect();
    node.eq_ignore_ascii_case(&short) || node.eq_ignore_ascii_case(pattern)
}

/// Matches a full `a:b:c` header against a pattern such as `CALibration:MEASure`.
fn header_matches(header: &str, pattern: &str) -> bool {
    let nodes: Vec<&str> = header.trim_start_matches(':').split(':').collect();
    let expected: Vec<&str> = pattern.split(':').collect();
    nodes.len() == expected.len() && nodes.iter().zip(expected).all(|(node, p)| node_matches(node, p))
}

fn split_command(command_str: &str) -> Result<(&str, Vec<&str>), CommandError> {
    let command = command_str.trim();
    if command.is_empty() {
        return Err(CommandError::Empty);
    }
    let (header, params) = match command.split_once(char::is_whitespace) {
        Some((header, params)) => (header, params.split(',').map(str::trim).collect()),
        None => (command, Vec::new()),
    };
    Ok((header, params))
}

fn param<'a>(params: &[&'a str], index: usize) -> Result<&'a str, CommandError> {
    params.get(index).copied().ok_or(CommandError::MissingParameter)
}

/// Parses `CH<n>` into a zero-based output index.
fn parse_channel(text: &str) -> Result<usize, CommandError> {
    let number = text
        .get(..2)
        .filter(|prefix| prefix.eq_ignore_ascii_case("CH"))
        .and_then(|_| text[2..].parse::<usize>().ok())
        .ok_or_else(|| CommandError::InvalidParameter(text.to_string()))?;
    match number {
        1..=3 => Ok(number - 1),
        _ => Err(CommandError::InvalidParameter(text.to_string())),
    }
}

/// Parses a number that may carry a `V` or `A` unit suffix.
fn parse_value(text: &str) -> Result<f64, CommandError> {
    text.trim_end_matches(|c: char| c.eq_ignore_ascii_case(&'V') || c.eq_ignore_ascii_case(&'A'))
        .parse::<f64>()
        .map_err(|_| CommandError::InvalidParameter(text.to_string()))
}

fn parse_switch(text: &str) -> Result<bool, CommandError> {
    match text.to_ascii_uppercase().as_str() {
        "ON" | "1" => Ok(true),
        "OFF" | "0" => Ok(false),
        _ => Err(CommandError::InvalidParameter(text.to_string())),
    }
}

// Represents the state of a single DP832 output.
#[derive(Debug, Clone, PartialEq)]
pub struct SimOutput {
    pub enabled: bool,
    pub current_limit: f64,
    // The last calibration point driven on this output.
    pub driven: Option<(char, f64)>,
}

impl Default for SimOutput {
    fn default() -> Self {
        Self {
            enabled: false,
            current_limit: 3.2,
            driven: None,
        }
    }
}

/// One row written to a simulated calibration table.
#[derive(Debug, Clone, PartialEq)]
pub struct CalPoint {
    // 'V' or 'C'
    pub ident: char,
    pub step: usize,
    // 1 for DAC rows, 0 for ADC rows.
    pub index: u8,
    pub set: f64,
    pub measured: Option<f64>,
}

// Calibration state of one channel.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChannelCalibration {
    pub unlocked: bool,
    pub cleared: bool,
    pub points: Vec<CalPoint>,
    // Date string of the last `CALibration:End`.
    pub committed: Option<String>,
}

/// Simulated Rigol DP832.
#[derive(Debug, Clone)]
pub struct SimulatedDp832 {
    idn: String,
    pub outputs: [SimOutput; 3],
    calibration: [ChannelCalibration; 3],
    // Relative error of the uncalibrated output stage, e.g. 0.001 for +0.1 %.
    gain_error: f64,
    probe: Probe,
    history: Vec<String>,
}

impl SimulatedDp832 {
    pub fn new(probe: Probe) -> Self {
        Self::with_model("DP832", probe)
    }

    /// A supply reporting `model` in its identity string.
    pub fn with_model(model: &str, probe: Probe) -> Self {
        Self {
            idn: format!("RIGOL TECHNOLOGIES,{},DP8SIM000001,00.01.16", model),
            outputs: Default::default(),
            calibration: Default::default(),
            gain_error: 0.001,
            probe,
            history: Vec::new(),
        }
    }

    pub fn with_gain_error(mut self, gain_error: f64) -> Self {
        self.gain_error = gain_error;
        self
    }

    /// Every command received so far, in order.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Calibration state of channel `number` (1 to 3).
    pub fn calibration(&self, number: u8) -> Option<&ChannelCalibration> {
        self.calibration.get((number as usize).checked_sub(1)?)
    }

    /// Processes a command string and returns the appropriate response.
    pub fn process_command(&mut self, command_str: &str) -> Result<Option<String>, CommandError> {
        self.history.push(command_str.trim().to_string());
        let (header, params) = split_command(command_str)?;

        if header_matches(header, "*IDN?") {
            return Ok(Some(self.idn.clone()));
        }
        if header_matches(header, "*RST") {
            self.reset();
            return Ok(None);
        }
        if header_matches(header, "OUTPut") || header_matches(header, "OUTPut:STATe") {
            let channel = parse_channel(param(&params, 0)?)?;
            let enabled = parse_switch(param(&params, 1)?)?;
            self.outputs[channel].enabled = enabled;
            self.update_probe(channel);
            return Ok(None);
        }
        if let Some(channel) = source_current_channel(header) {
            let amps = parse_value(param(&params, 0)?)?;
            self.outputs[channel?].current_limit = amps;
            return Ok(None);
        }
        if header_matches(header, "CALibration:STARt") {
            return self.handle_cal_start(&params).map(|_| None);
        }
        if header_matches(header, "CALibration:CLEar") {
            let channel = self.unlocked_channel(param(&params, 0)?)?;
            let calibration = &mut self.calibration[channel];
            calibration.points.clear();
            calibration.cleared = true;
            return Ok(None);
        }
        if header_matches(header, "CALibration:SET") {
            return self.handle_cal_set(&params).map(|_| None);
        }
        if header_matches(header, "CALibration:MEASure") {
            return self.handle_cal_measure(&params).map(|_| None);
        }
        if header_matches(header, "CALibration:END") {
            let date = param(&params, 0)?.to_string();
            let channel = self.unlocked_channel(param(&params, 1)?)?;
            let calibration = &mut self.calibration[channel];
            calibration.committed = Some(date);
            calibration.cleared = false;
            calibration.unlocked = false;
            return Ok(None);
        }

        Err(CommandError::UnknownHeader(header.to_string()))
    }

    // Reset switches every output off but keeps calibration mode.
    fn reset(&mut self) {
        for output in self.outputs.iter_mut() {
            *output = SimOutput::default();
        }
        self.probe.set(ProbeReading::default());
    }

    fn unlocked_channel(&self, text: &str) -> Result<usize, CommandError> {
        let channel = parse_channel(text)?;
        if self.calibration[channel].unlocked {
            Ok(channel)
        } else {
            Err(CommandError::Locked(channel as u8 + 1))
        }
    }

    fn handle_cal_start(&mut self, params: &[&str]) -> Result<(), CommandError> {
        let code = param(params, 0)?;
        let channel = parse_channel(param(params, 1)?)?;
        if code != "11111" {
            return Err(CommandError::WrongCode(code.to_string()));
        }
        self.calibration[channel].unlocked = true;
        Ok(())
    }

    /// Parses the `CH<n>,<V|C>,<step>,<value>,<index>` parameters shared by Set and MEAS.
    fn parse_point(&self, params: &[&str]) -> Result<(usize, CalPoint), CommandError> {
        let channel = self.unlocked_channel(param(params, 0)?)?;
        let ident = match param(params, 1)?.to_ascii_uppercase().as_str() {
            "V" => 'V',
            "C" => 'C',
            other => return Err(CommandError::InvalidParameter(other.to_string())),
        };
        let step_text = param(params, 2)?;
        let step = step_text
            .parse::<usize>()
            .map_err(|_| CommandError::InvalidParameter(step_text.to_string()))?;
        let value = parse_value(param(params, 3)?)?;
        let index = match param(params, 4)? {
            "0" => 0,
            "1" => 1,
            other => return Err(CommandError::InvalidParameter(other.to_string())),
        };
        Ok((
            channel,
            CalPoint {
                ident,
                step,
                index,
                set: value,
                measured: None,
            },
        ))
    }

    fn handle_cal_set(&mut self, params: &[&str]) -> Result<(), CommandError> {
        let (channel, point) = self.parse_point(params)?;
        self.outputs[channel].driven = Some((point.ident, point.set));
        self.calibration[channel].points.push(point);
        self.update_probe(channel);
        Ok(())
    }

    fn handle_cal_measure(&mut self, params: &[&str]) -> Result<(), CommandError> {
        let (channel, reported) = self.parse_point(params)?;
        let pending = self.calibration[channel]
            .points
            .last_mut()
            .filter(|point| {
                point.measured.is_none()
                    && point.ident == reported.ident
                    && point.step == reported.step
                    && point.index == reported.index
            })
            .ok_or(CommandError::UnmatchedMeasure(channel as u8 + 1))?;
        pending.measured = Some(reported.set);
        Ok(())
    }

    fn update_probe(&mut self, channel: usize) {
        let output = &self.outputs[channel];
        let reading = match (output.enabled, output.driven) {
            (true, Some(('V', volts))) => ProbeReading {
                volts: volts * (1.0 + self.gain_error),
                amps: 0.0,
            },
            (true, Some((_, amps))) => ProbeReading {
                volts: 0.0,
                amps: amps * (1.0 + self.gain_error),
            },
            _ => ProbeReading::default(),
        };
        debug!("simulated CH{} output {:?}", channel + 1, reading);
        self.probe.set(reading);
    }
}

/// Recognises `SOURce<n>:CURRent`, returning the zero-based channel.
fn source_current_channel(header: &str) -> Option<Result<usize, CommandError>> {
    let (source, rest) = header.trim_start_matches(':').split_once(':')?;
    if !header_matches(rest, "CURRent") && !header_matches(rest, "CURRent:LEVel") {
        return None;
    }
    let digits_at = source.find(|c: char| c.is_ascii_digit()).unwrap_or(source.len());
    let (node, number) = source.split_at(digits_at);
    if !node_matches(node, "SOURce") {
        return None;
    }
    Some(parse_channel(&format!("CH{}", if number.is_empty() { "1" } else { number })))
}

impl ScpiLink for SimulatedDp832 {
    fn send(&mut self, command: &str) -> Result<(), CalError> {
        self.process_command(command).map(|_| ()).map_err(into_link_error)
    }

    fn query(&mut self, command: &str) -> Result<String, CalError> {
        match self.process_command(command).map_err(into_link_error)? {
            Some(reply) => Ok(reply),
            None => Err(io::Error::from(io::ErrorKind::TimedOut).into()),
        }
    }
}

/// Reply of a Keithley 2000 whose input is beyond the selected range.
pub const OVERFLOW_READING: &str = "+9.9E37";

/// Simulated Keithley 2000 DMM.
#[derive(Debug, Clone)]
pub struct SimulatedKeithley {
    pub measuring_current: bool,
    pub auto_range: bool,
    pub nplc: f64,
    pub filter_count: u32,
    pub filter_repeat: bool,
    pub filter_enabled: bool,
    // Highest current the 3 A range still reads, overrange included.
    pub current_range_limit: f64,
    probe: Probe,
    history: Vec<String>,
}

impl SimulatedKeithley {
    pub fn new(probe: Probe) -> Self {
        Self {
            measuring_current: false,
            auto_range: true,
            nplc: 10.0,
            filter_count: 10,
            filter_repeat: false,
            filter_enabled: false,
            current_range_limit: 3.1,
            probe,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Processes a command string and returns the appropriate response.
    pub fn process_command(&mut self, command_str: &str) -> Result<Option<String>, CommandError> {
        self.history.push(command_str.trim().to_string());
        let (header, params) = split_command(command_str)?;

        if header_matches(header, "*IDN?") {
            return Ok(Some(String::from("KEITHLEY INSTRUMENTS INC.,MODEL 2000,0000001,A20 /A02")));
        }
        if header_matches(header, "*RST") {
            *self = Self {
                current_range_limit: self.current_range_limit,
                history: std::mem::take(&mut self.history),
                ..Self::new(self.probe.clone())
            };
            return Ok(None);
        }
        if header_matches(header, "READ?") {
            return Ok(Some(self.reading()));
        }
        if header_matches(header, "SENSe:FUNCtion") {
            let function = param(&params, 0)?.trim_matches(|c| c == '\'' || c == '"');
            self.measuring_current = match function.to_ascii_uppercase().as_str() {
                "VOLT:DC" | "VOLTAGE:DC" => false,
                "CURR:DC" | "CURRENT:DC" => true,
                other => return Err(CommandError::InvalidParameter(other.to_string())),
            };
            return Ok(None);
        }

        // :SENS:<function>:<setting>
        let nodes: Vec<&str> = header.trim_start_matches(':').splitn(4, ':').collect();
        if let [sense, _kind, _dc, setting] = nodes.as_slice() {
            if node_matches(sense, "SENSe") {
                let value = param(&params, 0)?;
                if header_matches(setting, "RANGe:AUTO") {
                    self.auto_range = parse_switch(value)?;
                } else if header_matches(setting, "NPLCycles") {
                    self.nplc = parse_value(value)?;
                } else if header_matches(setting, "AVERage:COUNt") {
                    self.filter_count = value
                        .parse()
                        .map_err(|_| CommandError::InvalidParameter(value.to_string()))?;
                } else if header_matches(setting, "AVERage:TCONtrol") {
                    self.filter_repeat = node_matches(value, "REPeat");
                } else if header_matches(setting, "AVERage:STATe") {
                    self.filter_enabled = parse_switch(value)?;
                } else {
                    return Err(CommandError::UnknownHeader(header.to_string()));
                }
                return Ok(None);
            }
        }

        Err(CommandError::UnknownHeader(header.to_string()))
    }

    fn reading(&self) -> String {
        let probe = self.probe.get();
        if self.measuring_current {
            if probe.amps.abs() > self.current_range_limit {
                return String::from(OVERFLOW_READING);
            }
            format!("{:+.7E}", probe.amps)
        } else {
            format!("{:+.7E}", probe.volts)
        }
    }
}

impl ScpiLink for SimulatedKeithley {
    fn send(&mut self, command: &str) -> Result<(), CalError> {
        self.process_command(command).map(|_| ()).map_err(into_link_error)
    }

    fn query(&mut self, command: &str) -> Result<String, CalError> {
        match self.process_command(command).map_err(into_link_error)? {
            Some(reply) => Ok(reply),
            None => Err(io::Error::from(io::ErrorKind::TimedOut).into()),
        }
    }
}

/// A simulated DP832 wired to a simulated Keithley 2000.
pub fn bench() -> (SimulatedDp832, SimulatedKeithley) {
    let probe = Probe::default();
    (SimulatedDp832::new(probe.clone()), SimulatedKeithley::new(probe))
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Tests for parsing ---

    #[test]
    fn header_matching_accepts_short_and_long_forms() {
        assert!(header_matches("CALibration:Set", "CALibration:SET"));
        assert!(header_matches("CAL:MEAS", "CALibration:MEASure"));
        assert!(header_matches(":calibration:measure", "CALibration:MEASure"));
        assert!(!header_matches("CALI:MEAS", "CALibration:MEASure"));
        assert!(header_matches("*IDN?", "*IDN?"));
    }

    #[test]
    fn identity_query() {
        let (mut psu, _) = bench();
        let response = psu.process_command("*IDN?").unwrap();
        assert_eq!(response, Some(String::from("RIGOL TECHNOLOGIES,DP832,DP8SIM000001,00.01.16")));
    }

    #[test]
    fn reject_unknown_and_empty_commands() {
        let (mut psu, _) = bench();
        assert_eq!(psu.process_command("  ").unwrap_err(), CommandError::Empty);
        assert!(matches!(psu.process_command(":VOLT 5"), Err(CommandError::UnknownHeader(_))));
    }

    // --- Tests for the calibration protocol ---

    #[test]
    fn calibration_requires_unlock_code() {
        let (mut psu, _) = bench();
        assert_eq!(
            psu.process_command("CALibration:Clear CH1,ALL").unwrap_err(),
            CommandError::Locked(1)
        );
        assert_eq!(
            psu.process_command("CALibration:Start 12345,CH1").unwrap_err(),
            CommandError::WrongCode(String::from("12345"))
        );
        psu.process_command("CALibration:Start 11111,CH1").unwrap();
        psu.process_command("CALibration:Clear CH1,ALL").unwrap();
        assert!(psu.calibration(1).unwrap().cleared);
        assert!(!psu.calibration(2).unwrap().unlocked);
    }

    #[test]
    fn set_drives_probe_only_when_output_enabled() {
        let (psu, dmm) = bench();
        let mut psu = psu.with_gain_error(0.01);
        psu.process_command("CALibration:Start 11111,CH2").unwrap();
        psu.process_command("CALibration:Set CH2,V,1,10V,1").unwrap();
        assert_eq!(dmm.probe.get(), ProbeReading::default());

        psu.process_command(":OUTP CH2,ON").unwrap();
        assert!((dmm.probe.get().volts - 10.1).abs() < 1e-9);

        psu.process_command("*RST").unwrap();
        assert_eq!(dmm.probe.get(), ProbeReading::default());
        assert!(psu.calibration(2).unwrap().unlocked);
    }

    #[test]
    fn measure_must_answer_last_set() {
        let (mut psu, _) = bench();
        psu.process_command("CALibration:Start 11111,CH3").unwrap();
        psu.process_command("CALibration:Set CH3,C,0,0.1A,0").unwrap();
        assert_eq!(
            psu.process_command("CALibration:MEAS CH3,C,1,0.1A,0").unwrap_err(),
            CommandError::UnmatchedMeasure(3)
        );
        psu.process_command("CALibration:MEAS CH3,C,0,0.1002A,0").unwrap();
        assert_eq!(
            psu.process_command("CALibration:MEAS CH3,C,0,0.1002A,0").unwrap_err(),
            CommandError::UnmatchedMeasure(3)
        );
        let point = &psu.calibration(3).unwrap().points[0];
        assert_eq!(point.measured, Some(0.1002));
        assert_eq!(point.index, 0);
    }

    #[test]
    fn end_commits_and_locks() {
        let (mut psu, _) = bench();
        psu.process_command("CALibration:Start 11111,CH1").unwrap();
        psu.process_command("CALibration:End 2024-05-17,CH1").unwrap();
        let calibration = psu.calibration(1).unwrap();
        assert_eq!(calibration.committed.as_deref(), Some("2024-05-17"));
        assert!(!calibration.unlocked);
    }

    #[test]
    fn source_current_sets_limit() {
        let (mut psu, _) = bench();
        psu.process_command(":SOUR3:CURR 0.1").unwrap();
        assert_eq!(psu.outputs[2].current_limit, 0.1);
        assert!(psu.process_command(":SOUR4:CURR 0.1").is_err());
    }

    // --- Tests for the meter ---

    #[test]
    fn meter_reads_probe_in_selected_function() {
        let (_, mut dmm) = bench();
        dmm.probe.set(ProbeReading { volts: 5.0, amps: 1.5 });
        assert_eq!(dmm.process_command(":READ?").unwrap(), Some(String::from("+5.0000000E0")));
        dmm.process_command(":SENS:FUNC 'CURR:DC'").unwrap();
        assert_eq!(dmm.process_command(":READ?").unwrap(), Some(String::from("+1.5000000E0")));
    }

    #[test]
    fn meter_overflows_beyond_current_range() {
        let (_, mut dmm) = bench();
        dmm.process_command(":SENS:FUNC 'CURR:DC'").unwrap();
        dmm.probe.set(ProbeReading { volts: 0.0, amps: 3.2 });
        assert_eq!(dmm.process_command(":READ?").unwrap(), Some(String::from(OVERFLOW_READING)));
    }

    #[test]
    fn meter_settings_and_reset() {
        let (_, mut dmm) = bench();
        dmm.process_command(":SENS:CURR:DC:NPLC 1").unwrap();
        dmm.process_command(":SENS:CURR:DC:AVER:TCON REP").unwrap();
        dmm.process_command(":SENS:CURR:DC:AVER:STAT ON").unwrap();
        assert_eq!(dmm.nplc, 1.0);
        assert!(dmm.filter_repeat);
        assert!(dmm.filter_enabled);
        dmm.process_command("*RST").unwrap();
        assert!(!dmm.filter_enabled);
        assert_eq!(dmm.history().len(), 4);
    }
}
