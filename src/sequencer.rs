//! The calibration procedure.
//!
//! For every requested channel the sequencer runs four passes in a fixed order: DAC-V, ADC-V,
//! DAC-I, ADC-I. Each point of a pass is written to the PSU, left to settle, measured with
//! the reference DMM (or read by the operator from a second meter) and written back.
//!
//! Any failure resets the PSU before the error is returned. The PSU has already wiped the
//! channel's calibration tables by then, so it must be restarted (or the run repeated) to get
//! usable calibration data back.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use log::{error, info, warn};

use crate::{
    catalog::{CalibrationCatalog, Quantity},
    command::{format_g, CalCommand},
    error::CalError,
    instrument::{Channel, MeasurementFunction, Multimeter, PowerSupply},
    operator::Operator,
};

/// Models whose calibration protocol and point tables are known.
pub const SUPPORTED_MODELS: [&str; 2] = ["DP832", "DP832A"];

/// Highest current any DP832 channel is calibrated at.
pub const MAX_RATED_CURRENT: f64 = 3.2;

/// Current limit applied while the operator swaps meters back.
pub const SAFE_CURRENT_LIMIT: f64 = 0.1;

pub const DEFAULT_SETTLE_TIME: Duration = Duration::from_secs(2);

/// Default manual entry threshold, high enough that the DMM measures every point itself.
pub const DEFAULT_MANUAL_CURRENT_LIMIT: f64 = 10.0;

/// Caller supplied DMM configuration, run at the start of each voltage and current phase.
pub type DmmSetup<M> = Box<dyn FnMut(&mut M, MeasurementFunction) -> Result<(), CalError>>;

/// Settings of one calibration run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Currents above this are beyond the DMM's range and must be read by the operator.
    pub manual_current_limit: f64,
    /// Time the output is given to settle before each measurement.
    pub settle_time: Duration,
}

impl RunConfig {
    fn needs_alternative_dmm(&self) -> bool {
        self.manual_current_limit < MAX_RATED_CURRENT
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            manual_current_limit: DEFAULT_MANUAL_CURRENT_LIMIT,
            settle_time: DEFAULT_SETTLE_TIME,
        }
    }
}

/// Error of `measured` relative to the calibration point, in percent.
///
/// A zero point has no meaningful relative error and reports 0.
pub fn percent_error(point: f64, measured: f64) -> f64 {
    if point != 0.0 {
        ((point - measured) / point).abs() * 100.0
    } else {
        0.0
    }
}

/// Outcome of a single calibration point.
#[derive(Debug, Clone, PartialEq)]
pub struct PointResult {
    pub channel: Channel,
    pub quantity: Quantity,
    pub step: usize,
    pub point: f64,
    pub measured: f64,
    pub error_pct: f64,
    // Typed in by the operator rather than read from the DMM.
    pub manual: bool,
}

fn signed(value: f64, precision: usize) -> String {
    let text = format_g(value, precision);
    if text.starts_with('-') {
        text
    } else {
        format!("+{}", text)
    }
}

impl fmt::Display for PointResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = self.quantity.unit();
        write!(
            f,
            "{:>5} {:>2} :  Point:{:>6}{} - DMM:{:>12}{} - Err:{:>4}%",
            self.quantity.label(),
            self.step,
            signed(self.point, 4),
            unit,
            signed(self.measured, 8),
            unit,
            format_g(self.error_pct, 6)
        )
    }
}

/// Everything measured for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReport {
    pub channel: Channel,
    pub points: Vec<PointResult>,
    pub committed: bool,
}

impl ChannelReport {
    pub fn results(&self, quantity: Quantity) -> impl Iterator<Item = &PointResult> + '_ {
        self.points.iter().filter(move |result| result.quantity == quantity)
    }

    /// Largest percent error seen in a pass.
    pub fn worst_error(&self, quantity: Quantity) -> Option<f64> {
        self.results(quantity).map(|result| result.error_pct).reduce(f64::max)
    }
}

/// Resets the PSU when dropped unless disarmed, so every early return and unwind leaves the
/// outputs off.
struct ResetOnFailure<'a, P: PowerSupply> {
    psu: &'a mut P,
    armed: bool,
}

impl<'a, P: PowerSupply> ResetOnFailure<'a, P> {
    fn new(psu: &'a mut P) -> Self {
        Self { psu, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<P: PowerSupply> Deref for ResetOnFailure<'_, P> {
    type Target = P;

    fn deref(&self) -> &P {
        self.psu
    }
}

impl<P: PowerSupply> DerefMut for ResetOnFailure<'_, P> {
    fn deref_mut(&mut self) -> &mut P {
        self.psu
    }
}

impl<P: PowerSupply> Drop for ResetOnFailure<'_, P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Resetting power supply, all outputs off");
        if let Err(err) = self.psu.reset() {
            error!("Power supply reset failed: {}", err);
        }
    }
}

/// Drives a DP832 and a reference DMM through the calibration procedure.
pub struct Calibrator<P, M, O> {
    psu: P,
    dmm: M,
    operator: O,
    catalog: CalibrationCatalog,
    config: RunConfig,
    dmm_setup: Option<DmmSetup<M>>,
}

impl<P, M, O> Calibrator<P, M, O>
where
    P: PowerSupply,
    M: Multimeter,
    O: Operator,
{
    pub fn new(psu: P, dmm: M, operator: O, catalog: CalibrationCatalog) -> Self {
        Self {
            psu,
            dmm,
            operator,
            catalog,
            config: RunConfig::default(),
            dmm_setup: None,
        }
    }

    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default DMM configuration (function plus auto-range).
    pub fn with_dmm_setup<F>(mut self, setup: F) -> Self
    where
        F: FnMut(&mut M, MeasurementFunction) -> Result<(), CalError> + 'static,
    {
        self.dmm_setup = Some(Box::new(setup));
        self
    }

    pub fn psu(&self) -> &P {
        &self.psu
    }

    pub fn dmm(&self) -> &M {
        &self.dmm
    }

    pub fn operator(&self) -> &O {
        &self.operator
    }

    pub fn into_parts(self) -> (P, M, O) {
        (self.psu, self.dmm, self.operator)
    }

    /// Calibrates `channels` in order, committing each one dated today when `commit` is set.
    ///
    /// Without `commit` the PSU's calibration tables for the channels stay cleared until it is
    /// power cycled.
    pub fn calibrate(&mut self, channels: &[Channel], commit: bool) -> Result<Vec<ChannelReport>, CalError> {
        let today = Local::now().date_naive();
        self.calibrate_on(channels, commit, today)
    }

    /// Same as [`calibrate`](Self::calibrate) with an explicit calibration date.
    pub fn calibrate_on(
        &mut self,
        channels: &[Channel],
        commit: bool,
        date: NaiveDate,
    ) -> Result<Vec<ChannelReport>, CalError> {
        let model = &self.psu.identity().model;
        if !SUPPORTED_MODELS.contains(&model.as_str()) {
            return Err(CalError::UnsupportedInstrument(model.clone()));
        }

        let mut run = Run {
            psu: ResetOnFailure::new(&mut self.psu),
            dmm: &mut self.dmm,
            operator: &mut self.operator,
            catalog: &self.catalog,
            config: &self.config,
            dmm_setup: &mut self.dmm_setup,
            date,
        };

        let reports = run.execute(channels, commit)?;
        run.psu.disarm();
        Ok(reports)
    }
}

/// Borrowed state of a calibration in progress.
struct Run<'a, P: PowerSupply, M, O> {
    psu: ResetOnFailure<'a, P>,
    dmm: &'a mut M,
    operator: &'a mut O,
    catalog: &'a CalibrationCatalog,
    config: &'a RunConfig,
    dmm_setup: &'a mut Option<DmmSetup<M>>,
    // Shared by every channel committed in this run.
    date: NaiveDate,
}

impl<P, M, O> Run<'_, P, M, O>
where
    P: PowerSupply,
    M: Multimeter,
    O: Operator,
{
    fn execute(&mut self, channels: &[Channel], commit: bool) -> Result<Vec<ChannelReport>, CalError> {
        info!("Calibrating: {}", self.psu.identity());
        info!("With: {}", self.dmm.identity());

        if self.config.needs_alternative_dmm() {
            warn!(
                "Currents greater than {:.1} A will require alternative DMM and manual entry",
                self.config.manual_current_limit
            );
        }
        if !commit {
            warn!("Calibration will not be saved, the PSU must be restarted afterwards to restore its calibration");
        }

        let mut reports = Vec::with_capacity(channels.len());
        for &channel in channels {
            reports.push(self.calibrate_channel(channel, commit)?);
        }
        Ok(reports)
    }

    fn calibrate_channel(&mut self, channel: Channel, commit: bool) -> Result<ChannelReport, CalError> {
        let n = channel.number();
        info!("CALIBRATING CHANNEL {} ...", n);
        let mut points = Vec::new();

        // Voltage
        self.operator
            .wait_for_enter(&format!("Connect the DMM VOLTAGE inputs to the PSU channel {}", n))?;
        self.setup_dmm(MeasurementFunction::DcVolts)?;

        self.send(CalCommand::Start(channel))?;
        self.send(CalCommand::Clear(channel))?;
        self.psu.reset()?;

        self.psu.set_output_enabled(channel, true)?;
        points.extend(self.run_subsequence(Quantity::DacVoltage, channel)?);
        points.extend(self.run_subsequence(Quantity::AdcVoltage, channel)?);
        self.psu.set_output_enabled(channel, false)?;

        // Current
        self.operator
            .wait_for_enter(&format!("Connect the DMM 10A CURRENT inputs to the PSU channel {}", n))?;
        self.setup_dmm(MeasurementFunction::DcCurrent)?;

        self.psu.set_output_enabled(channel, true)?;
        points.extend(self.run_subsequence(Quantity::DacCurrent, channel)?);

        if self.config.needs_alternative_dmm() {
            self.psu.set_current_limit(channel, SAFE_CURRENT_LIMIT)?;
            self.operator
                .wait_for_enter(&format!("Reconnect original DMM CURRENT inputs to PSU channel {}", n))?;
        }

        points.extend(self.run_subsequence(Quantity::AdcCurrent, channel)?);
        self.psu.set_output_enabled(channel, false)?;

        if commit {
            info!("Updating calibration data for channel {}", n);
            self.send(CalCommand::End(self.date, channel))?;
        }

        info!("Channel {} finished", n);
        Ok(ChannelReport {
            channel,
            points,
            committed: commit,
        })
    }

    /// Runs one pass over the catalog points of `quantity`.
    ///
    /// Once a current point exceeds the manual entry threshold, every remaining point of the
    /// pass is read by the operator, even ones back below the threshold.
    fn run_subsequence(&mut self, quantity: Quantity, channel: Channel) -> Result<Vec<PointResult>, CalError> {
        info!("Running {} for channel {}", quantity.label(), channel.number());
        let catalog = self.catalog;
        let points = catalog.points(channel, quantity);
        let mut results = Vec::with_capacity(points.len());
        let mut manual = false;

        for (position, &point) in points.iter().enumerate() {
            let step = quantity.step(position);

            if quantity.is_current() && point > self.config.manual_current_limit && !manual {
                manual = true;
                warn!("CURRENT BEYOND DMM LIMIT, MANUAL INPUT REQUIRED");
                self.operator.wait_for_enter(&format!(
                    "Connect alternative DMM 10A CURRENT inputs to PSU channel {}",
                    channel.number()
                ))?;
            }

            self.send(CalCommand::Set {
                channel,
                quantity,
                step,
                value: point,
            })?;

            self.operator.settle(self.config.settle_time)?;
            let measured = if manual {
                self.operator.read_reading("Enter DMM reading")?
            } else {
                let reading = self.dmm.read()?;
                self.operator.check_abort()?;
                reading
            };

            self.send(CalCommand::Measure {
                channel,
                quantity,
                step,
                value: measured,
            })?;

            let result = PointResult {
                channel,
                quantity,
                step,
                point,
                measured,
                error_pct: percent_error(point, measured),
                manual,
            };
            info!("{}", result);
            results.push(result);
        }

        Ok(results)
    }

    fn setup_dmm(&mut self, function: MeasurementFunction) -> Result<(), CalError> {
        match self.dmm_setup.as_mut() {
            Some(setup) => setup(&mut *self.dmm, function),
            None => {
                self.dmm.set_function(function)?;
                self.dmm.set_auto_range(true)
            }
        }
    }

    // Every calibration write is a point where an interrupt takes effect.
    fn send(&mut self, command: CalCommand) -> Result<(), CalError> {
        self.operator.check_abort()?;
        self.psu.write_raw(&command.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::Identity;
    use crate::operator::{Interaction, Response, ScriptedOperator};

    #[derive(Default)]
    struct RecordingPsu {
        identity: Identity,
        log: Vec<String>,
    }

    impl RecordingPsu {
        fn model(model: &str) -> Self {
            Self {
                identity: Identity {
                    model: model.to_string(),
                    ..Default::default()
                },
                log: Vec::new(),
            }
        }
    }

    impl PowerSupply for RecordingPsu {
        fn identity(&self) -> &Identity {
            &self.identity
        }

        fn write_raw(&mut self, command: &str) -> Result<(), CalError> {
            self.log.push(command.to_string());
            Ok(())
        }

        fn reset(&mut self) -> Result<(), CalError> {
            self.log.push(String::from("reset"));
            Ok(())
        }

        fn set_output_enabled(&mut self, channel: Channel, enabled: bool) -> Result<(), CalError> {
            self.log.push(format!("output {} {}", channel, enabled));
            Ok(())
        }

        fn set_current_limit(&mut self, channel: Channel, amps: f64) -> Result<(), CalError> {
            self.log.push(format!("limit {} {}", channel, amps));
            Ok(())
        }
    }

    /// Returns the same reading every time.
    #[derive(Default)]
    struct ConstantDmm {
        identity: Identity,
        reading: f64,
        functions: Vec<MeasurementFunction>,
        fail_reads: bool,
    }

    impl Multimeter for ConstantDmm {
        fn identity(&self) -> &Identity {
            &self.identity
        }

        fn set_function(&mut self, function: MeasurementFunction) -> Result<(), CalError> {
            self.functions.push(function);
            Ok(())
        }

        fn set_auto_range(&mut self, _enabled: bool) -> Result<(), CalError> {
            Ok(())
        }

        fn reset(&mut self) -> Result<(), CalError> {
            Ok(())
        }

        fn read(&mut self) -> Result<f64, CalError> {
            if self.fail_reads {
                return Err(std::io::Error::from(std::io::ErrorKind::TimedOut).into());
            }
            Ok(self.reading)
        }
    }

    fn ch(n: u8) -> Channel {
        Channel::new(n).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 17).unwrap()
    }

    #[test]
    fn percent_error_is_relative_to_the_point() {
        assert!((percent_error(2.0, 1.98) - 1.0).abs() < 1e-9);
        assert!((percent_error(0.5, 0.51) - 2.0).abs() < 1e-9);
        assert_eq!(percent_error(0.0, 0.013), 0.0);
    }

    #[test]
    fn unsupported_model_sends_nothing() {
        let mut calibrator = Calibrator::new(
            RecordingPsu::model("DP831"),
            ConstantDmm::default(),
            ScriptedOperator::default(),
            CalibrationCatalog::dp832(),
        );
        let result = calibrator.calibrate_on(&[ch(1)], true, date());
        assert!(matches!(result, Err(CalError::UnsupportedInstrument(ref m)) if m == "DP831"));
        assert!(calibrator.psu().log.is_empty());
        assert!(calibrator.operator().history().is_empty());
    }

    #[test]
    fn dp832a_is_accepted() {
        let mut calibrator = Calibrator::new(
            RecordingPsu::model("DP832A"),
            ConstantDmm { reading: 1.0, ..Default::default() },
            ScriptedOperator::default(),
            CalibrationCatalog::dp832(),
        );
        assert!(calibrator.calibrate_on(&[ch(3)], false, date()).is_ok());
    }

    #[test]
    fn default_dmm_setup_selects_function_per_phase() {
        let mut calibrator = Calibrator::new(
            RecordingPsu::model("DP832"),
            ConstantDmm { reading: 1.0, ..Default::default() },
            ScriptedOperator::default(),
            CalibrationCatalog::dp832(),
        );
        calibrator.calibrate_on(&[ch(2)], false, date()).unwrap();
        assert_eq!(
            calibrator.dmm().functions,
            vec![MeasurementFunction::DcVolts, MeasurementFunction::DcCurrent]
        );
    }

    #[test]
    fn custom_dmm_setup_replaces_default() {
        let mut calibrator = Calibrator::new(
            RecordingPsu::model("DP832"),
            ConstantDmm { reading: 1.0, ..Default::default() },
            ScriptedOperator::default(),
            CalibrationCatalog::dp832(),
        )
        .with_dmm_setup(|dmm: &mut ConstantDmm, function| {
            dmm.functions.push(function);
            dmm.functions.push(function);
            Ok(())
        });
        calibrator.calibrate_on(&[ch(1)], false, date()).unwrap();
        assert_eq!(calibrator.dmm().functions.len(), 4);
    }

    #[test]
    fn sticky_manual_mode_covers_rest_of_pass() {
        let mut calibrator = Calibrator::new(
            RecordingPsu::model("DP832"),
            ConstantDmm { reading: 1.0, ..Default::default() },
            // voltage prompt, current prompt, alternative DMM prompt, then one reading
            ScriptedOperator::new(vec![
                Response::Confirm,
                Response::Confirm,
                Response::Confirm,
                Response::Type(String::from("3.1995")),
            ]),
            CalibrationCatalog::dp832(),
        )
        .with_config(RunConfig {
            manual_current_limit: 3.1,
            settle_time: Duration::from_millis(1),
        });

        // Only the last DAC-I point is above 3.1 A and the script ends after its reading,
        // so the run aborts when ADC-I reaches 3.2 A and asks for another reading.
        let result = calibrator.calibrate_on(&[ch(1)], true, date());
        assert!(matches!(result, Err(CalError::OperatorAbort)));

        let readings = calibrator
            .operator()
            .history()
            .iter()
            .filter(|i| matches!(i, Interaction::Reading(_)))
            .count();
        assert_eq!(readings, 2);
        assert_eq!(calibrator.psu().log.last().map(String::as_str), Some("reset"));
    }

    #[test]
    fn failed_dmm_read_resets_psu() {
        let mut calibrator = Calibrator::new(
            RecordingPsu::model("DP832"),
            ConstantDmm { fail_reads: true, ..Default::default() },
            ScriptedOperator::default(),
            CalibrationCatalog::dp832(),
        );
        let result = calibrator.calibrate_on(&[ch(1)], true, date());
        assert!(matches!(result, Err(CalError::InstrumentCommunication(_))));

        let log = &calibrator.psu().log;
        assert_eq!(log.last().map(String::as_str), Some("reset"));
        assert!(!log.iter().any(|line| line.starts_with("CALibration:MEAS")));
        assert!(!log.iter().any(|line| line.starts_with("CALibration:End")));
    }

    #[test]
    fn successful_run_does_not_reset_at_the_end() {
        let mut calibrator = Calibrator::new(
            RecordingPsu::model("DP832"),
            ConstantDmm { reading: 0.5, ..Default::default() },
            ScriptedOperator::default(),
            CalibrationCatalog::dp832(),
        );
        let reports = calibrator.calibrate_on(&[ch(3)], true, date()).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].committed);
        assert_eq!(
            calibrator.psu().log.last().map(String::as_str),
            Some("CALibration:End 2024-05-17,CH3")
        );
        // one reset right after the calibration tables are cleared
        assert_eq!(calibrator.psu().log.iter().filter(|l| *l == "reset").count(), 1);
    }

    #[test]
    fn report_lists_every_point() {
        let mut calibrator = Calibrator::new(
            RecordingPsu::model("DP832"),
            ConstantDmm { reading: 1.0, ..Default::default() },
            ScriptedOperator::default(),
            CalibrationCatalog::dp832(),
        );
        let reports = calibrator.calibrate_on(&[ch(3)], false, date()).unwrap();
        let report = &reports[0];
        let catalog = CalibrationCatalog::dp832();
        for quantity in Quantity::ALL {
            assert_eq!(report.results(quantity).count(), catalog.points(ch(3), quantity).len());
        }
        // the 0.1 A point read as 1.0 A is 900 % off
        assert!((report.worst_error(Quantity::DacCurrent).unwrap() - 900.0).abs() < 1e-6);
        assert!(!report.committed);
    }

    #[test]
    fn result_line_layout() {
        let result = PointResult {
            channel: ch(1),
            quantity: Quantity::DacVoltage,
            step: 3,
            point: 1.2,
            measured: 1.19876543,
            error_pct: percent_error(1.2, 1.19876543),
            manual: false,
        };
        let line = result.to_string();
        assert!(line.starts_with("DAC-V  3 :  Point:  +1.2V - DMM:  +1.1987654V - Err:"), "{}", line);
        assert!(line.ends_with('%'));
    }
}
