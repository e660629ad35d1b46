//! Calibration set-points for the DP832 family.
//!
//! The order of every table matters: a point's position is the step index sent to the
//! instrument, so the values must not be reordered without re-deriving them from the
//! hardware documentation.

use crate::error::CalError;
use crate::instrument::Channel;

/// The four calibration passes run for every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    DacVoltage,
    AdcVoltage,
    DacCurrent,
    AdcCurrent,
}

impl Quantity {
    pub const ALL: [Quantity; 4] = [
        Quantity::DacVoltage,
        Quantity::AdcVoltage,
        Quantity::DacCurrent,
        Quantity::AdcCurrent,
    ];

    /// Short name used in progress and result lines.
    pub fn label(self) -> &'static str {
        match self {
            Quantity::DacVoltage => "DAC-V",
            Quantity::AdcVoltage => "ADC-V",
            Quantity::DacCurrent => "DAC-I",
            Quantity::AdcCurrent => "ADC-I",
        }
    }

    /// Unit suffix appended to values on the wire.
    pub fn unit(self) -> char {
        if self.is_current() { 'A' } else { 'V' }
    }

    /// Quantity identifier on the wire. Current uses `C`, not the unit letter.
    pub fn ident(self) -> char {
        if self.is_current() { 'C' } else { 'V' }
    }

    pub fn is_current(self) -> bool {
        matches!(self, Quantity::DacCurrent | Quantity::AdcCurrent)
    }

    pub fn is_dac(self) -> bool {
        matches!(self, Quantity::DacVoltage | Quantity::DacCurrent)
    }

    /// Trailing index of the Set/MEAS commands: 1 for DAC passes, 0 for ADC passes.
    pub fn pass_index(self) -> u8 {
        if self.is_dac() { 1 } else { 0 }
    }

    /// Step number for the point at `position` in the table.
    ///
    /// DAC passes number their steps from 1, ADC passes from 0.
    pub fn step(self, position: usize) -> usize {
        position + self.pass_index() as usize
    }
}

/// Set-points for one channel group, one ordered list per quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct PointTable {
    pub dac_voltage: Vec<f64>,
    pub adc_voltage: Vec<f64>,
    pub dac_current: Vec<f64>,
    pub adc_current: Vec<f64>,
}

impl PointTable {
    pub fn points(&self, quantity: Quantity) -> &[f64] {
        match quantity {
            Quantity::DacVoltage => &self.dac_voltage,
            Quantity::AdcVoltage => &self.adc_voltage,
            Quantity::DacCurrent => &self.dac_current,
            Quantity::AdcCurrent => &self.adc_current,
        }
    }

    fn check_not_empty(&self) -> Result<(), CalError> {
        match Quantity::ALL.iter().find(|q| self.points(**q).is_empty()) {
            Some(quantity) => Err(CalError::EmptyCatalog(*quantity)),
            None => Ok(()),
        }
    }
}

// Channels 1 & 2
const DAC_V_12: [f64; 36] = [
    0.2, 0.5, 1.2, 2.0, 3.2, 4.1, 5.2, 6.9, 7.5, 8.7, 10.1, 11.8, 12.6, 13.5, 15.0, 15.8, 16.5,
    17.3, 18.5, 19.1, 19.9, 20.2, 20.8, 21.8, 22.4, 22.7, 23.9, 24.3, 25.7, 26.9, 27.9, 28.5,
    28.9, 29.8, 30.2, 32.0,
];
const ADC_V_12: [f64; 11] = [0.0, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 12.8, 20.0, 30.0, 32.0];
const DAC_I_12: [f64; 15] = [
    0.1, 0.25, 0.5, 0.8, 1.0, 1.25, 1.5, 1.75, 1.9, 2.15, 2.35, 2.5, 2.75, 3.0, 3.2,
];
const ADC_I_12: [f64; 7] = [0.0, 0.01, 0.1, 1.0, 2.0, 3.0, 3.2];

// Channel 3
const DAC_V_3: [f64; 13] = [0.1, 0.2, 0.4, 0.85, 1.2, 1.8, 2.55, 3.1, 3.4, 4.1, 4.5, 5.0, 5.3];
const ADC_V_3: [f64; 11] = [0.0, 0.005, 0.01, 0.02, 0.05, 0.1, 0.5, 1.0, 3.0, 5.0, 5.3];
const DAC_I_3: [f64; 12] = [0.1, 0.5, 1.0, 1.25, 1.5, 1.75, 2.0, 2.25, 2.5, 2.75, 3.0, 3.2];
const ADC_I_3: [f64; 6] = [0.0, 0.1, 1.0, 2.0, 3.0, 3.2];

/// Immutable lookup of calibration points by channel and quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationCatalog {
    // Shared by channels 1 and 2.
    low_channels: PointTable,
    channel_3: PointTable,
}

impl CalibrationCatalog {
    /// Builds a catalog from custom tables, rejecting any empty point list.
    pub fn new(low_channels: PointTable, channel_3: PointTable) -> Result<Self, CalError> {
        low_channels.check_not_empty()?;
        channel_3.check_not_empty()?;
        Ok(Self { low_channels, channel_3 })
    }

    /// The factory calibration points of the DP832 / DP832A.
    pub fn dp832() -> Self {
        Self {
            low_channels: PointTable {
                dac_voltage: DAC_V_12.to_vec(),
                adc_voltage: ADC_V_12.to_vec(),
                dac_current: DAC_I_12.to_vec(),
                adc_current: ADC_I_12.to_vec(),
            },
            channel_3: PointTable {
                dac_voltage: DAC_V_3.to_vec(),
                adc_voltage: ADC_V_3.to_vec(),
                dac_current: DAC_I_3.to_vec(),
                adc_current: ADC_I_3.to_vec(),
            },
        }
    }

    pub fn table(&self, channel: Channel) -> &PointTable {
        match channel.number() {
            3 => &self.channel_3,
            _ => &self.low_channels,
        }
    }

    pub fn points(&self, channel: Channel, quantity: Quantity) -> &[f64] {
        self.table(channel).points(quantity)
    }
}

impl Default for CalibrationCatalog {
    fn default() -> Self {
        Self::dp832()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(n: u8) -> Channel {
        Channel::new(n).unwrap()
    }

    #[test]
    fn channels_one_and_two_share_tables() {
        let catalog = CalibrationCatalog::dp832();
        for quantity in Quantity::ALL {
            assert_eq!(catalog.points(channel(1), quantity), catalog.points(channel(2), quantity));
        }
    }

    #[test]
    fn channel_three_has_a_smaller_range() {
        let catalog = CalibrationCatalog::dp832();
        for quantity in Quantity::ALL {
            let low = catalog.points(channel(1), quantity);
            let high = catalog.points(channel(3), quantity);
            assert_ne!(low, high);
            let max = |points: &[f64]| points.iter().cloned().fold(f64::MIN, f64::max);
            assert!(max(high) <= max(low));
        }
        assert_eq!(catalog.points(channel(3), Quantity::DacVoltage).last(), Some(&5.3));
        assert_eq!(catalog.points(channel(1), Quantity::DacVoltage).last(), Some(&32.0));
    }

    #[test]
    fn factory_tables_are_ascending() {
        let catalog = CalibrationCatalog::dp832();
        for n in 1..=3 {
            for quantity in Quantity::ALL {
                let points = catalog.points(channel(n), quantity);
                assert!(!points.is_empty());
                assert!(points.windows(2).all(|pair| pair[0] < pair[1]), "{:?} ch{}", quantity, n);
            }
        }
    }

    #[test]
    fn empty_table_is_rejected() {
        let mut table = CalibrationCatalog::dp832().table(channel(1)).clone();
        table.adc_current.clear();
        let result = CalibrationCatalog::new(table, CalibrationCatalog::dp832().channel_3);
        assert!(matches!(result, Err(CalError::EmptyCatalog(Quantity::AdcCurrent))));
    }

    #[test]
    fn step_numbering_depends_on_pass() {
        assert_eq!(Quantity::DacVoltage.step(0), 1);
        assert_eq!(Quantity::DacCurrent.step(4), 5);
        assert_eq!(Quantity::AdcVoltage.step(0), 0);
        assert_eq!(Quantity::AdcCurrent.step(4), 4);
    }

    #[test]
    fn current_uses_c_identifier_with_amp_unit() {
        assert_eq!(Quantity::DacCurrent.ident(), 'C');
        assert_eq!(Quantity::DacCurrent.unit(), 'A');
        assert_eq!(Quantity::AdcVoltage.ident(), 'V');
        assert_eq!(Quantity::AdcVoltage.unit(), 'V');
    }
}
