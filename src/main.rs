use anyhow::Context;
use dp832_cal::{
    config::{Settings, USAGE},
    scpi::{self, Dp832, FilterType, Keithley2000, ScpiLink},
    simulator, AbortFlag, CalError, CalibrationCatalog, Calibrator, ChannelReport, ConsoleOperator,
    MeasurementFunction, Multimeter, PowerSupply, Quantity, RunConfig,
};
use log::{error, info};
use std::time::Duration;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

// The main entry point for the command-line calibration tool.
fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args(std::env::args().skip(1))?;
    if settings.help {
        println!("{}", USAGE);
        return Ok(());
    }

    simple_logger::init_with_level(settings.log_level())?;
    // From here on Ctrl-C stops the run through the reset path instead of killing the process.
    let interrupt = AbortFlag::on_interrupt().context("could not install the Ctrl-C handler")?;

    if settings.simulate {
        info!("Using simulated DP832 and Keithley 2000");
        let (psu_sim, dmm_sim) = simulator::bench();
        let psu = Dp832::connect(psu_sim)?;
        let dmm = Keithley2000::connect(dmm_sim)?;
        return run(psu, dmm, &settings, interrupt);
    }

    let psu_link = scpi::connect_tcp(settings.psu_address.as_str(), IO_TIMEOUT)
        .with_context(|| format!("could not reach PSU at {}", settings.psu_address))?;
    let dmm_link = scpi::connect_serial(&settings.dmm_port, settings.dmm_baud, IO_TIMEOUT)
        .with_context(|| format!("could not open DMM port {}", settings.dmm_port))?;

    let psu = Dp832::connect(psu_link)?;
    let dmm = Keithley2000::connect(dmm_link)?;
    run(psu, dmm, &settings, interrupt)
}

// Keithley 2000 setup: auto range, 1 PLC integration and a 10 reading repeat filter.
fn setup_keithley<L: ScpiLink>(dmm: &mut Keithley2000<L>, function: MeasurementFunction) -> Result<(), CalError> {
    dmm.set_function(function)?;
    dmm.set_auto_range(true)?;
    dmm.set_nplc(1.0)?;
    dmm.set_filter_count(10)?;
    dmm.set_filter_type(FilterType::Repeat)?;
    dmm.set_filter_enabled(true)
}

fn run<P, L>(
    mut psu: P,
    mut dmm: Keithley2000<L>,
    settings: &Settings,
    interrupt: AbortFlag,
) -> anyhow::Result<()>
where
    P: PowerSupply,
    L: ScpiLink + 'static,
{
    psu.reset()?;
    dmm.reset()?;

    let config = RunConfig {
        manual_current_limit: settings.manual_current_limit,
        settle_time: settings.settle_time,
    };
    let mut calibrator = Calibrator::new(
        psu,
        dmm,
        ConsoleOperator::with_abort_flag(interrupt),
        CalibrationCatalog::dp832(),
    )
    .with_config(config)
    .with_dmm_setup(setup_keithley);

    info!("Press Ctrl-C (or Esc at a prompt) to abort");

    match calibrator.calibrate(&settings.channels, settings.commit) {
        Ok(reports) => {
            for report in &reports {
                print_summary(report);
            }
            Ok(())
        }
        Err(err) => {
            error!("{}", err);
            error!("Calibration failed. Your DP832 may need to be restarted to regain calibration values.");
            Err(err.into())
        }
    }
}

fn print_summary(report: &ChannelReport) {
    let verdict = if report.committed { "saved" } else { "not saved" };
    info!("Channel {} ({}):", report.channel.number(), verdict);
    for quantity in Quantity::ALL {
        if let Some(worst) = report.worst_error(quantity) {
            info!("  {:>5} worst error {:.4}%", quantity.label(), worst);
        }
    }
}
