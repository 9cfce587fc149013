use std::path::{Path, PathBuf};
use std::process::ExitCode;

use env_logger::Builder;
use log::{LevelFilter, error, info};

use crate::config::SimulationProfile;
use crate::radio::medium::{FullCoverage, PropagationPolicy};
use crate::script::ScriptConfig;
use crate::simulation::{MILLISECOND, Simulation};

mod bridge;
mod config;
mod mote;
mod radio;
mod script;
mod simulation;

fn make_policy(name: &str) -> anyhow::Result<Box<dyn PropagationPolicy>> {
    match name {
        "full-coverage" => Ok(Box::new(FullCoverage)),
        other => anyhow::bail!("unknown radio medium '{other}'"),
    }
}

/// Demo scenario: two application motes exchange one packet under script
/// control, optionally alongside a firmware-backed mote built from the
/// object file given on the command line.
fn setup_demo(sim: &mut Simulation, firmware: Option<PathBuf>) -> anyhow::Result<()> {
    if let Some(path) = firmware {
        sim.create_firmware_mote_type("firmware", &path)?;
        sim.add_firmware_mote("firmware")?;
    }

    let sender = sim.add_application_mote("sender");
    sim.add_application_mote("receiver");
    sim.plan_transmission(sender, 100 * MILLISECOND, b"hello".to_vec(), 5 * MILLISECOND)?;

    sim.add_script(
        ScriptConfig::default(),
        Box::new(|ctx| {
            while let Some(event) = ctx.wait_for_output() {
                ctx.log(&format!("{} mote {}: {}", event.time, event.mote, event.message));
                if event.message == "received: hello" {
                    ctx.log("TEST OK");
                    return 0;
                }
                if ctx.timed_out() || ctx.shutdown_requested() {
                    ctx.log("TEST FAILED (timeout)");
                    return 1;
                }
            }
            1
        }),
    )?;
    Ok(())
}

fn run() -> anyhow::Result<i32> {
    let mut args = std::env::args().skip(1);
    let profile_path = args.next();
    let firmware = args.next().map(PathBuf::from);

    let mut profile = match &profile_path {
        Some(path) => SimulationProfile::load(Path::new(path))?,
        None => SimulationProfile::default(),
    };
    if !profile.quick_setup {
        // The command-line frontend is headless; only quick setup runs make
        // sense here.
        info!("forcing quick setup for headless run");
        profile.quick_setup = true;
    }

    let policy = make_policy(&profile.radio_medium)?;
    let title = profile.title.clone();
    info!("starting simulation '{title}'");

    let handle = Simulation::spawn(profile, policy, move |sim| setup_demo(sim, firmware))?;
    handle.control().start();
    Ok(handle.join())
}

fn main() -> ExitCode {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("motesim"), LevelFilter::Debug)
        .parse_default_env()
        .init();

    match run() {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => {
            error!("simulation failed with result {code}");
            ExitCode::FAILURE
        }
        Err(error) => {
            error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}
