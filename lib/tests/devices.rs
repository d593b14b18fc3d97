// SPDX-License-Identifier: Apache-2.0 OR MIT

use devio::gpio::{DigitalInput, DigitalInputOutput, DigitalOutput, Readable, Writable};
use devio::registry::Device;
use devio::sim::Sim;
use devio::{Chip, Direction, EdgeTrigger, Error, Pull};
use std::sync::Arc;
use std::time::Duration;

fn chip_on(sim: &Sim) -> Chip {
    Chip::from_path_on(Arc::new(sim.clone()), "/dev/gpiochip0").unwrap()
}

#[test]
fn output_lifecycle() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);

    // initial value is applied by the provisioning request itself
    let mut out = DigitalOutput::new(&chip, 4, false).unwrap();
    assert_eq!(sim.level(0, 4), Some(false));
    assert!(!out.read().unwrap());

    out.write(true).unwrap();
    assert!(out.read().unwrap());
    assert_eq!(sim.level(0, 4), Some(true));

    out.close().unwrap();
    assert!(out.is_closed());
    assert_eq!(out.read().unwrap_err(), Error::Closed);
    assert_eq!(out.write(false).unwrap_err(), Error::Closed);

    // second close is a no-op, not a double release
    out.close().unwrap();

    // the pin is free for the next owner
    assert!(DigitalOutput::new(&chip, 4, false).is_ok());
}

#[test]
fn output_initially_high() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);
    let out = DigitalOutput::new(&chip, 2, true).unwrap();
    assert!(out.read().unwrap());
    assert_eq!(sim.level(0, 2), Some(true));
}

#[test]
fn output_toggle() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);
    let mut out = DigitalOutput::new(&chip, 1, false).unwrap();
    out.toggle().unwrap();
    assert!(out.read().unwrap());
    out.toggle().unwrap();
    assert!(!out.read().unwrap());
}

#[test]
fn input_reads_hardware_level() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);
    let input = DigitalInput::new(&chip, 3, Pull::None, EdgeTrigger::None).unwrap();
    assert_eq!(input.gpio(), 3);
    assert!(!input.read().unwrap());
    sim.set_level(0, 3, true);
    assert!(input.read().unwrap());
}

#[test]
fn input_close_releases_pin() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);
    let mut input = DigitalInput::new(&chip, 3, Pull::None, EdgeTrigger::Both).unwrap();
    input.close().unwrap();
    assert_eq!(input.read().unwrap_err(), Error::Closed);
    assert_eq!(
        input.wait_edge(Duration::from_millis(1)).unwrap_err(),
        Error::Closed
    );
    input.close().unwrap();
    assert!(DigitalInput::new(&chip, 3, Pull::None, EdgeTrigger::Both).is_ok());
}

#[test]
fn construction_failure_leaves_nothing_reserved() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);
    let _held = chip
        .provision_input(5, Pull::None, EdgeTrigger::None)
        .unwrap();
    assert_eq!(
        DigitalInput::new(&chip, 5, Pull::None, EdgeTrigger::None).unwrap_err(),
        Error::AlreadyReserved(5)
    );
    assert_eq!(
        DigitalOutput::new(&chip, 9, false).unwrap_err(),
        Error::InvalidOffset {
            offset: 9,
            num_lines: 8
        }
    );
}

#[test]
fn inout_mode_switch_reprovisions() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);
    let mut dev = DigitalInputOutput::new(&chip, 6, Direction::Input).unwrap();
    assert_eq!(dev.mode(), Direction::Input);
    let d1 = dev.descriptor().unwrap();

    dev.set_mode(Direction::Output).unwrap();
    assert_eq!(dev.mode(), Direction::Output);
    let d2 = dev.descriptor().unwrap();
    assert_ne!(d1, d2);

    dev.set_mode(Direction::Input).unwrap();
    assert_eq!(dev.mode(), Direction::Input);
    let d3 = dev.descriptor().unwrap();
    assert_ne!(d2, d3);
    assert_ne!(d1, d3);

    // an immediate read returns the live hardware level
    sim.set_level(0, 6, true);
    assert!(dev.read().unwrap());
    sim.set_level(0, 6, false);
    assert!(!dev.read().unwrap());
}

#[test]
fn inout_same_mode_is_noop() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);
    let mut dev = DigitalInputOutput::new(&chip, 6, Direction::Output).unwrap();
    let d1 = dev.descriptor().unwrap();
    dev.set_mode(Direction::Output).unwrap();
    assert_eq!(dev.descriptor().unwrap(), d1);
}

#[test]
fn inout_write_follows_mode() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);
    let mut dev = DigitalInputOutput::new(&chip, 2, Direction::Input).unwrap();

    // writes are refused by the kernel while an input
    assert!(matches!(dev.write(true), Err(Error::Ioctl(_, _))));

    dev.set_mode(Direction::Output).unwrap();
    dev.write(true).unwrap();
    assert_eq!(sim.level(0, 2), Some(true));
    assert!(dev.read().unwrap());
}

#[test]
fn inout_closed_is_a_sink() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);
    let mut dev = DigitalInputOutput::new(&chip, 2, Direction::Input).unwrap();
    dev.close().unwrap();
    assert!(dev.is_closed());
    assert_eq!(dev.read().unwrap_err(), Error::Closed);
    assert_eq!(dev.write(true).unwrap_err(), Error::Closed);
    assert_eq!(dev.set_mode(Direction::Output).unwrap_err(), Error::Closed);
    assert_eq!(dev.events().unwrap_err(), Error::Closed);
    dev.close().unwrap();
}

#[test]
fn inout_listener_needs_input_mode() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);
    let mut dev = DigitalInputOutput::new(&chip, 2, Direction::Output).unwrap();
    assert_eq!(
        dev.enable_listener(Box::new(|_| {})).unwrap_err(),
        Error::Unsupported("edge detection on outputs")
    );
}

#[test]
fn capability_traits_compose() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);

    fn level_of(d: &dyn Readable) -> bool {
        d.read().unwrap()
    }
    fn drive(d: &mut dyn Writable, value: bool) {
        d.write(value).unwrap()
    }

    let input = DigitalInput::new(&chip, 0, Pull::None, EdgeTrigger::None).unwrap();
    let mut out = DigitalOutput::new(&chip, 1, false).unwrap();
    let mut both = DigitalInputOutput::new(&chip, 2, Direction::Output).unwrap();

    assert!(!level_of(&input));
    drive(&mut out, true);
    assert!(level_of(&out));
    drive(&mut both, true);
    assert!(level_of(&both));
}
