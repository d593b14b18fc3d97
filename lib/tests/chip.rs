// SPDX-License-Identifier: Apache-2.0 OR MIT

use devio::sim::{self, Sim};
use devio::{chips_on, Backend, Chip, Direction, EdgeTrigger, Error, Pull};
use std::sync::Arc;

fn chip_on(sim: &Sim) -> Chip {
    Chip::from_path_on(Arc::new(sim.clone()), "/dev/gpiochip0").unwrap()
}

#[test]
fn open_enumerates_lines() {
    let sim = sim::builder().with_chip("fruitbank", 8).build();
    let chip = chip_on(&sim);
    assert_eq!(chip.name(), "gpiochip0");
    assert_eq!(chip.label(), "fruitbank");
    assert_eq!(chip.num_lines(), 8);
    assert_eq!(chip.lines().len(), 8);
    for (offset, li) in chip.lines().iter().enumerate() {
        assert_eq!(li.offset, offset as u32);
        assert_eq!(li.direction, Direction::Input);
        assert!(!li.used);
    }
}

#[test]
fn open_missing_chip() {
    let sim = Sim::simpleton(4);
    let backend: Arc<dyn Backend> = Arc::new(sim);
    let err = Chip::from_path_on(backend, "/dev/gpiochip7").unwrap_err();
    assert!(matches!(err, Error::Open(_, _)));
}

#[test]
fn line_lookups() {
    let sim = sim::builder().with_chip("alpha", 4).with_chip("beta", 8).build();
    let chips = chips_on(Arc::new(sim)).unwrap();
    assert_eq!(chips.len(), 2);

    let alpha = &chips[0];
    let beta = &chips[1];
    assert_eq!(alpha.gpio_base(), 0);
    assert_eq!(beta.gpio_base(), 4);

    assert_eq!(alpha.line_info(3).unwrap().name, "alpha-3");
    assert_eq!(
        alpha.line_info(4).unwrap_err(),
        Error::InvalidOffset {
            offset: 4,
            num_lines: 4
        }
    );

    assert_eq!(beta.find_line("beta-5").unwrap().offset, 5);
    assert!(beta.find_line("beta-9").is_none());

    // global numbering spans the chips in open order
    assert_eq!(beta.line_by_gpio(4).unwrap().offset, 0);
    assert_eq!(beta.line_by_gpio(11).unwrap().offset, 7);
    assert!(beta.line_by_gpio(12).is_none());
    assert!(beta.line_by_gpio(3).is_none());
    assert_eq!(alpha.line_by_gpio(3).unwrap().offset, 3);
}

#[test]
fn provision_reserves_offset() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);

    let line = chip
        .provision_input(2, Pull::None, EdgeTrigger::None)
        .unwrap();
    assert!(line.is_provisioned());
    assert!(line.descriptor().is_some());

    // held offsets refuse a second provisioning, either direction
    assert_eq!(
        chip.provision_input(2, Pull::None, EdgeTrigger::None)
            .unwrap_err(),
        Error::AlreadyReserved(2)
    );
    assert_eq!(
        chip.provision_output(2, false).unwrap_err(),
        Error::AlreadyReserved(2)
    );

    line.release().unwrap();
    assert!(!line.is_provisioned());
    assert!(line.descriptor().is_none());

    // released offsets are free again
    let line = chip.provision_output(2, true).unwrap();
    assert!(line.is_provisioned());
}

#[test]
fn release_is_idempotent() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);
    let line = chip
        .provision_input(1, Pull::None, EdgeTrigger::None)
        .unwrap();
    line.release().unwrap();
    line.release().unwrap();
    assert_eq!(line.value().unwrap_err(), Error::Closed);
}

#[test]
fn drop_releases_line() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);
    {
        let _line = chip
            .provision_input(5, Pull::None, EdgeTrigger::None)
            .unwrap();
    }
    // the drop released the reservation
    assert!(chip.provision_input(5, Pull::None, EdgeTrigger::None).is_ok());
}

#[test]
fn provision_invalid_offset() {
    let sim = Sim::simpleton(4);
    let chip = chip_on(&sim);
    assert_eq!(
        chip.provision_input(4, Pull::None, EdgeTrigger::None)
            .unwrap_err(),
        Error::InvalidOffset {
            offset: 4,
            num_lines: 4
        }
    );
    assert_eq!(
        chip.provision_output(17, false).unwrap_err(),
        Error::InvalidOffset {
            offset: 17,
            num_lines: 4
        }
    );
}

#[test]
fn bias_refusal_is_surfaced() {
    let sim = sim::builder().with_chip("old", 4).without_bias().build();
    let chip = chip_on(&sim);
    assert_eq!(
        chip.provision_input(1, Pull::Up, EdgeTrigger::None)
            .unwrap_err(),
        Error::Unsupported("line bias")
    );
    // the failed request leaves no reservation behind
    assert!(chip.provision_input(1, Pull::None, EdgeTrigger::None).is_ok());
}

#[test]
fn pull_drives_floating_input() {
    let sim = Sim::simpleton(4);
    let chip = chip_on(&sim);
    let line = chip
        .provision_input(1, Pull::Up, EdgeTrigger::None)
        .unwrap();
    assert!(line.value().unwrap());
    line.release().unwrap();
    let line = chip
        .provision_input(1, Pull::Down, EdgeTrigger::None)
        .unwrap();
    assert!(!line.value().unwrap());
}

#[test]
fn close_force_releases_lines() {
    let sim = Sim::simpleton(8);
    let chip = chip_on(&sim);
    let line = chip
        .provision_input(2, Pull::None, EdgeTrigger::None)
        .unwrap();
    chip.close().unwrap();
    assert!(chip.is_closed());

    // the line descriptor went with the chip
    assert!(!line.is_provisioned());
    assert_eq!(line.value().unwrap_err(), Error::Closed);

    // and the chip refuses further provisioning
    assert_eq!(
        chip.provision_input(3, Pull::None, EdgeTrigger::None)
            .unwrap_err(),
        Error::Closed
    );
}

#[test]
fn close_is_not_idempotent() {
    let sim = Sim::simpleton(4);
    let chip = chip_on(&sim);
    chip.close().unwrap();
    assert_eq!(chip.close().unwrap_err(), Error::Closed);
}

#[test]
fn clones_share_the_chip() {
    let sim = Sim::simpleton(4);
    let chip = chip_on(&sim);
    let clone = chip.clone();
    let _line = chip
        .provision_input(1, Pull::None, EdgeTrigger::None)
        .unwrap();
    assert_eq!(
        clone
            .provision_input(1, Pull::None, EdgeTrigger::None)
            .unwrap_err(),
        Error::AlreadyReserved(1)
    );
    clone.close().unwrap();
    assert!(chip.is_closed());
}
