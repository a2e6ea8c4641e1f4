use std::fs::File;
use std::io::Read;
use std::process::ExitCode;

use clap::Parser;
use hart_core::hart::{Config, Hart};
use hart_core::memory::Memory;
use hart_core::registers::Specifier;
use hart_core::system_bus::SystemBus;

const RAM_BASE: u64 = 0x8000_0000;
const TOHOST_ADDRESS: u64 = 0x8000_1000;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Raw binary image to load at 0x8000_0000 and run to completion.
    image: String,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut buf = Vec::new();
    let mut file = match File::open(&args.image) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open {}: {err}", args.image);
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = file.read_to_end(&mut buf) {
        eprintln!("failed to read {}: {err}", args.image);
        return ExitCode::FAILURE;
    }

    let memory = Memory::from_image(&buf);
    let mut bus = SystemBus::new();
    bus.register(RAM_BASE, Box::new(memory))
        .expect("fresh bus has no overlapping devices");

    let config = Config {
        reset_vector: RAM_BASE,
        tohost_address: Some(TOHOST_ADDRESS),
        ..Config::default()
    };
    let mut hart = Hart::new(config, bus);

    while hart.step() {}

    let a0 = hart.registers().x(Specifier::from_u5(10));
    let a7 = hart.registers().x(Specifier::from_u5(17));
    if a7 == 93 && a0 == 0 {
        println!("Test PASSED");
        ExitCode::SUCCESS
    } else {
        println!("Test FAILED: {}", a0 >> 1);
        ExitCode::FAILURE
    }
}
