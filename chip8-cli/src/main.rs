//! Entrypoint for CLI
mod clock;

use std::{env, error::Error, fs, process};

use chip8::{check_program_size, constants::*, prelude::*, IMPL_VERSION};
use log::{debug, error, info, warn};

use self::clock::Clock;

static USAGE: &str = r#"
usage: chip8 FILE

Runs the target ROM file in the terminal.

environment:
    CHIP8_HZ      cycles per second (default 500)
    CHIP8_SEED    seed for the random number source
    RUST_LOG      log level (error, warn, info, debug, trace)

examples:
    chip8 breakout.rom
    CHIP8_HZ=1000 chip8 maze.rom
"#;

/// Clear the terminal and move the cursor home.
const ANSI_CLEAR: &str = "\x1B[2J\x1B[H";

fn run_bytecode(filepath: &str, conf: Chip8Conf) -> Chip8Result<()> {
    let bytecode = fs::read(filepath)?;
    if !check_program_size(&bytecode) {
        return Err(Chip8Error::LargeProgram {
            len: bytecode.len(),
        });
    }

    let frequency = conf
        .clock_frequency
        .unwrap_or(Hz(DEFAULT_CLOCK_FREQUENCY));
    info!("running {filepath} at {} Hz", frequency.0);

    let mut vm = Chip8Vm::new(conf);
    vm.initialize();
    vm.load_bytecode(&bytecode)?;
    debug!("program listing\n{}", vm.dump_ram(bytecode.len())?);

    let mut clock = Clock::new(frequency);

    loop {
        vm.step()?;

        if vm.take_redraw() {
            print!("{ANSI_CLEAR}{}", vm.dump_display()?);
        }

        if vm.take_tone() {
            info!("BEEP");
        }

        clock.wait();
    }
}

/// Build the VM configuration from the environment.
fn conf_from_env() -> Chip8Conf {
    Chip8Conf {
        clock_frequency: Some(Hz(env_var("CHIP8_HZ").unwrap_or(DEFAULT_CLOCK_FREQUENCY))),
        seed: env_var("CHIP8_SEED"),
    }
}

fn env_var(key: &str) -> Option<u64> {
    let value = env::var(key).ok()?;
    match value.trim().parse() {
        Ok(number) => Some(number),
        Err(err) => {
            warn!("ignoring {key}={value}: {err}");
            None
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    simple_logger::SimpleLogger::new().env().init()?;

    let filepath = match parse_args() {
        Some(filepath) => filepath,
        None => {
            print_usage();
            // FreeBSD EX_USAGE (64)
            process::exit(64)
        }
    };

    if let Err(err) = run_bytecode(&filepath, conf_from_env()) {
        error!("{err}");
        process::exit(1)
    }

    Ok(())
}

/// Exactly one positional argument, the ROM path.
fn parse_args() -> Option<String> {
    let mut args = env::args().skip(1);
    let filepath = args.next()?;

    match args.next() {
        Some(_) => None,
        None => Some(filepath),
    }
}

fn print_usage() {
    println!("Chip8 v{IMPL_VERSION}");
    println!("{USAGE}");
}
