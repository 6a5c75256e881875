//! `gpio-dma-test`: toggle GPIO14 from the CPU or from the DMA engine.

use std::env;
use std::io;
use std::process::ExitCode;

use clap::Parser;
use env_logger::Env;
use log::{debug, error};

use rpi_dma_gpio::cpu::CancelToken;
use rpi_dma_gpio::demo::{self, Linux, Mode};

/// Toggle a GPIO line using the CPU or the DMA engine.
#[derive(Debug, Parser)]
#[command(name = "gpio-dma-test", disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    /// Number of the test operation (1...5)
    #[arg(value_parser = clap::value_parser!(u8).range(1..=5))]
    mode: u8,
}

fn init_logging() {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("warn"));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn main() -> ExitCode {
    init_logging();

    let prog = env::args_os()
        .next()
        .map(|arg| arg.to_string_lossy().into_owned())
        .unwrap_or_else(|| "gpio-dma-test".into());
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            debug!("bad arguments: {:?}", err.kind());
            eprint!("{}", demo::usage(&prog));
            return ExitCode::FAILURE;
        }
    };

    let Some(mode) = Mode::from_number(cli.mode) else {
        eprint!("{}", demo::usage(&prog));
        return ExitCode::FAILURE;
    };

    // Nothing cancels the CPU modes; they run until the process is killed
    let cancel = CancelToken::new();
    let stdin = io::stdin();
    match demo::run(&Linux, mode, &mut io::stdout(), &mut stdin.lock(), &cancel) {
        Ok(outcome) => {
            debug!("{mode} finished: {outcome:?}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{mode} failed");
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
