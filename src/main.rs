//! tio: an interactive, scriptable serial-line terminal (spec.md §1).
//!
//! `main` only resolves the `Options` record (CLI + tiorc merge, or the
//! `--list-devices` early exit) and hands off to `lifecycle::run`, which
//! owns the console, the input pump, and the connect/run/reconnect loop
//! for the rest of the process's life.

use clap::Parser;

mod alert;
mod catalog;
mod cli;
mod command;
mod config;
mod console;
mod device;
mod diag;
mod error;
mod event_loop;
mod input;
mod lifecycle;
mod line;
mod log_file;
mod script;
mod session;
mod socket;
mod transfer;
mod transform;
mod xmodem;

fn main() {
    diag::init_tracing();

    let args = cli::Args::parse();

    if args.list_devices {
        catalog::print_devices();
        std::process::exit(0);
    }

    let opts = match config::build_options(&args) {
        Ok(opts) => opts,
        Err(e) => diag::fatal(&e.to_string()),
    };

    if let Some(color) = &opts.color {
        if color == "list" {
            print_color_list();
            std::process::exit(0);
        }
    }

    let mute = opts.mute;
    match lifecycle::run(opts) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            diag::error(mute, &e.to_string());
            std::process::exit(1);
        }
    }
}

fn print_color_list() {
    for i in 0u8..=255 {
        print!("\x1b[38;5;{i}m{i:3}\x1b[0m ");
        if i % 16 == 15 {
            println!();
        }
    }
}
