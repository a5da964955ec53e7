//! Alert dispatch: bell/blink/none on connect and disconnect events
//! (spec.md §3 "alert", §4.J).

use crate::config::AlertMode;

pub fn fire(mode: AlertMode) {
    match mode {
        AlertMode::None => {}
        AlertMode::Bell => {
            print!("\x07");
            let _ = std::io::Write::flush(&mut std::io::stdout());
        }
        AlertMode::Blink => {
            print!("\x1b[?5h\x1b[?5l");
            let _ = std::io::Write::flush(&mut std::io::stdout());
        }
    }
}
