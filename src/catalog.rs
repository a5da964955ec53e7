//! Device Catalog (component R, spec.md §6 `--list-devices`): walks
//! `/dev` for serial-like nodes and prints them one per line.

use std::path::Path;

const PREFIXES: &[&str] = &["ttyUSB", "ttyACM", "ttyS", "cu.", "tty."];

pub fn list_devices() -> Vec<String> {
    let mut found = Vec::new();
    let dev = Path::new("/dev");
    let Ok(entries) = std::fs::read_dir(dev) else {
        return found;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if PREFIXES.iter().any(|p| name.starts_with(p)) {
            found.push(format!("/dev/{name}"));
        }
    }
    found.sort();
    found
}

pub fn print_devices() {
    for path in list_devices() {
        println!("{path}");
    }
}
