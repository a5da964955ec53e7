//! Transfer Adapter (component H, spec.md §4.H): a thin façade over
//! the blocking XMODEM/YMODEM send primitive in `xmodem.rs`.

use crate::config::Protocol;
use crate::device::Device;
use crate::session::HotKey;
use crate::xmodem::{self, TransferOutcome};

/// Reads `path` and sends it over `device`, printing "Done"/"Aborted"
/// exactly as spec.md §4.H describes. The input pump's hot-key
/// mailbox (already armed by `xmodem::send`) is the abort signal.
pub fn send_file(
    device: &mut Device,
    protocol: Protocol,
    path: &str,
    hot_key: &HotKey,
    mute: bool,
) -> std::io::Result<TransferOutcome> {
    let data = std::fs::read(path)?;
    let filename = std::path::Path::new(path)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());

    let outcome = xmodem::send(device, protocol, &filename, &data, hot_key)?;
    crate::diag::info(
        mute,
        match outcome {
            TransferOutcome::Done => "transfer complete: Done",
            TransferOutcome::Aborted => "transfer aborted: Aborted",
        },
    );
    Ok(outcome)
}
