//! Calibration persistence.
//!
//! Two constants survive restarts: the user-tunable trim and the output
//! latency compensation. A missing or corrupt file falls back to the
//! defaults — calibration is never worth refusing to start over.

use std::path::Path;

use unison_sync::Calibration;

pub fn load_calibration(path: &Path) -> Calibration {
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Calibration>(&text) {
            Ok(cal) => cal.sanitized(),
            Err(err) => {
                log::warn!("calibration file {} unreadable: {err}", path.display());
                Calibration::default()
            }
        },
        Err(_) => Calibration::default(),
    }
}

pub fn store_calibration(path: &Path, cal: &Calibration) -> std::io::Result<()> {
    let text = serde_json::to_string_pretty(cal).expect("calibration serialization");
    std::fs::write(path, text)
}
