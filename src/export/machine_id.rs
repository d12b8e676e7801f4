use std::fs;
use std::sync::OnceLock;

use rand::RngCore;

const MACHINE_ID_FILES: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// The 32-hex-character machine id returned by `Peer.GetMachineId`.
///
/// Read from the system once and cached, so the value is stable
/// process-wide. Falls back to a random 128-bit id when no valid system
/// file exists.
pub(crate) fn machine_id() -> &'static str {
    static MACHINE_ID: OnceLock<String> = OnceLock::new();

    MACHINE_ID.get_or_init(|| {
        for path in MACHINE_ID_FILES {
            if let Ok(contents) = fs::read_to_string(path) {
                let id = contents.trim();

                if id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return id.to_ascii_lowercase();
                }
            }
        }

        let mut bytes = [0; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    })
}
