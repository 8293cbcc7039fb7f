pub mod heartbeat;
pub mod process;

pub use heartbeat::HeartBeat;
pub use process::{InjectionStatus, ManagedProcessRecord, ProcessHandle};

use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
