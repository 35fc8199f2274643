//! Multicast image distribution.
//!
//! One image is streamed to many clients at once over a UDP multicast
//! group. A session is prepared first so clients can `join` on the control
//! channel (`port + 1`) before the image is sized, then started (image
//! resolved, chunk count fixed) and finally begun, which spawns the chunk
//! loop:
//!
//! ```text
//! prepare ─► waiting ─► start_session ─► waiting (sized) ─► begin ─► active
//!                                                                   │
//!                                  completed ◄──── all chunks sent ◄┤
//!                                  failed    ◄──── read/send error ◄┤
//!                                  cancelled ◄──── cancel_session  ◄┘
//! ```
//!
//! Clients report progress with `ack`/`status` and request repairs with
//! `nack`; a repair is re-sent to the whole group.

pub mod address;
pub mod control;
pub mod engine;
pub mod events;
pub mod session;
pub mod sink;
pub mod source;

pub use address::allocate_address;
pub use control::ControlServer;
pub use engine::{MulticastEngine, StartRequest};
pub use events::MulticastEvent;
pub use session::{ClientId, ClientSnapshot, SessionId, SessionSnapshot};
pub use sink::{DatagramSink, RecordingSink, UdpSink};
pub use source::ImageSource;

use std::path::PathBuf;
use std::time::Duration;

/// Chunk size used when none is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Pause between chunks.
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(10);

/// Image size assumed when neither the file nor the catalog knows it.
pub const DEFAULT_SIMULATED_SIZE: u64 = 100 * 1024 * 1024;

/// Default data port; control is `port + 1`.
pub const DEFAULT_PORT: u16 = 9000;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct MulticastOptions {
    /// Directory image filenames are resolved against
    pub images_dir: PathBuf,
    pub chunk_size: usize,
    pub throttle: Duration,
    pub simulated_size: u64,
    /// Data port for sessions created without one
    pub default_port: u16,
}

impl Default for MulticastOptions {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from("/var/lib/pxe/images"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            throttle: DEFAULT_THROTTLE,
            simulated_size: DEFAULT_SIMULATED_SIZE,
            default_port: DEFAULT_PORT,
        }
    }
}
