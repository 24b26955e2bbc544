//! Host-target debug bridge: a reliable multi-channel transport with file,
//! socket and cheat services riding on it.

pub use tether_cheat as cheat;
pub use tether_htcfs as htcfs;
pub use tether_htclow as htclow;
pub use tether_htcs as htcs;
pub use tether_utils as utils;
pub use tether_wire as wire;
pub use tracing;
