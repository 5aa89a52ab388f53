pub mod actor;
pub mod broadcast;
pub mod handler;

use tokio::sync::mpsc;

/// Sender half of a connection's outbound queue. Any part of the system can
/// clone this to push frames to a specific client; the writer task owns the
/// socket sink.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// Close code sent when room admission fails (client cap or bandwidth cap).
pub const CLOSE_ADMISSION_DENIED: u16 = 4003;
