//! Xbox Live service clients for advertising game servers.
//!
//! Two services matter here: the Multiplayer Session Directory (MPSD),
//! which holds the joinable session record consoles see in the Friends
//! tab, and the social graph, which controls who can see it. The
//! [`SessionController`] owns one MPSD session per game server and keeps
//! it fresh; the [`FriendGraph`] keeps the bot identities mutually
//! followed and accepts incoming follows.
//!
//! Everything consumes [`LiveIdentity`] handles (XUID plus `XBL3.0`
//! authorization header); authentication itself lives elsewhere.

pub mod document;
pub mod errors;
pub mod friends;
pub mod health;
pub mod models;
pub mod session;

pub use document::{build_member, build_session_document, session_name, ServerAdvert};
pub use errors::{LiveError, Result};
pub use friends::{
    expected_edges, ordered_pairs, spawn_poll_task, FriendEvent, FriendGraph, FriendTuning,
};
pub use health::{HealthSample, LiveIdentity};
pub use session::{
    reconnect_delay_for, spawn_heartbeat, SessionController, SessionEvent, SessionState,
    SessionTuning,
};
