//! Identity: sessions backed by the store, the principal attached to each
//! request, Discord sign-in and the guild role check.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod provider;
mod role_check;
mod session;

pub use principal::Principal;
pub use provider::{DiscordAuthProvider, LoginRequest, LoginResponse};
pub use role_check::{verify_member_role, RoleCheckOutcome, RoleCheckResult, RoleVerdict};
pub use session::{ActiveSession, IssuedSession, SessionManager};
