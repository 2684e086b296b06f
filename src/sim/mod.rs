//! Simulated game collaborators: a scripted server, an in-memory state tree
//! and a login flow driven by the front-end. They stand in for the real
//! network client so the session machinery can be run and tested.

mod login;
mod server;
mod tree;

pub use login::SimLogin;
pub use server::{character_name, SimServer};
pub use tree::SimTree;
