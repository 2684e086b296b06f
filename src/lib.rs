//! hearthmux: several game sessions in one client, one rendered and the
//! rest running headless.

pub mod app;
pub mod bootstrap;
pub mod config;
pub mod logging;
pub mod net;
pub mod paths;
pub mod pump;
pub mod session;
pub mod sim;
pub mod tree;
pub mod ui;
pub mod worker;
