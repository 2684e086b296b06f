pub mod layout;
pub mod session_view;
pub mod status_bar;
pub mod tab_bar;
pub mod theme;
