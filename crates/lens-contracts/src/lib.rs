pub mod catalog;
pub mod chat;
pub mod editor;
pub mod events;
pub mod runs;
pub mod state;
