pub mod daemon;
pub mod dbus_api;
pub mod sync;
pub mod token_source;
