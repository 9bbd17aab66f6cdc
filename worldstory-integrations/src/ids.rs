pub const APP_ID_BASE: &str = "io.worldstory";

pub const DBUS_NAME_SYNC: &str = "io.worldstory.OfflineSync1";
pub const DBUS_INTERFACE_SYNC: &str = "io.worldstory.OfflineSync1";
pub const DBUS_OBJECT_PATH_SYNC: &str = "/io/worldstory/OfflineSync1";

pub const DBUS_ERROR_NOT_FOUND: &str = "io.worldstory.OfflineSync1.Error.NotFound";
pub const DBUS_ERROR_OFFLINE: &str = "io.worldstory.OfflineSync1.Error.Offline";
pub const DBUS_ERROR_INVALID_ARGUMENT: &str = "io.worldstory.OfflineSync1.Error.InvalidArgument";
pub const DBUS_ERROR_FAILED: &str = "io.worldstory.OfflineSync1.Error.Failed";
