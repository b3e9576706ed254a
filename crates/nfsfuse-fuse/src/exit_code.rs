//! Process exit codes, following mount(8).

use nfsfuse_core::handshake::ExitClass;

pub const SUCCESS: i32 = 0;
/// Bad arguments or options.
pub const USAGE: i32 = 1;
/// Local resources or transport.
pub const SYSTEM_ERROR: i32 = 2;
/// The server refused the mount.
pub const MOUNT_FAILURE: i32 = 32;

pub fn for_class(class: ExitClass) -> i32 {
    match class {
        ExitClass::SystemError => SYSTEM_ERROR,
        ExitClass::ProtocolFailure => MOUNT_FAILURE,
    }
}
