mod console;
mod group;
mod handle;
mod observable;

pub use console::{Console, ConsoleError};
pub use group::{CallbackGroup, GroupError};
pub use handle::{CallbackHandle, CallbackKind, RegistrationFlag};
pub use observable::Observable;
