use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    SchedulerTask,
    ConsoleCommand,
    EventSubscription,
}

impl CallbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackKind::SchedulerTask => "scheduler task",
            CallbackKind::ConsoleCommand => "console command",
            CallbackKind::EventSubscription => "event subscription",
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared between a registry entry and the handle that owns it. Once released
/// the registry treats the entry as defunct and erases it on its next visit.
#[derive(Debug, Clone, Default)]
pub struct RegistrationFlag(Rc<Cell<bool>>);

impl RegistrationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        self.0.set(true);
    }

    pub fn is_released(&self) -> bool {
        self.0.get()
    }

    pub fn same_registration(&self, other: &RegistrationFlag) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

#[must_use = "dropping a CallbackHandle deregisters its callback"]
pub struct CallbackHandle {
    kind: CallbackKind,
    id: u64,
    label: String,
    flag: RegistrationFlag,
    armed: bool,
}

impl CallbackHandle {
    pub fn new(kind: CallbackKind, id: u64, label: impl Into<String>, flag: RegistrationFlag) -> Self {
        Self {
            kind,
            id,
            label: label.into(),
            flag,
            armed: true,
        }
    }

    pub fn kind(&self) -> CallbackKind {
        self.kind
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_live(&self) -> bool {
        !self.flag.is_released()
    }

    pub fn release(mut self) {
        self.flag.release();
        self.armed = false;
    }

    // Drops the handle without touching the registration.
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl PartialEq for CallbackHandle {
    fn eq(&self, other: &Self) -> bool {
        self.flag.same_registration(&other.flag)
    }
}

impl Eq for CallbackHandle {}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("label", &self.label)
            .field("live", &self.is_live())
            .finish()
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if self.armed {
            self.flag.release();
        }
    }
}
