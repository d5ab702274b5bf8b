use super::handle::{CallbackHandle, CallbackKind};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GroupError {
    #[error("{kind} {id} is already registered in this group")]
    Duplicate { kind: CallbackKind, id: u64 },
    #[error("{kind} {id} is not registered in this group")]
    NotFound { kind: CallbackKind, id: u64 },
}

/// Owns the registrations made on behalf of one object. Dropping the group
/// deregisters everything still in it.
#[derive(Debug, Default)]
pub struct CallbackGroup {
    handles: Vec<CallbackHandle>,
}

impl CallbackGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handle: CallbackHandle) -> Result<(), GroupError> {
        self.prune();

        if self.handles.contains(&handle) {
            let err = GroupError::Duplicate {
                kind: handle.kind(),
                id: handle.id(),
            };
            handle.disarm();
            return Err(err);
        }

        self.handles.push(handle);
        Ok(())
    }

    // Registries hand out fresh handles, which can never be duplicates.
    pub(crate) fn adopt(&mut self, handle: CallbackHandle) {
        self.prune();
        self.handles.push(handle);
    }

    pub fn deregister(&mut self, kind: CallbackKind, id: u64) -> Result<(), GroupError> {
        let index = self
            .handles
            .iter()
            .position(|h| h.kind() == kind && h.id() == id)
            .ok_or(GroupError::NotFound { kind, id })?;

        self.handles.swap_remove(index).release();
        Ok(())
    }

    pub fn deregister_all(&mut self, kind: Option<CallbackKind>) -> usize {
        let mut released = 0;
        let mut kept = Vec::with_capacity(self.handles.len());

        for handle in self.handles.drain(..) {
            if kind.is_none_or(|k| k == handle.kind()) {
                if handle.is_live() {
                    released += 1;
                }
                handle.release();
            } else {
                kept.push(handle);
            }
        }

        self.handles = kept;
        released
    }

    pub fn contains(&self, kind: CallbackKind, id: u64) -> bool {
        self.handles
            .iter()
            .any(|h| h.kind() == kind && h.id() == id && h.is_live())
    }

    /// Forgets handles whose registration already ended on the registry side,
    /// e.g. one-shot events that fired.
    pub fn prune(&mut self) {
        self.handles.retain(|h| h.is_live());
    }

    pub fn len(&self) -> usize {
        self.handles.iter().filter(|h| h.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn labels(&self) -> Vec<(CallbackKind, String)> {
        self.handles
            .iter()
            .filter(|h| h.is_live())
            .map(|h| (h.kind(), h.label().to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::RegistrationFlag;

    fn handle(kind: CallbackKind, id: u64) -> (CallbackHandle, RegistrationFlag) {
        let flag = RegistrationFlag::new();
        (CallbackHandle::new(kind, id, format!("h{id}"), flag.clone()), flag)
    }

    #[test]
    fn test_drop_group_releases_all() {
        let (a, fa) = handle(CallbackKind::SchedulerTask, 1);
        let (b, fb) = handle(CallbackKind::ConsoleCommand, 2);

        let mut group = CallbackGroup::new();
        group.add(a).unwrap();
        group.add(b).unwrap();
        assert_eq!(group.len(), 2);

        drop(group);
        assert!(fa.is_released());
        assert!(fb.is_released());
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let flag = RegistrationFlag::new();
        let mut group = CallbackGroup::new();
        group
            .add(CallbackHandle::new(CallbackKind::SchedulerTask, 7, "x", flag.clone()))
            .unwrap();

        let err = group
            .add(CallbackHandle::new(CallbackKind::SchedulerTask, 7, "x", flag.clone()))
            .unwrap_err();
        assert_eq!(
            err,
            GroupError::Duplicate {
                kind: CallbackKind::SchedulerTask,
                id: 7
            }
        );
        assert!(!flag.is_released());
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn test_deregister_single() {
        let (a, fa) = handle(CallbackKind::SchedulerTask, 1);
        let (b, fb) = handle(CallbackKind::SchedulerTask, 2);
        let mut group = CallbackGroup::new();
        group.add(a).unwrap();
        group.add(b).unwrap();

        group.deregister(CallbackKind::SchedulerTask, 1).unwrap();
        assert!(fa.is_released());
        assert!(!fb.is_released());

        assert_eq!(
            group.deregister(CallbackKind::SchedulerTask, 1),
            Err(GroupError::NotFound {
                kind: CallbackKind::SchedulerTask,
                id: 1
            })
        );
    }

    #[test]
    fn test_deregister_all_by_kind() {
        let (a, fa) = handle(CallbackKind::SchedulerTask, 1);
        let (b, fb) = handle(CallbackKind::EventSubscription, 2);
        let (c, fc) = handle(CallbackKind::SchedulerTask, 3);
        let mut group = CallbackGroup::new();
        group.add(a).unwrap();
        group.add(b).unwrap();
        group.add(c).unwrap();

        assert_eq!(group.deregister_all(Some(CallbackKind::SchedulerTask)), 2);
        assert!(fa.is_released());
        assert!(fc.is_released());
        assert!(!fb.is_released());
        assert!(group.contains(CallbackKind::EventSubscription, 2));

        assert_eq!(group.deregister_all(None), 1);
        assert!(group.is_empty());
    }

    #[test]
    fn test_prune_forgets_released_registrations() {
        let (a, fa) = handle(CallbackKind::SchedulerTask, 1);
        let mut group = CallbackGroup::new();
        group.add(a).unwrap();

        fa.release();
        assert_eq!(group.len(), 0);
        group.prune();
        assert!(group.labels().is_empty());
    }
}
