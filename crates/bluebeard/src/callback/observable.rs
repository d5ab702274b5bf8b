use std::cell::RefCell;
use std::rc::Rc;

use super::group::CallbackGroup;
use super::handle::{CallbackHandle, CallbackKind, RegistrationFlag};

type Handler<E> = Rc<RefCell<dyn FnMut(&E)>>;

struct Subscriber<E> {
    flag: RegistrationFlag,
    handler: Handler<E>,
}

struct Subscribers<E> {
    next_id: u64,
    entries: Vec<Subscriber<E>>,
}

/// Event source with group-owned subscriptions.
pub struct Observable<E> {
    name: Rc<str>,
    inner: Rc<RefCell<Subscribers<E>>>,
}

impl<E> Clone for Observable<E> {
    fn clone(&self) -> Self {
        Self {
            name: Rc::clone(&self.name),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<E: 'static> Observable<E> {
    pub fn new(name: &str) -> Self {
        Self {
            name: Rc::from(name),
            inner: Rc::new(RefCell::new(Subscribers {
                next_id: 1,
                entries: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, group: &mut CallbackGroup, handler: F) -> u64
    where
        F: FnMut(&E) + 'static,
    {
        let flag = RegistrationFlag::new();
        let id = {
            let mut subs = self.inner.borrow_mut();
            let id = subs.next_id;
            subs.next_id += 1;
            subs.entries.push(Subscriber {
                flag: flag.clone(),
                handler: Rc::new(RefCell::new(handler)),
            });
            id
        };

        group.adopt(CallbackHandle::new(
            CallbackKind::EventSubscription,
            id,
            self.name.to_string(),
            flag,
        ));
        id
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<(RegistrationFlag, Handler<E>)> = {
            let mut subs = self.inner.borrow_mut();
            subs.entries.retain(|s| !s.flag.is_released());
            subs.entries
                .iter()
                .map(|s| (s.flag.clone(), Rc::clone(&s.handler)))
                .collect()
        };

        for (flag, handler) in snapshot {
            if flag.is_released() {
                continue;
            }
            match handler.try_borrow_mut() {
                Ok(mut handler) => (*handler)(event),
                Err(_) => log::warn!("{}: skipping re-entrant subscriber", self.name),
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .borrow()
            .entries
            .iter()
            .filter(|s| !s.flag.is_released())
            .count()
    }
}
