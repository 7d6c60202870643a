//! Keyed per-thread user data.
//!
//! A slot is a value plus an optional deinit callback that gets the value back when the
//! slot is replaced, cleared or its thread object goes away. Values are `Arc`s of any
//! `Send + Sync` type and come back typed through a downcast.

use std::{any::Any, collections::BTreeMap, sync::Arc};

pub type AnyData = Arc<dyn Any + Send + Sync>;

type Deinit = Box<dyn FnOnce(Option<AnyData>) + Send>;

#[derive(Default)]
pub(crate) struct Slot {
    data: Option<AnyData>,
    deinit: Option<Deinit>,
}

impl Slot {
    pub(crate) fn new<Y, F>(data: Option<Arc<Y>>, deinit: Option<F>) -> Self
    where
        Y: Any + Send + Sync,
        F: FnOnce(Option<Arc<Y>>) + Send + 'static,
    {
        Self {
            data: data.map(|data| data as AnyData),
            deinit: deinit.map(|deinit| {
                Box::new(move |data: Option<AnyData>| {
                    deinit(data.and_then(|data| data.downcast::<Y>().ok()))
                }) as Deinit
            }),
        }
    }

    fn is_empty(&self) -> bool {
        self.data.is_none() && self.deinit.is_none()
    }

    /// Runs the callback, if any. The caller must not hold any lock: it's user code.
    pub(crate) fn deinit(self) {
        if let Some(deinit) = self.deinit {
            deinit(self.data);
        }
    }
}

#[derive(Default)]
pub(crate) struct UserData {
    slots: BTreeMap<String, Slot>,
}

impl UserData {
    pub(crate) fn get(&self, key: &str) -> Option<AnyData> {
        self.slots.get(key).and_then(|slot| slot.data.clone())
    }

    /// Puts `slot` under `key` and hands the old one back. An empty slot removes the key.
    pub(crate) fn replace(&mut self, key: &str, slot: Slot) -> Option<Slot> {
        if slot.is_empty() {
            self.slots.remove(key)
        } else {
            self.slots.insert(key.to_owned(), slot)
        }
    }

    pub(crate) fn take_all(&mut self) -> Vec<Slot> {
        std::mem::take(&mut self.slots).into_values().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
