//! Непрозрачные носители состояния вызывающей стороны.
//!
//! Транспорт передаёт [`ContextBag`] и [`TransportTransaction`] сквозь
//! dispatch, subscribe и вызов обработчика, но сам их содержимое не читает.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
};

/// Типизированная коллекция значений: не более одного значения на тип.
#[derive(Default)]
pub struct ContextBag {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ContextBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Кладёт значение, возвращая предыдущее значение того же типа.
    pub fn set<T: Any + Send + Sync>(
        &mut self,
        value: T,
    ) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.values
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| v.downcast_mut::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for ContextBag {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ContextBag")
            .field("entries", &self.values.len())
            .finish()
    }
}

/// Транзакция транспорта. В режиме receive-only это просто ещё один
/// непрозрачный мешок, который насос создаёт заново на каждую запись.
#[derive(Debug, Default)]
pub struct TransportTransaction {
    bag: ContextBag,
}

impl TransportTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Any + Send + Sync>(
        &mut self,
        value: T,
    ) -> Option<T> {
        self.bag.set(value)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.bag.get()
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.bag.remove()
    }
}
