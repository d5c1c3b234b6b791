//! Реестр иерархии типов сообщений.
//!
//! Хост один раз регистрирует статические метаданные (класс/интерфейс,
//! базовый класс, реализуемые интерфейсы), после чего [`RegistryBuilder::build`]
//! вычисляет полную родословную каждого типа. Дальше реестр неизменяем и
//! отвечает только табличными поисками.

use std::{
    borrow::Borrow,
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::Arc,
};

use tracing::debug;
use typebus_error::RegistryError;

/// Корневой тип по умолчанию: подписка на него получает любую публикацию.
pub const DEFAULT_UNIVERSAL_ROOT: &str = "object";

/// Полное имя типа сообщения.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeName(Arc<str>);

impl TypeName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TypeName {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for TypeName {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TypeName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for TypeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TypeName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TypeName {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Class,
    Interface,
}

/// Статическое описание одного типа сообщения.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub name: TypeName,
    pub kind: TypeKind,
    /// Базовый класс; только для классов.
    pub base: Option<TypeName>,
    /// Напрямую реализуемые (для интерфейса: расширяемые) интерфейсы.
    pub interfaces: Vec<TypeName>,
}

impl TypeDescriptor {
    pub fn class(name: impl Into<TypeName>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Class,
            base: None,
            interfaces: Vec::new(),
        }
    }

    pub fn interface(name: impl Into<TypeName>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Interface,
            base: None,
            interfaces: Vec::new(),
        }
    }

    pub fn extends(
        mut self,
        base: impl Into<TypeName>,
    ) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn implements(
        mut self,
        interface: impl Into<TypeName>,
    ) -> Self {
        self.interfaces.push(interface.into());
        self
    }
}

/// Построитель реестра.
#[derive(Debug, Clone)]
pub struct RegistryBuilder {
    root: TypeName,
    markers: Vec<TypeName>,
    types: Vec<TypeDescriptor>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            root: TypeName::new(DEFAULT_UNIVERSAL_ROOT),
            markers: Vec::new(),
            types: Vec::new(),
        }
    }

    /// Переопределяет имя универсального корня.
    pub fn universal_root(
        mut self,
        name: impl Into<TypeName>,
    ) -> Self {
        self.root = name.into();
        self
    }

    /// Регистрирует маркер «любое событие»: интерфейс, который неявно входит
    /// в родословную каждого типа.
    pub fn catch_all_marker(
        mut self,
        name: impl Into<TypeName>,
    ) -> Self {
        self.markers.push(name.into());
        self
    }

    pub fn register(
        mut self,
        descriptor: TypeDescriptor,
    ) -> Self {
        self.types.push(descriptor);
        self
    }

    pub fn register_all(
        mut self,
        descriptors: impl IntoIterator<Item = TypeDescriptor>,
    ) -> Self {
        self.types.extend(descriptors);
        self
    }

    /// Проверяет таблицу и вычисляет родословные.
    ///
    /// # Ошибки
    /// - `Duplicate` — тип зарегистрирован дважды (в том числе корень/маркер);
    /// - `UnknownReference` — ссылка на незарегистрированный тип;
    /// - `InvalidBase` / `NotAnInterface` — нарушены правила класс/интерфейс;
    /// - `Cycle` — цикл наследования.
    pub fn build(self) -> Result<TypeRegistry, RegistryError> {
        let mut table: HashMap<TypeName, TypeDescriptor> = HashMap::new();

        table.insert(self.root.clone(), TypeDescriptor::class(self.root.clone()));
        for marker in &self.markers {
            if table
                .insert(marker.clone(), TypeDescriptor::interface(marker.clone()))
                .is_some()
            {
                return Err(RegistryError::Duplicate {
                    type_name: marker.to_string(),
                });
            }
        }
        for desc in self.types {
            if table.contains_key(&desc.name) {
                return Err(RegistryError::Duplicate {
                    type_name: desc.name.to_string(),
                });
            }
            table.insert(desc.name.clone(), desc);
        }

        for desc in table.values() {
            validate_descriptor(desc, &table)?;
        }
        for name in table.keys() {
            detect_cycle(name, &table)?;
        }

        let ancestry = table
            .keys()
            .map(|name| {
                let chain = compute_ancestry(name, &table, &self.markers, &self.root);
                (name.clone(), Arc::<[TypeName]>::from(chain))
            })
            .collect::<HashMap<_, _>>();

        debug!(
            types = ancestry.len(),
            root = %self.root,
            markers = self.markers.len(),
            "Type registry built"
        );

        Ok(TypeRegistry {
            root: self.root,
            kinds: table.into_iter().map(|(k, d)| (k, d.kind)).collect(),
            ancestry,
        })
    }
}

/// Неизменяемая таблица родословных.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    root: TypeName,
    kinds: HashMap<TypeName, TypeKind>,
    ancestry: HashMap<TypeName, Arc<[TypeName]>>,
}

impl TypeRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn universal_root(&self) -> &TypeName {
        &self.root
    }

    pub fn contains(
        &self,
        type_name: &str,
    ) -> bool {
        self.kinds.contains_key(type_name)
    }

    pub fn kind(
        &self,
        type_name: &str,
    ) -> Option<TypeKind> {
        self.kinds.get(type_name).copied()
    }

    /// Родословная типа: сам тип, базовые классы, все интерфейсы
    /// (транзитивно), маркеры и универсальный корень. Без повторов.
    pub fn ancestry(
        &self,
        type_name: &str,
    ) -> Result<Arc<[TypeName]>, RegistryError> {
        self.ancestry
            .get(type_name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownType {
                type_name: type_name.to_string(),
            })
    }

    /// Удовлетворяет ли публикация `concrete` интересу `interest`.
    pub fn is_assignable(
        &self,
        concrete: &str,
        interest: &str,
    ) -> bool {
        self.ancestry
            .get(concrete)
            .is_some_and(|chain| chain.iter().any(|t| t.as_str() == interest))
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &TypeName> {
        self.kinds.keys()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Внутренние функции
////////////////////////////////////////////////////////////////////////////////

fn validate_descriptor(
    desc: &TypeDescriptor,
    table: &HashMap<TypeName, TypeDescriptor>,
) -> Result<(), RegistryError> {
    if let Some(base) = &desc.base {
        if desc.kind == TypeKind::Interface {
            return Err(RegistryError::InvalidBase {
                type_name: desc.name.to_string(),
                base: base.to_string(),
                reason: "interfaces cannot extend a class",
            });
        }
        match table.get(base) {
            None => {
                return Err(RegistryError::UnknownReference {
                    type_name: desc.name.to_string(),
                    missing: base.to_string(),
                })
            }
            Some(b) if b.kind == TypeKind::Interface => {
                return Err(RegistryError::InvalidBase {
                    type_name: desc.name.to_string(),
                    base: base.to_string(),
                    reason: "base type is an interface",
                })
            }
            Some(_) => {}
        }
    }

    for iface in &desc.interfaces {
        match table.get(iface) {
            None => {
                return Err(RegistryError::UnknownReference {
                    type_name: desc.name.to_string(),
                    missing: iface.to_string(),
                })
            }
            Some(i) if i.kind != TypeKind::Interface => {
                return Err(RegistryError::NotAnInterface {
                    type_name: desc.name.to_string(),
                    interface: iface.to_string(),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn parents(desc: &TypeDescriptor) -> impl Iterator<Item = &TypeName> {
    desc.base.iter().chain(desc.interfaces.iter())
}

/// Итеративный DFS с тремя цветами.
fn detect_cycle(
    start: &TypeName,
    table: &HashMap<TypeName, TypeDescriptor>,
) -> Result<(), RegistryError> {
    let mut on_path: HashSet<&TypeName> = HashSet::new();
    let mut done: HashSet<&TypeName> = HashSet::new();
    let mut stack: Vec<(&TypeName, bool)> = vec![(start, false)];

    while let Some((name, expanded)) = stack.pop() {
        if expanded {
            on_path.remove(name);
            done.insert(name);
            continue;
        }
        if done.contains(name) {
            continue;
        }
        if !on_path.insert(name) {
            return Err(RegistryError::Cycle {
                type_name: name.to_string(),
            });
        }
        stack.push((name, true));
        if let Some(desc) = table.get(name) {
            for parent in parents(desc) {
                if on_path.contains(parent) {
                    return Err(RegistryError::Cycle {
                        type_name: parent.to_string(),
                    });
                }
                if !done.contains(parent) {
                    stack.push((parent, false));
                }
            }
        }
    }
    Ok(())
}

fn compute_ancestry(
    name: &TypeName,
    table: &HashMap<TypeName, TypeDescriptor>,
    markers: &[TypeName],
    root: &TypeName,
) -> Vec<TypeName> {
    let mut out = Vec::new();
    let mut seen: HashSet<TypeName> = HashSet::new();

    // Сначала цепочка базовых классов, затем интерфейсы в ширину.
    let mut interfaces: VecDeque<TypeName> = VecDeque::new();
    let mut current = table.get(name);
    while let Some(desc) = current {
        if seen.insert(desc.name.clone()) {
            out.push(desc.name.clone());
        }
        interfaces.extend(desc.interfaces.iter().cloned());
        current = desc.base.as_ref().and_then(|b| table.get(b));
    }

    while let Some(iface) = interfaces.pop_front() {
        if !seen.insert(iface.clone()) {
            continue;
        }
        if let Some(desc) = table.get(&iface) {
            interfaces.extend(desc.interfaces.iter().cloned());
        }
        out.push(iface);
    }

    for marker in markers.iter().chain(std::iter::once(root)) {
        if seen.insert(marker.clone()) {
            out.push(marker.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(chain: &[TypeName]) -> Vec<&str> {
        chain.iter().map(TypeName::as_str).collect()
    }

    fn registry() -> TypeRegistry {
        TypeRegistry::builder()
            .catch_all_marker("IEvent")
            .register(TypeDescriptor::class("EventBase").implements("IEvent"))
            .register(TypeDescriptor::class("SubEvent1").extends("EventBase"))
            .register(TypeDescriptor::class("SubEvent2").extends("EventBase"))
            .register(TypeDescriptor::interface("IMyEvent"))
            .register(TypeDescriptor::interface("IAudited"))
            .register(
                TypeDescriptor::class("MyEvent1")
                    .implements("IMyEvent")
                    .implements("IAudited"),
            )
            .register(TypeDescriptor::class("MyOtherEvent"))
            .build()
            .unwrap()
    }

    /// Тест проверяет порядок и состав родословной: тип, базы, интерфейсы,
    /// маркеры, корень.
    #[test]
    fn test_ancestry_order() {
        let reg = registry();
        let chain = reg.ancestry("SubEvent1").unwrap();
        assert_eq!(names(&chain), vec!["SubEvent1", "EventBase", "IEvent", "object"]);

        let chain = reg.ancestry("MyEvent1").unwrap();
        assert_eq!(
            names(&chain),
            vec!["MyEvent1", "IMyEvent", "IAudited", "IEvent", "object"]
        );
    }

    /// Тест проверяет, что маркер и корень входят в родословную типа без
    /// явной связи с ними.
    #[test]
    fn test_unrelated_type_reaches_marker_and_root() {
        let reg = registry();
        assert!(reg.is_assignable("MyOtherEvent", "IEvent"));
        assert!(reg.is_assignable("MyOtherEvent", "object"));
        assert!(!reg.is_assignable("MyOtherEvent", "EventBase"));
    }

    #[test]
    fn test_descendant_does_not_satisfy_supertype_interest() {
        let reg = registry();
        assert!(reg.is_assignable("SubEvent1", "EventBase"));
        assert!(!reg.is_assignable("EventBase", "SubEvent1"));
        assert!(!reg.is_assignable("IMyEvent", "MyEvent1"));
    }

    #[test]
    fn test_root_ancestry_is_itself() {
        let reg = registry();
        assert_eq!(names(&reg.ancestry("object").unwrap()), vec!["object"]);
        assert_eq!(reg.universal_root().as_str(), "object");
    }

    #[test]
    fn test_unknown_type() {
        let reg = registry();
        assert_eq!(
            reg.ancestry("Nope").unwrap_err(),
            RegistryError::UnknownType {
                type_name: "Nope".into()
            }
        );
    }

    /// Тест проверяет транзитивные интерфейсы и ромбовидное наследование без
    /// дубликатов.
    #[test]
    fn test_diamond_interfaces() {
        let reg = TypeRegistry::builder()
            .universal_root("Root")
            .register(TypeDescriptor::interface("IA"))
            .register(TypeDescriptor::interface("IB").implements("IA"))
            .register(TypeDescriptor::interface("IC").implements("IA"))
            .register(TypeDescriptor::class("Base").implements("IB"))
            .register(
                TypeDescriptor::class("Leaf")
                    .extends("Base")
                    .implements("IC"),
            )
            .build()
            .unwrap();
        assert_eq!(
            names(&reg.ancestry("Leaf").unwrap()),
            vec!["Leaf", "Base", "IC", "IB", "IA", "Root"]
        );
    }

    #[test]
    fn test_build_errors() {
        let dup = TypeRegistry::builder()
            .register(TypeDescriptor::class("A"))
            .register(TypeDescriptor::class("A"))
            .build();
        assert!(matches!(dup, Err(RegistryError::Duplicate { .. })));

        let root_dup = TypeRegistry::builder()
            .register(TypeDescriptor::class("object"))
            .build();
        assert!(matches!(root_dup, Err(RegistryError::Duplicate { .. })));

        let missing = TypeRegistry::builder()
            .register(TypeDescriptor::class("A").extends("B"))
            .build();
        assert!(matches!(missing, Err(RegistryError::UnknownReference { .. })));

        let not_iface = TypeRegistry::builder()
            .register(TypeDescriptor::class("A"))
            .register(TypeDescriptor::class("B").implements("A"))
            .build();
        assert!(matches!(not_iface, Err(RegistryError::NotAnInterface { .. })));

        let iface_base = TypeRegistry::builder()
            .register(TypeDescriptor::interface("I"))
            .register(TypeDescriptor::class("B").extends("I"))
            .build();
        assert!(matches!(iface_base, Err(RegistryError::InvalidBase { .. })));
    }

    #[test]
    fn test_cycle_detected() {
        let res = TypeRegistry::builder()
            .register(TypeDescriptor::class("A").extends("B"))
            .register(TypeDescriptor::class("B").extends("A"))
            .build();
        assert!(matches!(res, Err(RegistryError::Cycle { .. })));

        let res = TypeRegistry::builder()
            .register(TypeDescriptor::interface("I").implements("J"))
            .register(TypeDescriptor::interface("J").implements("I"))
            .build();
        assert!(matches!(res, Err(RegistryError::Cycle { .. })));
    }
}
