//! Именование физических топиков.
//!
//! Логический адрес `(endpoint, qualifier)` отображается в имя топика
//! `endpoint` или `endpoint.qualifier`. Отображение детерминированное и
//! инъективное: ни endpoint, ни qualifier не могут содержать разделитель.
//!
//! Топики типов сообщений живут в отдельном пространстве
//! [`TYPE_TOPIC_NAMESPACE`]: `typebus-types.<тип>`. Endpoint с таким именем
//! запрещён, поэтому входной топик endpoint'а никогда не совпадает с
//! топиком типа.

use std::fmt;

use typebus_error::TopicNameError;

/// Разделитель endpoint и qualifier.
pub const QUALIFIER_SEPARATOR: char = '.';
/// Максимальная длина имени топика в байтах.
pub const MAX_TOPIC_LEN: usize = 249;
/// Endpoint-часть всех топиков типов.
pub const TYPE_TOPIC_NAMESPACE: &str = "typebus-types";

/// Логический адрес получателя.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalAddress {
    pub endpoint: String,
    pub qualifier: Option<String>,
}

impl LogicalAddress {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            qualifier: None,
        }
    }

    pub fn with_qualifier(
        endpoint: impl Into<String>,
        qualifier: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            qualifier: Some(qualifier.into()),
        }
    }

    /// Имя топика для этого адреса.
    pub fn to_topic(&self) -> Result<String, TopicNameError> {
        to_topic(&self.endpoint, self.qualifier.as_deref())
    }
}

impl fmt::Display for LogicalAddress {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}{}{}", self.endpoint, QUALIFIER_SEPARATOR, q),
            None => f.write_str(&self.endpoint),
        }
    }
}

/// Строит имя топика из endpoint и необязательного qualifier.
///
/// # Ошибки
/// - `SeparatorInSegment`, если любой сегмент содержит `.`;
/// - `Reserved`, если endpoint совпадает с [`TYPE_TOPIC_NAMESPACE`];
/// - остальные варианты [`TopicNameError`] из [`validate_topic_name`].
pub fn to_topic(
    endpoint: &str,
    qualifier: Option<&str>,
) -> Result<String, TopicNameError> {
    validate_segment(endpoint)?;
    if endpoint == TYPE_TOPIC_NAMESPACE {
        return Err(TopicNameError::Reserved {
            name: endpoint.to_string(),
        });
    }
    let topic = match qualifier {
        Some(q) => {
            validate_segment(q)?;
            format!("{endpoint}{QUALIFIER_SEPARATOR}{q}")
        }
        None => endpoint.to_string(),
    };
    validate_topic_name(&topic)?;
    Ok(topic)
}

/// Проверяет готовое имя топика: ASCII `[A-Za-z0-9_-]`, не более одной
/// точки-разделителя, не пустое и не длиннее [`MAX_TOPIC_LEN`].
pub fn validate_topic_name(name: &str) -> Result<(), TopicNameError> {
    if name.is_empty() {
        return Err(TopicNameError::Empty);
    }
    if name.len() > MAX_TOPIC_LEN {
        return Err(TopicNameError::TooLong {
            name: name.to_string(),
            len: name.len(),
            max: MAX_TOPIC_LEN,
        });
    }

    let mut segments = name.split(QUALIFIER_SEPARATOR);
    let endpoint = segments.next().unwrap_or_default();
    let qualifier = segments.next();
    if segments.next().is_some() || endpoint.is_empty() || qualifier == Some("") {
        return Err(TopicNameError::SeparatorInSegment {
            segment: name.to_string(),
        });
    }

    if let Some(ch) = name
        .chars()
        .find(|&c| c != QUALIFIER_SEPARATOR && !is_topic_char(c))
    {
        return Err(TopicNameError::IllegalCharacter {
            name: name.to_string(),
            ch,
        });
    }
    Ok(())
}

/// Имя топика для типа сообщения: `typebus-types.<экранированное имя>`.
///
/// Имя типа экранируется так, чтобы разные типы никогда не попадали в один
/// топик: буквы и цифры остаются как есть, `.` становится `-`, а любой
/// другой символ (включая `-` и `_`) кодируется как `_XX` по байтам UTF-8.
pub fn type_topic(type_name: &str) -> Result<String, TopicNameError> {
    if type_name.is_empty() {
        return Err(TopicNameError::Empty);
    }
    let topic = format!(
        "{TYPE_TOPIC_NAMESPACE}{QUALIFIER_SEPARATOR}{}",
        escape_type_name(type_name)
    );
    validate_topic_name(&topic)?;
    Ok(topic)
}

/// Принадлежит ли топик пространству типов.
pub fn is_type_topic(topic: &str) -> bool {
    topic
        .strip_prefix(TYPE_TOPIC_NAMESPACE)
        .is_some_and(|rest| rest.starts_with(QUALIFIER_SEPARATOR))
}

fn escape_type_name(type_name: &str) -> String {
    let mut out = String::with_capacity(type_name.len());
    for ch in type_name.chars() {
        match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' => out.push(ch),
            '.' => out.push('-'),
            _ => {
                let mut buf = [0u8; 4];
                for b in ch.encode_utf8(&mut buf).bytes() {
                    out.push('_');
                    out.push_str(&format!("{b:02X}"));
                }
            }
        }
    }
    out
}

fn validate_segment(segment: &str) -> Result<(), TopicNameError> {
    if segment.is_empty() {
        return Err(TopicNameError::Empty);
    }
    if segment.contains(QUALIFIER_SEPARATOR) {
        return Err(TopicNameError::SeparatorInSegment {
            segment: segment.to_string(),
        });
    }
    Ok(())
}

#[inline]
fn is_topic_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_endpoint_only() {
        assert_eq!(to_topic("billing", None).unwrap(), "billing");
        assert_eq!(LogicalAddress::new("billing").to_topic().unwrap(), "billing");
    }

    #[test]
    fn test_endpoint_with_qualifier() {
        let addr = LogicalAddress::with_qualifier("billing", "audit");
        assert_eq!(addr.to_topic().unwrap(), "billing.audit");
        assert_eq!(addr.to_string(), "billing.audit");
    }

    /// Тест проверяет, что разделитель внутри сегмента отклоняется.
    #[test]
    fn test_separator_in_segment_rejected() {
        assert!(matches!(
            to_topic("a.b", None),
            Err(TopicNameError::SeparatorInSegment { .. })
        ));
        assert!(matches!(
            to_topic("a", Some("b.c")),
            Err(TopicNameError::SeparatorInSegment { .. })
        ));
    }

    #[test]
    fn test_invalid_names() {
        assert_eq!(to_topic("", None), Err(TopicNameError::Empty));
        assert_eq!(to_topic("a", Some("")), Err(TopicNameError::Empty));
        assert!(matches!(
            to_topic("bad name", None),
            Err(TopicNameError::IllegalCharacter { ch: ' ', .. })
        ));
        assert!(matches!(
            to_topic(&"x".repeat(250), None),
            Err(TopicNameError::TooLong { len: 250, .. })
        ));
        assert!(to_topic(&"x".repeat(249), None).is_ok());
    }

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("orders").is_ok());
        assert!(validate_topic_name("orders.audit").is_ok());
        assert!(validate_topic_name("a.b.c").is_err());
        assert!(validate_topic_name(".a").is_err());
        assert!(validate_topic_name("a.").is_err());
        assert!(validate_topic_name("ордер").is_err());
    }

    #[test]
    fn test_type_topic_escaping() {
        assert_eq!(
            type_topic("Sales.OrderPlaced").unwrap(),
            "typebus-types.Sales-OrderPlaced"
        );
        assert_eq!(
            type_topic("Sales-OrderPlaced").unwrap(),
            "typebus-types.Sales_2DOrderPlaced"
        );
        assert_eq!(
            type_topic("List`1[Int]").unwrap(),
            "typebus-types.List_601_5BInt_5D"
        );
        assert_eq!(type_topic(""), Err(TopicNameError::Empty));
    }

    /// Тест проверяет, что тип с именем endpoint'а не попадает во входной
    /// топик этого endpoint'а, а само пространство типов нельзя занять
    /// endpoint'ом.
    #[test]
    fn test_type_topics_do_not_collide_with_endpoints() {
        let endpoint = to_topic("billing", None).unwrap();
        let by_type = type_topic("billing").unwrap();
        assert_ne!(endpoint, by_type);
        assert!(is_type_topic(&by_type));
        assert!(!is_type_topic(&endpoint));
        assert!(!is_type_topic("typebus-typesX.a"));

        assert!(matches!(
            to_topic(TYPE_TOPIC_NAMESPACE, None),
            Err(TopicNameError::Reserved { .. })
        ));
        assert!(matches!(
            to_topic(TYPE_TOPIC_NAMESPACE, Some("Sales-OrderPlaced")),
            Err(TopicNameError::Reserved { .. })
        ));
    }

    proptest! {
        /// Разные имена типов никогда не дают один и тот же топик.
        #[test]
        fn prop_type_topic_injective(a in "[A-Za-z0-9._+`-]{1,40}", b in "[A-Za-z0-9._+`-]{1,40}") {
            prop_assume!(a != b);
            let ta = type_topic(&a).unwrap();
            let tb = type_topic(&b).unwrap();
            prop_assert_ne!(ta, tb);
        }

        #[test]
        fn prop_type_topic_never_matches_endpoint(t in "[A-Za-z0-9._+`-]{1,40}", e in "[A-Za-z0-9_-]{1,20}") {
            prop_assume!(e != TYPE_TOPIC_NAMESPACE);
            let endpoint = to_topic(&e, None).unwrap();
            prop_assert_ne!(type_topic(&t).unwrap(), endpoint);
        }

        #[test]
        fn prop_to_topic_injective(
            e1 in "[A-Za-z0-9_-]{1,20}", q1 in proptest::option::of("[A-Za-z0-9_-]{1,20}"),
            e2 in "[A-Za-z0-9_-]{1,20}", q2 in proptest::option::of("[A-Za-z0-9_-]{1,20}"),
        ) {
            prop_assume!((&e1, &q1) != (&e2, &q2));
            let t1 = to_topic(&e1, q1.as_deref()).unwrap();
            let t2 = to_topic(&e2, q2.as_deref()).unwrap();
            prop_assert_ne!(t1, t2);
        }

        #[test]
        fn prop_to_topic_deterministic(e in "[A-Za-z0-9_-]{1,20}", q in proptest::option::of("[A-Za-z0-9_-]{1,20}")) {
            prop_assert_eq!(to_topic(&e, q.as_deref()).unwrap(), to_topic(&e, q.as_deref()).unwrap());
        }
    }
}
