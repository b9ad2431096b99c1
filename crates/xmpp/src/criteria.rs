//! Declarative stanza matching.
//!
//! A [`Criterion`] is a pure predicate over a stanza. Modules advertise one
//! and the registry evaluates it; nothing here holds state, so a criterion
//! can be shared freely across threads.

use xmpp_parsers::minidom::Element;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criterion {
    /// The stanza's element name equals the given name.
    Name(String),
    /// The stanza itself, or one of its direct children, has this name and
    /// namespace.
    NameAndNamespace { name: String, namespace: String },
    /// The stanza itself, or one of its direct children, is in this namespace.
    Namespace(String),
    /// Logical AND, evaluated in order, stopping at the first miss. An empty
    /// chain matches every stanza.
    Chain(Vec<Criterion>),
}

impl Criterion {
    pub fn name(name: impl Into<String>) -> Self {
        Criterion::Name(name.into())
    }

    pub fn name_and_namespace(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Criterion::NameAndNamespace {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn namespace(namespace: impl Into<String>) -> Self {
        Criterion::Namespace(namespace.into())
    }

    pub fn chain(criteria: impl IntoIterator<Item = Criterion>) -> Self {
        Criterion::Chain(criteria.into_iter().collect())
    }

    pub fn matches(&self, stanza: &Element) -> bool {
        match self {
            Criterion::Name(name) => stanza.name() == name,
            Criterion::NameAndNamespace { name, namespace } => {
                stanza.is(name.as_str(), namespace.as_str())
                    || stanza.has_child(name.as_str(), namespace.as_str())
            }
            Criterion::Namespace(namespace) => {
                stanza.has_ns(namespace.as_str())
                    || stanza
                        .children()
                        .any(|child| child.has_ns(namespace.as_str()))
            }
            Criterion::Chain(criteria) => criteria.iter().all(|c| c.matches(stanza)),
        }
    }
}
