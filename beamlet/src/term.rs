// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Identity types and small helpers layered over the external term format
//! provided by [eetf].
//!
//! [Pid] and [Reference] are structured keys (node + numeric components +
//! creation) suitable for map lookups. They convert losslessly to and from
//! their [eetf] counterparts at the wire boundary.

use std::fmt::Display;
use std::sync::Arc;

use rand::RngCore;

pub use eetf::Term;

/// References carry 3 id words, the first of which is limited to 18 bits
const REF_FIRST_WORD_MASK: u32 = 0x3_ffff;

/// The identity of a process, local or remote
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pid {
    /// The full `name@host` of the owning node
    pub node: Arc<str>,
    /// The process id on the owning node
    pub id: u32,
    /// The serial (wrap count of `id`)
    pub serial: u32,
    /// The creation of the owning node at the time the process was spawned
    pub creation: u32,
}

impl Pid {
    /// Returns [true] if this pid belongs to the node named `node`
    pub fn is_local_to(&self, node: &str) -> bool {
        &*self.node == node
    }
}

impl Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}.{}.{}>", self.node, self.id, self.serial)
    }
}

impl From<&Pid> for eetf::Pid {
    fn from(value: &Pid) -> Self {
        eetf::Pid {
            node: eetf::Atom::from(&*value.node),
            id: value.id,
            serial: value.serial,
            creation: value.creation,
        }
    }
}

impl From<&eetf::Pid> for Pid {
    fn from(value: &eetf::Pid) -> Self {
        Self {
            node: Arc::from(value.node.name.as_str()),
            id: value.id,
            serial: value.serial,
            creation: value.creation,
        }
    }
}

impl From<&Pid> for Term {
    fn from(value: &Pid) -> Self {
        Term::Pid(value.into())
    }
}

/// A unique correlation token, used for monitors, call tagging and aliases
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// The full `name@host` of the node which created the reference
    pub node: Arc<str>,
    /// The creation of that node
    pub creation: u32,
    /// The random id words
    pub id: Vec<u32>,
}

impl Reference {
    /// Create a new random reference owned by `node`
    pub fn new_random(node: Arc<str>, creation: u32) -> Self {
        let mut rng = rand::thread_rng();
        let id = vec![
            rng.next_u32() & REF_FIRST_WORD_MASK,
            rng.next_u32(),
            rng.next_u32(),
        ];
        Self { node, creation, id }
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#Ref<{}", self.node)?;
        for word in self.id.iter().rev() {
            write!(f, ".{word}")?;
        }
        write!(f, ">")
    }
}

impl From<&Reference> for eetf::Reference {
    fn from(value: &Reference) -> Self {
        eetf::Reference {
            node: eetf::Atom::from(&*value.node),
            id: value.id.clone(),
            creation: value.creation,
        }
    }
}

impl From<&eetf::Reference> for Reference {
    fn from(value: &eetf::Reference) -> Self {
        Self {
            node: Arc::from(value.node.name.as_str()),
            creation: value.creation,
            id: value.id.clone(),
        }
    }
}

impl From<&Reference> for Term {
    fn from(value: &Reference) -> Self {
        Term::Reference(Box::new(value.into()))
    }
}

/// Where a message is headed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// A process by id, possibly on another node
    Pid(Pid),
    /// A process by alias. The reference's node owns the alias
    Alias(Reference),
    /// A process registered under this name on the local node
    Name(String),
    /// A process registered under `name` on `node`
    Remote {
        /// The registered name
        name: String,
        /// The owning node's full name
        node: String,
    },
}

impl Destination {
    /// Build a remote named destination
    pub fn remote(name: impl Into<String>, node: impl Into<String>) -> Self {
        Self::Remote {
            name: name.into(),
            node: node.into(),
        }
    }

    /// Interpret a term as a destination, accepting a pid, a reference, an atom
    /// or a `{Name, Node}` tuple
    pub fn from_term(term: &Term) -> Option<Self> {
        match term {
            Term::Pid(pid) => Some(Self::Pid(pid.into())),
            Term::Reference(reference) => Some(Self::Alias((&**reference).into())),
            Term::Atom(atom) => Some(Self::Name(atom.name.clone())),
            Term::Tuple(tuple) => match tuple.elements.as_slice() {
                [Term::Atom(name), Term::Atom(node)] => {
                    Some(Self::remote(name.name.clone(), node.name.clone()))
                }
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<Pid> for Destination {
    fn from(value: Pid) -> Self {
        Self::Pid(value)
    }
}

impl From<&Pid> for Destination {
    fn from(value: &Pid) -> Self {
        Self::Pid(value.clone())
    }
}

impl From<Reference> for Destination {
    fn from(value: Reference) -> Self {
        Self::Alias(value)
    }
}

impl From<&str> for Destination {
    fn from(value: &str) -> Self {
        Self::Name(value.to_string())
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pid(pid) => write!(f, "{pid}"),
            Self::Alias(reference) => write!(f, "{reference}"),
            Self::Name(name) => write!(f, "{name}"),
            Self::Remote { name, node } => write!(f, "{{{name},{node}}}"),
        }
    }
}

// ============== Term construction helpers ============== //

/// Build an atom term
pub fn atom(name: &str) -> Term {
    Term::Atom(eetf::Atom::from(name))
}

/// Build a tuple term
pub fn tuple(elements: Vec<Term>) -> Term {
    Term::Tuple(eetf::Tuple { elements })
}

/// Build a binary term
pub fn binary(bytes: impl Into<Vec<u8>>) -> Term {
    Term::Binary(eetf::Binary {
        bytes: bytes.into(),
    })
}

/// Build a small integer term
pub fn int(value: i32) -> Term {
    Term::FixInteger(eetf::FixInteger { value })
}

/// The name of an atom term
pub fn as_atom(term: &Term) -> Option<&str> {
    match term {
        Term::Atom(atom) => Some(atom.name.as_str()),
        _ => None,
    }
}

/// The elements of a tuple term
pub fn as_tuple(term: &Term) -> Option<&[Term]> {
    match term {
        Term::Tuple(tuple) => Some(tuple.elements.as_slice()),
        _ => None,
    }
}

/// Returns [true] if `term` is the atom `name`
pub fn is_atom(term: &Term, name: &str) -> bool {
    as_atom(term) == Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_survives_eetf_conversion() {
        let pid = Pid {
            node: Arc::from("a@localhost"),
            id: 42,
            serial: 1,
            creation: 7,
        };
        let wire: eetf::Pid = (&pid).into();
        assert_eq!("a@localhost", wire.node.name);
        assert_eq!(pid, Pid::from(&wire));
        assert_eq!("<a@localhost.42.1>", pid.to_string());
    }

    #[test]
    fn random_references_are_distinct_and_masked() {
        let node: Arc<str> = Arc::from("a@localhost");
        let a = Reference::new_random(node.clone(), 1);
        let b = Reference::new_random(node, 1);
        assert_ne!(a, b);
        assert_eq!(3, a.id.len());
        assert!(a.id[0] <= REF_FIRST_WORD_MASK);
    }

    #[test]
    fn destinations_from_terms() {
        let remote = tuple(vec![atom("echo"), atom("x@host")]);
        assert_eq!(
            Some(Destination::remote("echo", "x@host")),
            Destination::from_term(&remote)
        );
        assert_eq!(
            Some(Destination::Name("echo".to_string())),
            Destination::from_term(&atom("echo"))
        );
        assert_eq!(None, Destination::from_term(&int(3)));
    }

    #[test]
    fn references_become_aliases() {
        let reference = Reference::new_random(Arc::from("a@localhost"), 5);
        let wire = Term::from(&reference);
        assert!(matches!(&wire, Term::Reference(inner) if inner.id == reference.id));
        assert_eq!(
            Some(Destination::Alias(reference)),
            Destination::from_term(&wire)
        );
    }
}
