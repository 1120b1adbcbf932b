// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Control messages are the routing envelope of every dispatch frame. They're
//! decoded once, at the frame boundary, into a closed set of typed variants.

use crate::errors::ProtocolErr;
use crate::term::{self, Pid, Reference, Term};

/// `{2, Unused, ToPid}`
pub const SEND: i32 = 2;
/// `{6, FromPid, Unused, ToName}`
pub const REG_SEND: i32 = 6;
/// `{19, FromPid, ToProc, Ref}`
pub const MONITOR_P: i32 = 19;
/// `{20, FromPid, ToProc, Ref}`
pub const DEMONITOR_P: i32 = 20;
/// `{21, FromProc, ToPid, Ref, Reason}`
pub const MONITOR_P_EXIT: i32 = 21;
/// `{22, FromPid, ToPid}`
pub const SEND_SENDER: i32 = 22;
/// `{33, FromPid, Alias}`
pub const ALIAS_SEND: i32 = 33;

/// A process as named in a monitor control message: by pid, or by a name
/// registered on the receiving (or sending, for exits) node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// By pid
    Pid(Pid),
    /// By registered name
    Name(String),
}

impl Subject {
    fn to_term(&self) -> Term {
        match self {
            Self::Pid(pid) => pid.into(),
            Self::Name(name) => term::atom(name),
        }
    }

    /// The item a DOWN message names for this subject, which lives on `node`
    pub fn down_item(&self, node: &str) -> Term {
        match self {
            Self::Pid(pid) => pid.into(),
            Self::Name(name) => term::tuple(vec![term::atom(name), term::atom(node)]),
        }
    }

    fn from_term(term: &Term) -> Result<Self, ProtocolErr> {
        match term {
            Term::Pid(pid) => Ok(Self::Pid(pid.into())),
            Term::Atom(atom) => Ok(Self::Name(atom.name.clone())),
            _ => Err(ProtocolErr::Malformed("expected a pid or an atom")),
        }
    }
}

/// The supported subset of distribution control messages
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Deliver the payload to a pid, sender unknown
    Send {
        /// The receiver
        to: Pid,
    },
    /// Deliver the payload to a registered name on the receiving node
    RegSend {
        /// The sender
        from: Pid,
        /// The registered name
        to_name: String,
    },
    /// Deliver the payload to a pid
    SendSender {
        /// The sender
        from: Pid,
        /// The receiver
        to: Pid,
    },
    /// Deliver the payload to the process holding an alias
    AliasSend {
        /// The sender
        from: Pid,
        /// The alias
        alias: Reference,
    },
    /// `from` (on the sending node) monitors `to` (on the receiving node)
    MonitorP {
        /// The monitoring process
        from: Pid,
        /// The monitored process
        to: Subject,
        /// The monitor reference
        reference: Reference,
    },
    /// Cancel a monitor established with [ControlMessage::MonitorP]
    DemonitorP {
        /// The monitoring process
        from: Pid,
        /// The monitored process
        to: Subject,
        /// The monitor reference
        reference: Reference,
    },
    /// The monitored process `from` exited
    MonitorPExit {
        /// The process which exited
        from: Subject,
        /// The monitoring process
        to: Pid,
        /// The monitor reference
        reference: Reference,
        /// The exit reason
        reason: Term,
    },
    /// An opcode we don't handle. Kept so it can be logged and skipped
    Unsupported(i32),
}

fn pid(term: &Term) -> Result<Pid, ProtocolErr> {
    match term {
        Term::Pid(pid) => Ok(pid.into()),
        _ => Err(ProtocolErr::Malformed("expected a pid")),
    }
}

fn reference(term: &Term) -> Result<Reference, ProtocolErr> {
    match term {
        Term::Reference(reference) => Ok((&**reference).into()),
        _ => Err(ProtocolErr::Malformed("expected a reference")),
    }
}

fn name(term: &Term) -> Result<String, ProtocolErr> {
    term::as_atom(term)
        .map(str::to_string)
        .ok_or(ProtocolErr::Malformed("expected an atom"))
}

impl ControlMessage {
    /// Returns [true] if a payload term follows this control message on the wire
    pub fn has_payload(&self) -> bool {
        matches!(
            self,
            Self::Send { .. } | Self::RegSend { .. } | Self::SendSender { .. } | Self::AliasSend { .. }
        )
    }

    /// The opcode of this message
    pub fn opcode(&self) -> i32 {
        match self {
            Self::Send { .. } => SEND,
            Self::RegSend { .. } => REG_SEND,
            Self::SendSender { .. } => SEND_SENDER,
            Self::AliasSend { .. } => ALIAS_SEND,
            Self::MonitorP { .. } => MONITOR_P,
            Self::DemonitorP { .. } => DEMONITOR_P,
            Self::MonitorPExit { .. } => MONITOR_P_EXIT,
            Self::Unsupported(op) => *op,
        }
    }

    /// Encode as the control tuple
    pub fn to_term(&self) -> Term {
        let op = term::int(self.opcode());
        let elements = match self {
            Self::Send { to } => vec![op, term::atom(""), to.into()],
            Self::RegSend { from, to_name } => {
                vec![op, from.into(), term::atom(""), term::atom(to_name)]
            }
            Self::SendSender { from, to } => vec![op, from.into(), to.into()],
            Self::AliasSend { from, alias } => vec![op, from.into(), alias.into()],
            Self::MonitorP {
                from,
                to,
                reference,
            }
            | Self::DemonitorP {
                from,
                to,
                reference,
            } => vec![op, from.into(), to.to_term(), reference.into()],
            Self::MonitorPExit {
                from,
                to,
                reference,
                reason,
            } => vec![
                op,
                from.to_term(),
                to.into(),
                reference.into(),
                reason.clone(),
            ],
            Self::Unsupported(_) => vec![op],
        };
        term::tuple(elements)
    }

    /// Decode a control tuple. Unknown opcodes decode to
    /// [ControlMessage::Unsupported]; a known opcode with the wrong shape is a
    /// protocol error
    pub fn decode(control: &Term) -> Result<Self, ProtocolErr> {
        let elements = term::as_tuple(control)
            .ok_or(ProtocolErr::Malformed("control message is not a tuple"))?;
        let op = match elements.first() {
            Some(Term::FixInteger(op)) => op.value,
            _ => return Err(ProtocolErr::Malformed("control message has no opcode")),
        };
        let msg = match (op, elements) {
            (SEND, [_, _, to]) => Self::Send { to: pid(to)? },
            (REG_SEND, [_, from, _, to_name]) => Self::RegSend {
                from: pid(from)?,
                to_name: name(to_name)?,
            },
            (SEND_SENDER, [_, from, to]) => Self::SendSender {
                from: pid(from)?,
                to: pid(to)?,
            },
            (ALIAS_SEND, [_, from, alias]) => Self::AliasSend {
                from: pid(from)?,
                alias: reference(alias)?,
            },
            (MONITOR_P, [_, from, to, r]) => Self::MonitorP {
                from: pid(from)?,
                to: Subject::from_term(to)?,
                reference: reference(r)?,
            },
            (DEMONITOR_P, [_, from, to, r]) => Self::DemonitorP {
                from: pid(from)?,
                to: Subject::from_term(to)?,
                reference: reference(r)?,
            },
            (MONITOR_P_EXIT, [_, from, to, r, reason]) => Self::MonitorPExit {
                from: Subject::from_term(from)?,
                to: pid(to)?,
                reference: reference(r)?,
                reason: reason.clone(),
            },
            (SEND | REG_SEND | SEND_SENDER | ALIAS_SEND | MONITOR_P | DEMONITOR_P
            | MONITOR_P_EXIT, _) => {
                return Err(ProtocolErr::Malformed("control message has the wrong arity"))
            }
            (other, _) => Self::Unsupported(other),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn test_pid(id: u32) -> Pid {
        Pid {
            node: Arc::from("peer@localhost"),
            id,
            serial: 0,
            creation: 3,
        }
    }

    fn test_ref() -> Reference {
        Reference {
            node: Arc::from("peer@localhost"),
            creation: 3,
            id: vec![1, 2, 3],
        }
    }

    #[test]
    fn reg_send_matches_wire_shape() {
        let msg = ControlMessage::RegSend {
            from: test_pid(1),
            to_name: "echo".to_string(),
        };
        let t = msg.to_term();
        let elements = term::as_tuple(&t).expect("Not a tuple");
        assert_eq!(4, elements.len());
        assert_eq!(term::int(REG_SEND), elements[0]);
        assert!(term::is_atom(&elements[2], ""));
        assert!(term::is_atom(&elements[3], "echo"));
        assert_eq!(msg, ControlMessage::decode(&t).expect("Failed to decode"));
        assert!(msg.has_payload());
    }

    #[test]
    fn monitor_messages_decode() {
        let monitor = ControlMessage::MonitorP {
            from: test_pid(1),
            to: Subject::Name("echo".to_string()),
            reference: test_ref(),
        };
        assert!(!monitor.has_payload());
        assert_eq!(
            monitor,
            ControlMessage::decode(&monitor.to_term()).expect("Failed to decode")
        );

        let exit = ControlMessage::MonitorPExit {
            from: Subject::Pid(test_pid(2)),
            to: test_pid(1),
            reference: test_ref(),
            reason: term::atom("normal"),
        };
        assert_eq!(
            exit,
            ControlMessage::decode(&exit.to_term()).expect("Failed to decode")
        );
    }

    #[test]
    fn unknown_opcodes_are_not_errors() {
        let t = term::tuple(vec![term::int(29), term::atom("whatever")]);
        assert_eq!(
            ControlMessage::Unsupported(29),
            ControlMessage::decode(&t).expect("Failed to decode")
        );
    }

    #[test]
    fn wrong_arity_is_malformed() {
        let t = term::tuple(vec![term::int(SEND_SENDER), term::atom("x")]);
        assert!(matches!(
            ControlMessage::decode(&t),
            Err(ProtocolErr::Malformed(_))
        ));
        assert!(ControlMessage::decode(&term::atom("nope")).is_err());
    }
}
