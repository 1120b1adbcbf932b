// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The `net_kernel` responder. After connecting, peers ask the remote
//! `net_kernel` whether they're authorized (`{is_auth, Node}`); anything that
//! completed the cookie handshake is, so the answer is always `yes`.

use crate::errors::{ProcessFault, SpawnErr};
use crate::gen_server::{self, Caller, GenServer};
use crate::node::Node;
use crate::process::ProcessContext;
use crate::term::{self, Pid, Term};

/// The registered name peers address
pub const NAME: &str = "net_kernel";

struct NetKernel;

#[async_trait::async_trait]
impl GenServer for NetKernel {
    type State = ();

    async fn init(&self, _ctx: &mut ProcessContext) -> Result<(), ProcessFault> {
        Ok(())
    }

    async fn handle_call(
        &self,
        _ctx: &mut ProcessContext,
        request: Term,
        from: &Caller,
        _state: &mut (),
    ) -> Result<Option<Term>, ProcessFault> {
        match term::as_tuple(&request) {
            Some([op, node]) if term::is_atom(op, "is_auth") => {
                log::debug!("{:?} asked whether {} is authorized", from.pid, node);
                Ok(Some(term::atom("yes")))
            }
            _ => {
                log::debug!("Unsupported net_kernel call {request:?} from {}", from.pid);
                Ok(Some(term::atom("undefined")))
            }
        }
    }

    async fn handle_info(
        &self,
        _ctx: &mut ProcessContext,
        message: Term,
        _state: &mut (),
    ) -> Result<(), ProcessFault> {
        log::trace!("net_kernel ignoring {message:?}");
        Ok(())
    }
}

/// Start the responder on `node`, registered as [NAME]
pub(crate) fn start(node: &Node) -> Result<Pid, SpawnErr> {
    gen_server::start(node, Some(NAME), NetKernel)
}
