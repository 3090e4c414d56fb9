//! Handler for naming-server commands on the persistent control socket.
//!
//! Each command is one record in, one record out, processed strictly in
//! arrival order; the naming server guarantees a single request in
//! flight per storage server, and this handler never reorders. SHUTDOWN
//! acknowledges first, then tells the caller to stop serving.

use tracing::{debug, info};

use crate::protocol::message::Message;
use crate::protocol::ops::{OpError, OpResult, Opcode, Status};
use crate::storage::StorageState;

/// What the control loop should do after a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlFlow {
    Continue,
    Shutdown,
}

/// Executes one control command and builds its response record.
pub async fn handle_control(state: &StorageState, req: &Message) -> (Message, ControlFlow) {
    if req.opcode == Opcode::Shutdown {
        info!("shutdown requested by the naming server");
        return (Message::reply(req, Status::Ack), ControlFlow::Shutdown);
    }
    let response = match execute(state, req).await {
        Ok(response) => response,
        Err(err) => {
            debug!("control {:?} on '{}' failed: {}", req.opcode, req.filename, err);
            Message::error(req, &err)
        }
    };
    (response, ControlFlow::Continue)
}

async fn execute(state: &StorageState, req: &Message) -> OpResult<Message> {
    match req.opcode {
        Opcode::Heartbeat => Ok(Message::ok(req, "alive")),
        Opcode::Create => {
            state.store.create(&req.filename).await?;
            Ok(Message::ok(req, format!("file '{}' created", req.filename)))
        }
        Opcode::Delete => {
            state.store.delete(&req.filename).await?;
            state.clear_undo_flag(&req.filename);
            Ok(Message::ok(req, format!("file '{}' deleted", req.filename)))
        }
        Opcode::CreateFolder => {
            state.store.create_folder(&req.filename).await?;
            Ok(Message::ok(req, format!("folder '{}' created", req.filename)))
        }
        Opcode::Move => {
            state.store.relocate(&req.filename, req.folder.trim_matches('/')).await?;
            Ok(Message::ok(req, format!("file '{}' moved", req.filename)))
        }
        Opcode::Checkpoint => {
            let size = state.store.checkpoint(&req.filename, &req.checkpoint_tag).await?;
            Ok(Message::ok(req, size.to_string()))
        }
        Opcode::ViewCheckpoint => {
            let bytes = state.store.read_checkpoint(&req.filename, &req.checkpoint_tag).await?;
            let mut response = Message::reply(req, Status::Success);
            response.set_data(&bytes);
            Ok(response)
        }
        Opcode::Revert => {
            state.store.revert(&req.filename, &req.checkpoint_tag).await?;
            Ok(Message::ok(req, format!("file '{}' reverted", req.filename)))
        }
        Opcode::Info => {
            let (size, words, chars) = state.store.stats(&req.filename).await?;
            Ok(Message::ok(req, format!("{size}:{words}:{chars}")))
        }
        other => Err(OpError::invalid(format!("{other:?} is not a control operation"))),
    }
}
