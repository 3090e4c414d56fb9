//! Handler for one-shot client connections on the data plane.
//!
//! A data connection carries exactly one of READ, STREAM, UNDO, or a
//! WRITE editing session. The naming server has already checked
//! permissions before redirecting the client here; the storage server
//! trusts the redirect (usernames are self-declared everywhere in this
//! protocol).
//!
//! WRITE drives the session through its states: parse the document,
//! validate the sentence index, take the sentence lock, loop over word
//! inserts, and commit on the ETIRW marker via write-to-temp plus rename.
//! The lock guard lives on the handler's stack, so every exit path
//! (commit, terminal error, peer close) releases it.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::protocol::message::{read_message, write_message, Message};
use crate::protocol::ops::{OpError, Opcode, Status};
use crate::storage::edit::EditBuffer;
use crate::storage::StorageState;

/// Word-update payload that commits the session.
const COMMIT_MARKER: &str = "ETIRW";

/// Pacing delay between streamed words. A presentation choice, not a
/// throughput limit: clients render the stream at this cadence.
const STREAM_WORD_DELAY: Duration = Duration::from_millis(100);

/// Serves one accepted data-plane connection to completion.
pub async fn serve_data(state: Arc<StorageState>, mut socket: TcpStream) -> anyhow::Result<()> {
    let req = read_message(&mut socket).await?;
    debug!("data-plane {:?} on '{}' from '{}'", req.opcode, req.filename, req.username);
    match req.opcode {
        Opcode::Read => read_file(&state, &mut socket, &req).await,
        Opcode::Stream => stream_file(&state, &mut socket, &req).await,
        Opcode::Undo => undo_file(&state, &mut socket, &req).await,
        Opcode::Write => edit_session(&state, &mut socket, req).await,
        other => {
            let err = OpError::invalid(format!("{other:?} is not a data-plane operation"));
            write_message(&mut socket, &Message::error(&req, &err)).await?;
            Ok(())
        }
    }
}

/// READ: the whole file in one response, bounded by the data field.
async fn read_file(
    state: &StorageState,
    socket: &mut TcpStream,
    req: &Message,
) -> anyhow::Result<()> {
    let response = match state.store.read(&req.filename).await {
        Ok(bytes) => {
            let mut response = Message::reply(req, Status::Success);
            response.set_data(&bytes);
            response
        }
        Err(err) => Message::error(req, &err),
    };
    write_message(socket, &response).await?;
    Ok(())
}

/// STREAM: one Data record per word, a `"\n"` record at each original
/// line boundary, then the Success stop packet. Cancellation is the peer
/// closing; the write error simply ends the handler.
async fn stream_file(
    state: &StorageState,
    socket: &mut TcpStream,
    req: &Message,
) -> anyhow::Result<()> {
    let bytes = match state.store.read(&req.filename).await {
        Ok(bytes) => bytes,
        Err(err) => {
            write_message(socket, &Message::error(req, &err)).await?;
            return Ok(());
        }
    };
    let text = String::from_utf8_lossy(&bytes);
    for segment in text.split_inclusive('\n') {
        let line = segment.trim_end_matches(['\n', '\r']);
        for word in line.split_whitespace() {
            let mut frame = Message::reply(req, Status::Data);
            frame.set_text(word);
            write_message(socket, &frame).await?;
            tokio::time::sleep(STREAM_WORD_DELAY).await;
        }
        if segment.ends_with('\n') {
            let mut frame = Message::reply(req, Status::Data);
            frame.set_text("\n");
            write_message(socket, &frame).await?;
        }
    }
    // stop packet: Success with empty data
    write_message(socket, &Message::reply(req, Status::Success)).await?;
    Ok(())
}

/// UNDO: swap the live bytes with the single backup snapshot, one step
/// only: a second undo without an intervening committed write is
/// refused.
async fn undo_file(
    state: &StorageState,
    socket: &mut TcpStream,
    req: &Message,
) -> anyhow::Result<()> {
    let name = req.filename.as_str();
    let result = async {
        if state.undo_blocked(name) {
            return Err(OpError::invalid("consecutive undo; write something first"));
        }
        let current = state.store.read(name).await?;
        let backup = state.store.read_backup(name).await?;
        state.store.replace(name, &backup).await?;
        state.store.replace_backup(name, &current).await?;
        state.set_undo_flag(name);
        info!("undid last write on '{}'", name);
        Ok(Message::ok(req, format!("file '{name}' restored to its previous version")))
    }
    .await;
    let response = match result {
        Ok(response) => response,
        Err(err) => Message::error(req, &err),
    };
    write_message(socket, &response).await?;
    Ok(())
}

/// WRITE: the sentence editing session.
async fn edit_session(
    state: &StorageState,
    socket: &mut TcpStream,
    req: Message,
) -> anyhow::Result<()> {
    let name = req.filename.clone();
    let user = req.username.clone();

    let original = match state.store.read(&name).await {
        Ok(bytes) => bytes,
        Err(err) => {
            write_message(socket, &Message::error(&req, &err)).await?;
            return Ok(());
        }
    };
    let text = String::from_utf8_lossy(&original).into_owned();
    let mut buffer = match EditBuffer::open(&text, req.sentence_num) {
        Ok(buffer) => buffer,
        Err(err) => {
            write_message(socket, &Message::error(&req, &err)).await?;
            return Ok(());
        }
    };

    // The guard's drop is the release on every exit path below.
    let _guard = match state.locks.try_acquire(&name, buffer.current_index(), &user) {
        Ok(guard) => guard,
        Err(holder) => {
            debug!(
                "lock conflict on '{}' sentence {}: held by '{}'",
                name,
                buffer.current_index(),
                holder.username
            );
            let mut response = Message::reply(&req, Status::FileLocked);
            response.set_text(&holder.username);
            write_message(socket, &response).await?;
            return Ok(());
        }
    };

    let mut ack = Message::reply(&req, Status::Success);
    ack.sentence_num = req.sentence_num;
    ack.word_index = buffer.current_word_count() as i64;
    ack.set_text(buffer.current_sentence());
    write_message(socket, &ack).await?;

    loop {
        let update = match read_message(socket).await {
            Ok(update) => update,
            Err(_) => {
                debug!("editing session on '{}' ended by peer", name);
                return Ok(());
            }
        };
        if update.opcode != Opcode::Write {
            let err = OpError::invalid("expected a word update or the commit marker");
            write_message(socket, &Message::error(&update, &err)).await?;
            continue;
        }
        let payload = update.text();
        if payload == COMMIT_MARKER {
            let content = buffer.document();
            let committed = async {
                state.store.replace_backup(&name, &original).await?;
                state.store.replace(&name, content.as_bytes()).await
            }
            .await;
            let response = match committed {
                Ok(()) => {
                    state.clear_undo_flag(&name);
                    info!("committed {} bytes to '{}'", content.len(), name);
                    let mut response = Message::reply(&update, Status::Success);
                    response.set_text(&content);
                    response
                }
                Err(err) => Message::error(&update, &err),
            };
            write_message(socket, &response).await?;
            return Ok(());
        }

        let response = match buffer.insert(update.word_index, &payload) {
            Ok(()) => {
                let mut response = Message::reply(&update, Status::Success);
                response.sentence_num = buffer.current_index() as i64;
                response.word_index = buffer.current_word_count() as i64;
                response.set_text(buffer.current_sentence());
                response
            }
            // range errors are not terminal; the session continues
            Err(err) => Message::error(&update, &err),
        };
        write_message(socket, &response).await?;
    }
}
