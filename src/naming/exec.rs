//! Server-side script execution for the EXEC operation.
//!
//! EXEC runs a stored file's contents under the local shell on the
//! naming host, a deliberate trust hole inherited from the protocol, so
//! the whole path sits behind the `enable_exec` configuration flag and is
//! refused unless a deployment opts in.
//!
//! The naming server fetches the file over the data plane exactly like a
//! client would, writes the bytes to a private temp script, runs it with
//! `sh`, and returns stdout and stderr bounded by the record's data
//! capacity.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::naming::pool::SsEndpoint;
use crate::protocol::message::{read_message, write_message, Message, DATA_CAP};
use crate::protocol::ops::{OpError, OpResult, Opcode};

static SCRIPT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Fetches `filename` from its home server and runs it as a shell script.
pub async fn execute_script(
    endpoint: &SsEndpoint,
    username: &str,
    filename: &str,
) -> OpResult<String> {
    let script = fetch_file(endpoint, username, filename).await?;

    let path = std::env::temp_dir().join(format!(
        "scribefs-exec-{}-{}",
        std::process::id(),
        SCRIPT_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    tokio::fs::write(&path, &script)
        .await
        .map_err(|err| OpError::server(format!("could not stage script: {err}")))?;
    debug!("running '{}' as {}", filename, path.display());

    let output = tokio::process::Command::new("sh").arg(&path).output().await;
    if let Err(err) = tokio::fs::remove_file(&path).await {
        warn!("could not remove staged script {}: {}", path.display(), err);
    }
    let output = output.map_err(|err| OpError::server(format!("could not run script: {err}")))?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    combined.truncate(DATA_CAP);
    Ok(String::from_utf8_lossy(&combined).into_owned())
}

/// One-shot data-plane read, the same way a client performs it.
async fn fetch_file(
    endpoint: &SsEndpoint,
    username: &str,
    filename: &str,
) -> OpResult<Vec<u8>> {
    let addr = format!("{}:{}", endpoint.ip, endpoint.client_port);
    let mut socket = TcpStream::connect(&addr)
        .await
        .map_err(|err| OpError::unavailable(format!("cannot reach {addr}: {err}")))?;
    let mut request = Message::request(Opcode::Read);
    request.username = username.to_string();
    request.filename = filename.to_string();
    write_message(&mut socket, &request)
        .await
        .map_err(|err| OpError::unavailable(format!("data-plane send failed: {err}")))?;
    let reply = read_message(&mut socket)
        .await
        .map_err(|err| OpError::unavailable(format!("data-plane read failed: {err}")))?;
    if !reply.status.is_ok() {
        return Err(OpError::new(reply.status, reply.text()));
    }
    Ok(reply.data)
}
