//! The request router: one task per accepted naming-server connection.
//!
//! A connection starts unauthenticated. Its first record decides what it
//! is: REGISTER_SS turns it into a storage control channel and parks it
//! with the pool's worker; REGISTER_CLIENT opens a session and enters the
//! command loop. Every subsequent request produces exactly one response:
//! handlers return `OpResult<Message>` and the single serializer at the
//! bottom of the loop turns an error into its response record.
//!
//! Field conventions on requests: the record's username names the *target*
//! user for access operations (the requester is always the session owner);
//! CREATE may carry an explicit storage-server id as text in the data
//! field; SEARCH carries its pattern in the filename field.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::naming::registry::{FileRecord, FileStats};
use crate::naming::sessions::fmt_age;
use crate::naming::{exec, Coordinator};
use crate::protocol::message::{
    read_message, write_message, Message, SsRegistration, USERNAME_WIDTH,
};
use crate::protocol::ops::{flags, OpError, OpResult, Opcode, Status};
use crate::storage::store::validate_name;

/// Serves one accepted connection to completion.
pub async fn serve_connection(
    coordinator: Arc<Coordinator>,
    mut socket: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let first = read_message(&mut socket).await?;
    match first.opcode {
        Opcode::RegisterSs => register_storage(coordinator, socket, peer, first).await,
        Opcode::RegisterClient => client_session(coordinator, socket, peer, first).await,
        other => {
            debug!("rejecting {:?} from unauthenticated peer {}", other, peer);
            let err = OpError::invalid("register as a client or storage server first");
            write_message(&mut socket, &Message::error(&first, &err)).await?;
            Ok(())
        }
    }
}

/// REGISTER_SS: merge the advertised file list, acknowledge, then hand
/// the socket to the pool as the server's persistent control channel.
async fn register_storage(
    coordinator: Arc<Coordinator>,
    mut socket: TcpStream,
    peer: SocketAddr,
    first: Message,
) -> anyhow::Result<()> {
    let registration = match SsRegistration::unpack(&first.data) {
        Ok(reg) if !reg.ss_id.is_empty() => reg,
        Ok(_) => {
            let err = OpError::invalid("registration carries no server id");
            write_message(&mut socket, &Message::error(&first, &err)).await?;
            return Ok(());
        }
        Err(err) => {
            let err = OpError::invalid(format!("bad registration payload: {err}"));
            write_message(&mut socket, &Message::error(&first, &err)).await?;
            return Ok(());
        }
    };

    let ip = if registration.advertise_ip.is_empty() {
        peer.ip().to_string()
    } else {
        registration.advertise_ip.clone()
    };
    coordinator.registry.merge_advertised(&registration.ss_id, &registration.files);
    coordinator.search.invalidate_all();

    let mut ack = Message::reply(&first, Status::Success);
    ack.set_text(&format!("storage server '{}' registered", registration.ss_id));
    write_message(&mut socket, &ack).await?;

    info!(
        "storage server '{}' registered from {} ({} files, data {}:{}, control {})",
        registration.ss_id,
        peer,
        registration.files.len(),
        ip,
        registration.client_port,
        registration.control_port
    );
    coordinator.pool.register_or_rebind(
        &registration.ss_id,
        ip,
        registration.client_port as u16,
        registration.control_port as u16,
        socket,
    );
    Ok(())
}

/// REGISTER_CLIENT: open the session (rejecting duplicates), then loop
/// over commands until the peer hangs up.
async fn client_session(
    coordinator: Arc<Coordinator>,
    mut socket: TcpStream,
    peer: SocketAddr,
    first: Message,
) -> anyhow::Result<()> {
    let username = first.username.trim().to_string();
    if username.is_empty() || username.len() > USERNAME_WIDTH {
        let err = OpError::invalid("invalid username");
        write_message(&mut socket, &Message::error(&first, &err)).await?;
        return Ok(());
    }
    if let Err(err) = coordinator.sessions.login(&username, &peer.ip().to_string()) {
        warn!("duplicate login for '{}' from {}", username, peer);
        write_message(&mut socket, &Message::error(&first, &err)).await?;
        return Ok(());
    }
    info!("user '{}' logged in from {}", username, peer);

    let mut welcome = Message::reply(&first, Status::Success);
    welcome.set_text(&format!("Welcome, {username}."));
    let session = async {
        write_message(&mut socket, &welcome).await?;
        loop {
            let request = match read_message(&mut socket).await {
                Ok(request) => request,
                Err(_) => break,
            };
            let response = dispatch(&coordinator, &username, &request).await;
            write_message(&mut socket, &response).await?;
        }
        Ok::<(), std::io::Error>(())
    }
    .await;

    coordinator.sessions.logout(&username);
    info!("user '{}' logged out", username);
    session?;
    Ok(())
}

/// Routes one authenticated request and serializes its outcome.
async fn dispatch(coordinator: &Coordinator, user: &str, req: &Message) -> Message {
    let result = match req.opcode {
        Opcode::Create => coordinator.op_create(user, req).await,
        Opcode::Delete => coordinator.op_delete(user, req).await,
        Opcode::View => coordinator.op_view(user, req).await,
        Opcode::Info => coordinator.op_info(user, req).await,
        Opcode::ListUsers => coordinator.op_list_users(req),
        Opcode::ListSs => coordinator.op_list_ss(req),
        Opcode::AddAccess => coordinator.op_add_access(user, req),
        Opcode::RemAccess => coordinator.op_rem_access(user, req),
        Opcode::Search => coordinator.op_search(user, req),
        Opcode::CreateFolder => coordinator.op_create_folder(user, req).await,
        Opcode::Move => coordinator.op_move(user, req).await,
        Opcode::ViewFolder => coordinator.op_view_folder(user, req),
        Opcode::Checkpoint => coordinator.op_checkpoint(user, req).await,
        Opcode::ViewCheckpoint => coordinator.op_view_checkpoint(user, req).await,
        Opcode::Revert => coordinator.op_revert(user, req).await,
        Opcode::ListCheckpoints => coordinator.op_list_checkpoints(user, req),
        Opcode::RequestAccess => coordinator.op_request_access(user, req),
        Opcode::ViewRequests => coordinator.op_view_requests(user, req),
        Opcode::RespondRequest => coordinator.op_respond_request(user, req),
        Opcode::Exec => coordinator.op_exec(user, req).await,
        Opcode::Read | Opcode::Stream => coordinator.op_redirect(user, req, false),
        Opcode::Write | Opcode::Undo => coordinator.op_redirect(user, req, true),
        Opcode::Replicate => Err(OpError::invalid("replication is reserved")),
        Opcode::RegisterClient => Err(OpError::invalid("already logged in")),
        Opcode::RegisterSs | Opcode::Heartbeat | Opcode::Shutdown => {
            Err(OpError::invalid("not a client operation"))
        }
    };
    match result {
        Ok(response) => response,
        Err(err) => {
            debug!("{:?} for '{}' failed: {}", req.opcode, user, err);
            Message::error(req, &err)
        }
    }
}

/// Parses an SS INFO reply of the form `<size>:<words>:<chars>`.
fn parse_stats(text: &str) -> Option<FileStats> {
    let mut parts = text.trim().splitn(3, ':');
    let size = parts.next()?.parse().ok()?;
    let words = parts.next()?.parse().ok()?;
    let chars = parts.next()?.parse().ok()?;
    Some(FileStats { size, words, chars })
}

impl Coordinator {
    /// Forwards one control command to a storage server and lifts an
    /// error status in its reply into an `OpError`.
    async fn forward(&self, ss_id: &str, msg: Message) -> OpResult<Message> {
        let reply = self.pool.send_control(ss_id, msg).await?;
        if reply.status.is_ok() {
            Ok(reply)
        } else {
            Err(OpError::new(reply.status, reply.text()))
        }
    }

    /// Refreshes a file's cached statistics from its home server.
    async fn refresh_stats(&self, name: &str, ss_id: &str) -> OpResult<FileStats> {
        let mut probe = Message::request(Opcode::Info);
        probe.filename = name.to_string();
        let reply = self.forward(ss_id, probe).await?;
        let stats = parse_stats(&reply.text())
            .ok_or_else(|| OpError::server("malformed statistics from storage server"))?;
        self.registry.set_stats(name, stats);
        Ok(stats)
    }

    async fn op_create(&self, user: &str, req: &Message) -> OpResult<Message> {
        let name = req.filename.trim();
        validate_name(name)?;
        if self.registry.contains(name) {
            return Err(OpError::new(Status::FileExists, format!("file '{name}' already exists")));
        }
        let requested = req.text().trim().to_string();
        let ss_id = if requested.is_empty() {
            self.pool
                .pick_default()
                .ok_or_else(|| OpError::unavailable("no active storage server"))?
        } else {
            // fail fast before touching the control channel
            self.pool.endpoint(&requested)?;
            requested
        };

        let mut cmd = Message::request(Opcode::Create);
        cmd.filename = name.to_string();
        self.forward(&ss_id, cmd).await?;

        self.registry.insert(FileRecord::new(name, user, ss_id.as_str()))?;
        self.search.invalidate_all();
        Ok(Message::ok(req, format!("file '{name}' created on '{ss_id}'")))
    }

    async fn op_delete(&self, user: &str, req: &Message) -> OpResult<Message> {
        let name = req.filename.as_str();
        self.registry.require_owner(name, user)?;
        let ss_id = self.registry.home_of(name)?;

        let mut cmd = Message::request(Opcode::Delete);
        cmd.filename = name.to_string();
        let reply = self.pool.send_control(&ss_id, cmd).await?;
        if !reply.status.is_ok() && reply.status != Status::FileNotFound {
            return Err(OpError::new(reply.status, reply.text()));
        }

        self.registry.remove(name)?;
        self.search.invalidate_all();
        Ok(Message::ok(req, format!("file '{name}' deleted")))
    }

    async fn op_view(&self, user: &str, req: &Message) -> OpResult<Message> {
        let all = req.flags & flags::VIEW_ALL != 0;
        let long = req.flags & flags::VIEW_LONG != 0;
        let mut rows = self.registry.visible_files(user, all);
        if long {
            for row in &mut rows {
                if !row.accessible {
                    continue;
                }
                match self.refresh_stats(&row.name, &row.ss_id).await {
                    Ok(stats) => row.stats = Some(stats),
                    Err(err) => debug!("stat refresh for '{}' failed: {}", row.name, err),
                }
            }
        }
        let mut listing = String::new();
        for row in &rows {
            let marker = if row.accessible { "" } else { " [no access]" };
            let place =
                if row.folder.is_empty() { String::new() } else { format!(" in /{}", row.folder) };
            match (long, row.stats) {
                (true, Some(stats)) => listing.push_str(&format!(
                    "{} (owner {}, ss {}{place}) {}B {}w {}c{marker}\n",
                    row.name, row.owner, row.ss_id, stats.size, stats.words, stats.chars
                )),
                _ => listing.push_str(&format!(
                    "{} (owner {}, ss {}{place}){marker}\n",
                    row.name, row.owner, row.ss_id
                )),
            }
        }
        if listing.is_empty() {
            listing.push_str("no files\n");
        }
        Ok(Message::ok(req, listing))
    }

    async fn op_info(&self, user: &str, req: &Message) -> OpResult<Message> {
        let name = req.filename.as_str();
        self.registry.require_permission(name, user, false)?;
        let ss_id = self.registry.home_of(name)?;
        let stats = self.refresh_stats(name, &ss_id).await?;
        self.registry.touch_accessed(name);

        let text = self.registry.with_file(name, |rec| {
            let mut text = format!(
                "{}\n  owner: {}\n  storage: {}\n  folder: /{}\n  created {}, modified {}, accessed {}\n  {} bytes, {} words, {} chars\n",
                rec.name,
                rec.owner,
                rec.ss_id,
                rec.folder,
                fmt_age(rec.created),
                fmt_age(rec.modified),
                fmt_age(rec.accessed),
                stats.size,
                stats.words,
                stats.chars
            );
            if rec.owner == user {
                text.push_str("  access:\n");
                if rec.acl.is_empty() {
                    text.push_str("    (owner only)\n");
                }
                for entry in &rec.acl {
                    let cap = match (entry.read, entry.write) {
                        (_, true) => "read+write",
                        (true, false) => "read",
                        (false, false) => "none",
                    };
                    text.push_str(&format!("    {} ({cap})\n", entry.username));
                }
            }
            text
        })?;
        Ok(Message::ok(req, text))
    }

    fn op_list_users(&self, req: &Message) -> OpResult<Message> {
        let mut listing = String::new();
        for session in self.sessions.snapshot() {
            listing.push_str(&format!(
                "{} from {} (logged in {})\n",
                session.username,
                session.peer,
                fmt_age(session.login_time)
            ));
        }
        if listing.is_empty() {
            listing.push_str("no active users\n");
        }
        Ok(Message::ok(req, listing))
    }

    fn op_list_ss(&self, req: &Message) -> OpResult<Message> {
        let mut listing = String::new();
        for status in self.pool.snapshot() {
            let state = match (status.active, status.failed) {
                (true, false) => "active",
                (_, true) => "failed",
                (false, false) => "inactive",
            };
            listing.push_str(&format!(
                "{} at {}:{} (control {}) [{}] heartbeat {}s ago\n",
                status.id,
                status.ip,
                status.client_port,
                status.control_port,
                state,
                status.last_heartbeat.elapsed().as_secs()
            ));
        }
        if listing.is_empty() {
            listing.push_str("no storage servers\n");
        }
        Ok(Message::ok(req, listing))
    }

    fn op_add_access(&self, user: &str, req: &Message) -> OpResult<Message> {
        let name = req.filename.as_str();
        let target = req.username.trim();
        if target.is_empty() {
            return Err(OpError::invalid("no target user named"));
        }
        self.registry.require_owner(name, user)?;
        let read = req.flags & flags::ACCESS_READ != 0;
        let write = req.flags & flags::ACCESS_WRITE != 0;
        if !read && !write {
            return Err(OpError::invalid("no access bits requested"));
        }
        self.registry.add_access(name, target, read, write)?;
        self.search.invalidate_all();
        Ok(Message::ok(req, format!("'{target}' granted access to '{name}'")))
    }

    fn op_rem_access(&self, user: &str, req: &Message) -> OpResult<Message> {
        let name = req.filename.as_str();
        let target = req.username.trim();
        self.registry.require_owner(name, user)?;
        self.registry.remove_access(name, target)?;
        self.search.invalidate_all();
        Ok(Message::ok(req, format!("'{target}' removed from '{name}'")))
    }

    fn op_search(&self, user: &str, req: &Message) -> OpResult<Message> {
        let pattern = req.filename.trim();
        if pattern.is_empty() {
            return Err(OpError::invalid("empty search pattern"));
        }
        if let Some(cached) = self.search.get(user, pattern) {
            debug!("search cache hit for '{}'", pattern);
            return Ok(Message::ok(req, cached));
        }
        let names = self.registry.readable_names(user);
        let matches = crate::naming::search::match_names(&names, pattern);
        let result = if matches.is_empty() {
            format!("no files match '{pattern}'\n")
        } else {
            let mut out = String::new();
            for name in &matches {
                out.push_str(name);
                out.push('\n');
            }
            out
        };
        self.search.put(user, pattern, result.clone());
        Ok(Message::ok(req, result))
    }

    async fn op_create_folder(&self, user: &str, req: &Message) -> OpResult<Message> {
        let path = req.filename.trim().trim_matches('/');
        self.registry.create_folder(path, user)?;
        // Materialize the folder on the USE default best-effort; MOVE and
        // CREATE create directories on demand anyway.
        if let Some(ss_id) = self.pool.pick_default() {
            let mut cmd = Message::request(Opcode::CreateFolder);
            cmd.filename = path.to_string();
            if let Err(err) = self.forward(&ss_id, cmd).await {
                debug!("folder materialization on '{}' failed: {}", ss_id, err);
            }
        }
        Ok(Message::ok(req, format!("folder '{path}' created")))
    }

    async fn op_move(&self, user: &str, req: &Message) -> OpResult<Message> {
        let name = req.filename.as_str();
        let folder = req.folder.trim().trim_matches('/');
        self.registry.require_permission(name, user, true)?;
        if !self.registry.folder_exists(folder) {
            return Err(OpError::new(
                Status::FolderNotFound,
                format!("folder '{folder}' does not exist"),
            ));
        }
        let ss_id = self.registry.home_of(name)?;

        let mut cmd = Message::request(Opcode::Move);
        cmd.filename = name.to_string();
        cmd.folder = folder.to_string();
        self.forward(&ss_id, cmd).await?;

        self.registry.move_file(name, folder)?;
        let shown = if folder.is_empty() { "/" } else { folder };
        Ok(Message::ok(req, format!("file '{name}' moved to '{shown}'")))
    }

    fn op_view_folder(&self, _user: &str, req: &Message) -> OpResult<Message> {
        let folder = req.folder.trim().trim_matches('/');
        if !self.registry.folder_exists(folder) {
            return Err(OpError::new(
                Status::FolderNotFound,
                format!("folder '{folder}' does not exist"),
            ));
        }
        let mut listing = String::new();
        for sub in self.registry.subfolders(folder) {
            listing.push_str(&format!("{sub}/\n"));
        }
        for row in self.registry.files_in_folder(folder) {
            listing.push_str(&format!("{} (owner {})\n", row.name, row.owner));
        }
        if listing.is_empty() {
            listing.push_str("empty folder\n");
        }
        Ok(Message::ok(req, listing))
    }

    async fn op_checkpoint(&self, user: &str, req: &Message) -> OpResult<Message> {
        let name = req.filename.as_str();
        let tag = req.checkpoint_tag.trim();
        if tag.is_empty() {
            return Err(OpError::invalid("empty checkpoint tag"));
        }
        self.registry.require_permission(name, user, true)?;
        if self.registry.find_checkpoint(name, tag).is_ok() {
            return Err(OpError::invalid(format!("checkpoint '{tag}' already exists")));
        }
        let ss_id = self.registry.home_of(name)?;

        let mut cmd = Message::request(Opcode::Checkpoint);
        cmd.filename = name.to_string();
        cmd.checkpoint_tag = tag.to_string();
        let reply = self.forward(&ss_id, cmd).await?;
        let size = reply.text().trim().parse().unwrap_or(0);

        self.registry.add_checkpoint(name, tag, user, size)?;
        Ok(Message::ok(req, format!("checkpoint '{tag}' recorded ({size} bytes)")))
    }

    async fn op_view_checkpoint(&self, user: &str, req: &Message) -> OpResult<Message> {
        let name = req.filename.as_str();
        let tag = req.checkpoint_tag.trim();
        self.registry.require_permission(name, user, false)?;
        self.registry.find_checkpoint(name, tag)?;
        let ss_id = self.registry.home_of(name)?;

        let mut cmd = Message::request(Opcode::ViewCheckpoint);
        cmd.filename = name.to_string();
        cmd.checkpoint_tag = tag.to_string();
        let reply = self.forward(&ss_id, cmd).await?;

        let mut response = Message::reply(req, Status::Success);
        response.checkpoint_tag = tag.to_string();
        response.set_data(&reply.data);
        Ok(response)
    }

    async fn op_revert(&self, user: &str, req: &Message) -> OpResult<Message> {
        let name = req.filename.as_str();
        let tag = req.checkpoint_tag.trim();
        self.registry.require_permission(name, user, true)?;
        self.registry.find_checkpoint(name, tag)?;
        let ss_id = self.registry.home_of(name)?;

        let mut cmd = Message::request(Opcode::Revert);
        cmd.filename = name.to_string();
        cmd.checkpoint_tag = tag.to_string();
        self.forward(&ss_id, cmd).await?;

        self.registry.touch_modified(name);
        Ok(Message::ok(req, format!("file '{name}' reverted to '{tag}'")))
    }

    fn op_list_checkpoints(&self, user: &str, req: &Message) -> OpResult<Message> {
        let name = req.filename.as_str();
        self.registry.require_permission(name, user, false)?;
        let checkpoints = self.registry.list_checkpoints(name)?;
        let mut listing = String::new();
        for meta in &checkpoints {
            listing.push_str(&format!(
                "{} by {} ({} bytes, {})\n",
                meta.tag,
                meta.creator,
                meta.size,
                fmt_age(meta.created)
            ));
        }
        if listing.is_empty() {
            listing.push_str("no checkpoints\n");
        }
        Ok(Message::ok(req, listing))
    }

    fn op_request_access(&self, user: &str, req: &Message) -> OpResult<Message> {
        let name = req.filename.as_str();
        let is_owner = self.registry.with_file(name, |rec| rec.owner == user)?;
        if is_owner {
            return Err(OpError::invalid("you already own this file"));
        }
        let read = req.flags & flags::ACCESS_READ != 0;
        let write = req.flags & flags::ACCESS_WRITE != 0;
        if !read && !write {
            return Err(OpError::invalid("no access bits requested"));
        }
        let id = self.next_request_id();
        self.registry.enqueue_request(name, user, read, write, id)?;
        let mut response = Message::ok(req, format!("access request #{id} queued"));
        response.request_id = id;
        Ok(response)
    }

    fn op_view_requests(&self, user: &str, req: &Message) -> OpResult<Message> {
        let name = req.filename.as_str();
        self.registry.require_owner(name, user)?;
        let pending = self.registry.pending_requests(name)?;
        if pending.is_empty() {
            return Err(OpError::new(Status::NoPendingRequests, "no pending access requests"));
        }
        let mut listing = String::new();
        for request in &pending {
            let wanted = if request.write { "read+write" } else { "read" };
            listing.push_str(&format!(
                "#{} {} wants {} ({})\n",
                request.id,
                request.requester,
                wanted,
                fmt_age(request.created)
            ));
        }
        Ok(Message::ok(req, listing))
    }

    fn op_respond_request(&self, user: &str, req: &Message) -> OpResult<Message> {
        let name = req.filename.as_str();
        self.registry.require_owner(name, user)?;
        let approve = req.flags & flags::APPROVE != 0;
        let request = self.registry.resolve_request(name, req.request_id, approve)?;
        if approve {
            self.search.invalidate_all();
        }
        let verdict = if approve { "approved" } else { "denied" };
        let mut response = Message::ok(
            req,
            format!("request #{} from '{}' {verdict}", request.id, request.requester),
        );
        response.request_id = request.id;
        Ok(response)
    }

    async fn op_exec(&self, user: &str, req: &Message) -> OpResult<Message> {
        if !self.config.enable_exec {
            return Err(OpError::permission_denied(
                "EXEC is disabled; set enable_exec in the server configuration to allow it",
            ));
        }
        let name = req.filename.as_str();
        self.registry.require_permission(name, user, false)?;
        let ss_id = self.registry.home_of(name)?;
        let endpoint = self.pool.endpoint(&ss_id)?;
        let output = exec::execute_script(&endpoint, user, name).await?;
        Ok(Message::ok(req, output))
    }

    /// READ / WRITE / STREAM / UNDO: after the permission check the client
    /// is redirected to the file's home server; the naming server is not
    /// involved again until the next command.
    fn op_redirect(&self, user: &str, req: &Message, need_write: bool) -> OpResult<Message> {
        let name = req.filename.as_str();
        self.registry.require_permission(name, user, need_write)?;
        let ss_id = self.registry.home_of(name)?;
        let endpoint = self.pool.endpoint(&ss_id)?;
        if need_write {
            self.registry.touch_modified(name);
        } else {
            self.registry.touch_accessed(name);
        }
        let mut response = Message::reply(req, Status::SsInfo);
        response.ss_ip = endpoint.ip;
        response.ss_port = endpoint.client_port as u32;
        Ok(response)
    }
}
