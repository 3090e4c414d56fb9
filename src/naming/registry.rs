//! The metadata registry: the naming server's authoritative map of files,
//! folders, ACLs, checkpoint metadata and access requests.
//!
//! Records are owning values: ACL entries, checkpoints and pending
//! requests are plain vectors inside [`FileRecord`]. The registry exposes
//! metadata-only operations guarded by two internal locks (files, then
//! folders, always in that order); nothing here performs network or disk
//! I/O, so no lock is ever held across a suspension point.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::protocol::ops::{OpError, OpResult, Status};

/// Cached size/word/char statistics, refreshed lazily from the home SS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileStats {
    pub size: u64,
    pub words: u64,
    pub chars: u64,
}

/// One ACL entry. The owner never appears here; ownership implies both
/// capabilities and cannot be revoked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessEntry {
    pub username: String,
    pub read: bool,
    pub write: bool,
}

/// Metadata of one named checkpoint; the bytes live on the home SS.
#[derive(Clone, Debug)]
pub struct CheckpointMeta {
    pub tag: String,
    pub creator: String,
    pub created: SystemTime,
    pub size: u64,
}

/// Lifecycle of an access request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
}

/// A queued request for access to someone else's file.
#[derive(Clone, Debug)]
pub struct AccessRequest {
    pub id: u64,
    pub requester: String,
    pub read: bool,
    pub write: bool,
    pub status: RequestStatus,
    pub created: SystemTime,
}

/// Authoritative record of one file.
#[derive(Clone, Debug)]
pub struct FileRecord {
    pub name: String,
    pub owner: String,
    pub ss_id: String,
    pub folder: String,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
    pub stats: Option<FileStats>,
    pub acl: Vec<AccessEntry>,
    pub checkpoints: Vec<CheckpointMeta>,
    pub requests: Vec<AccessRequest>,
}

impl FileRecord {
    pub fn new(name: impl Into<String>, owner: impl Into<String>, ss_id: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            name: name.into(),
            owner: owner.into(),
            ss_id: ss_id.into(),
            folder: String::new(),
            created: now,
            modified: now,
            accessed: now,
            stats: None,
            acl: Vec::new(),
            checkpoints: Vec::new(),
            requests: Vec::new(),
        }
    }

    /// Permission check: the owner always passes; everyone else needs a
    /// matching ACL entry. Lookup is linear and case-sensitive.
    pub fn allows(&self, username: &str, need_write: bool) -> bool {
        if self.owner == username {
            return true;
        }
        self.acl
            .iter()
            .find(|e| e.username == username)
            .is_some_and(|e| if need_write { e.write } else { e.read })
    }
}

/// A folder known to the naming server. The root ("") always exists and
/// has no record.
#[derive(Clone, Debug)]
pub struct FolderRecord {
    pub path: String,
    pub owner: String,
    pub created: SystemTime,
}

/// Summary row emitted by VIEW and folder listings.
#[derive(Clone, Debug)]
pub struct FileSummary {
    pub name: String,
    pub owner: String,
    pub ss_id: String,
    pub folder: String,
    pub stats: Option<FileStats>,
    pub accessible: bool,
}

#[derive(Default)]
pub struct MetadataRegistry {
    files: Mutex<HashMap<String, FileRecord>>,
    folders: Mutex<HashMap<String, FolderRecord>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.lock().expect("file table poisoned").contains_key(name)
    }

    /// Inserts a new record; the namespace is flat and globally unique.
    pub fn insert(&self, record: FileRecord) -> OpResult<()> {
        let mut files = self.files.lock().expect("file table poisoned");
        if files.contains_key(&record.name) {
            return Err(OpError::new(
                Status::FileExists,
                format!("file '{}' already exists", record.name),
            ));
        }
        files.insert(record.name.clone(), record);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> OpResult<FileRecord> {
        let mut files = self.files.lock().expect("file table poisoned");
        files.remove(name).ok_or_else(|| OpError::file_not_found(name))
    }

    /// Runs a read-only closure against a record.
    pub fn with_file<R>(&self, name: &str, f: impl FnOnce(&FileRecord) -> R) -> OpResult<R> {
        let files = self.files.lock().expect("file table poisoned");
        files.get(name).map(f).ok_or_else(|| OpError::file_not_found(name))
    }

    /// Runs a mutating closure against a record.
    pub fn with_file_mut<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut FileRecord) -> R,
    ) -> OpResult<R> {
        let mut files = self.files.lock().expect("file table poisoned");
        files.get_mut(name).map(f).ok_or_else(|| OpError::file_not_found(name))
    }

    /// Fails with `PermissionDenied` unless `username` holds the needed
    /// capability on the file.
    pub fn require_permission(
        &self,
        name: &str,
        username: &str,
        need_write: bool,
    ) -> OpResult<()> {
        let allowed = self.with_file(name, |rec| rec.allows(username, need_write))?;
        if allowed {
            Ok(())
        } else {
            let what = if need_write { "write" } else { "read" };
            Err(OpError::permission_denied(format!("no {what} access to '{name}'")))
        }
    }

    /// Fails with `PermissionDenied` unless `username` owns the file.
    pub fn require_owner(&self, name: &str, username: &str) -> OpResult<()> {
        let owned = self.with_file(name, |rec| rec.owner == username)?;
        if owned {
            Ok(())
        } else {
            Err(OpError::permission_denied(format!("only the owner of '{name}' may do this")))
        }
    }

    /// Home storage server of a file.
    pub fn home_of(&self, name: &str) -> OpResult<String> {
        self.with_file(name, |rec| rec.ss_id.clone())
    }

    /// Grants access, idempotently. Granting write forces read. Granting
    /// to the owner is a no-op: ownership already implies everything.
    pub fn add_access(&self, name: &str, username: &str, read: bool, write: bool) -> OpResult<()> {
        self.with_file_mut(name, |rec| {
            if rec.owner == username {
                return;
            }
            let read = read || write;
            match rec.acl.iter_mut().find(|e| e.username == username) {
                Some(entry) => {
                    entry.read = entry.read || read;
                    entry.write = entry.write || write;
                }
                None => {
                    rec.acl.push(AccessEntry { username: username.to_string(), read, write });
                }
            }
        })
    }

    /// Revokes access, idempotently. The owner's implicit access cannot be
    /// removed.
    pub fn remove_access(&self, name: &str, username: &str) -> OpResult<()> {
        let owner_hit = self.with_file_mut(name, |rec| {
            if rec.owner == username {
                return true;
            }
            rec.acl.retain(|e| e.username != username);
            false
        })?;
        if owner_hit {
            Err(OpError::invalid(format!("'{username}' owns '{name}'; owner access is implicit")))
        } else {
            Ok(())
        }
    }

    /// Files for the VIEW listing: those the user owns or can read, plus,
    /// when `all` is set, every other file, marked inaccessible.
    pub fn visible_files(&self, username: &str, all: bool) -> Vec<FileSummary> {
        let files = self.files.lock().expect("file table poisoned");
        let mut rows: Vec<FileSummary> = files
            .values()
            .filter_map(|rec| {
                let accessible = rec.allows(username, false);
                if !accessible && !all {
                    return None;
                }
                Some(FileSummary {
                    name: rec.name.clone(),
                    owner: rec.owner.clone(),
                    ss_id: rec.ss_id.clone(),
                    folder: rec.folder.clone(),
                    stats: rec.stats,
                    accessible,
                })
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Names the user is permitted to read, for SEARCH.
    pub fn readable_names(&self, username: &str) -> Vec<String> {
        let files = self.files.lock().expect("file table poisoned");
        let mut names: Vec<String> = files
            .values()
            .filter(|rec| rec.allows(username, false))
            .map(|rec| rec.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Files whose folder field equals `folder` exactly.
    pub fn files_in_folder(&self, folder: &str) -> Vec<FileSummary> {
        let files = self.files.lock().expect("file table poisoned");
        let mut rows: Vec<FileSummary> = files
            .values()
            .filter(|rec| rec.folder == folder)
            .map(|rec| FileSummary {
                name: rec.name.clone(),
                owner: rec.owner.clone(),
                ss_id: rec.ss_id.clone(),
                folder: rec.folder.clone(),
                stats: rec.stats,
                accessible: true,
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Updates a file's folder. The destination must exist unless it is
    /// the root.
    pub fn move_file(&self, name: &str, folder: &str) -> OpResult<()> {
        let mut files = self.files.lock().expect("file table poisoned");
        let record = files.get_mut(name).ok_or_else(|| OpError::file_not_found(name))?;
        if !folder.is_empty() {
            let folders = self.folders.lock().expect("folder table poisoned");
            if !folders.contains_key(folder) {
                return Err(OpError::new(
                    Status::FolderNotFound,
                    format!("folder '{folder}' does not exist"),
                ));
            }
        }
        record.folder = folder.to_string();
        record.modified = SystemTime::now();
        Ok(())
    }

    /// Creates a folder, auto-creating missing parents. The root cannot be
    /// created and an existing folder is a conflict.
    pub fn create_folder(&self, path: &str, owner: &str) -> OpResult<()> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(OpError::invalid("the root folder always exists"));
        }
        let mut folders = self.folders.lock().expect("folder table poisoned");
        if folders.contains_key(path) {
            return Err(OpError::new(
                Status::FolderExists,
                format!("folder '{path}' already exists"),
            ));
        }
        let mut prefix = String::new();
        for part in path.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            folders.entry(prefix.clone()).or_insert_with(|| FolderRecord {
                path: prefix.clone(),
                owner: owner.to_string(),
                created: SystemTime::now(),
            });
        }
        Ok(())
    }

    /// The root always exists; other folders must have been created.
    pub fn folder_exists(&self, path: &str) -> bool {
        path.is_empty()
            || self.folders.lock().expect("folder table poisoned").contains_key(path)
    }

    /// Immediate subfolders of `parent`.
    pub fn subfolders(&self, parent: &str) -> Vec<String> {
        let folders = self.folders.lock().expect("folder table poisoned");
        let mut out: Vec<String> = folders
            .keys()
            .filter(|path| match path.rsplit_once('/') {
                Some((p, _)) => p == parent,
                None => parent.is_empty(),
            })
            .cloned()
            .collect();
        out.sort();
        out
    }

    /// Merges a storage server's advertised file list. Unknown files get a
    /// synthetic record owned by "system" so data that predates the naming
    /// server stays visible; known files keep their owner and ACLs.
    pub fn merge_advertised(&self, ss_id: &str, names: &[String]) {
        let mut files = self.files.lock().expect("file table poisoned");
        for name in names {
            files
                .entry(name.clone())
                .or_insert_with(|| FileRecord::new(name.clone(), "system", ss_id));
        }
    }

    /// Records checkpoint metadata; tags are unique within a file.
    pub fn add_checkpoint(
        &self,
        name: &str,
        tag: &str,
        creator: &str,
        size: u64,
    ) -> OpResult<()> {
        let duplicate = self.with_file_mut(name, |rec| {
            if rec.checkpoints.iter().any(|c| c.tag == tag) {
                return true;
            }
            rec.checkpoints.push(CheckpointMeta {
                tag: tag.to_string(),
                creator: creator.to_string(),
                created: SystemTime::now(),
                size,
            });
            false
        })?;
        if duplicate {
            Err(OpError::invalid(format!("checkpoint '{tag}' already exists for '{name}'")))
        } else {
            Ok(())
        }
    }

    pub fn find_checkpoint(&self, name: &str, tag: &str) -> OpResult<CheckpointMeta> {
        self.with_file(name, |rec| rec.checkpoints.iter().find(|c| c.tag == tag).cloned())?
            .ok_or_else(|| {
                OpError::new(
                    Status::CheckpointNotFound,
                    format!("no checkpoint '{tag}' for '{name}'"),
                )
            })
    }

    pub fn list_checkpoints(&self, name: &str) -> OpResult<Vec<CheckpointMeta>> {
        self.with_file(name, |rec| rec.checkpoints.clone())
    }

    /// Queues an access request.
    pub fn enqueue_request(
        &self,
        name: &str,
        requester: &str,
        read: bool,
        write: bool,
        id: u64,
    ) -> OpResult<()> {
        self.with_file_mut(name, |rec| {
            rec.requests.push(AccessRequest {
                id,
                requester: requester.to_string(),
                read: read || write,
                write,
                status: RequestStatus::Pending,
                created: SystemTime::now(),
            });
        })
    }

    pub fn pending_requests(&self, name: &str) -> OpResult<Vec<AccessRequest>> {
        self.with_file(name, |rec| {
            rec.requests
                .iter()
                .filter(|r| r.status == RequestStatus::Pending)
                .cloned()
                .collect()
        })
    }

    /// Resolves a pending request; approval grants the requested access.
    pub fn resolve_request(&self, name: &str, id: u64, approve: bool) -> OpResult<AccessRequest> {
        let resolved = self.with_file_mut(name, |rec| {
            let request = rec.requests.iter_mut().find(|r| r.id == id)?;
            if request.status != RequestStatus::Pending {
                return Some(Err(OpError::invalid(format!("request #{id} was already resolved"))));
            }
            request.status =
                if approve { RequestStatus::Approved } else { RequestStatus::Denied };
            Some(Ok(request.clone()))
        })?;
        let request = match resolved {
            Some(result) => result?,
            None => {
                return Err(OpError::new(
                    Status::RequestNotFound,
                    format!("no access request #{id} for '{name}'"),
                ))
            }
        };
        if approve {
            self.add_access(name, &request.requester, request.read, request.write)?;
        }
        Ok(request)
    }

    /// Stores freshly fetched statistics.
    pub fn set_stats(&self, name: &str, stats: FileStats) {
        let _ = self.with_file_mut(name, |rec| rec.stats = Some(stats));
    }

    pub fn touch_accessed(&self, name: &str) {
        let _ = self.with_file_mut(name, |rec| rec.accessed = SystemTime::now());
    }

    pub fn touch_modified(&self, name: &str) {
        let now = SystemTime::now();
        let _ = self.with_file_mut(name, |rec| {
            rec.modified = now;
            rec.accessed = now;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(name: &str, owner: &str) -> MetadataRegistry {
        let registry = MetadataRegistry::new();
        registry.insert(FileRecord::new(name, owner, "ss1")).expect("insert");
        registry
    }

    #[test]
    fn names_are_globally_unique() {
        let registry = registry_with("a.txt", "alice");
        let err = registry.insert(FileRecord::new("a.txt", "bob", "ss2")).expect_err("dup");
        assert_eq!(err.status, Status::FileExists);
    }

    #[test]
    fn owner_always_has_access_and_cannot_lose_it() {
        let registry = registry_with("a.txt", "alice");
        assert!(registry.require_permission("a.txt", "alice", true).is_ok());
        let err = registry.remove_access("a.txt", "alice").expect_err("owner removal");
        assert_eq!(err.status, Status::InvalidRequest);
    }

    #[test]
    fn granting_write_implies_read() {
        let registry = registry_with("a.txt", "alice");
        registry.add_access("a.txt", "bob", false, true).expect("grant");
        assert!(registry.require_permission("a.txt", "bob", false).is_ok());
        assert!(registry.require_permission("a.txt", "bob", true).is_ok());
    }

    #[test]
    fn incremental_grants_accumulate() {
        let registry = registry_with("a.txt", "alice");
        registry.add_access("a.txt", "bob", true, false).expect("read grant");
        assert!(registry.require_permission("a.txt", "bob", true).is_err());
        registry.add_access("a.txt", "bob", false, true).expect("write grant");
        assert!(registry.require_permission("a.txt", "bob", true).is_ok());
    }

    #[test]
    fn remove_access_is_idempotent() {
        let registry = registry_with("a.txt", "alice");
        registry.add_access("a.txt", "bob", true, false).expect("grant");
        registry.remove_access("a.txt", "bob").expect("revoke");
        registry.remove_access("a.txt", "bob").expect("revoke again");
        assert!(registry.require_permission("a.txt", "bob", false).is_err());
    }

    #[test]
    fn moving_into_unknown_folder_fails() {
        let registry = registry_with("a.txt", "alice");
        let err = registry.move_file("a.txt", "missing").expect_err("unknown folder");
        assert_eq!(err.status, Status::FolderNotFound);

        registry.create_folder("docs", "alice").expect("mkdir");
        registry.move_file("a.txt", "docs").expect("move");
        registry.move_file("a.txt", "").expect("move back to root");
    }

    #[test]
    fn nested_folder_creation_fills_in_parents() {
        let registry = MetadataRegistry::new();
        registry.create_folder("a/b/c", "alice").expect("mkdir -p");
        assert!(registry.folder_exists("a"));
        assert!(registry.folder_exists("a/b"));
        assert!(registry.folder_exists("a/b/c"));
        assert_eq!(registry.subfolders(""), vec!["a".to_string()]);
        assert_eq!(registry.subfolders("a"), vec!["a/b".to_string()]);
    }

    #[test]
    fn merge_keeps_known_owners() {
        let registry = registry_with("mine.txt", "alice");
        registry.merge_advertised("ss1", &["mine.txt".to_string(), "found.txt".to_string()]);
        let owner = registry.with_file("mine.txt", |r| r.owner.clone()).expect("known");
        assert_eq!(owner, "alice");
        let owner = registry.with_file("found.txt", |r| r.owner.clone()).expect("synthetic");
        assert_eq!(owner, "system");
    }

    #[test]
    fn checkpoint_tags_are_unique_per_file() {
        let registry = registry_with("a.txt", "alice");
        registry.add_checkpoint("a.txt", "v1", "alice", 10).expect("first");
        let err = registry.add_checkpoint("a.txt", "v1", "alice", 20).expect_err("dup tag");
        assert_eq!(err.status, Status::InvalidRequest);
        assert_eq!(registry.find_checkpoint("a.txt", "v1").expect("find").size, 10);
    }

    #[test]
    fn approving_a_request_grants_access() {
        let registry = registry_with("a.txt", "alice");
        registry.enqueue_request("a.txt", "bob", true, true, 7).expect("enqueue");
        let request = registry.resolve_request("a.txt", 7, true).expect("approve");
        assert_eq!(request.status, RequestStatus::Approved);
        assert!(registry.require_permission("a.txt", "bob", true).is_ok());

        let err = registry.resolve_request("a.txt", 7, true).expect_err("already resolved");
        assert_eq!(err.status, Status::InvalidRequest);
        let err = registry.resolve_request("a.txt", 99, true).expect_err("unknown id");
        assert_eq!(err.status, Status::RequestNotFound);
    }
}
