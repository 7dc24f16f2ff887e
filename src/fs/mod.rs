//! Virtual filesystem surface.
//!
//! Implements the POSIX operation contract consumed by the external FUSE
//! adapter: every operation takes a mount-relative path and returns either
//! a value or a negated errno. The root namespace carries regular virtual
//! files plus the reserved pseudo entries; registered containers surface
//! read-only under `/.containers/<id>`.

pub mod pseudo;

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{VfsError, errno};
use crate::manager::ContainerManager;
use crate::search::{FileMeta, SearchEngine};

/// Result alias for the operation contract: `Err` is a negated errno.
pub type FsResult<T> = Result<T, i32>;

/// Reserved names listed at the mount root.
pub const RESERVED_ROOT_ENTRIES: &[&str] = &[
    ".search",
    ".reindex",
    ".embeddings",
    ".markov",
    ".all",
    ".debug",
    ".containers",
];

const PSEUDO_FILE_SIZE: u64 = 1024;
const PSEUDO_REPORT_SIZE: u64 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
}

/// Attribute record handed to the adapter's `getattr`.
#[derive(Debug, Clone)]
pub struct FileAttr {
    pub kind: FileKind,
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileAttr {
    fn directory(mode: u32, uid: u32, gid: u32) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            kind: FileKind::Directory,
            mode,
            size: 0,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    fn pseudo(size: u64, uid: u32, gid: u32) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            kind: FileKind::Regular,
            mode: 0o444,
            size,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }
}

pub struct VectorFs {
    search: Arc<RwLock<SearchEngine>>,
    dirs: RwLock<BTreeSet<String>>,
    manager: Arc<ContainerManager>,
    uid: u32,
    gid: u32,
}

fn err(e: VfsError) -> i32 {
    e.to_errno()
}

impl VectorFs {
    pub fn new(search: SearchEngine, manager: Arc<ContainerManager>, uid: u32, gid: u32) -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Self {
            search: Arc::new(RwLock::new(search)),
            dirs: RwLock::new(dirs),
            manager,
            uid,
            gid,
        }
    }

    pub fn search(&self) -> &Arc<RwLock<SearchEngine>> {
        &self.search
    }

    pub fn dir_count(&self) -> usize {
        self.dirs.read().len()
    }

    /// Record an access against the root engine and kick off a background
    /// model refresh when one is due. Background work logs and continues;
    /// it never takes the caller down.
    pub fn record_access(&self, path: &str, reason: &str) {
        let due = self.search.write().record_access(path, reason);
        if due {
            let search = self.search.clone();
            spawn_background(move || {
                if let Err(e) = search.write().update_models() {
                    warn!(error = %e, "background model refresh failed");
                }
            });
        }
    }

    fn is_container_path(path: &str) -> bool {
        path == "/.containers" || path.starts_with("/.containers/")
    }

    /// Split `/.containers/<id>[/<rest>]` into `(id, "/<rest>")`.
    fn split_container_path(path: &str) -> Option<(&str, String)> {
        let rest = path.strip_prefix("/.containers/")?;
        match rest.split_once('/') {
            Some((id, inner)) => Some((id, format!("/{inner}"))),
            None => Some((rest, "/".to_string())),
        }
    }

    // ------------------------------------------------------------------
    // Operation contract
    // ------------------------------------------------------------------

    pub fn getattr(&self, path: &str) -> FsResult<FileAttr> {
        if path == "/" || path == "/.search" || path == "/.containers" {
            return Ok(FileAttr::directory(0o555, self.uid, self.gid));
        }
        if path == "/.debug" || path == "/.reindex" || path == "/.embeddings" {
            return Ok(FileAttr::pseudo(PSEUDO_FILE_SIZE, self.uid, self.gid));
        }
        if path == "/.markov" || path == "/.all" {
            return Ok(FileAttr::pseudo(PSEUDO_REPORT_SIZE, self.uid, self.gid));
        }
        if path.starts_with("/.search/") {
            return Ok(FileAttr::pseudo(PSEUDO_FILE_SIZE, self.uid, self.gid));
        }
        if Self::is_container_path(path) {
            return self.container_getattr(path);
        }

        if self.dirs.read().contains(path) {
            return Ok(FileAttr::directory(0o755, self.uid, self.gid));
        }

        let search = self.search.read();
        let file = search.file(path).ok_or(-errno::ENOENT)?;
        Ok(FileAttr {
            kind: FileKind::Regular,
            mode: file.meta.mode,
            size: file.meta.size,
            uid: file.meta.uid,
            gid: file.meta.gid,
            atime: file.meta.atime,
            mtime: file.meta.mtime,
            ctime: file.meta.ctime,
        })
    }

    fn container_getattr(&self, path: &str) -> FsResult<FileAttr> {
        if path == "/.containers" {
            return Ok(FileAttr::directory(0o555, self.uid, self.gid));
        }
        let (id, inner) = Self::split_container_path(path).ok_or(-errno::ENOENT)?;
        let container = self.manager.get(id).map_err(err)?;

        if inner == "/" || container.is_directory(&inner) {
            return Ok(FileAttr::directory(0o555, self.uid, self.gid));
        }
        let content = container.get_file_content(&inner).map_err(err)?;
        Ok(FileAttr {
            kind: FileKind::Regular,
            mode: 0o444,
            size: content.len() as u64,
            uid: self.uid,
            gid: self.gid,
            atime: chrono::Utc::now().timestamp(),
            mtime: chrono::Utc::now().timestamp(),
            ctime: chrono::Utc::now().timestamp(),
        })
    }

    pub fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        let mut entries = vec![".".to_string(), "..".to_string()];

        if path == "/" {
            entries.extend(RESERVED_ROOT_ENTRIES.iter().map(|s| s.to_string()));
            for dir in self.dirs.read().iter() {
                if dir != "/" {
                    entries.push(dir.trim_start_matches('/').to_string());
                }
            }
            for file in self.search.read().paths() {
                entries.push(file.trim_start_matches('/').to_string());
            }
            return Ok(entries);
        }

        if path == "/.search" {
            return Ok(entries);
        }

        if path == "/.containers" {
            entries.extend(self.manager.all().iter().map(|c| c.id().to_string()));
            return Ok(entries);
        }

        if let Some((id, inner)) = Self::split_container_path(path) {
            let container = self.manager.get(id).map_err(err)?;
            entries.extend(container.list_files(&inner));
            return Ok(entries);
        }

        if self.dirs.read().contains(path) {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            for dir in self.dirs.read().iter() {
                if let Some(rest) = dir.strip_prefix(&prefix) {
                    if !rest.is_empty() && !rest.contains('/') {
                        entries.push(rest.to_string());
                    }
                }
            }
            for file in self.search.read().paths() {
                if let Some(rest) = file.strip_prefix(&prefix) {
                    if !rest.contains('/') {
                        entries.push(rest.to_string());
                    }
                }
            }
            return Ok(entries);
        }

        Err(-errno::ENOENT)
    }

    pub fn open(&self, path: &str) -> FsResult<()> {
        if path.starts_with("/.search/")
            || path == "/.markov"
            || path == "/.reindex"
            || path == "/.embeddings"
            || path == "/.all"
            || path == "/.debug"
        {
            return Ok(());
        }
        if Self::is_container_path(path) {
            return self.container_getattr(path).map(|_| ());
        }
        if self.search.read().contains(path) {
            return Ok(());
        }
        Err(-errno::ENOENT)
    }

    pub fn read(&self, path: &str, size: usize, offset: u64) -> FsResult<Vec<u8>> {
        self.record_access(path, "read");

        if let Some(query) = path.strip_prefix("/.search/") {
            let report = self.search_report(query);
            return Ok(slice_at(report.as_bytes(), size, offset));
        }
        match path {
            "/.debug" => {
                let report = self.debug_report();
                return Ok(slice_at(report.as_bytes(), size, offset));
            }
            "/.reindex" => {
                let report = self.reindex_report();
                return Ok(slice_at(report.as_bytes(), size, offset));
            }
            "/.markov" => {
                let report = self.markov_report();
                return Ok(slice_at(report.as_bytes(), size, offset));
            }
            "/.all" => {
                let report = self.all_report();
                return Ok(slice_at(report.as_bytes(), size, offset));
            }
            "/.embeddings" => {
                let report = self.embeddings_report();
                return Ok(slice_at(report.as_bytes(), size, offset));
            }
            _ => {}
        }

        if Self::is_container_path(path) {
            let (id, inner) = Self::split_container_path(path).ok_or(-errno::ENOENT)?;
            let container = self.manager.get(id).map_err(err)?;
            let content = container.get_file_content(&inner).map_err(err)?;
            record_container_access(&container, &inner, "read");
            return Ok(slice_at(&content, size, offset));
        }

        let search = self.search.read();
        let file = search.file(path).ok_or(-errno::ENOENT)?;
        Ok(slice_at(&file.content, size, offset))
    }

    pub fn write(&self, path: &str, data: &[u8], offset: u64) -> FsResult<usize> {
        let mut search = self.search.write();
        let file = search.file(path).ok_or(-errno::ENOENT)?;
        if file.meta.mode & 0o200 == 0 {
            return Err(-errno::EACCES);
        }

        let mut content = file.content.clone();
        let end = offset as usize + data.len();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(data);

        search.update_file(path, &content).map_err(err)?;
        debug!(path, bytes = data.len(), offset, "file written");
        Ok(data.len())
    }

    pub fn create(&self, path: &str, mode: u32) -> FsResult<()> {
        if self.search.read().contains(path) || self.dirs.read().contains(path) {
            return Err(-errno::EEXIST);
        }
        if path.starts_with("/.") {
            return Err(-errno::EACCES);
        }

        // Auto-create the parent chain of virtual directories.
        {
            let mut dirs = self.dirs.write();
            let mut current = parent_of(path);
            while current != "/" {
                dirs.insert(current.to_string());
                current = parent_of(&current);
            }
        }

        let mut meta = FileMeta::regular(self.uid, self.gid);
        meta.mode = mode & 0o777;
        self.search
            .write()
            .add_file(path, b"", meta)
            .map_err(err)?;
        Ok(())
    }

    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        if self.dirs.read().contains(path) || self.search.read().contains(path) {
            return Err(-errno::EEXIST);
        }
        let parent = parent_of(path);
        if parent != "/" && !self.dirs.read().contains(parent.as_str()) {
            return Err(-errno::ENOENT);
        }
        self.dirs.write().insert(path.to_string());
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        if !self.dirs.read().contains(path) {
            return Err(-errno::ENOENT);
        }

        // Everything beneath the directory goes with it.
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let doomed: Vec<String> = self
            .search
            .read()
            .paths()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        {
            let mut search = self.search.write();
            for file in doomed {
                let _ = search.remove_file(&file);
            }
        }

        let mut dirs = self.dirs.write();
        dirs.retain(|d| d != path && !d.starts_with(&prefix));
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        self.search.write().remove_file(path).map_err(err)
    }

    pub fn utimens(&self, path: &str, atime: i64, mtime: i64) -> FsResult<()> {
        let mut search = self.search.write();
        let meta = search.file_meta_mut(path).ok_or(-errno::ENOENT)?;
        meta.atime = atime;
        meta.mtime = mtime;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Extended attributes
    // ------------------------------------------------------------------

    /// Attribute value with the adapter's size-probe protocol: a zero
    /// `size` asks how large a buffer is needed, a short buffer is
    /// `-ERANGE`, and a sufficient one receives the value.
    pub fn getxattr(&self, path: &str, name: &str, size: usize) -> FsResult<XattrReply> {
        let search = self.search.read();
        let file = search.file(path).ok_or(-errno::ENOENT)?;

        let value = match name {
            "user.embedding.size" => file.embedding.len().to_string(),
            "user.embedding.updated" => {
                if file.embedding_fresh { "true" } else { "false" }.to_string()
            }
            "user.content.size" => file.content.len().to_string(),
            _ => return Err(-errno::ENODATA),
        };

        if size == 0 {
            return Ok(XattrReply::Size(value.len()));
        }
        if size < value.len() {
            return Err(-errno::ERANGE);
        }
        Ok(XattrReply::Value(value))
    }

    pub fn setxattr(&self, _path: &str, _name: &str, _value: &[u8]) -> FsResult<()> {
        Err(-errno::ENOTSUP)
    }

    /// Attribute name list, NUL-separated on the wire, with the same
    /// size-probe protocol as `getxattr`.
    pub fn listxattr(&self, path: &str, size: usize) -> FsResult<XattrListReply> {
        if !self.search.read().contains(path) {
            return Err(-errno::ENOENT);
        }
        let names = [
            "user.embedding.size",
            "user.embedding.updated",
            "user.content.size",
        ];
        let needed: usize = names.iter().map(|n| n.len() + 1).sum();

        if size == 0 {
            return Ok(XattrListReply::Size(needed));
        }
        if size < needed {
            return Err(-errno::ERANGE);
        }
        Ok(XattrListReply::Names(
            names.iter().map(|n| n.to_string()).collect(),
        ))
    }
}

/// `getxattr` outcome: either the probed length or the value itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrReply {
    Size(usize),
    Value(String),
}

impl XattrReply {
    pub fn into_value(self) -> Option<String> {
        match self {
            XattrReply::Value(value) => Some(value),
            XattrReply::Size(_) => None,
        }
    }
}

/// `listxattr` outcome: either the probed length or the attribute names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrListReply {
    Size(usize),
    Names(Vec<String>),
}

/// Record a container access and schedule the container's model refresh
/// off the caller's thread when one is due.
pub fn record_container_access(
    container: &Arc<crate::container::Container>,
    path: &str,
    reason: &str,
) {
    if container.record_access(path, reason) {
        let container = container.clone();
        spawn_background(move || {
            if let Err(e) = container.update_models() {
                warn!(container = %container.id(), error = %e, "background model refresh failed");
            }
        });
    }
}

/// Run a CPU-bound refresh job off the caller. These entry points are
/// synchronous FUSE-contract methods, so the tokio handle has to be looked
/// up rather than awaited: inside the runtime the job lands on the blocking
/// pool, where shutdown waits for it; without a runtime (plain test
/// binaries) a detached thread stands in.
fn spawn_background<F>(job: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(job);
        }
        Err(_) => {
            std::thread::spawn(job);
        }
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => "/".to_string(),
    }
}

fn slice_at(content: &[u8], size: usize, offset: u64) -> Vec<u8> {
    let offset = offset as usize;
    if offset >= content.len() {
        return Vec::new();
    }
    let end = (offset + size).min(content.len());
    content[offset..end].to_vec()
}

/// Percent-decode a query path segment; `_` doubles as a space.
pub fn decode_query(raw: &str) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 3 <= bytes.len() => {
                let hex = raw.get(i + 1..i + 3);
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'_' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::{HashEmbedder, SharedEmbedder};

    fn fs() -> VectorFs {
        let embedder: SharedEmbedder = Arc::new(HashEmbedder::new(64).unwrap());
        let manager = Arc::new(ContainerManager::new(embedder.clone(), false));
        VectorFs::new(SearchEngine::new(embedder, false), manager, 1000, 1000)
    }

    #[test]
    fn root_lists_reserved_entries() {
        let fs = fs();
        let entries = fs.readdir("/").unwrap();
        for reserved in RESERVED_ROOT_ENTRIES {
            assert!(entries.iter().any(|e| e == reserved), "missing {reserved}");
        }
    }

    #[test]
    fn create_write_read_round_trip() {
        let fs = fs();
        fs.create("/notes.md", 0o644).unwrap();
        let written = fs.write("/notes.md", b"hello semantic world", 0).unwrap();
        assert_eq!(written, 20);

        let data = fs.read("/notes.md", 4096, 0).unwrap();
        assert_eq!(data, b"hello semantic world");

        let attr = fs.getattr("/notes.md").unwrap();
        assert_eq!(attr.kind, FileKind::Regular);
        assert_eq!(attr.size, 20);
    }

    #[test]
    fn create_auto_builds_parent_dirs() {
        let fs = fs();
        fs.create("/a/b/c.txt", 0o644).unwrap();
        assert_eq!(fs.getattr("/a").unwrap().kind, FileKind::Directory);
        assert_eq!(fs.getattr("/a/b").unwrap().kind, FileKind::Directory);

        let entries = fs.readdir("/a/b").unwrap();
        assert!(entries.contains(&"c.txt".to_string()));
    }

    #[test]
    fn duplicate_create_is_eexist() {
        let fs = fs();
        fs.create("/x", 0o644).unwrap();
        assert_eq!(fs.create("/x", 0o644), Err(-errno::EEXIST));
    }

    #[test]
    fn write_respects_the_write_bit() {
        let fs = fs();
        fs.create("/ro.txt", 0o444).unwrap();
        assert_eq!(fs.write("/ro.txt", b"nope", 0), Err(-errno::EACCES));
    }

    #[test]
    fn write_at_offset_extends_content() {
        let fs = fs();
        fs.create("/f", 0o644).unwrap();
        fs.write("/f", b"abc", 0).unwrap();
        fs.write("/f", b"XY", 5).unwrap();
        let data = fs.read("/f", 100, 0).unwrap();
        assert_eq!(data, b"abc\0\0XY");
    }

    #[test]
    fn unlink_removes_file() {
        let fs = fs();
        fs.create("/gone.txt", 0o644).unwrap();
        fs.unlink("/gone.txt").unwrap();
        assert_eq!(fs.getattr("/gone.txt").err(), Some(-errno::ENOENT));
        assert_eq!(fs.unlink("/gone.txt"), Err(-errno::ENOENT));
    }

    #[test]
    fn mkdir_and_rmdir_manage_the_tree() {
        let fs = fs();
        fs.mkdir("/work").unwrap();
        assert_eq!(fs.mkdir("/work"), Err(-errno::EEXIST));
        assert_eq!(fs.mkdir("/missing/deep"), Err(-errno::ENOENT));

        fs.create("/work/wip.txt", 0o644).unwrap();
        fs.write("/work/wip.txt", b"draft", 0).unwrap();

        fs.rmdir("/work").unwrap();
        assert_eq!(fs.getattr("/work").err(), Some(-errno::ENOENT));
        assert_eq!(fs.getattr("/work/wip.txt").err(), Some(-errno::ENOENT));
    }

    #[test]
    fn pseudo_paths_have_attributes_and_open() {
        let fs = fs();
        assert_eq!(fs.getattr("/.search").unwrap().kind, FileKind::Directory);
        assert_eq!(fs.getattr("/.debug").unwrap().mode, 0o444);
        assert_eq!(fs.getattr("/.search/some_query").unwrap().kind, FileKind::Regular);
        fs.open("/.reindex").unwrap();
        fs.open("/.markov").unwrap();
        assert_eq!(fs.open("/nope"), Err(-errno::ENOENT));
    }

    #[test]
    fn xattrs_expose_embedding_state() {
        let fs = fs();
        fs.create("/doc.md", 0o644).unwrap();
        fs.write("/doc.md", b"semantic notes", 0).unwrap();

        let value = fs.getxattr("/doc.md", "user.content.size", 4096).unwrap();
        assert_eq!(value, XattrReply::Value("14".to_string()));
        let updated = fs.getxattr("/doc.md", "user.embedding.updated", 4096).unwrap();
        assert_eq!(updated.into_value().as_deref(), Some("true"));
        let dim = fs.getxattr("/doc.md", "user.embedding.size", 4096).unwrap();
        assert_eq!(dim.into_value().as_deref(), Some("64"));

        assert_eq!(fs.getxattr("/doc.md", "user.bogus", 4096), Err(-errno::ENODATA));
        assert_eq!(fs.setxattr("/doc.md", "user.x", b"v"), Err(-errno::ENOTSUP));

        match fs.listxattr("/doc.md", 4096).unwrap() {
            XattrListReply::Names(names) => assert_eq!(names.len(), 3),
            other => panic!("expected names, got {other:?}"),
        }
    }

    #[test]
    fn xattr_size_probe_protocol() {
        let fs = fs();
        fs.create("/doc.md", 0o644).unwrap();
        fs.write("/doc.md", b"semantic notes", 0).unwrap();

        // Zero-size probe answers the needed length.
        assert_eq!(
            fs.getxattr("/doc.md", "user.content.size", 0).unwrap(),
            XattrReply::Size(2)
        );
        // A short buffer is ERANGE; a sufficient one gets the value.
        assert_eq!(
            fs.getxattr("/doc.md", "user.content.size", 1),
            Err(-errno::ERANGE)
        );
        assert_eq!(
            fs.getxattr("/doc.md", "user.content.size", 2).unwrap(),
            XattrReply::Value("14".to_string())
        );

        let needed = match fs.listxattr("/doc.md", 0).unwrap() {
            XattrListReply::Size(needed) => needed,
            other => panic!("expected a probed size, got {other:?}"),
        };
        // One NUL terminator per name.
        let name_bytes: usize = ["user.embedding.size", "user.embedding.updated", "user.content.size"]
            .iter()
            .map(|n| n.len() + 1)
            .sum();
        assert_eq!(needed, name_bytes);
        assert_eq!(fs.listxattr("/doc.md", needed - 1), Err(-errno::ERANGE));
        assert!(matches!(
            fs.listxattr("/doc.md", needed).unwrap(),
            XattrListReply::Names(_)
        ));
    }

    #[test]
    fn utimens_updates_timestamps() {
        let fs = fs();
        fs.create("/t", 0o644).unwrap();
        fs.utimens("/t", 111, 222).unwrap();
        let attr = fs.getattr("/t").unwrap();
        assert_eq!(attr.atime, 111);
        assert_eq!(attr.mtime, 222);
    }

    #[test]
    fn query_decoding_handles_percent_and_underscore() {
        assert_eq!(decode_query("hello_world"), "hello world");
        assert_eq!(decode_query("rate%20limit"), "rate limit");
        assert_eq!(decode_query("100%"), "100%");
    }
}
