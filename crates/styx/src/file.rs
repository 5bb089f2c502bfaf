//! Synthetic file trees.
//!
//! A [`File`] is one node of an in-memory tree of synthetic files and
//! directories; [`FileSrv`] serves such a tree as a 9P filesystem. What each
//! file actually does when read, written, created into or removed is decided
//! by its [`FileOps`] record, so a server is assembled by linking files with
//! the right ops into a tree and handing the root to [`FileSrv::new`].

use {
    crate::{
        error::{Error, errno::*},
        fcall::*,
        serialize::Encodable,
        srv::{FId, Filesystem},
        user::{Group, OpenUsers, User, UserDb},
        utils::Result,
    },
    async_trait::async_trait,
    std::{
        sync::{
            Arc, Mutex as StdMutex, Weak,
            atomic::{AtomicU64, Ordering},
        },
        time::{SystemTime, UNIX_EPOCH},
    },
    tokio::sync::{Mutex, RwLock},
};

fn now_sec() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Issues QID path values for one tree, strictly increasing and never
/// reused. Every root gets its own pool and children inherit it, so several
/// trees in one process keep independent QID spaces.
pub struct QidPool {
    next: AtomicU64,
}

impl QidPool {
    fn new() -> Arc<QidPool> {
        Arc::new(QidPool {
            next: AtomicU64::new(0),
        })
    }

    /// Allocate the next path value.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Per-file operations.
///
/// Every method has a default, and the default is "not supported": a file
/// only accepts the requests its ops record overrides. `stat` is the
/// exception; with no override the stored stat is served as-is.
///
/// Ops are invoked without any tree lock held and may block freely. The two
/// sides of a remove live on different files: the file being removed is the
/// subject, but the *parent's* ops decide and see [`FileOps::remove`].
#[async_trait]
pub trait FileOps: Send + Sync {
    /// Called before a stat reply is sent; may refresh the stored stat
    /// through [`File::update_stat`].
    async fn stat(&self, _file: &Arc<File>) -> Result<()> {
        Ok(())
    }

    /// Called on Twstat with the client's proposed stat.
    async fn wstat(&self, _file: &Arc<File>, _stat: &Stat) -> Result<()> {
        Err(Error::eperm())
    }

    /// Read up to `buf.len()` bytes at `offset` into `buf`, returning the
    /// number of bytes read.
    async fn read(&self, _file: &Arc<File>, _buf: &mut [u8], _offset: u64) -> Result<usize> {
        Err(Error::eperm())
    }

    /// Write `data` at `offset`, returning the number of bytes accepted.
    async fn write(&self, _file: &Arc<File>, _data: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::eperm())
    }

    /// Called on Tcreate in the directory carrying this record. The
    /// implementation is responsible for linking the new file into `dir`
    /// with [`File::add`] before returning it.
    async fn create(&self, _dir: &Arc<File>, _name: &str, _perm: u32) -> Result<Arc<File>> {
        Err(Error::eperm())
    }

    /// Called when `file`, a child of `dir`, is about to be removed. The
    /// structural unlink happens afterwards, and only on success.
    async fn remove(&self, _dir: &Arc<File>, _file: &Arc<File>) -> Result<()> {
        Err(Error::eperm())
    }
}

/// Ops for files that expose nothing beyond their stored stat.
pub struct NoOps;

#[async_trait]
impl FileOps for NoOps {}

struct Children {
    list: Vec<Arc<File>>,
    /// Bumped on every insert and unlink; directory-read cursors compare it
    /// to notice the list changed under them.
    gen: u64,
}

/// One file or directory served by a file server.
///
/// Parent→child edges are the owning references; the parent pointer is weak
/// and the root is its own parent, so `..` at the root stays put. A file
/// unlinked by [`File::remove`] keeps a readable stat but loses its parent
/// and its place in the tree.
pub struct File {
    stat: StdMutex<Stat>,
    parent: StdMutex<Weak<File>>,
    children: StdMutex<Children>,
    qids: Arc<QidPool>,
    ops: Arc<dyn FileOps>,
}

impl File {
    /// Initializes a file's stat block, allocates its QID path and links it
    /// at the tail of `dir`'s child list. The sibling-name check and the
    /// insert are atomic under the directory's lock.
    ///
    /// With no `dir` the file becomes a self-parented root with a fresh
    /// [`QidPool`].
    pub fn add(
        dir: Option<&Arc<File>>,
        name: &str,
        uid: Option<&dyn User>,
        gid: Option<&dyn Group>,
        mode: u32,
        ops: Arc<dyn FileOps>,
    ) -> Result<Arc<File>> {
        let now = now_sec();
        let mut stat = Stat {
            typ: 0,
            dev: 0,
            qid: QId {
                typ: QIdType::from_bits_truncate((mode >> 24) as u8),
                version: 0,
                path: 0,
            },
            mode,
            atime: now,
            mtime: now,
            length: 0,
            name: name.to_owned(),
            muid: String::new(),
            ext: String::new(),
            n_muid: NOUID,
            ..Default::default()
        };

        match uid {
            Some(u) => {
                stat.uid = u.name().to_owned();
                stat.n_uid = u.id();
            }
            None => {
                stat.uid = "none".to_owned();
                stat.n_uid = NOUID;
            }
        }

        match gid {
            Some(g) => {
                stat.gid = g.name().to_owned();
                stat.n_gid = g.id();
            }
            None => {
                stat.gid = "none".to_owned();
                stat.n_gid = NOUID;
            }
        }

        match dir {
            Some(dir) => {
                stat.qid.path = dir.qids.next();
                let f = Arc::new(File {
                    stat: StdMutex::new(stat),
                    parent: StdMutex::new(Arc::downgrade(dir)),
                    children: StdMutex::new(Children {
                        list: Vec::new(),
                        gen: 0,
                    }),
                    qids: dir.qids.clone(),
                    ops,
                });

                let mut children = dir.children.lock().unwrap();
                if children
                    .list
                    .iter()
                    .any(|c| c.stat.lock().unwrap().name == name)
                {
                    return Err(Error::eexist());
                }
                children.list.push(f.clone());
                children.gen += 1;

                Ok(f)
            }
            None => {
                let qids = QidPool::new();
                stat.qid.path = qids.next();
                Ok(Arc::new_cyclic(|me| File {
                    stat: StdMutex::new(stat),
                    parent: StdMutex::new(me.clone()),
                    children: StdMutex::new(Children {
                        list: Vec::new(),
                        gen: 0,
                    }),
                    qids,
                    ops,
                }))
            }
        }
    }

    /// Unlinks the file from its parent's child list and clears the parent
    /// pointer. Does not consult the ops record; that policy belongs to the
    /// request dispatcher. Removing the root is a no-op.
    pub fn remove(self: &Arc<File>) {
        let parent = { self.parent.lock().unwrap().upgrade() };
        let Some(parent) = parent else { return };
        if Arc::ptr_eq(&parent, self) {
            return;
        }

        {
            let mut children = parent.children.lock().unwrap();
            if let Some(pos) = children.list.iter().position(|c| Arc::ptr_eq(c, self)) {
                children.list.remove(pos);
                children.gen += 1;
            }
        }

        *self.parent.lock().unwrap() = Weak::new();
    }

    /// Looks for a child by name. Linear scan under the directory's lock;
    /// synthetic directories are small.
    pub fn find(&self, name: &str) -> Option<Arc<File>> {
        let children = self.children.lock().unwrap();
        children
            .list
            .iter()
            .find(|c| c.stat.lock().unwrap().name == name)
            .cloned()
    }

    /// Checks whether `user` may perform an operation requiring `perm`,
    /// a subset of `dm::READ | dm::WRITE | dm::EXEC`.
    ///
    /// The grant is the union of the classes the user falls into: the
    /// "other" bits always contribute, the owner bits when the uid matches,
    /// the group bits when any of the user's groups matches. A user whose
    /// "other" bits already grant the access succeeds even if the owner
    /// class would deny it.
    pub fn check_perm(&self, user: Option<&dyn User>, perm: u32) -> bool {
        let Some(user) = user else { return false };
        let perm = perm & 7;

        let stat = self.stat.lock().unwrap();
        let mut fperm = stat.mode & 7;

        if stat.uid == user.name() || stat.n_uid == user.id() {
            fperm |= (stat.mode >> 6) & 7;
        }

        if user
            .groups()
            .iter()
            .any(|g| stat.gid == g.name() || stat.n_gid == g.id())
        {
            fperm |= (stat.mode >> 3) & 7;
        }

        (fperm & perm) == perm
    }

    /// The file's identity on the wire.
    pub fn qid(&self) -> QId {
        self.stat.lock().unwrap().qid
    }

    /// A copy of the stored stat.
    pub fn stat(&self) -> Stat {
        self.stat.lock().unwrap().clone()
    }

    /// Mutate the stored stat under the file's lock.
    pub fn update_stat<F: FnOnce(&mut Stat)>(&self, f: F) {
        f(&mut self.stat.lock().unwrap())
    }

    /// The owning directory; the root returns itself, an unlinked file
    /// returns `None`.
    pub fn parent(&self) -> Option<Arc<File>> {
        self.parent.lock().unwrap().upgrade()
    }

    pub fn is_dir(&self) -> bool {
        self.stat.lock().unwrap().mode & dm::DIR != 0
    }

    fn ops(&self) -> Arc<dyn FileOps> {
        self.ops.clone()
    }
}

#[derive(Default)]
struct DirCursor {
    index: usize,
    gen: u64,
}

/// Per-fid server state: the bound file, the identity that attached, the
/// open mode once the fid is opened, and the directory-read cursor.
#[derive(Default)]
pub struct FsFid {
    file: RwLock<Option<Arc<File>>>,
    user: RwLock<Option<Arc<dyn User>>>,
    omode: Mutex<Option<u8>>,
    dirent: Mutex<DirCursor>,
}

impl FsFid {
    /// The file the fid is bound to.
    pub async fn file(&self) -> Option<Arc<File>> {
        self.file.read().await.clone()
    }
}

async fn fid_file(fid: &FId<FsFid>) -> Result<Arc<File>> {
    fid.aux
        .file
        .read()
        .await
        .clone()
        .ok_or(Error::No(EBADF))
}

fn mode2perm(mode: u8) -> u32 {
    let mut perm = match mode & 3 {
        om::READ => dm::READ,
        om::WRITE => dm::WRITE,
        om::RDWR => dm::READ | dm::WRITE,
        _ => 0,
    };

    if mode & om::TRUNC != 0 {
        perm |= dm::WRITE;
    }

    perm
}

/// Serves a tree of synthetic files.
#[derive(Clone)]
pub struct FileSrv {
    root: Arc<File>,
    users: Arc<dyn UserDb>,
}

impl FileSrv {
    /// Creates a file server with `root` as root directory, accepting any
    /// uname as identity.
    pub fn new(root: Arc<File>) -> FileSrv {
        FileSrv {
            root,
            users: Arc::new(OpenUsers),
        }
    }

    /// Creates a file server that resolves attach identities through
    /// `users`.
    pub fn with_users(root: Arc<File>, users: Arc<dyn UserDb>) -> FileSrv {
        FileSrv { root, users }
    }

    pub fn root(&self) -> &Arc<File> {
        &self.root
    }
}

#[async_trait]
impl Filesystem for FileSrv {
    type FId = FsFid;

    async fn rattach(
        &self,
        fid: &FId<FsFid>,
        _afid: Option<&FId<FsFid>>,
        uname: &str,
        _aname: &str,
        n_uname: u32,
    ) -> Result<FCall> {
        let user = self
            .users
            .user(uname, n_uname)
            .ok_or_else(|| Error::new("unknown user", EPERM))?;

        *fid.aux.user.write().await = Some(user);
        *fid.aux.file.write().await = Some(self.root.clone());

        Ok(FCall::RAttach {
            qid: self.root.qid(),
        })
    }

    async fn rwalk(
        &self,
        fid: &FId<FsFid>,
        newfid: &FId<FsFid>,
        wnames: &[String],
    ) -> Result<FCall> {
        if fid.aux.omode.lock().await.is_some() {
            return Err(Error::new("walk of open fid", EBUSY));
        }

        let mut f = fid_file(fid).await?;
        let user = fid.aux.user.read().await.clone();

        let mut wqids = Vec::with_capacity(wnames.len());
        for name in wnames {
            if name == ".." {
                // the root is its own parent, so dotdot there stays put
                let Some(parent) = f.parent() else { break };
                f = parent;
                wqids.push(f.qid());
                continue;
            }

            // descending requires a directory the user may search
            if !f.is_dir() || !f.check_perm(user.as_deref(), dm::EXEC) {
                break;
            }

            let Some(next) = f.find(name) else { break };
            f = next;
            wqids.push(f.qid());
        }

        if !wnames.is_empty() && wqids.is_empty() {
            return Err(Error::enoent());
        }

        // a short prefix tells the client the walk stopped early; the newfid
        // is bound to the last file reached either way
        *newfid.aux.file.write().await = Some(f);
        *newfid.aux.user.write().await = user;

        Ok(FCall::RWalk { wqids })
    }

    async fn ropen(&self, fid: &FId<FsFid>, mode: u8) -> Result<FCall> {
        let f = fid_file(fid).await?;

        let mut omode = fid.aux.omode.lock().await;
        if omode.is_some() {
            return Err(Error::new("file already open", EBUSY));
        }

        let user = fid.aux.user.read().await.clone();
        if !f.check_perm(user.as_deref(), mode2perm(mode)) {
            return Err(Error::eperm());
        }

        *omode = Some(mode);

        Ok(FCall::ROpen {
            qid: f.qid(),
            iounit: 0,
        })
    }

    async fn rcreate(
        &self,
        fid: &FId<FsFid>,
        name: &str,
        perm: u32,
        mode: u8,
        _ext: &str,
    ) -> Result<FCall> {
        let dir = fid_file(fid).await?;

        if fid.aux.omode.lock().await.is_some() {
            return Err(Error::new("file already open", EBUSY));
        }
        if !dir.is_dir() {
            return Err(Error::new("not a directory", ENOTDIR));
        }

        let user = fid.aux.user.read().await.clone();
        if !dir.check_perm(user.as_deref(), dm::WRITE) {
            return Err(Error::eperm());
        }

        // the ops record links the new file into the tree itself
        let f = dir.ops().create(&dir, name, perm).await?;
        let qid = f.qid();

        *fid.aux.file.write().await = Some(f);
        *fid.aux.omode.lock().await = Some(mode);

        Ok(FCall::RCreate { qid, iounit: 0 })
    }

    async fn rread(&self, fid: &FId<FsFid>, offset: u64, count: u32) -> Result<FCall> {
        let f = fid_file(fid).await?;

        let omode = *fid.aux.omode.lock().await;
        match omode.map(|m| m & 3) {
            Some(om::READ) | Some(om::RDWR) | Some(om::EXEC) => {}
            _ => return Err(Error::new("file not open", EBADF)),
        }

        let count = count.min(fid.conn().msize().saturating_sub(IOHDRSZ)) as usize;

        if f.is_dir() {
            let dotu = fid.conn().dotu();
            let mut cursor = fid.aux.dirent.lock().await;
            let children = f.children.lock().unwrap();

            if offset == 0 {
                cursor.index = 0;
                cursor.gen = children.gen;
            } else if cursor.gen != children.gen {
                // the directory changed between reads; clamp and continue.
                // Entries may be skipped or repeated; offset 0 restarts.
                cursor.index = cursor.index.min(children.list.len());
                cursor.gen = children.gen;
            }

            let mut buf = Vec::with_capacity(count);
            while cursor.index < children.list.len() {
                let stat = children.list[cursor.index].stat();
                if buf.len() + stat.size(dotu) as usize + 2 > count {
                    break;
                }
                stat.encode(&mut buf, dotu)?;
                cursor.index += 1;
            }

            Ok(FCall::RRead { data: Data(buf) })
        } else {
            let mut buf = vec![0; count];
            let n = f.ops().read(&f, &mut buf, offset).await?;
            buf.truncate(n);

            Ok(FCall::RRead { data: Data(buf) })
        }
    }

    async fn rwrite(&self, fid: &FId<FsFid>, offset: u64, data: &Data) -> Result<FCall> {
        let f = fid_file(fid).await?;

        let omode = *fid.aux.omode.lock().await;
        match omode.map(|m| m & 3) {
            Some(om::WRITE) | Some(om::RDWR) => {}
            _ => return Err(Error::new("file not open", EBADF)),
        }

        let count = f.ops().write(&f, &data.0, offset).await? as u32;

        Ok(FCall::RWrite { count })
    }

    async fn rclunk(&self, _: &FId<FsFid>) -> Result<FCall> {
        Ok(FCall::RClunk)
    }

    async fn rremove(&self, fid: &FId<FsFid>) -> Result<FCall> {
        let f = fid_file(fid).await?;

        {
            let children = f.children.lock().unwrap();
            if !children.list.is_empty() {
                return Err(Error::enotempty());
            }
        }

        let parent = f.parent().ok_or_else(Error::enoent)?;
        if Arc::ptr_eq(&parent, &f) {
            // the root stays
            return Err(Error::eperm());
        }

        parent.ops().remove(&parent, &f).await?;
        f.remove();

        Ok(FCall::RRemove)
    }

    async fn rstat(&self, fid: &FId<FsFid>) -> Result<FCall> {
        let f = fid_file(fid).await?;

        f.ops().stat(&f).await?;

        Ok(FCall::RStat { stat: f.stat() })
    }

    async fn rwstat(&self, fid: &FId<FsFid>, stat: &Stat) -> Result<FCall> {
        let f = fid_file(fid).await?;

        f.ops().wstat(&f, stat).await?;

        Ok(FCall::RWStat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::Decodable;
    use crate::srv::Conn;
    use crate::user::{StaticGroup, StaticUser, StaticUsers};
    use std::io::Cursor;

    fn newroot(mode: u32) -> Arc<File> {
        File::add(None, "/", None, None, dm::DIR | mode, Arc::new(NoOps)).unwrap()
    }

    fn test_fid(n: u32) -> FId<FsFid> {
        FId::new(n, Arc::new(Conn::new()), FsFid::default())
    }

    async fn attach(srv: &FileSrv, n: u32, uname: &str) -> FId<FsFid> {
        let fid = test_fid(n);
        srv.rattach(&fid, None, uname, "", NONUNAME).await.unwrap();
        fid
    }

    /// Directory ops granting create and remove.
    struct TreeOps;

    #[async_trait]
    impl FileOps for TreeOps {
        async fn create(&self, dir: &Arc<File>, name: &str, perm: u32) -> Result<Arc<File>> {
            let ops: Arc<dyn FileOps> = if perm & dm::DIR != 0 {
                Arc::new(TreeOps)
            } else {
                Arc::new(NoOps)
            };
            File::add(Some(dir), name, None, None, perm, ops)
        }

        async fn remove(&self, _dir: &Arc<File>, _file: &Arc<File>) -> Result<()> {
            Ok(())
        }
    }

    /// A read-only file with fixed contents.
    struct StaticFile(&'static [u8]);

    #[async_trait]
    impl FileOps for StaticFile {
        async fn read(&self, _file: &Arc<File>, buf: &mut [u8], offset: u64) -> Result<usize> {
            let data = self.0;
            let offset = offset as usize;
            if offset >= data.len() {
                return Ok(0);
            }
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }
    }

    /// Stat op that refreshes length before every reply.
    struct Counted(u64);

    #[async_trait]
    impl FileOps for Counted {
        async fn stat(&self, file: &Arc<File>) -> Result<()> {
            file.update_stat(|s| s.length = self.0);
            Ok(())
        }
    }

    /// Wstat op that accepts mode and length changes.
    struct Chmoddable;

    #[async_trait]
    impl FileOps for Chmoddable {
        async fn wstat(&self, file: &Arc<File>, stat: &Stat) -> Result<()> {
            file.update_stat(|s| {
                s.mode = stat.mode;
                s.length = stat.length;
            });
            Ok(())
        }
    }

    #[test]
    fn qid_paths_are_unique_and_increasing() {
        let root = newroot(0o755);
        let mut paths = vec![root.qid().path];

        for name in ["a", "b", "c", "d"] {
            let f = File::add(Some(&root), name, None, None, 0o644, Arc::new(NoOps)).unwrap();
            paths.push(f.qid().path);
        }

        for w in paths.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn qid_type_follows_mode() {
        let root = newroot(0o755);
        assert!(root.qid().typ.contains(QIdType::DIR));

        let f = File::add(Some(&root), "f", None, None, 0o644, Arc::new(NoOps)).unwrap();
        assert!(!f.qid().typ.contains(QIdType::DIR));

        let d =
            File::add(Some(&root), "d", None, None, dm::DIR | 0o755, Arc::new(NoOps)).unwrap();
        assert!(d.qid().typ.contains(QIdType::DIR));
        assert!(d.is_dir());
    }

    #[test]
    fn add_find_remove() {
        let root = newroot(0o755);
        assert!(Arc::ptr_eq(&root.parent().unwrap(), &root));

        let f = File::add(Some(&root), "a", None, None, 0o644, Arc::new(NoOps)).unwrap();
        assert!(Arc::ptr_eq(&root.find("a").unwrap(), &f));
        assert!(Arc::ptr_eq(&f.parent().unwrap(), &root));
        assert!(root.find("b").is_none());

        f.remove();
        assert!(root.find("a").is_none());
        assert!(f.parent().is_none());
        // the stat stays legible after the unlink
        assert_eq!(f.stat().name, "a");

        assert_eq!(f.stat().uid, "none");
        assert_eq!(f.stat().n_uid, NOUID);
    }

    #[test]
    fn sibling_names_are_unique() {
        let root = newroot(0o755);
        File::add(Some(&root), "a", None, None, 0o644, Arc::new(NoOps)).unwrap();

        let err = File::add(Some(&root), "a", None, None, 0o644, Arc::new(NoOps))
            .err()
            .unwrap();
        assert_eq!(err.ename(), "file already exists");

        assert_eq!(root.children.lock().unwrap().list.len(), 1);
    }

    #[test]
    fn removing_root_is_a_noop() {
        let root = newroot(0o755);
        root.remove();
        assert!(Arc::ptr_eq(&root.parent().unwrap(), &root));
    }

    #[test]
    fn perm_check_is_a_union_of_classes() {
        let alice = StaticUser::new("alice", 1001, &[("staff", 20)]);
        let staff = StaticGroup::new("staff", 20);

        let root = newroot(0o755);
        let f = File::add(
            Some(&root),
            "f",
            Some(&alice),
            Some(&staff),
            0o004,
            Arc::new(NoOps),
        )
        .unwrap();

        // the "other" class grants READ even though alice's owner bits deny it
        assert!(f.check_perm(Some(&alice), dm::READ));
        assert!(!f.check_perm(Some(&alice), dm::WRITE));

        // an empty request always passes for a present identity
        assert!(f.check_perm(Some(&alice), 0));
        // no identity, no access
        assert!(!f.check_perm(None, 0));
        assert!(!f.check_perm(None, dm::READ));
    }

    #[test]
    fn perm_check_owner_and_group_classes() {
        let alice = StaticUser::new("alice", 1001, &[("staff", 20)]);
        let bob = StaticUser::new("bob", 1002, &[("wheel", 0)]);
        let carol = StaticUser::new("carol", 1003, &[("staff", 20)]);
        let staff = StaticGroup::new("staff", 20);

        let root = newroot(0o755);
        let f = File::add(
            Some(&root),
            "f",
            Some(&alice),
            Some(&staff),
            0o640,
            Arc::new(NoOps),
        )
        .unwrap();

        assert!(f.check_perm(Some(&alice), dm::READ | dm::WRITE));
        assert!(f.check_perm(Some(&carol), dm::READ));
        assert!(!f.check_perm(Some(&carol), dm::WRITE));
        assert!(!f.check_perm(Some(&bob), dm::READ));
    }

    #[tokio::test]
    async fn attach_binds_root() {
        let root = newroot(0o755);
        let srv = FileSrv::new(root.clone());

        let fid = test_fid(0);
        match srv.rattach(&fid, None, "alice", "", NONUNAME).await.unwrap() {
            FCall::RAttach { qid } => {
                assert_eq!(qid, root.qid());
                assert!(qid.typ.contains(QIdType::DIR));
            }
            r => panic!("unexpected response: {:?}", r),
        }

        assert!(Arc::ptr_eq(&fid.aux.file().await.unwrap(), &root));
    }

    #[tokio::test]
    async fn attach_rejects_unknown_users() {
        let root = newroot(0o755);
        let srv = FileSrv::with_users(root, Arc::new(StaticUsers::new()));

        let fid = test_fid(0);
        let err = srv
            .rattach(&fid, None, "mallory", "", NONUNAME)
            .await
            .err()
            .unwrap();
        assert_eq!(err.ename(), "unknown user");
    }

    #[tokio::test]
    async fn walk_of_nothing_duplicates_the_fid() {
        let root = newroot(0o755);
        let srv = FileSrv::new(root.clone());
        let fid = attach(&srv, 0, "alice").await;

        let newfid = test_fid(1);
        match srv.rwalk(&fid, &newfid, &[]).await.unwrap() {
            FCall::RWalk { wqids } => assert!(wqids.is_empty()),
            r => panic!("unexpected response: {:?}", r),
        }
        assert!(Arc::ptr_eq(&newfid.aux.file().await.unwrap(), &root));
    }

    #[tokio::test]
    async fn walk_dotdot_in_root() {
        let root = newroot(0o755);
        let srv = FileSrv::new(root.clone());
        let fid = attach(&srv, 0, "alice").await;

        let newfid = test_fid(1);
        match srv
            .rwalk(&fid, &newfid, &["..".to_owned()])
            .await
            .unwrap()
        {
            FCall::RWalk { wqids } => assert_eq!(wqids, vec![root.qid()]),
            r => panic!("unexpected response: {:?}", r),
        }
        assert!(Arc::ptr_eq(&newfid.aux.file().await.unwrap(), &root));
    }

    #[tokio::test]
    async fn walk_down_and_back_up() {
        let root = newroot(0o755);
        let a = File::add(Some(&root), "a", None, None, dm::DIR | 0o755, Arc::new(NoOps))
            .unwrap();
        let b = File::add(Some(&a), "b", None, None, dm::DIR | 0o755, Arc::new(NoOps)).unwrap();

        let srv = FileSrv::new(root);
        let fid = attach(&srv, 0, "alice").await;

        let newfid = test_fid(1);
        let wnames: Vec<String> = ["a", "b", ".."].iter().map(|s| s.to_string()).collect();
        match srv.rwalk(&fid, &newfid, &wnames).await.unwrap() {
            FCall::RWalk { wqids } => {
                assert_eq!(wqids, vec![a.qid(), b.qid(), a.qid()]);
            }
            r => panic!("unexpected response: {:?}", r),
        }
        assert!(Arc::ptr_eq(&newfid.aux.file().await.unwrap(), &a));
    }

    #[tokio::test]
    async fn walk_to_nowhere_is_enoent() {
        let root = newroot(0o755);
        let srv = FileSrv::new(root);
        let fid = attach(&srv, 0, "alice").await;

        let newfid = test_fid(1);
        let err = srv
            .rwalk(&fid, &newfid, &["ghost".to_owned()])
            .await
            .err()
            .unwrap();
        assert_eq!(err.ename(), "file not found");
    }

    #[tokio::test]
    async fn partial_walk_returns_the_prefix() {
        let root = newroot(0o755);
        let a = File::add(Some(&root), "a", None, None, dm::DIR | 0o755, Arc::new(NoOps))
            .unwrap();

        let srv = FileSrv::new(root);
        let fid = attach(&srv, 0, "alice").await;

        let newfid = test_fid(1);
        let wnames: Vec<String> = ["a", "ghost"].iter().map(|s| s.to_string()).collect();
        match srv.rwalk(&fid, &newfid, &wnames).await.unwrap() {
            FCall::RWalk { wqids } => assert_eq!(wqids, vec![a.qid()]),
            r => panic!("unexpected response: {:?}", r),
        }
        // bound to the last file reached
        assert!(Arc::ptr_eq(&newfid.aux.file().await.unwrap(), &a));
    }

    #[tokio::test]
    async fn walk_stops_at_unsearchable_directories() {
        let root = newroot(0o755);
        let d = File::add(Some(&root), "d", None, None, dm::DIR | 0o700, Arc::new(NoOps))
            .unwrap();
        File::add(Some(&d), "f", None, None, 0o644, Arc::new(NoOps)).unwrap();

        let srv = FileSrv::new(root);
        let fid = attach(&srv, 0, "bob").await;

        // bob may enter the root but not search d
        let newfid = test_fid(1);
        let wnames: Vec<String> = ["d", "f"].iter().map(|s| s.to_string()).collect();
        match srv.rwalk(&fid, &newfid, &wnames).await.unwrap() {
            FCall::RWalk { wqids } => assert_eq!(wqids, vec![d.qid()]),
            r => panic!("unexpected response: {:?}", r),
        }
    }

    #[tokio::test]
    async fn walk_requires_an_unopened_fid() {
        let root = newroot(0o755);
        let srv = FileSrv::new(root);
        let fid = attach(&srv, 0, "alice").await;

        srv.ropen(&fid, om::READ).await.unwrap();

        let newfid = test_fid(1);
        let err = srv.rwalk(&fid, &newfid, &[]).await.err().unwrap();
        assert_eq!(err.ename(), "walk of open fid");
    }

    #[tokio::test]
    async fn open_honors_permissions() {
        let root = newroot(0o755);
        File::add(Some(&root), "secret", None, None, 0o000, Arc::new(NoOps)).unwrap();

        let srv = FileSrv::new(root.clone());
        let fid = attach(&srv, 0, "alice").await;

        // a permitted open succeeds and reports the file's qid
        match srv.ropen(&fid, om::READ).await.unwrap() {
            FCall::ROpen { qid, iounit } => {
                assert_eq!(qid, root.qid());
                assert_eq!(iounit, 0);
            }
            r => panic!("unexpected response: {:?}", r),
        }

        // reopening the same fid is an error
        let err = srv.ropen(&fid, om::READ).await.err().unwrap();
        assert_eq!(err.ename(), "file already open");

        // mode 0 grants nothing to anyone
        let fid = attach(&srv, 1, "alice").await;
        let newfid = test_fid(2);
        srv.rwalk(&fid, &newfid, &["secret".to_owned()]).await.unwrap();
        let err = srv.ropen(&newfid, om::READ).await.err().unwrap();
        assert_eq!(err.ename(), "permission denied");
    }

    #[tokio::test]
    async fn truncate_needs_write_permission() {
        let root = newroot(0o755);
        File::add(Some(&root), "ro", None, None, 0o444, Arc::new(NoOps)).unwrap();

        let srv = FileSrv::new(root);
        let fid = attach(&srv, 0, "alice").await;
        let newfid = test_fid(1);
        srv.rwalk(&fid, &newfid, &["ro".to_owned()]).await.unwrap();

        let err = srv
            .ropen(&newfid, om::READ | om::TRUNC)
            .await
            .err()
            .unwrap();
        assert_eq!(err.ename(), "permission denied");
    }

    #[tokio::test]
    async fn create_then_stat() {
        let root = File::add(None, "/", None, None, dm::DIR | 0o755, Arc::new(TreeOps)).unwrap();
        let srv = FileSrv::new(root.clone());
        let fid = attach(&srv, 0, "alice").await;

        let created_qid = match srv
            .rcreate(&fid, "hello", 0o644, om::READ, "")
            .await
            .unwrap()
        {
            FCall::RCreate { qid, iounit } => {
                assert_eq!(iounit, 0);
                qid
            }
            r => panic!("unexpected response: {:?}", r),
        };

        // the fid now represents the new file
        match srv.rstat(&fid).await.unwrap() {
            FCall::RStat { stat } => {
                assert_eq!(stat.name, "hello");
                assert_eq!(stat.length, 0);
                assert_eq!(stat.mode, 0o644);
                assert_eq!(stat.qid, created_qid);
            }
            r => panic!("unexpected response: {:?}", r),
        }

        // and walking to it from the root finds the same qid
        let fid2 = attach(&srv, 1, "alice").await;
        let newfid = test_fid(2);
        match srv
            .rwalk(&fid2, &newfid, &["hello".to_owned()])
            .await
            .unwrap()
        {
            FCall::RWalk { wqids } => assert_eq!(wqids, vec![created_qid]),
            r => panic!("unexpected response: {:?}", r),
        }
    }

    #[tokio::test]
    async fn create_needs_a_capability_and_write_permission() {
        // no create ops
        let root = newroot(0o755);
        let srv = FileSrv::new(root);
        let fid = attach(&srv, 0, "alice").await;
        let err = srv
            .rcreate(&fid, "f", 0o644, om::READ, "")
            .await
            .err()
            .unwrap();
        assert_eq!(err.ename(), "permission denied");

        // create ops, but the directory is not writable for this user
        let root = File::add(None, "/", None, None, dm::DIR | 0o555, Arc::new(TreeOps)).unwrap();
        let srv = FileSrv::new(root.clone());
        let fid = attach(&srv, 0, "alice").await;
        let err = srv
            .rcreate(&fid, "f", 0o644, om::READ, "")
            .await
            .err()
            .unwrap();
        assert_eq!(err.ename(), "permission denied");
        assert!(root.find("f").is_none());
    }

    #[tokio::test]
    async fn read_requires_an_open_fid() {
        let root = newroot(0o755);
        File::add(
            Some(&root),
            "motd",
            None,
            None,
            0o644,
            Arc::new(StaticFile(b"hello, 9p\n")),
        )
        .unwrap();

        let srv = FileSrv::new(root);
        let fid = attach(&srv, 0, "alice").await;
        let newfid = test_fid(1);
        srv.rwalk(&fid, &newfid, &["motd".to_owned()]).await.unwrap();

        let err = srv.rread(&newfid, 0, 128).await.err().unwrap();
        assert_eq!(err.ename(), "file not open");

        srv.ropen(&newfid, om::READ).await.unwrap();
        match srv.rread(&newfid, 0, 128).await.unwrap() {
            FCall::RRead { data } => assert_eq!(data.0, b"hello, 9p\n"),
            r => panic!("unexpected response: {:?}", r),
        }

        // offset past the end reads nothing
        match srv.rread(&newfid, 1024, 128).await.unwrap() {
            FCall::RRead { data } => assert!(data.0.is_empty()),
            r => panic!("unexpected response: {:?}", r),
        }

        // a read-only open does not allow writing
        let err = srv
            .rwrite(&newfid, 0, &Data(b"x".to_vec()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.ename(), "file not open");
    }

    #[tokio::test]
    async fn read_without_a_capability_is_denied() {
        let root = newroot(0o755);
        File::add(Some(&root), "blob", None, None, 0o666, Arc::new(NoOps)).unwrap();

        let srv = FileSrv::new(root);
        let fid = attach(&srv, 0, "alice").await;
        let newfid = test_fid(1);
        srv.rwalk(&fid, &newfid, &["blob".to_owned()]).await.unwrap();
        srv.ropen(&newfid, om::RDWR).await.unwrap();

        let err = srv.rread(&newfid, 0, 128).await.err().unwrap();
        assert_eq!(err.ename(), "permission denied");

        let err = srv
            .rwrite(&newfid, 0, &Data(b"x".to_vec()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.ename(), "permission denied");
    }

    fn decode_dir(data: &[u8]) -> Vec<Stat> {
        let mut stats = Vec::new();
        let mut cursor = Cursor::new(data);
        while (cursor.position() as usize) < data.len() {
            stats.push(Stat::decode(&mut cursor, false).unwrap());
        }
        stats
    }

    #[tokio::test]
    async fn directory_read_enumerates_children() {
        let root = newroot(0o755);
        File::add(Some(&root), "a", None, None, 0o644, Arc::new(NoOps)).unwrap();
        File::add(Some(&root), "b", None, None, 0o644, Arc::new(NoOps)).unwrap();
        File::add(Some(&root), "c", None, None, dm::DIR | 0o755, Arc::new(NoOps)).unwrap();

        let srv = FileSrv::new(root);
        let fid = attach(&srv, 0, "alice").await;
        srv.ropen(&fid, om::READ).await.unwrap();

        let data = match srv.rread(&fid, 0, 8192).await.unwrap() {
            FCall::RRead { data } => data.0,
            r => panic!("unexpected response: {:?}", r),
        };

        let names: Vec<String> = decode_dir(&data).into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        // the cursor is exhausted; a continued read returns nothing
        match srv.rread(&fid, data.len() as u64, 8192).await.unwrap() {
            FCall::RRead { data } => assert!(data.0.is_empty()),
            r => panic!("unexpected response: {:?}", r),
        }

        // offset 0 restarts the enumeration
        match srv.rread(&fid, 0, 8192).await.unwrap() {
            FCall::RRead { data } => assert_eq!(decode_dir(&data.0).len(), 3),
            r => panic!("unexpected response: {:?}", r),
        }
    }

    #[tokio::test]
    async fn directory_read_continues_across_small_buffers() {
        let root = newroot(0o755);
        let a = File::add(Some(&root), "a", None, None, 0o644, Arc::new(NoOps)).unwrap();
        File::add(Some(&root), "b", None, None, 0o644, Arc::new(NoOps)).unwrap();

        let srv = FileSrv::new(root);
        let fid = attach(&srv, 0, "alice").await;
        srv.ropen(&fid, om::READ).await.unwrap();

        // room for exactly one entry per read
        let entry = a.stat().size(false) as u32 + 2;
        let first = match srv.rread(&fid, 0, entry).await.unwrap() {
            FCall::RRead { data } => data.0,
            r => panic!("unexpected response: {:?}", r),
        };
        assert_eq!(decode_dir(&first)[0].name, "a");

        let second = match srv.rread(&fid, first.len() as u64, entry).await.unwrap() {
            FCall::RRead { data } => data.0,
            r => panic!("unexpected response: {:?}", r),
        };
        assert_eq!(decode_dir(&second)[0].name, "b");

        // a buffer too small for even one entry yields an empty read
        match srv.rread(&fid, 0, 4).await.unwrap() {
            FCall::RRead { data } => assert!(data.0.is_empty()),
            r => panic!("unexpected response: {:?}", r),
        }
    }

    #[tokio::test]
    async fn remove_non_empty_directory_is_refused() {
        let root = File::add(None, "/", None, None, dm::DIR | 0o755, Arc::new(TreeOps)).unwrap();
        let d = File::add(Some(&root), "d", None, None, dm::DIR | 0o755, Arc::new(TreeOps))
            .unwrap();
        File::add(Some(&d), "f", None, None, 0o644, Arc::new(NoOps)).unwrap();

        let srv = FileSrv::new(root.clone());
        let fid = attach(&srv, 0, "alice").await;
        let newfid = test_fid(1);
        srv.rwalk(&fid, &newfid, &["d".to_owned()]).await.unwrap();

        let err = srv.rremove(&newfid).await.err().unwrap();
        assert_eq!(err.ename(), "directory not empty");

        // both files are still reachable
        assert!(root.find("d").is_some());
        assert!(d.find("f").is_some());
    }

    #[tokio::test]
    async fn remove_consults_the_parent_ops() {
        // the parent has no remove capability
        let root = newroot(0o755);
        let f = File::add(Some(&root), "f", None, None, 0o644, Arc::new(NoOps)).unwrap();

        let srv = FileSrv::new(root.clone());
        let fid = attach(&srv, 0, "alice").await;
        let newfid = test_fid(1);
        srv.rwalk(&fid, &newfid, &["f".to_owned()]).await.unwrap();

        let err = srv.rremove(&newfid).await.err().unwrap();
        assert_eq!(err.ename(), "permission denied");
        assert!(root.find("f").is_some());
        assert!(f.parent().is_some());

        // with the capability the file goes away
        let root = File::add(None, "/", None, None, dm::DIR | 0o755, Arc::new(TreeOps)).unwrap();
        let f = File::add(Some(&root), "f", None, None, 0o644, Arc::new(NoOps)).unwrap();

        let srv = FileSrv::new(root.clone());
        let fid = attach(&srv, 0, "alice").await;
        let newfid = test_fid(1);
        srv.rwalk(&fid, &newfid, &["f".to_owned()]).await.unwrap();

        match srv.rremove(&newfid).await.unwrap() {
            FCall::RRemove => {}
            r => panic!("unexpected response: {:?}", r),
        }
        assert!(root.find("f").is_none());
        assert!(f.parent().is_none());
    }

    #[tokio::test]
    async fn stat_capability_refreshes_the_stat() {
        let root = newroot(0o755);
        File::add(Some(&root), "n", None, None, 0o644, Arc::new(Counted(42))).unwrap();

        let srv = FileSrv::new(root);
        let fid = attach(&srv, 0, "alice").await;
        let newfid = test_fid(1);
        srv.rwalk(&fid, &newfid, &["n".to_owned()]).await.unwrap();

        match srv.rstat(&newfid).await.unwrap() {
            FCall::RStat { stat } => assert_eq!(stat.length, 42),
            r => panic!("unexpected response: {:?}", r),
        }
    }

    #[tokio::test]
    async fn wstat_requires_a_capability() {
        let root = newroot(0o755);
        File::add(Some(&root), "plain", None, None, 0o644, Arc::new(NoOps)).unwrap();
        let w = File::add(Some(&root), "w", None, None, 0o644, Arc::new(Chmoddable)).unwrap();

        let srv = FileSrv::new(root);
        let fid = attach(&srv, 0, "alice").await;

        let newfid = test_fid(1);
        srv.rwalk(&fid, &newfid, &["plain".to_owned()]).await.unwrap();
        let stat = Stat::default();
        let err = srv.rwstat(&newfid, &stat).await.err().unwrap();
        assert_eq!(err.ename(), "permission denied");

        let newfid = test_fid(2);
        srv.rwalk(&fid, &newfid, &["w".to_owned()]).await.unwrap();
        let stat = Stat {
            mode: 0o600,
            length: 7,
            ..Default::default()
        };
        match srv.rwstat(&newfid, &stat).await.unwrap() {
            FCall::RWStat => {}
            r => panic!("unexpected response: {:?}", r),
        }
        assert_eq!(w.stat().mode, 0o600);
        assert_eq!(w.stat().length, 7);
    }

    #[tokio::test]
    async fn read_count_is_clamped_to_msize() {
        let root = newroot(0o755);
        File::add(
            Some(&root),
            "big",
            None,
            None,
            0o644,
            Arc::new(StaticFile(&[0x5a; 65536])),
        )
        .unwrap();

        let srv = FileSrv::new(root);
        let fid = attach(&srv, 0, "alice").await;
        let newfid = test_fid(1);
        srv.rwalk(&fid, &newfid, &["big".to_owned()]).await.unwrap();
        srv.ropen(&newfid, om::READ).await.unwrap();

        match srv.rread(&newfid, 0, u32::MAX).await.unwrap() {
            FCall::RRead { data } => {
                assert_eq!(data.0.len(), (MSIZE - IOHDRSZ) as usize);
            }
            r => panic!("unexpected response: {:?}", r),
        }
    }
}
