//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000/9P2000.u

use {
    crate::{
        error::{self, errno::*},
        fcall::*,
        io_err, serialize,
        utils::{self, Result},
    },
    async_trait::async_trait,
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::{error, info},
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicU32, Ordering},
        },
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::{Mutex, RwLock},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::length_delimited::LengthDelimitedCodec,
};

/// Negotiated state of one client connection.
///
/// `Tversion` fixes the maximum message size and whether the connection
/// speaks 9P2000.u; both govern how later messages are served and encoded.
#[derive(Debug)]
pub struct Conn {
    msize: AtomicU32,
    dotu: AtomicBool,
}

impl Conn {
    pub fn new() -> Conn {
        Conn {
            msize: AtomicU32::new(MSIZE),
            dotu: AtomicBool::new(false),
        }
    }

    /// Maximum message size agreed with the client.
    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::Relaxed)
    }

    /// Whether the connection speaks 9P2000.u.
    pub fn dotu(&self) -> bool {
        self.dotu.load(Ordering::Relaxed)
    }

    pub(crate) fn negotiate(&self, msize: u32, dotu: bool) {
        self.msize.store(msize, Ordering::Relaxed);
        self.dotu.store(dotu, Ordering::Relaxed);
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::new()
    }
}

/// Represents a fid of clients holding associated `Filesystem::FId`.
pub struct FId<T> {
    /// Raw client side fid.
    fid: u32,

    /// The connection the fid belongs to.
    conn: Arc<Conn>,

    /// `Filesystem::FId` associated with this fid.
    /// Changing this value affects the continuous callbacks.
    pub aux: T,
}

impl<T> FId<T> {
    pub(crate) fn new(fid: u32, conn: Arc<Conn>, aux: T) -> FId<T> {
        FId { fid, conn, aux }
    }

    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// Get the connection state the fid belongs to.
    pub fn conn(&self) -> &Conn {
        &self.conn
    }
}

/// Filesystem server trait for implementing 9P2000/9P2000.u servers.
///
/// Implementors can represent an error condition by returning an `Err`.
/// Otherwise, they must return the appropriate `FCall` response with required
/// fields.
///
/// Most methods default to `EOPNOTSUPP`, so a server implements only the
/// operations its tree supports. `rversion` and `rflush` carry working
/// defaults; `rclunk` defaults to success because a clunk must always
/// succeed and the fid bookkeeping happens in the dispatch loop.
///
/// # Error Handling
/// Return `Err(error::Error::No(errno))` for an errno with its canonical
/// message, or `Err(error::Error::Msg(ename, errno))` for an explicit ename.
/// The dispatch loop turns either into an `Rerror` (with the errno included
/// when the connection speaks 9P2000.u).
#[async_trait]
pub trait Filesystem: Send {
    /// User defined fid type to be associated with a client's fid.
    ///
    /// This type stores per-fid state such as the bound file, the identity
    /// that attached, or an enumeration cursor.
    type FId: Send + Sync + Default;

    /// Authenticate a user.
    ///
    /// The afid will be used for the authentication data exchange. Servers
    /// that require no authentication keep the default.
    async fn rauth(
        &self,
        _: &FId<Self::FId>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Attach to the filesystem root.
    ///
    /// The first operation performed by a client after version negotiation.
    /// It associates the fid with the root of the served tree.
    ///
    /// # Arguments
    /// * `fid` - The fid to associate with the root
    /// * `afid` - Optional authentication fid
    /// * `uname` - The user name
    /// * `aname` - The file tree to access
    /// * `n_uname` - Numeric user id (9P2000.u; `NONUNAME` otherwise)
    async fn rattach(
        &self,
        _: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Abort a pending operation.
    ///
    /// The core never cancels an in-flight operation; the default simply
    /// acknowledges with `RFlush` as the protocol requires.
    async fn rflush(&self, _old: Option<&FCall>) -> Result<FCall> {
        Ok(FCall::RFlush)
    }

    /// Walk the directory tree.
    ///
    /// Resolves a sequence of path components against `fid`, binding
    /// `newfid` to the destination.
    async fn rwalk(
        &self,
        _: &FId<Self::FId>,
        _new: &FId<Self::FId>,
        _wnames: &[String],
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Open a file.
    ///
    /// `mode` is the classic open mode word (`om::READ` etc., possibly with
    /// `om::TRUNC` or'ed in), to be checked against the file permissions.
    async fn ropen(&self, _: &FId<Self::FId>, _mode: u8) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Create a file in the directory represented by `fid`.
    ///
    /// After creation the fid represents the newly created file, open with
    /// `mode`. `ext` carries 9P2000.u special-file data and is empty
    /// otherwise.
    async fn rcreate(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _perm: u32,
        _mode: u8,
        _ext: &str,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Read data from a file.
    async fn rread(&self, _: &FId<Self::FId>, _offset: u64, _count: u32) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Write data to a file.
    async fn rwrite(&self, _: &FId<Self::FId>, _offset: u64, _data: &Data) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Close a fid.
    ///
    /// A clunk always succeeds; the dispatch loop drops the fid whatever the
    /// return value.
    async fn rclunk(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Ok(FCall::RClunk)
    }

    /// Remove the file represented by the fid, then clunk it.
    ///
    /// The fid is dropped by the dispatch loop even when the remove fails,
    /// as the protocol demands.
    async fn rremove(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Get file metadata.
    async fn rstat(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Modify file metadata.
    async fn rwstat(&self, _: &FId<Self::FId>, _stat: &Stat) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Negotiate protocol version and message size.
    ///
    /// The default accepts 9P2000 and 9P2000.u and answers `unknown` for
    /// anything else, capping msize at `MSIZE`.
    async fn rversion(&self, msize: u32, ver: &str) -> Result<FCall> {
        let version = if ver.starts_with(P92000U) {
            P92000U
        } else if ver.starts_with(P92000) {
            P92000
        } else {
            VERSION_UNKNOWN
        };

        Ok(FCall::RVersion {
            msize: msize.min(MSIZE),
            version: version.to_owned(),
        })
    }
}

#[rustfmt::skip]
async fn dispatch_once<Fs, FsFId>(
    msg: &Msg,
    fs: Arc<Fs>,
    fsfids: Arc<RwLock<HashMap<u32, FId<FsFId>>>>,
    conn: Arc<Conn>,
) -> Result<FCall>
where
    Fs: Filesystem<FId = FsFId> + Send + Sync,
    FsFId: Send + Sync + Default,
{
    let newfid = msg
        .body
        .newfid()
        .map(|f| FId::new(f, conn.clone(), Default::default()));

    use crate::FCall::*;
    let response = {
        let fids = fsfids.read().await;
        let get_fid = |fid: &u32| fids.get(fid).ok_or(error::Error::No(EBADF));
        let get_newfid = || newfid.as_ref().ok_or(error::Error::No(EPROTO));

        let fut = match msg.body {
            TVersion { ref msize, ref version }                     => fs.rversion(*msize, version),
            TAuth { afid: _, ref uname, ref aname, ref n_uname }    => fs.rauth(get_newfid()?, uname, aname, *n_uname),
            TAttach { fid: _, afid: _, ref uname, ref aname, ref n_uname }
                                                                    => fs.rattach(get_newfid()?, None, uname, aname, *n_uname),
            TFlush { oldtag: _ }                                    => fs.rflush(None),
            TWalk { fid, newfid: _, ref wnames }                    => fs.rwalk(get_fid(&fid)?, get_newfid()?, wnames),
            TOpen { fid, ref mode }                                 => fs.ropen(get_fid(&fid)?, *mode),
            TCreate { fid, ref name, ref perm, ref mode, ref ext }  => fs.rcreate(get_fid(&fid)?, name, *perm, *mode, ext),
            TRead { fid, ref offset, ref count }                    => fs.rread(get_fid(&fid)?, *offset, *count),
            TWrite { fid, ref offset, ref data }                    => fs.rwrite(get_fid(&fid)?, *offset, data),
            TClunk { fid }                                          => fs.rclunk(get_fid(&fid)?),
            TRemove { fid }                                         => fs.rremove(get_fid(&fid)?),
            TStat { fid }                                           => fs.rstat(get_fid(&fid)?),
            TWStat { fid, ref stat }                                => fs.rwstat(get_fid(&fid)?, stat),
            _                                                       => return Err(error::Error::No(EOPNOTSUPP)),
        };

        fut.await
    };

    /* A clunked fid is gone, and a Tremove clunks even when the remove fails */
    match msg.body {
        TClunk { fid } | TRemove { fid } => {
            let mut fids = fsfids.write().await;
            fids.remove(&fid);
        }
        _ => {}
    }

    let response = response?;

    if let Some(newfid) = newfid {
        let mut fids = fsfids.write().await;
        fids.insert(newfid.fid, newfid);
    }

    Ok(response)
}

/// Serve one already-established connection until its stream ends.
///
/// This is the entry point the accept loops feed; it is public so a server
/// can also be driven over a byte stream the caller already holds, such as
/// an in-process duplex pipe.
pub async fn dispatch<Fs, Reader, Writer>(
    filesystem: Fs,
    reader: Reader,
    writer: Writer,
) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync,
    Reader: 'static + AsyncRead + Send + std::marker::Unpin,
    Writer: 'static + AsyncWrite + Send + std::marker::Unpin,
{
    let fsfids = Arc::new(RwLock::new(HashMap::new()));
    let filesystem = Arc::new(filesystem);
    let conn = Arc::new(Conn::new());

    let mut framedread = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_read(reader);
    let framedwrite = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_write(writer);
    let framedwrite = Arc::new(Mutex::new(framedwrite));

    while let Some(bytes) = framedread.next().await {
        let bytes = bytes?;

        let msg = serialize::read_msg(&mut bytes.reader(), conn.dotu())?;
        info!("\t← {:?}", msg);

        let fids = fsfids.clone();
        let fs = filesystem.clone();
        let framedwrite = framedwrite.clone();
        let conn = conn.clone();

        tokio::spawn(async move {
            let response_fcall = dispatch_once(&msg, fs, fids, conn.clone())
                .await
                .unwrap_or_else(|e| {
                    error!("{:?}: Error: \"{}\": {:?}", MsgType::from(&msg.body), e, e);
                    FCall::RError {
                        ename: e.ename(),
                        errno: e.errno(),
                    }
                });

            if let FCall::RVersion { msize, version } = &response_fcall {
                conn.negotiate(*msize, version == P92000U);
            }

            if MsgType::from(&response_fcall).is_r() {
                let response = Msg {
                    tag: msg.tag,
                    body: response_fcall,
                };

                let mut writer = bytes::BytesMut::with_capacity(4096).writer();
                if let Err(e) = serialize::write_msg(&mut writer, &response, conn.dotu()) {
                    error!("Failed to serialize response for tag {}: {:?}", msg.tag, e);
                    return;
                }

                let frozen = writer.into_inner().freeze();
                {
                    let mut framedwrite_locked = framedwrite.lock().await;
                    if let Err(e) = framedwrite_locked.send(frozen).await {
                        error!("Failed to send response for tag {}: {:?}", msg.tag, e);
                        return;
                    }
                }
                info!("\t→ {:?}", response);
            }
        });
    }

    Ok(())
}

async fn srv_async_tcp<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let fs = filesystem.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            let res = dispatch(fs, readhalf, writehalf).await;
            if let Err(e) = res {
                error!("Error: {}: {:?}", e, e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl std::ops::DerefMut for DeleteOnDrop {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            eprintln!(
                "Warning: Failed to remove socket file {:?}: {}",
                self.path, e
            );
        }
    }
}

pub async fn srv_async_unix<Fs>(filesystem: Fs, addr: impl AsRef<Path>) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let running = Arc::new(AtomicBool::new(true));

    {
        let running = running.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                }
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        info!("accepted: {:?}", peer);

                        let fs = filesystem.clone();
                        tokio::spawn(async move {
                            let (readhalf, writehalf) = tokio::io::split(stream);
                            let res = dispatch(fs, readhalf, writehalf).await;
                            if let Err(e) = res {
                                error!("Error: {:?}", e);
                            }
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {
                // Allow the server to check the running flag
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Start a server listening on `addr`, given as `proto!address!port`
/// where proto is `tcp` or `unix`.
pub async fn srv_async<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let (proto, address, port) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    match proto {
        "tcp" => srv_async_tcp(filesystem, &format!("{}:{}", address, port)).await,
        "unix" => srv_async_unix(filesystem, format!("{}:{}", address, port)).await,
        _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullFs;

    #[async_trait]
    impl Filesystem for NullFs {
        type FId = ();
    }

    #[tokio::test]
    async fn version_negotiation() {
        let fs = NullFs;

        match fs.rversion(MSIZE, P92000U).await.unwrap() {
            FCall::RVersion { msize, version } => {
                assert_eq!(msize, MSIZE);
                assert_eq!(version, P92000U);
            }
            r => panic!("unexpected response: {:?}", r),
        }

        match fs.rversion(1024, P92000).await.unwrap() {
            FCall::RVersion { msize, version } => {
                assert_eq!(msize, 1024);
                assert_eq!(version, P92000);
            }
            r => panic!("unexpected response: {:?}", r),
        }

        match fs.rversion(MSIZE * 4, "9P1776").await.unwrap() {
            FCall::RVersion { msize, version } => {
                assert_eq!(msize, MSIZE);
                assert_eq!(version, VERSION_UNKNOWN);
            }
            r => panic!("unexpected response: {:?}", r),
        }
    }

    #[test]
    fn conn_defaults() {
        let conn = Conn::new();
        assert_eq!(conn.msize(), MSIZE);
        assert!(!conn.dotu());

        conn.negotiate(1024, true);
        assert_eq!(conn.msize(), 1024);
        assert!(conn.dotu());
    }
}
