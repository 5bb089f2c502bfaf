//! Minimal client side 9P library.
//!
//! Enough of a client to mount a server and remove files by path: version
//! negotiation, attach, walk, clunk and remove. One request is in flight at
//! a time; requests are serialized on the transport.

use {
    crate::{
        error::Error,
        fcall::*,
        io_err, res, serialize,
        utils::Result,
    },
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::info,
    std::collections::BTreeSet,
    tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::Mutex,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite, length_delimited::LengthDelimitedCodec},
};

/// A fid held by the client, with the qid of the file it reached.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Fid {
    fid: u32,
    pub qid: QId,
}

impl Fid {
    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }
}

/// Allocates fid numbers, reusing released ids.
///
/// Release is idempotent: the free list is a set, so the defensive double
/// release in [`Clnt::fremove`] cannot hand an id out twice.
struct FidPool {
    next: u32,
    free: BTreeSet<u32>,
}

impl FidPool {
    fn new() -> FidPool {
        FidPool {
            next: 0,
            free: BTreeSet::new(),
        }
    }

    fn get(&mut self) -> u32 {
        if let Some(&id) = self.free.iter().next() {
            self.free.remove(&id);
            id
        } else {
            let id = self.next;
            self.next += 1;
            id
        }
    }

    fn put(&mut self, id: u32) {
        if id < self.next {
            self.free.insert(id);
        }
    }
}

struct Transport<R, W> {
    reader: FramedRead<R, LengthDelimitedCodec>,
    writer: FramedWrite<W, LengthDelimitedCodec>,
    next_tag: u16,
}

impl<R, W> Transport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn rpc(&mut self, tag: u16, body: FCall, dotu: bool) -> Result<FCall> {
        let msg = Msg { tag, body };

        let mut writer = bytes::BytesMut::with_capacity(4096).writer();
        serialize::write_msg(&mut writer, &msg, dotu)?;
        self.writer.send(writer.into_inner().freeze()).await?;
        info!("\t→ {:?}", msg);

        let bytes = self
            .reader
            .next()
            .await
            .ok_or_else(|| io_err!(UnexpectedEof, "connection closed"))??;
        let resp = serialize::read_msg(&mut bytes.reader(), dotu)?;
        info!("\t← {:?}", resp);

        if resp.tag != msg.tag {
            return res!(io_err!(InvalidData, "response tag mismatch"));
        }

        match resp.body {
            FCall::RError { ename, errno } => Err(Error::Msg(ename, errno)),
            body => Ok(body),
        }
    }
}

/// A 9P client attached to a server.
pub struct Clnt<R, W> {
    transport: Mutex<Transport<R, W>>,
    fidpool: Mutex<FidPool>,
    msize: u32,
    dotu: bool,
    root: Fid,
}

impl<R, W> Clnt<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Negotiates the protocol over the given byte stream and attaches as
    /// `uname`. With `dotu` the client offers 9P2000.u and falls back to
    /// 9P2000 if the server prefers it.
    pub async fn mount(reader: R, writer: W, uname: &str, aname: &str, dotu: bool) -> Result<Self> {
        let framedread = LengthDelimitedCodec::builder()
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

        let mut transport = Transport {
            reader: framedread,
            writer: framedwrite,
            next_tag: 0,
        };

        let requested = if dotu { P92000U } else { P92000 };
        let tversion = FCall::TVersion {
            msize: MSIZE,
            version: requested.to_owned(),
        };
        let (msize, version) = match transport.rpc(NOTAG, tversion, dotu).await? {
            FCall::RVersion { msize, version } => (msize, version),
            _ => return res!(io_err!(InvalidData, "unexpected response to Tversion")),
        };

        if version != P92000 && version != P92000U {
            return res!(io_err!(InvalidData, "protocol not supported"));
        }
        let dotu = version == P92000U;

        let mut fidpool = FidPool::new();
        let rootfid = fidpool.get();

        let tattach = FCall::TAttach {
            fid: rootfid,
            afid: NOFID,
            uname: uname.to_owned(),
            aname: aname.to_owned(),
            n_uname: NONUNAME,
        };
        let qid = match transport.rpc(0, tattach, dotu).await? {
            FCall::RAttach { qid } => qid,
            _ => return res!(io_err!(InvalidData, "unexpected response to Tattach")),
        };

        transport.next_tag = 1;

        Ok(Clnt {
            transport: Mutex::new(transport),
            fidpool: Mutex::new(fidpool),
            msize,
            dotu,
            root: Fid { fid: rootfid, qid },
        })
    }

    /// The fid bound to the server's root by the attach.
    pub fn root(&self) -> Fid {
        self.root
    }

    /// Negotiated maximum message size.
    pub fn msize(&self) -> u32 {
        self.msize
    }

    /// Whether the connection speaks 9P2000.u.
    pub fn dotu(&self) -> bool {
        self.dotu
    }

    async fn rpc(&self, body: FCall) -> Result<FCall> {
        let mut transport = self.transport.lock().await;

        let tag = if transport.next_tag == NOTAG {
            0
        } else {
            transport.next_tag
        };
        transport.next_tag = tag.wrapping_add(1);

        transport.rpc(tag, body, self.dotu).await
    }

    /// Walks from `from` to a new fid, `MAXWELEM` components per message.
    ///
    /// The walk must reach the final component; when the server answers
    /// with a shorter qid prefix the new fid is clunked and `Enoent` comes
    /// back.
    pub async fn walk(&self, from: Fid, wnames: &[&str]) -> Result<Fid> {
        let newfid = self.fidpool.lock().await.get();

        let mut qid = from.qid;
        let mut first = true;
        let mut rest = wnames;

        loop {
            let n = rest.len().min(MAXWELEM);
            let batch: Vec<String> = rest[..n].iter().map(|s| s.to_string()).collect();
            let srcfid = if first { from.fid } else { newfid };

            match self
                .rpc(FCall::TWalk {
                    fid: srcfid,
                    newfid,
                    wnames: batch,
                })
                .await
            {
                Ok(FCall::RWalk { wqids }) => {
                    let complete = wqids.len() == n;
                    if let Some(last) = wqids.last() {
                        qid = *last;
                    }
                    if !complete {
                        // bound short of the target; give the fid back
                        let _ = self.clunk(Fid { fid: newfid, qid }).await;
                        return Err(Error::enoent());
                    }
                }
                Ok(_) => {
                    self.fidpool.lock().await.put(newfid);
                    return res!(io_err!(InvalidData, "unexpected response to Twalk"));
                }
                Err(e) => {
                    if first {
                        // nothing was bound server side
                        self.fidpool.lock().await.put(newfid);
                    } else {
                        let _ = self.clunk(Fid { fid: newfid, qid }).await;
                    }
                    return Err(e);
                }
            }

            first = false;
            rest = &rest[n..];
            if rest.is_empty() {
                break;
            }
        }

        Ok(Fid { fid: newfid, qid })
    }

    /// Walks to `path`, a `/`-separated name relative to the root.
    pub async fn fwalk(&self, path: &str) -> Result<Fid> {
        let wnames: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        self.walk(self.root, &wnames).await
    }

    /// Clunks the fid. Its id goes back to the pool whatever the server
    /// says.
    pub async fn clunk(&self, fid: Fid) -> Result<()> {
        let res = self.rpc(FCall::TClunk { fid: fid.fid }).await;
        self.fidpool.lock().await.put(fid.fid);

        match res? {
            FCall::RClunk => Ok(()),
            _ => res!(io_err!(InvalidData, "unexpected response to Tclunk")),
        }
    }

    /// Removes the file associated with the fid.
    ///
    /// The server clunks the fid even when the remove fails, so its id goes
    /// back to the pool regardless of the outcome.
    pub async fn remove(&self, fid: Fid) -> Result<()> {
        let res = self.rpc(FCall::TRemove { fid: fid.fid }).await;
        self.fidpool.lock().await.put(fid.fid);

        match res? {
            FCall::RRemove => Ok(()),
            _ => res!(io_err!(InvalidData, "unexpected response to Tremove")),
        }
    }

    /// Removes the named file.
    pub async fn fremove(&self, path: &str) -> Result<()> {
        let fid = self.fwalk(path).await?;

        let res = self.remove(fid).await;
        if res.is_err() {
            // the walk succeeded but the remove may never have reached the
            // server's tree; make sure the fid is not leaked
            let _ = self.clunk(fid).await;
        }

        res
    }
}
