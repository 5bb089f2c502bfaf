//! Serialize/deserialize 9P messages into/from binary.
//!
//! 9P2000.u changes the wire form of several messages (stat records grow
//! extension fields, `Rerror` gains an errno, `Tattach`/`Tauth` gain a
//! numeric uname, `Tcreate` gains an extension string), so both traits take
//! the connection's `dotu` flag.

use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr, $dotu:expr) => {
        Decodable::decode(&mut $decoder, $dotu)?
    };

    ($typ:ident, $buf:expr, $dotu:expr) => {
        $typ::from_bits_truncate(decode!($buf, $dotu))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
    dotu: bool,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W, dotu: bool) -> Encoder<W> {
        Encoder {
            writer,
            bytes: 0,
            dotu,
        }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer, self.dotu)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
    dotu: bool,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R, dotu: bool) -> Decoder<R> {
        Decoder { reader, dotu }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader, self.dotu)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, _dotu: bool) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, _dotu: bool) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, _dotu: bool) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, _dotu: bool) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w, dotu)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> Result<usize> {
        match Encoder::new(w, dotu) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> Result<usize> {
        let buf = Encoder::new(w, dotu)
            << &self.size(dotu)
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid;

        let buf = if dotu {
            buf << &self.ext << &self.n_uid << &self.n_gid << &self.n_muid
        } else {
            buf
        };

        match buf {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w, dotu)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> Result<usize> {
        match self.iter().fold(
            Encoder::new(w, dotu) << &(self.len() as u16),
            |acc, s| acc << s,
        ) {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W, dotu: bool) -> Result<usize> {
        use crate::FCall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w, dotu) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TAuth {
                ref afid,
                ref uname,
                ref aname,
                ref n_uname,
            } => {
                let buf = buf << afid << uname << aname;
                if dotu { buf << n_uname } else { buf }
            }
            RAuth { ref aqid } => buf << aqid,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
                ref n_uname,
            } => {
                let buf = buf << fid << afid << uname << aname;
                if dotu { buf << n_uname } else { buf }
            }
            RAttach { ref qid } => buf << qid,
            RError {
                ref ename,
                ref errno,
            } => {
                let buf = buf << ename;
                if dotu { buf << errno } else { buf }
            }
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => buf,
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TOpen { ref fid, ref mode } => buf << fid << mode,
            ROpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
                ref ext,
            } => {
                let buf = buf << fid << name << perm << mode;
                if dotu { buf << ext } else { buf }
            }
            RCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => buf,
            TRemove { ref fid } => buf << fid,
            RRemove => buf,
            TStat { ref fid } => buf << fid,
            // stat records in RStat/TWStat travel with an extra count
            RStat { ref stat } => buf << &(stat.size(dotu) + 2) << stat,
            TWStat { ref fid, ref stat } => buf << fid << &(stat.size(dotu) + 2) << stat,
            RWStat => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R, _dotu: bool) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R, _dotu: bool) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R, _dotu: bool) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R, _dotu: bool) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Self> {
        let len: u16 = Decodable::decode(r, dotu)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(Other, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Self> {
        Ok(QId {
            typ: decode!(QIdType, *r, dotu),
            version: decode!(*r, dotu),
            path: decode!(*r, dotu),
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Self> {
        let mut buf = r;

        let _size: u16 = decode!(buf, dotu);
        let mut stat = Stat {
            typ: decode!(buf, dotu),
            dev: decode!(buf, dotu),
            qid: decode!(buf, dotu),
            mode: decode!(buf, dotu),
            atime: decode!(buf, dotu),
            mtime: decode!(buf, dotu),
            length: decode!(buf, dotu),
            name: decode!(buf, dotu),
            uid: decode!(buf, dotu),
            gid: decode!(buf, dotu),
            muid: decode!(buf, dotu),
            ext: String::new(),
            n_uid: NOUID,
            n_gid: NOUID,
            n_muid: NOUID,
        };

        if dotu {
            stat.ext = decode!(buf, dotu);
            stat.n_uid = decode!(buf, dotu);
            stat.n_gid = decode!(buf, dotu);
            stat.n_muid = decode!(buf, dotu);
        }

        Ok(stat)
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Self> {
        let len: u32 = Decodable::decode(r, dotu)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Self> {
        let len: u16 = Decodable::decode(r, dotu)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r, dotu)?);
        }
        Ok(buf)
    }
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf, dotu));
        let tag = decode!(buf, dotu);
        let body = match msg_type {
            Some(TVersion) => FCall::TVersion {
                msize: decode!(buf, dotu),
                version: decode!(buf, dotu),
            },
            Some(RVersion) => FCall::RVersion {
                msize: decode!(buf, dotu),
                version: decode!(buf, dotu),
            },
            Some(TAuth) => FCall::TAuth {
                afid: decode!(buf, dotu),
                uname: decode!(buf, dotu),
                aname: decode!(buf, dotu),
                n_uname: if dotu { decode!(buf, dotu) } else { NONUNAME },
            },
            Some(RAuth) => FCall::RAuth {
                aqid: decode!(buf, dotu),
            },
            Some(TAttach) => FCall::TAttach {
                fid: decode!(buf, dotu),
                afid: decode!(buf, dotu),
                uname: decode!(buf, dotu),
                aname: decode!(buf, dotu),
                n_uname: if dotu { decode!(buf, dotu) } else { NONUNAME },
            },
            Some(RAttach) => FCall::RAttach {
                qid: decode!(buf, dotu),
            },
            Some(RError) => FCall::RError {
                ename: decode!(buf, dotu),
                errno: if dotu { decode!(buf, dotu) } else { 0 },
            },
            Some(TFlush) => FCall::TFlush {
                oldtag: decode!(buf, dotu),
            },
            Some(RFlush) => FCall::RFlush,
            Some(TWalk) => FCall::TWalk {
                fid: decode!(buf, dotu),
                newfid: decode!(buf, dotu),
                wnames: decode!(buf, dotu),
            },
            Some(RWalk) => FCall::RWalk {
                wqids: decode!(buf, dotu),
            },
            Some(TOpen) => FCall::TOpen {
                fid: decode!(buf, dotu),
                mode: decode!(buf, dotu),
            },
            Some(ROpen) => FCall::ROpen {
                qid: decode!(buf, dotu),
                iounit: decode!(buf, dotu),
            },
            Some(TCreate) => FCall::TCreate {
                fid: decode!(buf, dotu),
                name: decode!(buf, dotu),
                perm: decode!(buf, dotu),
                mode: decode!(buf, dotu),
                ext: if dotu {
                    decode!(buf, dotu)
                } else {
                    String::new()
                },
            },
            Some(RCreate) => FCall::RCreate {
                qid: decode!(buf, dotu),
                iounit: decode!(buf, dotu),
            },
            Some(TRead) => FCall::TRead {
                fid: decode!(buf, dotu),
                offset: decode!(buf, dotu),
                count: decode!(buf, dotu),
            },
            Some(RRead) => FCall::RRead {
                data: decode!(buf, dotu),
            },
            Some(TWrite) => FCall::TWrite {
                fid: decode!(buf, dotu),
                offset: decode!(buf, dotu),
                data: decode!(buf, dotu),
            },
            Some(RWrite) => FCall::RWrite {
                count: decode!(buf, dotu),
            },
            Some(TClunk) => FCall::TClunk {
                fid: decode!(buf, dotu),
            },
            Some(RClunk) => FCall::RClunk,
            Some(TRemove) => FCall::TRemove {
                fid: decode!(buf, dotu),
            },
            Some(RRemove) => FCall::RRemove,
            Some(TStat) => FCall::TStat {
                fid: decode!(buf, dotu),
            },
            Some(RStat) => {
                let _nstat: u16 = decode!(buf, dotu);
                FCall::RStat {
                    stat: decode!(buf, dotu),
                }
            }
            Some(TWStat) => {
                let fid = decode!(buf, dotu);
                let _nstat: u16 = decode!(buf, dotu);
                FCall::TWStat {
                    fid,
                    stat: decode!(buf, dotu),
                }
            }
            Some(RWStat) => FCall::RWStat,
            None => return res!(io_err!(Other, "Invalid message type")),
        };

        Ok(Msg { tag, body })
    }
}

/// Helper function to read a 9P message from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Msg> {
    Decodable::decode(r, dotu)
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg, dotu: bool) -> Result<usize> {
    msg.encode(w, dotu)
}

#[test]
fn encoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut encoder = Vec::new();
    for i in 0..10 {
        (i as u8).encode(&mut encoder, false).unwrap();
    }
    assert_eq!(expected, encoder);
}

#[test]
fn decoder_test1() {
    use std::io::Cursor;

    let expected: Vec<u8> = (0..10).collect();
    let mut decoder = Cursor::new(expected.clone());
    let mut actual: Vec<u8> = Vec::new();
    while let Ok(i) = Decodable::decode(&mut decoder, false) {
        actual.push(i);
    }
    assert_eq!(expected, actual);
}

#[test]
fn msg_encode_decode1() {
    use std::io::Cursor;

    let expected = Msg {
        tag: 0xdead,
        body: FCall::RVersion {
            msize: 40,
            version: P92000.to_owned(),
        },
    };
    let mut buf = Vec::new();
    let _ = expected.encode(&mut buf, false);

    let mut readbuf = Cursor::new(buf);
    let actual = Decodable::decode(&mut readbuf, false);

    assert_eq!(expected, actual.unwrap());
}

#[test]
fn walk_roundtrip() {
    use std::io::Cursor;

    let expected = Msg {
        tag: 1,
        body: FCall::TWalk {
            fid: 0,
            newfid: 1,
            wnames: vec!["usr".to_owned(), "alice".to_owned()],
        },
    };
    let mut buf = Vec::new();
    let _ = expected.encode(&mut buf, false);

    let actual = Decodable::decode(&mut Cursor::new(buf), false);
    assert_eq!(expected, actual.unwrap());
}

#[test]
fn stat_roundtrip_dotu() {
    use std::io::Cursor;

    let stat = Stat {
        qid: QId {
            typ: QIdType::DIR,
            version: 0,
            path: 42,
        },
        mode: dm::DIR | 0o755,
        atime: 1000,
        mtime: 1000,
        name: "hello".to_owned(),
        uid: "alice".to_owned(),
        gid: "staff".to_owned(),
        muid: "".to_owned(),
        n_uid: 1001,
        n_gid: 20,
        n_muid: NOUID,
        ..Default::default()
    };

    for dotu in [false, true] {
        let expected = Msg {
            tag: 2,
            body: FCall::RStat { stat: stat.clone() },
        };
        let mut buf = Vec::new();
        let n = expected.encode(&mut buf, dotu).unwrap();
        assert_eq!(n, buf.len());

        // type[1] tag[2] nstat[2], then the stat with its own size prefix
        assert_eq!(buf.len(), 5 + 2 + stat.size(dotu) as usize);

        let mut actual: Msg = Decodable::decode(&mut Cursor::new(buf), dotu).unwrap();
        if !dotu {
            // numeric ids do not travel without .u
            if let FCall::RStat { ref mut stat } = actual.body {
                stat.n_uid = 1001;
                stat.n_gid = 20;
            }
        }
        assert_eq!(expected, actual);
    }
}

#[test]
fn rerror_errno_only_under_dotu() {
    use std::io::Cursor;

    let msg = Msg {
        tag: 3,
        body: FCall::RError {
            ename: "file not found".to_owned(),
            errno: 2,
        },
    };

    let mut classic = Vec::new();
    let mut dotu = Vec::new();
    let _ = msg.encode(&mut classic, false);
    let _ = msg.encode(&mut dotu, true);
    assert_eq!(dotu.len(), classic.len() + 4);

    let decoded: Msg = Decodable::decode(&mut Cursor::new(dotu), true).unwrap();
    assert_eq!(msg, decoded);
}

#[test]
fn tattach_n_uname_only_under_dotu() {
    use std::io::Cursor;

    let msg = Msg {
        tag: 4,
        body: FCall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "bob".to_owned(),
            aname: "".to_owned(),
            n_uname: 1002,
        },
    };

    let mut classic = Vec::new();
    let mut dotu = Vec::new();
    let _ = msg.encode(&mut classic, false);
    let _ = msg.encode(&mut dotu, true);
    assert_eq!(dotu.len(), classic.len() + 4);

    let decoded: Msg = Decodable::decode(&mut Cursor::new(classic), false).unwrap();
    match decoded.body {
        FCall::TAttach { n_uname, .. } => assert_eq!(n_uname, NONUNAME),
        _ => panic!("wrong message type"),
    }
}
