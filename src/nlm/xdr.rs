//! NLM v4 XDR wire types (RFC-5531 big-endian, 4-byte aligned):
//! self-contained primitive read/write helpers plus the request and
//! response shapes for every NLM v4 procedure.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::{Error, Result};

const ALIGNMENT: usize = 4;
/// RFC 1813 `NLM4_MAXDATA`.
pub const MAX_NETOBJ_LEN: usize = 1024;
pub const MAX_CALLER_NAME_LEN: usize = 255;

fn io_err(err: std::io::Error) -> Error {
    Error::IOError(err.to_string())
}

fn padding_len(n: usize) -> usize {
    (ALIGNMENT - n % ALIGNMENT) % ALIGNMENT
}

pub fn read_padding(src: &mut impl Read, n: usize) -> Result<()> {
    let mut buf = [0u8; ALIGNMENT];
    let pad = padding_len(n);
    src.read_exact(&mut buf[..pad]).map_err(io_err)
}

pub fn write_padding(dest: &mut impl Write, n: usize) -> Result<()> {
    const ZEROES: [u8; ALIGNMENT] = [0u8; ALIGNMENT];
    dest.write_all(&ZEROES[..padding_len(n)]).map_err(io_err)
}

pub fn read_u32(src: &mut impl Read) -> Result<u32> {
    src.read_u32::<BigEndian>().map_err(io_err)
}

pub fn write_u32(dest: &mut impl Write, value: u32) -> Result<()> {
    dest.write_u32::<BigEndian>(value).map_err(io_err)
}

pub fn read_i32(src: &mut impl Read) -> Result<i32> {
    src.read_i32::<BigEndian>().map_err(io_err)
}

pub fn write_i32(dest: &mut impl Write, value: i32) -> Result<()> {
    dest.write_i32::<BigEndian>(value).map_err(io_err)
}

pub fn read_u64(src: &mut impl Read) -> Result<u64> {
    src.read_u64::<BigEndian>().map_err(io_err)
}

pub fn write_u64(dest: &mut impl Write, value: u64) -> Result<()> {
    dest.write_u64::<BigEndian>(value).map_err(io_err)
}

pub fn read_bool(src: &mut impl Read) -> Result<bool> {
    match read_u32(src)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::InvalidArgument("xdr boolean must be 0 or 1")),
    }
}

pub fn write_bool(dest: &mut impl Write, value: bool) -> Result<()> {
    write_u32(dest, if value { 1 } else { 0 })
}

/// Variable-length opaque data, length-prefixed, bounded by `max_len`.
pub fn read_opaque(src: &mut impl Read, max_len: usize) -> Result<Vec<u8>> {
    let len = read_u32(src)? as usize;
    if len > max_len {
        return Err(Error::InvalidArgument("opaque object exceeds protocol limit"));
    }
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf).map_err(io_err)?;
    read_padding(src, len)?;
    Ok(buf)
}

pub fn write_opaque(dest: &mut impl Write, data: &[u8]) -> Result<()> {
    write_u32(dest, data.len() as u32)?;
    dest.write_all(data).map_err(io_err)?;
    write_padding(dest, data.len())
}

pub fn read_string(src: &mut impl Read, max_len: usize) -> Result<String> {
    let bytes = read_opaque(src, max_len)?;
    String::from_utf8(bytes).map_err(|_| Error::InvalidArgument("xdr string is not valid UTF-8"))
}

pub fn write_string(dest: &mut impl Write, value: &str) -> Result<()> {
    write_opaque(dest, value.as_bytes())
}

pub fn read_enum<T: FromPrimitive>(src: &mut impl Read) -> Result<T> {
    T::from_u32(read_u32(src)?).ok_or(Error::InvalidArgument("unrecognized enum discriminant"))
}

/// RFC 1813 `nlm4_stats`, the response status carried in every
/// `nlm4_res`/`nlm4_testres`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum Nlm4Stat {
    Granted = 0,
    Denied = 1,
    DeniedNolocks = 2,
    Blocked = 3,
    DeniedGracePeriod = 4,
    Deadlck = 5,
    RofS = 6,
    StaleFh = 7,
    FBig = 8,
    Failed = 9,
}

impl Nlm4Stat {
    pub fn write(self, dest: &mut impl Write) -> Result<()> {
        write_u32(dest, self as u32)
    }
}

impl From<&Error> for Nlm4Stat {
    fn from(err: &Error) -> Self {
        match err {
            Error::LockConflict(_) | Error::Locked => Nlm4Stat::Denied,
            Error::LockLimitExceeded => Nlm4Stat::DeniedNolocks,
            Error::Deadlock => Nlm4Stat::Deadlck,
            Error::GracePeriod { .. } => Nlm4Stat::DeniedGracePeriod,
            Error::StaleHandle | Error::NotFound | Error::LockNotFound => Nlm4Stat::StaleFh,
            _ => Nlm4Stat::Failed,
        }
    }
}

/// Opaque cookie echoed back verbatim in the matching reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie(pub Vec<u8>);

impl Cookie {
    pub fn read(src: &mut impl Read) -> Result<Self> {
        Ok(Self(read_opaque(src, MAX_NETOBJ_LEN)?))
    }

    pub fn write(&self, dest: &mut impl Write) -> Result<()> {
        write_opaque(dest, &self.0)
    }
}

/// `nlm4_lock`.
#[derive(Debug, Clone)]
pub struct Nlm4Lock {
    pub caller_name: String,
    pub fh: Vec<u8>,
    pub oh: Vec<u8>,
    pub svid: i32,
    pub l_offset: u64,
    pub l_len: u64,
}

impl Nlm4Lock {
    pub fn read(src: &mut impl Read) -> Result<Self> {
        Ok(Self {
            caller_name: read_string(src, MAX_CALLER_NAME_LEN)?,
            fh: read_opaque(src, MAX_NETOBJ_LEN)?,
            oh: read_opaque(src, MAX_NETOBJ_LEN)?,
            svid: read_i32(src)?,
            l_offset: read_u64(src)?,
            l_len: read_u64(src)?,
        })
    }

    pub fn write(&self, dest: &mut impl Write) -> Result<()> {
        write_string(dest, &self.caller_name)?;
        write_opaque(dest, &self.fh)?;
        write_opaque(dest, &self.oh)?;
        write_i32(dest, self.svid)?;
        write_u64(dest, self.l_offset)?;
        write_u64(dest, self.l_len)
    }
}

/// `nlm4_holder`, describing whoever currently blocks a TEST request.
#[derive(Debug, Clone)]
pub struct Nlm4Holder {
    pub exclusive: bool,
    pub svid: i32,
    pub oh: Vec<u8>,
    pub l_offset: u64,
    pub l_len: u64,
}

impl Nlm4Holder {
    pub fn read(src: &mut impl Read) -> Result<Self> {
        Ok(Self {
            exclusive: read_bool(src)?,
            svid: read_i32(src)?,
            oh: read_opaque(src, MAX_NETOBJ_LEN)?,
            l_offset: read_u64(src)?,
            l_len: read_u64(src)?,
        })
    }

    pub fn write(&self, dest: &mut impl Write) -> Result<()> {
        write_bool(dest, self.exclusive)?;
        write_i32(dest, self.svid)?;
        write_opaque(dest, &self.oh)?;
        write_u64(dest, self.l_offset)?;
        write_u64(dest, self.l_len)
    }
}

/// `nlm4_lockargs`: the LOCK/NM_LOCK/LOCK_MSG request body.
#[derive(Debug, Clone)]
pub struct Nlm4LockArgs {
    pub cookie: Cookie,
    pub block: bool,
    pub exclusive: bool,
    pub alock: Nlm4Lock,
    pub reclaim: bool,
    pub state: u32,
}

impl Nlm4LockArgs {
    pub fn read(src: &mut impl Read) -> Result<Self> {
        Ok(Self {
            cookie: Cookie::read(src)?,
            block: read_bool(src)?,
            exclusive: read_bool(src)?,
            alock: Nlm4Lock::read(src)?,
            reclaim: read_bool(src)?,
            state: read_u32(src)?,
        })
    }

    pub fn write(&self, dest: &mut impl Write) -> Result<()> {
        self.cookie.write(dest)?;
        write_bool(dest, self.block)?;
        write_bool(dest, self.exclusive)?;
        self.alock.write(dest)?;
        write_bool(dest, self.reclaim)?;
        write_u32(dest, self.state)
    }
}

/// `nlm4_cancargs`.
#[derive(Debug, Clone)]
pub struct Nlm4CancArgs {
    pub cookie: Cookie,
    pub block: bool,
    pub exclusive: bool,
    pub alock: Nlm4Lock,
}

impl Nlm4CancArgs {
    pub fn read(src: &mut impl Read) -> Result<Self> {
        Ok(Self {
            cookie: Cookie::read(src)?,
            block: read_bool(src)?,
            exclusive: read_bool(src)?,
            alock: Nlm4Lock::read(src)?,
        })
    }
}

/// `nlm4_unlockargs`.
#[derive(Debug, Clone)]
pub struct Nlm4UnlockArgs {
    pub cookie: Cookie,
    pub alock: Nlm4Lock,
}

impl Nlm4UnlockArgs {
    pub fn read(src: &mut impl Read) -> Result<Self> {
        Ok(Self { cookie: Cookie::read(src)?, alock: Nlm4Lock::read(src)? })
    }
}

/// `nlm4_testargs`.
#[derive(Debug, Clone)]
pub struct Nlm4TestArgs {
    pub cookie: Cookie,
    pub exclusive: bool,
    pub alock: Nlm4Lock,
}

impl Nlm4TestArgs {
    pub fn read(src: &mut impl Read) -> Result<Self> {
        Ok(Self { cookie: Cookie::read(src)?, exclusive: read_bool(src)?, alock: Nlm4Lock::read(src)? })
    }
}

/// `nlm4_testrply`, the status-tagged union nested in `nlm4_testres`.
#[derive(Debug, Clone)]
pub enum Nlm4TestReply {
    Granted,
    Denied { holder: Nlm4Holder },
    Other(Nlm4Stat),
}

impl Nlm4TestReply {
    pub fn write(&self, dest: &mut impl Write) -> Result<()> {
        match self {
            Nlm4TestReply::Granted => Nlm4Stat::Granted.write(dest),
            Nlm4TestReply::Denied { holder } => {
                Nlm4Stat::Denied.write(dest)?;
                holder.write(dest)
            }
            Nlm4TestReply::Other(stat) => stat.write(dest),
        }
    }
}

/// `nlm4_testres`.
#[derive(Debug, Clone)]
pub struct Nlm4TestRes {
    pub cookie: Cookie,
    pub reply: Nlm4TestReply,
}

impl Nlm4TestRes {
    pub fn write(&self, dest: &mut impl Write) -> Result<()> {
        self.cookie.write(dest)?;
        self.reply.write(dest)
    }
}

/// `nlm4_res`, returned by LOCK/CANCEL/UNLOCK.
#[derive(Debug, Clone)]
pub struct Nlm4Res {
    pub cookie: Cookie,
    pub stat: Nlm4Stat,
}

impl Nlm4Res {
    pub fn write(&self, dest: &mut impl Write) -> Result<()> {
        self.cookie.write(dest)?;
        self.stat.write(dest)
    }
}

/// `nlm4_share`, the DOS-style share reservation payload.
#[derive(Debug, Clone)]
pub struct Nlm4Share {
    pub caller_name: String,
    pub fh: Vec<u8>,
    pub oh: Vec<u8>,
    pub mode: u32,
    pub access: u32,
}

impl Nlm4Share {
    pub fn read(src: &mut impl Read) -> Result<Self> {
        Ok(Self {
            caller_name: read_string(src, MAX_CALLER_NAME_LEN)?,
            fh: read_opaque(src, MAX_NETOBJ_LEN)?,
            oh: read_opaque(src, MAX_NETOBJ_LEN)?,
            mode: read_u32(src)?,
            access: read_u32(src)?,
        })
    }
}

/// `nlm4_shareargs`.
#[derive(Debug, Clone)]
pub struct Nlm4ShareArgs {
    pub cookie: Cookie,
    pub share: Nlm4Share,
    pub reclaim: bool,
}

impl Nlm4ShareArgs {
    pub fn read(src: &mut impl Read) -> Result<Self> {
        Ok(Self { cookie: Cookie::read(src)?, share: Nlm4Share::read(src)?, reclaim: read_bool(src)? })
    }
}

/// `nlm4_shareres`.
#[derive(Debug, Clone)]
pub struct Nlm4ShareRes {
    pub cookie: Cookie,
    pub stat: Nlm4Stat,
    pub sequence: i32,
}

impl Nlm4ShareRes {
    pub fn write(&self, dest: &mut impl Write) -> Result<()> {
        self.cookie.write(dest)?;
        self.stat.write(dest)?;
        write_i32(dest, self.sequence)
    }
}

/// `nlm4_notify`, carried by FREE_ALL.
#[derive(Debug, Clone)]
pub struct Nlm4Notify {
    pub name: String,
    pub state: i32,
}

impl Nlm4Notify {
    pub fn read(src: &mut impl Read) -> Result<Self> {
        Ok(Self { name: read_string(src, MAX_CALLER_NAME_LEN)?, state: read_i32(src)? })
    }
}
