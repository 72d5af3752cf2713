//! Storage API subjects and headers, shared by the clients and the
//! in-memory backends.
//!
//! Requests go to `$LL.KV.<bucket>.<OP>` or `$LL.OBJ.<bucket>.<OP>` with
//! their arguments in headers. Every reply carries `LL-Status` and, for
//! failures, `LL-Description`. KV changes are broadcast on
//! `$KV.<bucket>.<key>`.

use crate::error::{Error, Result};
use crate::subject::{validate_subject, validate_token};
use crate::types::{KvEntry, Message, Revision, Timestamp};
use std::fmt;
use std::str::FromStr;

pub const KV_API_PREFIX: &str = "$LL.KV";
pub const OBJ_API_PREFIX: &str = "$LL.OBJ";
pub const KV_EVENT_PREFIX: &str = "$KV";

pub const HDR_STATUS: &str = "LL-Status";
pub const HDR_DESCRIPTION: &str = "LL-Description";
pub const HDR_KEY: &str = "LL-Key";
pub const HDR_PREFIX: &str = "LL-Prefix";
pub const HDR_REVISION: &str = "LL-Revision";
pub const HDR_CREATED: &str = "LL-Created";
pub const HDR_HISTORY: &str = "LL-History";
pub const HDR_FILE_ID: &str = "LL-File";
pub const HDR_INDEX: &str = "LL-Index";
pub const HDR_CHECKSUM: &str = "LL-Checksum";

/// Reply status carried in `LL-Status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
    Conflict,
    Unavailable,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::Conflict => 409,
            Status::Unavailable => 503,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Status::Ok),
            400 => Some(Status::BadRequest),
            404 => Some(Status::NotFound),
            409 => Some(Status::Conflict),
            503 => Some(Status::Unavailable),
            _ => None,
        }
    }
}

/// KV API operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KvOp {
    Bind,
    Put,
    Get,
    Keys,
}

/// Object API operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjOp {
    Bind,
    Chunk,
    ChunkGet,
    Manifest,
    ManifestGet,
    Purge,
}

macro_rules! op_names {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok($ty::$variant),)+
                    other => Err(Error::InvalidSubject(format!("unknown operation {other}"))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

op_names!(KvOp {
    Bind => "BIND",
    Put => "PUT",
    Get => "GET",
    Keys => "KEYS",
});

op_names!(ObjOp {
    Bind => "BIND",
    Chunk => "CHUNK",
    ChunkGet => "CHUNK_GET",
    Manifest => "MANIFEST",
    ManifestGet => "MANIFEST_GET",
    Purge => "PURGE",
});

pub fn kv_subject(bucket: &str, op: KvOp) -> Result<String> {
    validate_token(bucket)?;
    Ok(format!("{KV_API_PREFIX}.{bucket}.{op}"))
}

pub fn obj_subject(bucket: &str, op: ObjOp) -> Result<String> {
    validate_token(bucket)?;
    Ok(format!("{OBJ_API_PREFIX}.{bucket}.{op}"))
}

/// Subject a change to `key` is broadcast on.
pub fn kv_event_subject(bucket: &str, key: &str) -> String {
    format!("{KV_EVENT_PREFIX}.{bucket}.{key}")
}

/// Pattern covering every change in a bucket.
pub fn kv_event_pattern(bucket: &str) -> String {
    format!("{KV_EVENT_PREFIX}.{bucket}.>")
}

/// Keys may contain dots but never wildcards, whitespace or empty tokens.
pub fn validate_key(key: &str) -> Result<()> {
    validate_subject(key).map_err(|_| Error::InvalidKey(key.to_string()))
}

/// Split `<prefix>.<bucket>.<OP>` into bucket and operation name.
pub fn split_api_subject<'a>(prefix: &str, subject: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = subject.strip_prefix(prefix)?.strip_prefix('.')?;
    let (bucket, op) = rest.split_once('.')?;
    Some((bucket, op))
}

/// Build a reply with the given status.
pub fn reply(status: Status, payload: Vec<u8>) -> Message {
    // Replies are addressed by the responder; the subject is filled in there.
    Message::new(String::new(), payload).with_header(HDR_STATUS, status.code().to_string())
}

/// Build a failure reply.
pub fn failure(status: Status, description: impl Into<String>) -> Message {
    reply(status, Vec::new()).with_header(HDR_DESCRIPTION, description)
}

/// Read the status of a reply.
pub fn status_of(reply: &Message) -> Result<(Status, String)> {
    let code = reply
        .header(HDR_STATUS)
        .and_then(|c| c.parse::<u16>().ok())
        .and_then(Status::from_code)
        .ok_or_else(|| Error::Malformed(format!("reply on {} has no status", reply.subject)))?;
    let description = reply.header(HDR_DESCRIPTION).unwrap_or_default().to_string();
    Ok((code, description))
}

/// Fail unless the reply reports success. 404 maps to `NotFound`, anything
/// else to `Server`.
pub fn expect_ok(reply: &Message) -> Result<()> {
    match status_of(reply)? {
        (Status::Ok, _) => Ok(()),
        (Status::NotFound, description) => Err(Error::NotFound(description)),
        (status, description) => Err(Error::Server(format!(
            "{} {}",
            status.code(),
            description
        ))),
    }
}

/// Parse a required numeric header.
pub fn header_u64(message: &Message, name: &str) -> Result<u64> {
    message
        .header(name)
        .ok_or_else(|| Error::Malformed(format!("missing header {name}")))?
        .parse()
        .map_err(|_| Error::Malformed(format!("header {name} is not a number")))
}

/// Parse a required string header.
pub fn header_str<'a>(message: &'a Message, name: &str) -> Result<&'a str> {
    message
        .header(name)
        .ok_or_else(|| Error::Malformed(format!("missing header {name}")))
}

/// Attach the entry metadata to a message carrying its value.
pub fn entry_message(subject: String, entry: &KvEntry) -> Message {
    Message::new(subject, entry.value.clone())
        .with_header(HDR_KEY, entry.key.clone())
        .with_header(HDR_REVISION, entry.revision.0.to_string())
        .with_header(HDR_CREATED, entry.created.0.to_string())
}

/// Rebuild an entry from a GET reply or a change event.
pub fn entry_from_message(bucket: &str, message: &Message) -> Result<KvEntry> {
    let created = message
        .header(HDR_CREATED)
        .and_then(|c| c.parse::<i64>().ok())
        .ok_or_else(|| Error::Malformed(format!("missing header {HDR_CREATED}")))?;
    Ok(KvEntry {
        bucket: bucket.to_string(),
        key: header_str(message, HDR_KEY)?.to_string(),
        value: message.payload.clone(),
        revision: Revision(header_u64(message, HDR_REVISION)?),
        created: Timestamp(created),
    })
}
