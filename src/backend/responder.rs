//! Serves the storage API subjects from in-memory backends.

use super::{MemoryKv, MemoryObjects, Rejection};
use crate::client::Client;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::objects::ObjectManifest;
use crate::protocol::{
    entry_message, failure, kv_event_subject, reply, split_api_subject, validate_key, KvOp, ObjOp,
    Status, HDR_CHECKSUM, HDR_FILE_ID, HDR_HISTORY, HDR_INDEX, HDR_KEY, HDR_PREFIX, HDR_REVISION,
    HDR_STATUS, KV_API_PREFIX, OBJ_API_PREFIX,
};
use crate::subscriptions::{HandlerResult, MessageHandler, SubscriptionId, SubscriptionOptions};
use crate::types::{FileId, Message, Revision};
use std::str::FromStr;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Answers KV and object requests for every bucket.
///
/// Each API runs on a single subscription thread, so requests are applied
/// one at a time and KV change events go out in commit order.
pub struct StorageResponder {
    client: Client,
    subscriptions: Vec<SubscriptionId>,
}

impl StorageResponder {
    /// Start serving on `client`'s connection.
    pub fn start(client: &Client, kv: MemoryKv, objects: MemoryObjects) -> Result<Self> {
        let conn = client.connection();

        let weak = Arc::downgrade(conn);
        let kv_sub = conn.subscribe_with(
            &format!("{KV_API_PREFIX}.>"),
            SubscriptionOptions::default(),
            |_| -> Box<dyn MessageHandler> { Box::new(KvApi { kv, conn: weak }) },
        )?;

        let weak = Arc::downgrade(conn);
        let obj_sub = match conn.subscribe_with(
            &format!("{OBJ_API_PREFIX}.>"),
            SubscriptionOptions::default(),
            |_| -> Box<dyn MessageHandler> { Box::new(ObjApi { objects, conn: weak }) },
        ) {
            Ok(id) => id,
            Err(e) => {
                conn.unsubscribe(kv_sub);
                return Err(e);
            }
        };

        info!("storage responder started");
        Ok(Self {
            client: client.clone(),
            subscriptions: vec![kv_sub, obj_sub],
        })
    }

    /// Stop serving. Idempotent.
    pub fn stop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.client.unsubscribe(id);
        }
    }
}

impl Drop for StorageResponder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Answer a request, turning rejections into failure replies.
fn respond(
    conn: &Weak<ConnectionManager>,
    request: &Message,
    handle: impl FnOnce(&ConnectionManager) -> std::result::Result<Message, Rejection>,
) -> HandlerResult {
    let Some(reply_to) = request.reply_to.clone() else {
        warn!(subject = %request.subject, "storage request without reply subject");
        return Ok(());
    };
    let Some(conn) = conn.upgrade() else {
        return Ok(());
    };

    let mut response = handle(&conn).unwrap_or_else(|rejection| {
        debug!(subject = %request.subject, %rejection, "request rejected");
        failure(rejection.status(), rejection.to_string())
    });
    response.subject = reply_to;
    conn.send(response)?;
    Ok(())
}

fn parse_op<T: FromStr>(prefix: &str, subject: &str) -> std::result::Result<(String, T), Rejection> {
    let (bucket, op) = split_api_subject(prefix, subject)
        .ok_or_else(|| Rejection::BadRequest(format!("unexpected subject {subject}")))?;
    let op = op
        .parse()
        .map_err(|_| Rejection::BadRequest(format!("unknown operation {op}")))?;
    Ok((bucket.to_string(), op))
}

fn required<'a>(message: &'a Message, name: &str) -> std::result::Result<&'a str, Rejection> {
    message
        .header(name)
        .ok_or_else(|| Rejection::BadRequest(format!("missing header {name}")))
}

fn numeric<T: FromStr>(message: &Message, name: &str) -> std::result::Result<Option<T>, Rejection> {
    message
        .header(name)
        .map(|v| {
            v.parse()
                .map_err(|_| Rejection::BadRequest(format!("header {name} is not a number")))
        })
        .transpose()
}

fn required_numeric<T: FromStr>(message: &Message, name: &str) -> std::result::Result<T, Rejection> {
    numeric(message, name)?.ok_or_else(|| Rejection::BadRequest(format!("missing header {name}")))
}

struct KvApi {
    kv: MemoryKv,
    conn: Weak<ConnectionManager>,
}

impl KvApi {
    fn handle(
        &self,
        conn: &ConnectionManager,
        request: &Message,
    ) -> std::result::Result<Message, Rejection> {
        let (bucket, op) = parse_op::<KvOp>(KV_API_PREFIX, &request.subject)?;
        match op {
            KvOp::Bind => {
                let history = numeric(request, HDR_HISTORY)?.unwrap_or(1);
                if self.kv.bind(&bucket, history) {
                    info!(%bucket, history, "kv bucket created");
                }
                Ok(reply(Status::Ok, Vec::new()))
            }
            KvOp::Put => {
                let key = required(request, HDR_KEY)?;
                validate_key(key).map_err(|e| Rejection::BadRequest(e.to_string()))?;
                let entry = self.kv.put(&bucket, key, request.payload.clone())?;

                let event = entry_message(kv_event_subject(&bucket, key), &entry);
                if let Err(e) = conn.send(event) {
                    warn!(%bucket, key, error = %e, "failed to publish kv change");
                }
                Ok(reply(Status::Ok, Vec::new())
                    .with_header(HDR_REVISION, entry.revision.0.to_string()))
            }
            KvOp::Get => {
                let key = required(request, HDR_KEY)?;
                let revision = numeric(request, HDR_REVISION)?.map(Revision);
                let entry = self.kv.get(&bucket, key, revision)?;
                Ok(entry_message(String::new(), &entry)
                    .with_header(HDR_STATUS, Status::Ok.code().to_string()))
            }
            KvOp::Keys => {
                let keys = self.kv.keys(&bucket, request.header(HDR_PREFIX))?;
                let payload =
                    rmp_serde::to_vec(&keys).map_err(|e| Rejection::Internal(e.to_string()))?;
                Ok(reply(Status::Ok, payload))
            }
        }
    }
}

impl MessageHandler for KvApi {
    fn on_message(&mut self, message: Message) -> HandlerResult {
        respond(&self.conn, &message, |conn| self.handle(conn, &message))
    }
}

struct ObjApi {
    objects: MemoryObjects,
    conn: Weak<ConnectionManager>,
}

impl ObjApi {
    fn handle(&self, request: &Message) -> std::result::Result<Message, Rejection> {
        let (bucket, op) = parse_op::<ObjOp>(OBJ_API_PREFIX, &request.subject)?;
        if op == ObjOp::Bind {
            if self.objects.bind(&bucket) {
                info!(%bucket, "object bucket created");
            }
            return Ok(reply(Status::Ok, Vec::new()));
        }

        let file_id = FileId::from(required(request, HDR_FILE_ID)?);
        match op {
            ObjOp::Bind => Ok(reply(Status::Ok, Vec::new())),
            ObjOp::Chunk => {
                let index = required_numeric(request, HDR_INDEX)?;
                let checksum = required_numeric(request, HDR_CHECKSUM)?;
                self.objects
                    .put_chunk(&bucket, &file_id, index, request.payload.clone(), checksum)?;
                Ok(reply(Status::Ok, Vec::new()))
            }
            ObjOp::ChunkGet => {
                let index = required_numeric(request, HDR_INDEX)?;
                let (data, checksum) = self.objects.get_chunk(&bucket, &file_id, index)?;
                Ok(reply(Status::Ok, data).with_header(HDR_CHECKSUM, checksum.to_string()))
            }
            ObjOp::Manifest => {
                let manifest = ObjectManifest::decode(&request.payload)
                    .map_err(|e| Rejection::BadRequest(e.to_string()))?;
                if manifest.file_id != file_id {
                    return Err(Rejection::BadRequest(format!(
                        "manifest for {} sent as {}",
                        manifest.file_id, file_id
                    )));
                }
                self.objects.put_manifest(&bucket, manifest)?;
                Ok(reply(Status::Ok, Vec::new()))
            }
            ObjOp::ManifestGet => {
                let manifest = self.objects.get_manifest(&bucket, &file_id)?;
                let payload = manifest
                    .encode()
                    .map_err(|e| Rejection::Internal(e.to_string()))?;
                Ok(reply(Status::Ok, payload))
            }
            ObjOp::Purge => {
                self.objects.purge(&bucket, &file_id)?;
                Ok(reply(Status::Ok, Vec::new()))
            }
        }
    }
}

impl MessageHandler for ObjApi {
    fn on_message(&mut self, message: Message) -> HandlerResult {
        respond(&self.conn, &message, |_| self.handle(&message))
    }
}
