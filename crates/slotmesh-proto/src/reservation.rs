//! Reservation handshake codecs.
//!
//! A `ReservationRequest` asks one instance to hold slots for a group of
//! users. The target is named three ways: directly by instance id, or
//! indirectly by a user currently on the wanted instance (by id or by
//! name). Every instance sees every request and silently ignores the
//! ones not meant for it, so the response always carries both the
//! requester (routing) and the responder (the actual destination).

use std::collections::HashSet;

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::error::{ProtoError, ProtoResult};
use crate::wire;

/// Upper bound on users per request; a group bigger than this is a
/// framing error, not a real relocation.
const MAX_USERS: i32 = 10_000;

const KIND_INSTANCE: u8 = 0;
const KIND_USER_ID: u8 = 1;
const KIND_USER_NAME: u8 = 2;

/// How a reservation request names its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocationTarget {
    /// A specific instance, by id.
    Instance(String),
    /// Whichever instance currently hosts this user.
    UserId(Uuid),
    /// Whichever instance currently hosts the user with this name.
    UserName(String),
}

/// Request to reserve one slot per user on the targeted instance.
///
/// Wire layout:
///
/// ```text
/// [kind:u8][discriminator][requesterLen:i32][requester]
/// [requestId:i32][userCount:i32][user uuid:16B]*
/// ```
///
/// The discriminator is a length-prefixed string for instance-id and
/// user-name targets, and 16 raw uuid bytes for user-id targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub target: RelocationTarget,
    pub requester: String,
    pub request_id: i32,
    pub users: HashSet<Uuid>,
}

impl ReservationRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64 + self.users.len() * 16);
        match &self.target {
            RelocationTarget::Instance(id) => {
                buf.put_u8(KIND_INSTANCE);
                wire::put_string(&mut buf, id);
            }
            RelocationTarget::UserId(id) => {
                buf.put_u8(KIND_USER_ID);
                buf.put_slice(id.as_bytes());
            }
            RelocationTarget::UserName(name) => {
                buf.put_u8(KIND_USER_NAME);
                wire::put_string(&mut buf, name);
            }
        }
        wire::put_string(&mut buf, &self.requester);
        buf.put_i32(self.request_id);
        buf.put_i32(self.users.len() as i32);
        for user in &self.users {
            buf.put_slice(user.as_bytes());
        }
        buf.to_vec()
    }

    pub fn decode(mut buf: &[u8]) -> ProtoResult<Self> {
        let kind = wire::get_u8(&mut buf)?;
        let target = match kind {
            KIND_INSTANCE => RelocationTarget::Instance(wire::get_id(&mut buf, "target id")?),
            KIND_USER_ID => RelocationTarget::UserId(wire::get_uuid(&mut buf)?),
            KIND_USER_NAME => RelocationTarget::UserName(wire::get_id(&mut buf, "target name")?),
            other => return Err(ProtoError::UnknownTargetKind(other)),
        };
        let requester = wire::get_id(&mut buf, "requester id")?;
        let request_id = wire::get_i32(&mut buf)?;
        let count = wire::get_i32(&mut buf)?;
        if !(1..=MAX_USERS).contains(&count) {
            return Err(ProtoError::BadUserCount(count));
        }
        let mut users = HashSet::with_capacity(count as usize);
        for _ in 0..count {
            users.insert(wire::get_uuid(&mut buf)?);
        }
        wire::expect_end(buf)?;
        Ok(Self {
            target,
            requester,
            request_id,
            users,
        })
    }
}

/// Answer to a reservation request, sent whether or not it was approved.
///
/// Wire layout:
///
/// ```text
/// [targetLen:i32][target][responderLen:i32][responder]
/// [requestId:i32][approved:u8]
/// ```
///
/// `target` is the instance that issued the request; everyone else on
/// the response channel discards the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationResponse {
    pub target: String,
    pub responder: String,
    pub request_id: i32,
    pub approved: bool,
}

impl ReservationResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16 + self.target.len() + self.responder.len());
        wire::put_string(&mut buf, &self.target);
        wire::put_string(&mut buf, &self.responder);
        buf.put_i32(self.request_id);
        buf.put_u8(u8::from(self.approved));
        buf.to_vec()
    }

    pub fn decode(mut buf: &[u8]) -> ProtoResult<Self> {
        let target = wire::get_id(&mut buf, "target id")?;
        let responder = wire::get_id(&mut buf, "responder id")?;
        let request_id = wire::get_i32(&mut buf)?;
        let approved = wire::get_u8(&mut buf)? != 0;
        wire::expect_end(buf)?;
        Ok(Self {
            target,
            responder,
            request_id,
            approved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users(n: usize) -> HashSet<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn request_round_trip_all_target_kinds() {
        let targets = [
            RelocationTarget::Instance("game-4".to_string()),
            RelocationTarget::UserId(Uuid::new_v4()),
            RelocationTarget::UserName("aria".to_string()),
        ];
        for target in targets {
            let req = ReservationRequest {
                target,
                requester: "lobby-1".to_string(),
                request_id: -42,
                users: users(3),
            };
            assert_eq!(ReservationRequest::decode(&req.encode()).unwrap(), req);
        }
    }

    #[test]
    fn request_rejects_zero_users() {
        let req = ReservationRequest {
            target: RelocationTarget::Instance("game-4".to_string()),
            requester: "lobby-1".to_string(),
            request_id: 1,
            users: HashSet::new(),
        };
        assert_eq!(
            ReservationRequest::decode(&req.encode()),
            Err(ProtoError::BadUserCount(0))
        );
    }

    #[test]
    fn request_rejects_unknown_kind() {
        let mut buf = ReservationRequest {
            target: RelocationTarget::Instance("x".to_string()),
            requester: "y".to_string(),
            request_id: 0,
            users: users(1),
        }
        .encode();
        buf[0] = 9;
        assert_eq!(
            ReservationRequest::decode(&buf),
            Err(ProtoError::UnknownTargetKind(9))
        );
    }

    #[test]
    fn response_round_trip() {
        for approved in [true, false] {
            let resp = ReservationResponse {
                target: "lobby-1".to_string(),
                responder: "game-4".to_string(),
                request_id: i32::MIN,
                approved,
            };
            assert_eq!(ReservationResponse::decode(&resp.encode()).unwrap(), resp);
        }
    }

    #[test]
    fn truncated_request_errors() {
        let buf = ReservationRequest {
            target: RelocationTarget::UserName("aria".to_string()),
            requester: "lobby-1".to_string(),
            request_id: 7,
            users: users(2),
        }
        .encode();
        for cut in 0..buf.len() {
            assert!(ReservationRequest::decode(&buf[..cut]).is_err());
        }
    }

    #[test]
    fn garbage_does_not_panic() {
        let mut x: u32 = 0x9E37_79B9;
        for len in 0..96 {
            let bytes: Vec<u8> = (0..len)
                .map(|_| {
                    x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                    (x >> 24) as u8
                })
                .collect();
            let _ = ReservationRequest::decode(&bytes);
            let _ = ReservationResponse::decode(&bytes);
        }
    }
}
