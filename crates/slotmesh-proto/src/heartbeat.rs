//! Heartbeat codec.
//!
//! A heartbeat announces one instance's cluster, identity, reachable
//! address, and current open-slot count. The emitter sends the same
//! message over and over with only the slot count changing, so the
//! encoding puts the slot count last: an already-encoded buffer can be
//! refreshed with [`Heartbeat::rewrite_open_slots`] instead of being
//! rebuilt each beat.

use bytes::{BufMut, BytesMut};

use crate::error::{ProtoError, ProtoResult};
use crate::wire;

/// Minimum encoded size: four i32 length/port fields plus the i32 slot
/// count, with all strings empty.
const BASE_LEN: usize = 4 * 5;

/// One instance's periodic status broadcast.
///
/// Wire layout, all integers big-endian:
///
/// ```text
/// [clusterLen:i32][cluster][instanceLen:i32][instance]
/// [ipLen:i32][ip][port:i32][openSlots:i32]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub cluster_id: String,
    pub instance_id: String,
    pub ip: String,
    pub port: u16,
    pub open_slots: u32,
}

impl Heartbeat {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(
            BASE_LEN + self.cluster_id.len() + self.instance_id.len() + self.ip.len(),
        );
        wire::put_string(&mut buf, &self.cluster_id);
        wire::put_string(&mut buf, &self.instance_id);
        wire::put_string(&mut buf, &self.ip);
        buf.put_i32(i32::from(self.port));
        buf.put_i32(self.open_slots as i32);
        buf.to_vec()
    }

    /// Decode from wire bytes.
    pub fn decode(mut buf: &[u8]) -> ProtoResult<Self> {
        let cluster_id = wire::get_id(&mut buf, "cluster id")?;
        let instance_id = wire::get_id(&mut buf, "instance id")?;
        let ip = wire::get_string(&mut buf, "ip")?;
        let port = wire::get_i32(&mut buf)?;
        let open_slots = wire::get_i32(&mut buf)?;
        wire::expect_end(buf)?;
        if open_slots < 0 {
            return Err(ProtoError::NegativeSlots(open_slots));
        }
        if !(0..=i32::from(u16::MAX)).contains(&port) {
            return Err(ProtoError::BadPort(port));
        }
        Ok(Self {
            cluster_id,
            instance_id,
            ip,
            port: port as u16,
            open_slots: open_slots as u32,
        })
    }

    /// Rewrite the open-slot count of an already-encoded heartbeat.
    ///
    /// The slot count is the trailing four bytes, so the rest of the
    /// buffer stays untouched. The caller owns the buffer and must hold
    /// whatever lock serializes its sends while rewriting.
    pub fn rewrite_open_slots(buf: &mut [u8], open_slots: u32) -> ProtoResult<()> {
        if buf.len() < BASE_LEN {
            return Err(ProtoError::Truncated {
                wanted: BASE_LEN - buf.len(),
                remaining: buf.len(),
            });
        }
        let tail = buf.len() - 4;
        buf[tail..].copy_from_slice(&(open_slots as i32).to_be_bytes());
        Ok(())
    }
}
