//! Shutdown notification codec.
//!
//! Sent once when an instance stops cleanly so peers can drop it from
//! their membership tables immediately instead of waiting out the
//! heartbeat timeout. The payload is just the instance id as raw UTF-8
//! bytes, no framing.

use crate::error::{ProtoError, ProtoResult};

/// Planned-shutdown announcement for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownNotification {
    pub instance_id: String,
}

impl ShutdownNotification {
    pub fn encode(&self) -> Vec<u8> {
        self.instance_id.as_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> ProtoResult<Self> {
        if buf.is_empty() {
            return Err(ProtoError::Empty {
                field: "instance id",
            });
        }
        let instance_id = std::str::from_utf8(buf)
            .map_err(|_| ProtoError::BadUtf8 {
                field: "instance id",
            })?
            .to_owned();
        Ok(Self { instance_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let note = ShutdownNotification {
            instance_id: "game-7".to_string(),
        };
        assert_eq!(ShutdownNotification::decode(&note.encode()).unwrap(), note);
    }

    #[test]
    fn empty_rejected() {
        assert!(ShutdownNotification::decode(&[]).is_err());
    }

    #[test]
    fn non_utf8_rejected() {
        assert!(ShutdownNotification::decode(&[0xff, 0xfe]).is_err());
    }
}
