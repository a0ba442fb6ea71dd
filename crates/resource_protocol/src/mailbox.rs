use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::TextureTarget;

pub const MAILBOX_NAME_BYTES: usize = 64;

/// Opaque cross-context texture name. Only compared for equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mailbox([u8; MAILBOX_NAME_BYTES]);

impl Mailbox {
    pub const fn zero() -> Self {
        Self([0; MAILBOX_NAME_BYTES])
    }

    pub const fn from_bytes(name: [u8; MAILBOX_NAME_BYTES]) -> Self {
        Self(name)
    }

    pub fn as_bytes(&self) -> &[u8; MAILBOX_NAME_BYTES] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return write!(formatter, "Mailbox(zero)");
        }
        write!(formatter, "Mailbox(")?;
        for byte in &self.0[..8] {
            write!(formatter, "{byte:02x}")?;
        }
        write!(formatter, "..)")
    }
}

impl Serialize for Mailbox {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Mailbox {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(MailboxVisitor)
    }
}

struct MailboxVisitor;

impl<'de> Visitor<'de> for MailboxVisitor {
    type Value = Mailbox;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{MAILBOX_NAME_BYTES} mailbox name bytes")
    }

    fn visit_bytes<E: de::Error>(self, bytes: &[u8]) -> Result<Mailbox, E> {
        let name: [u8; MAILBOX_NAME_BYTES] = bytes
            .try_into()
            .map_err(|_| E::invalid_length(bytes.len(), &self))?;
        Ok(Mailbox(name))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Mailbox, A::Error> {
        let mut name = [0u8; MAILBOX_NAME_BYTES];
        for (index, slot) in name.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(index, &self))?;
        }
        if seq.next_element::<u8>()?.is_some() {
            return Err(de::Error::invalid_length(MAILBOX_NAME_BYTES + 1, &self));
        }
        Ok(Mailbox(name))
    }
}

/// Marker in one command stream. Zero means "no sync point".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SyncPoint(pub u32);

impl SyncPoint {
    pub const NONE: SyncPoint = SyncPoint(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxHolder {
    pub mailbox: Mailbox,
    pub target: TextureTarget,
    pub sync_point: SyncPoint,
}

impl MailboxHolder {
    pub fn new(mailbox: Mailbox, target: TextureTarget, sync_point: SyncPoint) -> Self {
        Self {
            mailbox,
            target,
            sync_point,
        }
    }

    /// Hands the pending sync point to the caller and clears it on the holder.
    pub fn take_sync_point(&mut self) -> SyncPoint {
        std::mem::take(&mut self.sync_point)
    }
}

/// Shared-memory segment name for software resources. Travels in the
/// mailbox field of a transferable record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedBitmapId(pub Mailbox);

#[cfg(test)]
mod tests {
    use super::*;

    fn named(seed: u8) -> Mailbox {
        let mut name = [0u8; MAILBOX_NAME_BYTES];
        name[0] = seed;
        name[MAILBOX_NAME_BYTES - 1] = seed;
        Mailbox::from_bytes(name)
    }

    #[test]
    fn zero_mailbox_is_invalid() {
        assert!(Mailbox::zero().is_zero());
        assert!(Mailbox::default().is_zero());
        assert!(!named(3).is_zero());
    }

    #[test]
    fn mailbox_json_rejects_short_names() {
        let json = serde_json::to_string(&named(9)).expect("serialize mailbox");
        let decoded: Mailbox = serde_json::from_str(&json).expect("deserialize mailbox");
        assert_eq!(decoded, named(9));

        let error = serde_json::from_str::<Mailbox>("[1,2,3]").expect_err("short name");
        assert!(error.to_string().contains("mailbox name bytes"));
    }

    #[test]
    fn take_sync_point_resets_holder() {
        let mut holder = MailboxHolder::new(named(1), TextureTarget::Texture2D, SyncPoint(12));
        assert_eq!(holder.take_sync_point(), SyncPoint(12));
        assert!(holder.sync_point.is_none());
    }
}
