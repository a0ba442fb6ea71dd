use serde::{Deserialize, Serialize};

use crate::{Mailbox, ResourceFormat, ResourceId, Size, SyncPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextureTarget {
    #[default]
    Texture2D,
    External,
    Rectangle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WrapMode {
    #[default]
    ClampToEdge,
    Repeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextureUsageHint {
    #[default]
    Any,
    Framebuffer,
}

/// One resource crossing the child/parent boundary.
///
/// `mailbox` names a GPU texture when `is_software` is false and a shared
/// memory segment otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferableResource {
    pub id: ResourceId,
    pub format: ResourceFormat,
    pub target: TextureTarget,
    pub filter: Filter,
    pub size: Size,
    pub mailbox: Mailbox,
    pub sync_point: SyncPoint,
    pub is_software: bool,
}

impl TransferableResource {
    pub fn to_returned(&self) -> ReturnedResource {
        ReturnedResource {
            id: self.id,
            sync_point: self.sync_point,
            count: 1,
            lost: false,
        }
    }

    pub fn to_returned_array(resources: &[TransferableResource]) -> Vec<ReturnedResource> {
        resources.iter().map(TransferableResource::to_returned).collect()
    }
}

/// A resource handed back across the boundary. `count` coalesces several
/// exports of the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnedResource {
    pub id: ResourceId,
    pub sync_point: SyncPoint,
    pub count: u32,
    pub lost: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAILBOX_NAME_BYTES;

    #[test]
    fn transferable_record_survives_json() {
        let mut name = [0u8; MAILBOX_NAME_BYTES];
        name[5] = 0xab;
        let record = TransferableResource {
            id: ResourceId(7),
            format: ResourceFormat::Bgra8888,
            target: TextureTarget::Texture2D,
            filter: Filter::Nearest,
            size: Size::new(32, 16),
            mailbox: Mailbox::from_bytes(name),
            sync_point: SyncPoint(41),
            is_software: false,
        };

        let json = serde_json::to_string(&record).expect("serialize record");
        let decoded: TransferableResource = serde_json::from_str(&json).expect("decode record");
        assert_eq!(decoded, record);
    }

    #[test]
    fn to_returned_keeps_id_and_sync_point() {
        let record = TransferableResource {
            id: ResourceId(3),
            format: ResourceFormat::Rgba8888,
            target: TextureTarget::Texture2D,
            filter: Filter::Linear,
            size: Size::new(1, 1),
            mailbox: Mailbox::zero(),
            sync_point: SyncPoint(9),
            is_software: true,
        };
        let returned = TransferableResource::to_returned_array(std::slice::from_ref(&record));
        assert_eq!(
            returned,
            vec![ReturnedResource {
                id: ResourceId(3),
                sync_point: SyncPoint(9),
                count: 1,
                lost: false,
            }]
        );
    }
}
