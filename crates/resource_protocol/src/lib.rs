use std::fmt;

use serde::{Deserialize, Serialize};

mod format;
mod mailbox;
mod settings;
mod transfer;

pub use format::{
    ETC1_BLOCK_BYTES, ETC1_BLOCK_EDGE, GL_BGRA_EXT, GL_ETC1_RGB8_OES, GL_LUMINANCE, GL_RGB, GL_RGBA, GL_UNSIGNED_BYTE,
    GL_UNSIGNED_SHORT_4_4_4_4, GL_UNSIGNED_SHORT_5_6_5, ResourceFormat,
};
pub use mailbox::{MAILBOX_NAME_BYTES, Mailbox, MailboxHolder, SharedBitmapId, SyncPoint};
pub use settings::{BackingMode, ResourceSettings, SettingsError};
pub use transfer::{
    Filter, ReturnedResource, TextureTarget, TextureUsageHint, TransferableResource, WrapMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub u32);

impl fmt::Display for ResourceId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "resource#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChildId(pub u32);

impl fmt::Display for ChildId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "child#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(self) -> usize {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .expect("size area overflow")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Offset {
    pub x: u32,
    pub y: u32,
}

impl Offset {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub const fn origin(self) -> Offset {
        Offset::new(self.x, self.y)
    }

    pub const fn size(self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn right(self) -> u32 {
        self.x.checked_add(self.width).expect("rect right overflow")
    }

    pub fn bottom(self) -> u32 {
        self.y.checked_add(self.height).expect("rect bottom overflow")
    }

    pub fn contains_rect(self, other: Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_containment_is_inclusive_of_edges() {
        let outer = Rect::new(2, 2, 4, 4);
        assert!(outer.contains_rect(Rect::new(2, 2, 4, 4)));
        assert!(outer.contains_rect(Rect::new(3, 5, 3, 1)));
        assert!(!outer.contains_rect(Rect::new(1, 2, 2, 2)));
        assert!(!outer.contains_rect(Rect::new(4, 4, 3, 1)));
    }

    #[test]
    fn empty_sizes_have_zero_area() {
        assert!(Size::new(0, 9).is_empty());
        assert_eq!(Size::new(0, 9).area(), 0);
        assert_eq!(Rect::from_size(Size::new(3, 4)).size().area(), 12);
    }
}
