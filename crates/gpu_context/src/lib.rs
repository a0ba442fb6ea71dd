use std::sync::Arc;

use resource_protocol::{
    Filter, Mailbox, Offset, ResourceFormat, Size, SyncPoint, TextureTarget, TextureUsageHint,
    WrapMode,
};

mod fence;
mod shared_bitmap;
#[cfg(feature = "test-helpers")]
mod test_context;
#[cfg(feature = "wgpu-backend")]
mod wgpu_context;

pub use fence::{Fence, ManualFence};
pub use shared_bitmap::{
    BitmapPixels, InProcessSharedBitmapManager, SHARED_BITMAP_FORMAT, SharedBitmap,
    SharedBitmapManager,
};
#[cfg(feature = "test-helpers")]
pub use test_context::{TestContext, TestShareGroup};
#[cfg(feature = "wgpu-backend")]
pub use wgpu_context::{ContextCreateError, WgpuContext, WgpuShareGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureUnit(pub u32);

impl TextureUnit {
    pub const DEFAULT: TextureUnit = TextureUnit(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextCapabilities {
    pub max_texture_size: u32,
    pub supports_etc1: bool,
    pub best_texture_format: ResourceFormat,
}

impl Default for ContextCapabilities {
    fn default() -> Self {
        Self {
            max_texture_size: 4096,
            supports_etc1: false,
            best_texture_format: ResourceFormat::Rgba8888,
        }
    }
}

/// The driver seam. One context is one command stream.
///
/// Texture and query names are context-local. Mailbox names and sync points
/// are valid across every context of the same share group. None of these
/// calls report loss directly: it is observed through
/// [`GraphicsContext::is_context_lost`]. Failed mailbox generation shows as
/// an all-zero name, and a mailbox that cannot be consumed as `false`.
pub trait GraphicsContext: Send {
    fn capabilities(&self) -> ContextCapabilities;
    fn is_context_lost(&self) -> bool;

    fn gen_textures(&mut self, count: usize) -> Vec<TextureId>;
    fn delete_textures(&mut self, textures: &[TextureId]);
    fn set_texture_parameters(
        &mut self,
        texture: TextureId,
        target: TextureTarget,
        filter: Filter,
        wrap_mode: WrapMode,
    );
    fn set_texture_filter(&mut self, texture: TextureId, target: TextureTarget, filter: Filter);
    fn allocate_texture_storage(
        &mut self,
        texture: TextureId,
        target: TextureTarget,
        size: Size,
        format: ResourceFormat,
        hint: TextureUsageHint,
    );
    /// `pixels` is tightly packed `size` of `format`, written at `origin`.
    fn upload_pixels(
        &mut self,
        texture: TextureId,
        origin: Offset,
        size: Size,
        format: ResourceFormat,
        pixels: &[u8],
    );
    /// Blocks until the full texture contents are available. `None` when
    /// the copy could not be mapped.
    fn read_pixels(
        &mut self,
        texture: TextureId,
        size: Size,
        format: ResourceFormat,
    ) -> Option<Vec<u8>>;
    fn bind_texture(&mut self, unit: TextureUnit, target: TextureTarget, texture: TextureId);

    /// Non-blocking full-texture upload; completion is observed through the query.
    fn begin_async_upload(
        &mut self,
        texture: TextureId,
        size: Size,
        format: ResourceFormat,
        pixels: &[u8],
    ) -> QueryId;
    /// Non-blocking full-texture readback into a transfer buffer.
    fn begin_async_readback(
        &mut self,
        texture: TextureId,
        size: Size,
        format: ResourceFormat,
    ) -> (BufferId, QueryId);
    fn is_query_complete(&mut self, query: QueryId) -> bool;
    fn wait_query(&mut self, query: QueryId);
    fn delete_query(&mut self, query: QueryId);
    /// Consumes the transfer buffer. `None` when the readback failed.
    fn take_readback_buffer(&mut self, buffer: BufferId) -> Option<Vec<u8>>;
    fn delete_buffer(&mut self, buffer: BufferId);

    fn gen_mailbox(&mut self) -> Mailbox;
    fn produce_texture(&mut self, texture: TextureId, target: TextureTarget, mailbox: &Mailbox);
    /// Binds the texture behind `mailbox` to `texture`. False, leaving
    /// `texture` without storage, when the name is unknown or its texture is
    /// not `size` of `format`.
    fn consume_texture(
        &mut self,
        texture: TextureId,
        target: TextureTarget,
        mailbox: &Mailbox,
        size: Size,
        format: ResourceFormat,
    ) -> bool;
    /// Forgets a produced name. Textures already consumed from it stay valid.
    fn discard_mailbox(&mut self, mailbox: &Mailbox);
    fn insert_sync_point(&mut self) -> SyncPoint;
    fn wait_sync_point(&mut self, sync_point: SyncPoint);

    fn create_fence(&mut self) -> Arc<dyn Fence>;
    fn flush(&mut self);
    fn finish(&mut self);
}

/// Copies `source_rect`-shaped rows out of a larger image.
///
/// Shared by every backend that needs tightly packed uploads.
pub fn pack_rows(
    image: &[u8],
    image_row_bytes: usize,
    first_row: usize,
    first_byte: usize,
    row_bytes: usize,
    rows: usize,
) -> Vec<u8> {
    let mut packed = Vec::with_capacity(row_bytes * rows);
    for row in 0..rows {
        let start = (first_row + row) * image_row_bytes + first_byte;
        let end = start + row_bytes;
        assert!(
            end <= image.len(),
            "image row {} exceeds image buffer of {} bytes",
            first_row + row,
            image.len()
        );
        packed.extend_from_slice(&image[start..end]);
    }
    packed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_rows_extracts_sub_rectangle() {
        let image: Vec<u8> = (0..16).collect();
        let packed = pack_rows(&image, 4, 1, 1, 2, 2);
        assert_eq!(packed, vec![5, 6, 9, 10]);
    }

    #[test]
    #[should_panic(expected = "exceeds image buffer")]
    fn pack_rows_rejects_short_image() {
        let image = [0u8; 6];
        let _ = pack_rows(&image, 4, 1, 0, 4, 1);
    }
}
