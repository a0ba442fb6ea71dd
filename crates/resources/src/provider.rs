use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use gpu_context::{
    BitmapPixels, Fence, GraphicsContext, SHARED_BITMAP_FORMAT, SharedBitmapManager, TextureId,
    TextureUnit, pack_rows,
};
use resource_protocol::{
    BackingMode, ChildId, Filter, Mailbox, Offset, Rect, ResourceFormat, ResourceId,
    ResourceSettings, ReturnedResource, Size, SyncPoint, TextureTarget, TextureUsageHint, WrapMode,
};

use crate::readback::{ReadbackCallback, ReadbackQueue, ReadbackResult};
use crate::resource::{
    Backing, BitmapBacking, Lifecycle, Origin, PixelBuffer, Resource, Storage, TextureBacking,
    WriteState,
};
use crate::texture_id_allocator::TextureIdAllocator;
use crate::transfer::{Child, ReturnCallback};
use crate::{BackingKind, ReleaseCallback, ResourceSnapshot, ResourceView, TextureMailbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeleteStyle {
    Normal,
    /// Resources still held elsewhere are given up as lost.
    ForShutdown,
}

enum Notification {
    Release {
        callback: Box<dyn ReleaseCallback>,
        sync_point: SyncPoint,
        lost: bool,
    },
    Return {
        callback: ReturnCallback,
        resources: Vec<ReturnedResource>,
    },
    Readback {
        callback: ReadbackCallback,
        result: ReadbackResult,
    },
}

/// Callbacks collected while the table is borrowed. They run in collection
/// order once the borrow has ended.
#[derive(Default)]
pub(crate) struct Notifications(Vec<Notification>);

impl Notifications {
    pub(crate) fn release(
        &mut self,
        callback: Box<dyn ReleaseCallback>,
        sync_point: SyncPoint,
        lost: bool,
    ) {
        self.0.push(Notification::Release {
            callback,
            sync_point,
            lost,
        });
    }

    pub(crate) fn return_to_child(
        &mut self,
        callback: ReturnCallback,
        resources: Vec<ReturnedResource>,
    ) {
        self.0.push(Notification::Return {
            callback,
            resources,
        });
    }

    pub(crate) fn readback(&mut self, callback: ReadbackCallback, result: ReadbackResult) {
        self.0.push(Notification::Readback { callback, result });
    }

    fn dispatch(self) {
        for notification in self.0 {
            match notification {
                Notification::Release {
                    callback,
                    sync_point,
                    lost,
                } => callback.release(sync_point, lost),
                Notification::Return {
                    callback,
                    resources,
                } => callback(resources),
                Notification::Readback { callback, result } => callback(result),
            }
        }
    }
}

pub(crate) struct Driver {
    context: Option<Box<dyn GraphicsContext>>,
    lost_output_surface: bool,
    texture_ids: TextureIdAllocator,
}

impl Driver {
    fn new(context: Option<Box<dyn GraphicsContext>>, id_batch_size: usize) -> Self {
        Self {
            context,
            lost_output_surface: false,
            texture_ids: TextureIdAllocator::new(id_batch_size),
        }
    }

    pub(crate) fn has_context(&self) -> bool {
        self.context.is_some()
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost_output_surface
            || self
                .context
                .as_ref()
                .is_some_and(|context| context.is_context_lost())
    }

    pub(crate) fn live(&mut self) -> Option<&mut Box<dyn GraphicsContext>> {
        if self.lost_output_surface {
            return None;
        }
        self.context
            .as_mut()
            .filter(|context| !context.is_context_lost())
    }

    fn mark_output_surface_lost(&mut self) {
        self.lost_output_surface = true;
    }

    fn gen_texture(&mut self) -> Option<TextureId> {
        if self.is_lost() {
            return None;
        }
        let context = self.context.as_mut()?;
        Some(self.texture_ids.allocate(&mut **context))
    }

    fn create_texture(
        &mut self,
        target: TextureTarget,
        filter: Filter,
        wrap_mode: WrapMode,
    ) -> Option<TextureId> {
        let texture = self.gen_texture()?;
        let context = self.live()?;
        context.set_texture_parameters(texture, target, filter, wrap_mode);
        Some(texture)
    }

    /// Moves texture storage from unallocated to allocated. Every lazy
    /// allocation in the table goes through here.
    pub(crate) fn lazy_allocate(&mut self, resource: &mut Resource) {
        let Backing::Texture(backing) = &mut resource.backing else {
            return;
        };
        if backing.storage == Storage::Allocated {
            return;
        }
        backing.storage = Storage::Allocated;
        if backing.texture.is_none() {
            backing.texture =
                self.create_texture(backing.target, backing.filter, resource.wrap_mode);
        }
        let Some(texture) = backing.texture else {
            return;
        };
        let Some(context) = self.live() else {
            return;
        };
        context.allocate_texture_storage(
            texture,
            backing.target,
            resource.size,
            resource.format,
            resource.hint,
        );
        tracing::trace!(?texture, size = ?resource.size, format = ?resource.format, "allocated texture storage");
    }

    /// Binds a mailbox-only texture to a local name, after waiting on the
    /// producer's sync point. A name that does not resolve to a texture of
    /// the resource's shape leaves the resource lost.
    pub(crate) fn consume_mailbox(&mut self, resource: &mut Resource) {
        let (size, format) = (resource.size, resource.format);
        let Backing::Texture(backing) = &mut resource.backing else {
            return;
        };
        if backing.texture.is_some() {
            return;
        }
        let Some(holder) = backing.mailbox.as_mut() else {
            return;
        };
        let Some(texture) = self.gen_texture() else {
            return;
        };
        let Some(context) = self.live() else {
            return;
        };
        let sync_point = holder.take_sync_point();
        if !sync_point.is_none() {
            context.wait_sync_point(sync_point);
        }
        let consumed =
            context.consume_texture(texture, holder.target, &holder.mailbox, size, format);
        backing.target = holder.target;
        backing.texture = Some(texture);
        if !consumed {
            resource.lost = true;
            tracing::warn!(?texture, ?size, ?format, "mailbox did not resolve; resource lost");
        }
    }

    // Share-group bookkeeping, done even after loss.
    fn discard_mailbox(&mut self, mailbox: &Mailbox) {
        if let Some(context) = self.context.as_mut() {
            context.discard_mailbox(mailbox);
        }
    }

    fn release_unused_texture_ids(&mut self) {
        if self.is_lost() {
            self.texture_ids.discard_unused();
            return;
        }
        if let Some(context) = self.context.as_mut() {
            self.texture_ids.release_unused(&mut **context);
        }
    }
}

pub(crate) fn lookup(resources: &HashMap<ResourceId, Resource>, id: ResourceId) -> &Resource {
    let Some(resource) = resources.get(&id) else {
        panic!("{id} is not in the resource table");
    };
    resource
}

pub(crate) fn lookup_mut(
    resources: &mut HashMap<ResourceId, Resource>,
    id: ResourceId,
) -> &mut Resource {
    let Some(resource) = resources.get_mut(&id) else {
        panic!("{id} is not in the resource table");
    };
    resource
}

fn assert_writable(id: ResourceId, resource: &Resource, operation: &str) {
    if resource.write != WriteState::Unlocked {
        panic!("{operation}: {id} is locked for write");
    }
    if resource.lock_for_read_count > 0 {
        panic!("{operation}: {id} is locked for read");
    }
    if !resource.is_internal() {
        panic!("{operation}: {id} is not owned by this table");
    }
    if resource.exported_count > 0 {
        panic!("{operation}: {id} is exported");
    }
    if !resource.read_lock_fence_has_passed() {
        panic!("{operation}: {id} read lock fence has not passed");
    }
}

fn assert_owned_pixel_buffer(id: ResourceId, resource: &Resource, operation: &str) {
    if !resource.is_internal() {
        panic!("{operation}: {id} is not owned by this table");
    }
    if resource.exported_count > 0 {
        panic!("{operation}: {id} is exported");
    }
}

pub(crate) fn view_of(driver: &Driver, resource: &Resource) -> ResourceView {
    if resource.lost {
        return ResourceView::Lost;
    }
    match &resource.backing {
        Backing::Texture(backing) => match backing.texture {
            Some(texture) if !driver.is_lost() => ResourceView::Texture(texture),
            _ => ResourceView::Lost,
        },
        Backing::Bitmap(bitmap) => ResourceView::Bitmap(bitmap.pixels.clone()),
    }
}

fn packed_source(
    image: &[u8],
    image_rect: Rect,
    source_rect: Rect,
    format: ResourceFormat,
) -> Vec<u8> {
    if format.is_compressed() {
        if source_rect != image_rect {
            panic!("{format:?} pixels are uploaded whole, not as {source_rect:?} of {image_rect:?}");
        }
        let byte_len = format.byte_len(source_rect.size());
        if image.len() < byte_len {
            panic!("{format:?} image holds {} of {byte_len} bytes", image.len());
        }
        return image[..byte_len].to_vec();
    }
    let (Some(image_row_bytes), Some(row_bytes), Some(first_byte)) = (
        format.row_bytes(image_rect.width),
        format.row_bytes(source_rect.width),
        format.row_bytes(source_rect.x - image_rect.x),
    ) else {
        panic!("{format:?} has no row stride");
    };
    pack_rows(
        image,
        image_row_bytes,
        (source_rect.y - image_rect.y) as usize,
        first_byte,
        row_bytes,
        source_rect.height as usize,
    )
}

pub(crate) struct ProviderState {
    pub(crate) driver: Driver,
    pub(crate) bitmap_manager: Option<Arc<dyn SharedBitmapManager>>,
    default_backing: BackingMode,
    pub(crate) max_texture_size: u32,
    best_texture_format: ResourceFormat,
    pub(crate) resources: HashMap<ResourceId, Resource>,
    next_resource: u32,
    pub(crate) children: HashMap<ChildId, Child>,
    pub(crate) next_child: u32,
    current_read_lock_fence: Option<Arc<dyn Fence>>,
    pub(crate) readbacks: ReadbackQueue,
}

impl ProviderState {
    pub(crate) fn insert(&mut self, resource: Resource) -> ResourceId {
        self.next_resource = self
            .next_resource
            .checked_add(1)
            .expect("resource id space exhausted");
        let id = ResourceId(self.next_resource);
        tracing::trace!(%id, backing = ?resource.backing_kind(), size = ?resource.size, "resource created");
        self.resources.insert(id, resource);
        id
    }

    fn assert_creatable_size(&self, size: Size) {
        if size.is_empty() {
            panic!("cannot create an empty resource of {size:?}");
        }
        if size.width > self.max_texture_size || size.height > self.max_texture_size {
            panic!(
                "resource size {size:?} exceeds max texture size {}",
                self.max_texture_size
            );
        }
    }

    fn create_resource(
        &mut self,
        size: Size,
        wrap_mode: WrapMode,
        hint: TextureUsageHint,
        format: ResourceFormat,
    ) -> ResourceId {
        match self.default_backing {
            BackingMode::Gpu => self.create_gpu_resource(size, wrap_mode, hint, format),
            BackingMode::Bitmap => {
                if format != SHARED_BITMAP_FORMAT {
                    panic!("bitmap resources store {SHARED_BITMAP_FORMAT:?}, not {format:?}");
                }
                self.create_bitmap_resource(size, wrap_mode)
            }
        }
    }

    fn create_gpu_resource(
        &mut self,
        size: Size,
        wrap_mode: WrapMode,
        hint: TextureUsageHint,
        format: ResourceFormat,
    ) -> ResourceId {
        self.assert_creatable_size(size);
        if !self.driver.has_context() {
            panic!("gpu resources require a graphics context");
        }
        let mut backing = TextureBacking::local(Filter::Linear);
        backing.texture = self
            .driver
            .create_texture(backing.target, backing.filter, wrap_mode);
        self.insert(Resource::new(
            size,
            format,
            wrap_mode,
            hint,
            Backing::Texture(backing),
            Origin::Internal,
        ))
    }

    fn create_bitmap_resource(&mut self, size: Size, wrap_mode: WrapMode) -> ResourceId {
        self.assert_creatable_size(size);
        let shared = self
            .bitmap_manager
            .as_ref()
            .and_then(|manager| manager.allocate_shared_bitmap(size));
        let backing = match shared {
            Some(bitmap) => BitmapBacking {
                pixels: bitmap.pixels().clone(),
                shared: Some(bitmap.id()),
            },
            None => BitmapBacking {
                pixels: BitmapPixels::zeroed(SHARED_BITMAP_FORMAT.byte_len(size)),
                shared: None,
            },
        };
        self.insert(Resource::new(
            size,
            SHARED_BITMAP_FORMAT,
            wrap_mode,
            TextureUsageHint::Any,
            Backing::Bitmap(backing),
            Origin::Internal,
        ))
    }

    fn create_resource_from_texture_mailbox(
        &mut self,
        mailbox: TextureMailbox,
        release: Box<dyn ReleaseCallback>,
    ) -> ResourceId {
        let resource = match mailbox {
            TextureMailbox::Texture {
                holder,
                size,
                format,
            } => {
                if !self.driver.has_context() {
                    panic!("external textures require a graphics context");
                }
                if holder.mailbox.is_zero() {
                    panic!("external texture mailbox has not been produced");
                }
                Resource::new(
                    size,
                    format,
                    WrapMode::ClampToEdge,
                    TextureUsageHint::Any,
                    Backing::Texture(TextureBacking::from_mailbox(holder, Filter::Linear)),
                    Origin::External(release),
                )
            }
            TextureMailbox::SharedBitmap(bitmap) => Resource::new(
                bitmap.size(),
                SHARED_BITMAP_FORMAT,
                WrapMode::ClampToEdge,
                TextureUsageHint::Any,
                Backing::Bitmap(BitmapBacking {
                    pixels: bitmap.pixels().clone(),
                    shared: Some(bitmap.id()),
                }),
                Origin::External(release),
            ),
        };
        self.insert(resource)
    }

    fn delete_resource(&mut self, notes: &mut Notifications, id: ResourceId) {
        let resource = lookup_mut(&mut self.resources, id);
        if resource.lock_for_read_count > 0 {
            panic!("delete_resource: {id} is locked for read");
        }
        if resource.is_marked_for_deletion() {
            panic!("delete_resource: {id} is already marked for deletion");
        }
        if let Some(child) = resource.child() {
            panic!("delete_resource: {id} is imported from {child}; only its child releases it");
        }
        if resource.write == WriteState::Locked {
            panic!("delete_resource: {id} is locked for write");
        }
        if resource.exported_count > 0 {
            resource.lifecycle = Lifecycle::MarkedForDeletion;
            tracing::trace!(%id, exported = resource.exported_count, "deletion deferred until returned");
            return;
        }
        self.delete_resource_internal(notes, id, DeleteStyle::Normal);
    }

    pub(crate) fn delete_resource_internal(
        &mut self,
        notes: &mut Notifications,
        id: ResourceId,
        style: DeleteStyle,
    ) {
        let Some(resource) = self.resources.remove(&id) else {
            panic!("{id} is not in the resource table");
        };
        if style == DeleteStyle::Normal && resource.exported_count > 0 {
            panic!("{id} deleted while exported {} times", resource.exported_count);
        }
        let Resource {
            backing,
            origin,
            exported_count,
            lost,
            ..
        } = resource;
        let mut lost = lost || (style == DeleteStyle::ForShutdown && exported_count > 0);

        match backing {
            Backing::Texture(backing) => {
                let driver_lost = self.driver.is_lost();
                if let (Some(query), Some(context)) = (backing.upload_query, self.driver.live()) {
                    context.delete_query(query);
                }
                match origin {
                    Origin::External(release) => {
                        lost |= driver_lost;
                        let mut sync_point = backing
                            .mailbox
                            .map_or(SyncPoint::NONE, |holder| holder.sync_point);
                        if let (Some(texture), Some(context)) = (backing.texture, self.driver.live())
                        {
                            context.delete_textures(&[texture]);
                            if !lost {
                                sync_point = context.insert_sync_point();
                            }
                        }
                        notes.release(release, sync_point, lost);
                    }
                    Origin::Internal => {
                        if let (Some(texture), Some(context)) = (backing.texture, self.driver.live())
                        {
                            context.delete_textures(&[texture]);
                        }
                        if let Some(holder) = backing.mailbox {
                            self.driver.discard_mailbox(&holder.mailbox);
                        }
                    }
                    Origin::Imported(_) => {
                        if let (Some(texture), Some(context)) = (backing.texture, self.driver.live())
                        {
                            context.delete_textures(&[texture]);
                        }
                    }
                }
            }
            Backing::Bitmap(bitmap) => match origin {
                Origin::External(release) => notes.release(release, SyncPoint::NONE, lost),
                Origin::Internal => {
                    if let (Some(shared), Some(manager)) = (bitmap.shared, &self.bitmap_manager) {
                        manager.release_shared_bitmap(shared);
                    }
                }
                Origin::Imported(_) => {}
            },
        }
        tracing::trace!(%id, lost, "resource deleted");
    }

    fn set_pixels(
        &mut self,
        id: ResourceId,
        image: &[u8],
        image_rect: Rect,
        source_rect: Rect,
        dest_offset: Offset,
    ) {
        let resource = lookup_mut(&mut self.resources, id);
        assert_writable(id, resource, "set_pixels");
        if !image_rect.contains_rect(source_rect) {
            panic!("set_pixels: source {source_rect:?} lies outside image {image_rect:?}");
        }
        let dest_rect = Rect::new(
            dest_offset.x,
            dest_offset.y,
            source_rect.width,
            source_rect.height,
        );
        if !Rect::from_size(resource.size).contains_rect(dest_rect) {
            panic!("set_pixels: destination {dest_rect:?} exceeds {id} of {:?}", resource.size);
        }
        let format = resource.format;
        if format.is_compressed() && dest_rect != Rect::from_size(resource.size) {
            panic!("set_pixels: {format:?} resources are written whole");
        }
        if resource.lost {
            tracing::trace!(%id, "set_pixels on a lost resource skipped");
            return;
        }

        self.driver.lazy_allocate(resource);
        if source_rect.size().is_empty() {
            return;
        }
        let packed = packed_source(image, image_rect, source_rect, format);
        match &mut resource.backing {
            Backing::Texture(backing) => {
                if let (Some(texture), Some(context)) = (backing.texture, self.driver.live()) {
                    context.upload_pixels(texture, dest_offset, source_rect.size(), format, &packed);
                }
            }
            Backing::Bitmap(bitmap) => {
                let pixel_bytes = format.bits_per_pixel() as usize / 8;
                let dest_row_bytes = resource.size.width as usize * pixel_bytes;
                let row_bytes = source_rect.width as usize * pixel_bytes;
                let mut pixels = bitmap.pixels.lock();
                for (row, source) in packed.chunks_exact(row_bytes).enumerate() {
                    let start = (dest_offset.y as usize + row) * dest_row_bytes
                        + dest_offset.x as usize * pixel_bytes;
                    pixels[start..start + row_bytes].copy_from_slice(source);
                }
            }
        }
    }

    fn acquire_pixel_buffer(&mut self, id: ResourceId) {
        let resource = lookup_mut(&mut self.resources, id);
        assert_owned_pixel_buffer(id, resource, "acquire_pixel_buffer");
        if resource.pixel_buffer.is_none() {
            let byte_len = resource.format.byte_len(resource.size);
            resource.pixel_buffer = Some(PixelBuffer::Unmapped(vec![0; byte_len]));
        }
    }

    fn release_pixel_buffer(&mut self, id: ResourceId) {
        let resource = lookup_mut(&mut self.resources, id);
        assert_owned_pixel_buffer(id, resource, "release_pixel_buffer");
        if let WriteState::Uploading { completion_forced } = resource.write {
            if !completion_forced {
                panic!("release_pixel_buffer: {id} upload still in flight");
            }
            if let Backing::Texture(backing) = &mut resource.backing {
                if let (Some(query), Some(context)) =
                    (backing.upload_query.take(), self.driver.live())
                {
                    context.delete_query(query);
                }
            }
            resource.write = WriteState::Unlocked;
        }
        resource.pixel_buffer = None;
    }

    fn map_pixel_buffer(&mut self, id: ResourceId) -> MappedPixelBuffer {
        let resource = lookup_mut(&mut self.resources, id);
        assert_owned_pixel_buffer(id, resource, "map_pixel_buffer");
        if matches!(resource.write, WriteState::Uploading { .. }) {
            panic!("map_pixel_buffer: {id} upload still in flight");
        }
        match resource.pixel_buffer.take() {
            Some(PixelBuffer::Unmapped(bytes)) => {
                resource.pixel_buffer = Some(PixelBuffer::Mapped);
                MappedPixelBuffer { id, bytes }
            }
            Some(PixelBuffer::Mapped) => panic!("map_pixel_buffer: {id} is already mapped"),
            None => panic!("map_pixel_buffer: {id} has no pixel buffer"),
        }
    }

    fn unmap_pixel_buffer(&mut self, buffer: MappedPixelBuffer) {
        let MappedPixelBuffer { id, bytes } = buffer;
        let resource = lookup_mut(&mut self.resources, id);
        match resource.pixel_buffer {
            Some(PixelBuffer::Mapped) => resource.pixel_buffer = Some(PixelBuffer::Unmapped(bytes)),
            _ => panic!("unmap_pixel_buffer: {id} pixel buffer is not mapped"),
        }
    }

    fn begin_set_pixels(&mut self, id: ResourceId) {
        let resource = lookup_mut(&mut self.resources, id);
        assert_writable(id, resource, "begin_set_pixels");
        if !resource.lost {
            self.driver.lazy_allocate(resource);
        }
        let bytes = match &resource.pixel_buffer {
            Some(PixelBuffer::Unmapped(bytes)) => bytes,
            Some(PixelBuffer::Mapped) => panic!("begin_set_pixels: {id} pixel buffer is mapped"),
            None => panic!("begin_set_pixels: {id} has no pixel buffer"),
        };
        if resource.lost {
            tracing::trace!(%id, "pixel buffer upload to a lost resource skipped");
        } else {
            match &mut resource.backing {
                Backing::Texture(backing) => {
                    if let (Some(texture), Some(context)) = (backing.texture, self.driver.live()) {
                        backing.upload_query = Some(context.begin_async_upload(
                            texture,
                            resource.size,
                            resource.format,
                            bytes,
                        ));
                    }
                }
                Backing::Bitmap(bitmap) => bitmap.pixels.lock().copy_from_slice(bytes),
            }
        }
        resource.write = WriteState::Uploading {
            completion_forced: false,
        };
    }

    fn did_set_pixels_complete(&mut self, id: ResourceId) -> bool {
        let resource = lookup_mut(&mut self.resources, id);
        let WriteState::Uploading { .. } = resource.write else {
            panic!("did_set_pixels_complete: {id} has no upload in flight");
        };
        if let Backing::Texture(backing) = &mut resource.backing {
            if let Some(query) = backing.upload_query {
                if let Some(context) = self.driver.live() {
                    if !context.is_query_complete(query) {
                        return false;
                    }
                    context.delete_query(query);
                }
                backing.upload_query = None;
            }
        }
        resource.write = WriteState::Unlocked;
        true
    }

    fn force_set_pixels_to_complete(&mut self, id: ResourceId) {
        let resource = lookup_mut(&mut self.resources, id);
        let WriteState::Uploading { .. } = resource.write else {
            panic!("force_set_pixels_to_complete: {id} has no upload in flight");
        };
        if let Backing::Texture(backing) = &resource.backing {
            if let (Some(query), Some(context)) = (backing.upload_query, self.driver.live()) {
                context.wait_query(query);
            }
        }
        resource.write = WriteState::Uploading {
            completion_forced: true,
        };
    }

    pub(crate) fn lock_for_read(&mut self, id: ResourceId) -> ResourceView {
        let fence = self.current_read_lock_fence.clone();
        let resource = lookup_mut(&mut self.resources, id);
        if !resource.admits_readers() {
            panic!("lock_for_read: {id} is locked for write");
        }
        if resource.exported_count > 0 {
            panic!("lock_for_read: {id} is exported");
        }
        if resource.is_internal() {
            self.driver.lazy_allocate(resource);
        }
        self.driver.consume_mailbox(resource);
        resource.lock_for_read_count = resource
            .lock_for_read_count
            .checked_add(1)
            .expect("read lock count overflow");
        if resource.read_lock_fences_enabled {
            if let Some(fence) = &fence {
                fence.set();
            }
            resource.read_lock_fence = fence;
        }
        view_of(&self.driver, resource)
    }

    pub(crate) fn unlock_for_read(&mut self, notes: &mut Notifications, id: ResourceId) {
        let resource = lookup_mut(&mut self.resources, id);
        if resource.lock_for_read_count == 0 {
            panic!("unlock_for_read: {id} is not locked for read");
        }
        if resource.exported_count > 0 {
            panic!("unlock_for_read: {id} was exported while locked");
        }
        resource.lock_for_read_count -= 1;
        if resource.lock_for_read_count > 0 || !resource.is_marked_for_deletion() {
            return;
        }
        match resource.child() {
            None => self.delete_resource_internal(notes, id, DeleteStyle::Normal),
            Some(child) => self.delete_and_return_unused_resources_to_child(
                notes,
                child,
                DeleteStyle::Normal,
                vec![id],
            ),
        }
    }

    fn lock_for_write(&mut self, id: ResourceId) -> ResourceView {
        let resource = lookup_mut(&mut self.resources, id);
        assert_writable(id, resource, "lock_for_write");
        if resource.lost {
            panic!("lock_for_write: {id} is lost");
        }
        self.driver.lazy_allocate(resource);
        resource.write = WriteState::Locked;
        view_of(&self.driver, resource)
    }

    fn unlock_for_write(&mut self, id: ResourceId) {
        let resource = lookup_mut(&mut self.resources, id);
        if resource.write != WriteState::Locked {
            panic!("unlock_for_write: {id} is not locked for write");
        }
        resource.write = WriteState::Unlocked;
    }

    fn can_lock_for_write(&self, id: ResourceId) -> bool {
        let resource = lookup(&self.resources, id);
        resource.write == WriteState::Unlocked
            && resource.lock_for_read_count == 0
            && resource.exported_count == 0
            && resource.is_internal()
            && !resource.lost
            && resource.read_lock_fence_has_passed()
    }

    fn bind_for_sampling(&mut self, id: ResourceId, unit: TextureUnit, filter: Filter) {
        let resource = lookup_mut(&mut self.resources, id);
        if resource.lock_for_read_count == 0 {
            panic!("bind_for_sampling: {id} is not locked for read");
        }
        if resource.lost {
            return;
        }
        let Backing::Texture(backing) = &mut resource.backing else {
            return;
        };
        let Some(texture) = backing.texture else {
            return;
        };
        let Some(context) = self.driver.live() else {
            return;
        };
        context.bind_texture(unit, backing.target, texture);
        if filter != backing.filter {
            context.set_texture_filter(texture, backing.target, filter);
            backing.filter = filter;
        }
    }

    fn read_pixels(&mut self, notes: &mut Notifications, id: ResourceId) -> Option<Vec<u8>> {
        let resource = lookup(&self.resources, id);
        let (size, format) = (resource.size, resource.format);
        if format.is_compressed() {
            panic!("read_pixels: {id} is {format:?}, which cannot be read back");
        }
        let pixels = match self.lock_for_read(id) {
            ResourceView::Texture(texture) => self
                .driver
                .live()
                .and_then(|context| context.read_pixels(texture, size, format)),
            ResourceView::Bitmap(pixels) => Some(pixels.to_vec()),
            ResourceView::Lost => None,
        };
        self.unlock_for_read(notes, id);
        pixels
    }

    fn did_lose_output_surface(&mut self, notes: &mut Notifications) {
        self.driver.mark_output_surface_lost();
        tracing::warn!(
            resources = self.resources.len(),
            children = self.children.len(),
            "output surface lost; gpu resources leaving the table are reported lost"
        );
        self.readbacks.abandon(&mut self.driver, notes);
    }

    fn shutdown(&mut self, notes: &mut Notifications) {
        let mut children: Vec<ChildId> = self.children.keys().copied().collect();
        children.sort();
        for child in children {
            self.destroy_child_internal(notes, child, DeleteStyle::ForShutdown);
        }
        let mut ids: Vec<ResourceId> = self.resources.keys().copied().collect();
        ids.sort();
        for id in ids {
            self.delete_resource_internal(notes, id, DeleteStyle::ForShutdown);
        }
        self.readbacks.abandon(&mut self.driver, notes);
        self.driver.release_unused_texture_ids();
        tracing::debug!("resource provider shut down");
    }
}

/// CPU-visible staging bytes of a resource's pixel buffer, moved out of the
/// table while mapped. Hand it back with
/// [`ResourceProvider::unmap_pixel_buffer`].
#[derive(Debug)]
pub struct MappedPixelBuffer {
    id: ResourceId,
    bytes: Vec<u8>,
}

impl MappedPixelBuffer {
    pub fn id(&self) -> ResourceId {
        self.id
    }
}

impl Deref for MappedPixelBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for MappedPixelBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Owner of every resource of one compositor instance.
///
/// The provider binds to the first thread that uses it and panics when
/// called from any other. It is `Send` but not `Sync`: move it, then call
/// [`ResourceProvider::detach_from_thread`] to rebind.
pub struct ResourceProvider {
    state: RefCell<ProviderState>,
    owner_thread: Cell<Option<ThreadId>>,
}

impl fmt::Debug for ResourceProvider {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_borrow() {
            Ok(state) => formatter
                .debug_struct("ResourceProvider")
                .field("default_backing", &state.default_backing)
                .field("resources", &state.resources.len())
                .field("children", &state.children.len())
                .field("lost_output_surface", &state.driver.lost_output_surface)
                .finish(),
            Err(_) => formatter
                .debug_struct("ResourceProvider")
                .finish_non_exhaustive(),
        }
    }
}

impl ResourceProvider {
    /// Panics when `settings` are invalid or GPU backing is requested
    /// without a context.
    pub fn new(
        context: Option<Box<dyn GraphicsContext>>,
        bitmap_manager: Option<Arc<dyn SharedBitmapManager>>,
        settings: ResourceSettings,
    ) -> Self {
        if let Err(error) = settings.validate() {
            panic!("invalid resource settings: {error}");
        }
        if settings.default_backing == BackingMode::Gpu && context.is_none() {
            panic!("gpu backing requires a graphics context");
        }
        let max_texture_size = context.as_ref().map_or(settings.max_texture_size, |context| {
            context
                .capabilities()
                .max_texture_size
                .min(settings.max_texture_size)
        });
        tracing::debug!(
            backing = ?settings.default_backing,
            max_texture_size,
            "resource provider created"
        );
        Self {
            state: RefCell::new(ProviderState {
                driver: Driver::new(context, settings.id_allocation_batch_size),
                bitmap_manager,
                default_backing: settings.default_backing,
                max_texture_size,
                best_texture_format: settings.best_texture_format,
                resources: HashMap::new(),
                next_resource: 0,
                children: HashMap::new(),
                next_child: 0,
                current_read_lock_fence: None,
                readbacks: ReadbackQueue::default(),
            }),
            owner_thread: Cell::new(None),
        }
    }

    pub fn detach_from_thread(&mut self) {
        *self.owner_thread.get_mut() = None;
    }

    fn assert_owner_thread(&self) {
        let current = thread::current().id();
        match self.owner_thread.get() {
            None => self.owner_thread.set(Some(current)),
            Some(owner) if owner == current => {}
            Some(owner) => {
                panic!("resource provider bound to thread {owner:?} called from {current:?}")
            }
        }
    }

    pub(crate) fn with_state<R>(
        &self,
        operation: impl FnOnce(&mut ProviderState, &mut Notifications) -> R,
    ) -> R {
        self.assert_owner_thread();
        let mut notes = Notifications::default();
        let result = {
            let mut state = self.state.borrow_mut();
            operation(&mut state, &mut notes)
        };
        notes.dispatch();
        result
    }

    pub(crate) fn read_state<R>(&self, operation: impl FnOnce(&ProviderState) -> R) -> R {
        self.assert_owner_thread();
        operation(&self.state.borrow())
    }

    pub fn default_backing(&self) -> BackingMode {
        self.read_state(|state| state.default_backing)
    }

    pub fn max_texture_size(&self) -> u32 {
        self.read_state(|state| state.max_texture_size)
    }

    pub fn best_texture_format(&self) -> ResourceFormat {
        self.read_state(|state| state.best_texture_format)
    }

    pub fn create_resource(
        &self,
        size: Size,
        wrap_mode: WrapMode,
        hint: TextureUsageHint,
        format: ResourceFormat,
    ) -> ResourceId {
        self.with_state(|state, _| state.create_resource(size, wrap_mode, hint, format))
    }

    pub fn create_gpu_resource(
        &self,
        size: Size,
        wrap_mode: WrapMode,
        hint: TextureUsageHint,
        format: ResourceFormat,
    ) -> ResourceId {
        self.with_state(|state, _| state.create_gpu_resource(size, wrap_mode, hint, format))
    }

    pub fn create_bitmap_resource(&self, size: Size, wrap_mode: WrapMode) -> ResourceId {
        self.with_state(|state, _| state.create_bitmap_resource(size, wrap_mode))
    }

    pub fn create_resource_from_texture_mailbox(
        &self,
        mailbox: TextureMailbox,
        release: Box<dyn ReleaseCallback>,
    ) -> ResourceId {
        self.with_state(|state, _| state.create_resource_from_texture_mailbox(mailbox, release))
    }

    pub fn delete_resource(&self, id: ResourceId) {
        self.with_state(|state, notes| state.delete_resource(notes, id));
    }

    /// Copies `source_rect` of `image` so that its origin lands at
    /// `dest_offset`. `image` covers `image_rect` with a stride of
    /// `image_rect.width` pixels.
    pub fn set_pixels(
        &self,
        id: ResourceId,
        image: &[u8],
        image_rect: Rect,
        source_rect: Rect,
        dest_offset: Offset,
    ) {
        self.with_state(|state, _| {
            state.set_pixels(id, image, image_rect, source_rect, dest_offset)
        });
    }

    pub fn acquire_pixel_buffer(&self, id: ResourceId) {
        self.with_state(|state, _| state.acquire_pixel_buffer(id));
    }

    pub fn release_pixel_buffer(&self, id: ResourceId) {
        self.with_state(|state, _| state.release_pixel_buffer(id));
    }

    pub fn map_pixel_buffer(&self, id: ResourceId) -> MappedPixelBuffer {
        self.with_state(|state, _| state.map_pixel_buffer(id))
    }

    pub fn unmap_pixel_buffer(&self, buffer: MappedPixelBuffer) {
        self.with_state(|state, _| state.unmap_pixel_buffer(buffer));
    }

    pub fn begin_set_pixels(&self, id: ResourceId) {
        self.with_state(|state, _| state.begin_set_pixels(id));
    }

    pub fn did_set_pixels_complete(&self, id: ResourceId) -> bool {
        self.with_state(|state, _| state.did_set_pixels_complete(id))
    }

    /// Blocks until the upload has landed. Readers are admitted from here on
    /// even though the resource is still nominally locked for write.
    pub fn force_set_pixels_to_complete(&self, id: ResourceId) {
        self.with_state(|state, _| state.force_set_pixels_to_complete(id));
    }

    pub fn lock_for_read(&self, id: ResourceId) -> ResourceView {
        self.with_state(|state, _| state.lock_for_read(id))
    }

    pub fn unlock_for_read(&self, id: ResourceId) {
        self.with_state(|state, notes| state.unlock_for_read(notes, id));
    }

    pub fn lock_for_write(&self, id: ResourceId) -> ResourceView {
        self.with_state(|state, _| state.lock_for_write(id))
    }

    pub fn unlock_for_write(&self, id: ResourceId) {
        self.with_state(|state, _| state.unlock_for_write(id));
    }

    pub fn can_lock_for_write(&self, id: ResourceId) -> bool {
        self.read_state(|state| state.can_lock_for_write(id))
    }

    pub(crate) fn bind_for_sampling(&self, id: ResourceId, unit: TextureUnit, filter: Filter) {
        self.with_state(|state, _| state.bind_for_sampling(id, unit, filter));
    }

    pub fn enable_read_lock_fences(&self, id: ResourceId, enabled: bool) {
        self.with_state(|state, _| {
            lookup_mut(&mut state.resources, id).read_lock_fences_enabled = enabled;
        });
    }

    /// Fence latched by resources read-locked from now on. Locks taken
    /// earlier keep the fence they captured.
    pub fn set_read_lock_fence(&self, fence: Option<Arc<dyn Fence>>) {
        self.with_state(|state, _| state.current_read_lock_fence = fence);
    }

    pub fn read_lock_fence(&self) -> Option<Arc<dyn Fence>> {
        self.read_state(|state| state.current_read_lock_fence.clone())
    }

    /// Blocking full readback. `None` when the resource is lost.
    pub fn read_pixels(&self, id: ResourceId) -> Option<Vec<u8>> {
        self.with_state(|state, notes| state.read_pixels(notes, id))
    }

    pub fn flush(&self) {
        self.with_state(|state, _| {
            if let Some(context) = state.driver.live() {
                context.flush();
            }
        });
    }

    pub fn finish(&self) {
        self.with_state(|state, _| {
            if let Some(context) = state.driver.live() {
                context.finish();
            }
        });
    }

    pub fn did_lose_output_surface(&self) {
        self.with_state(|state, notes| state.did_lose_output_surface(notes));
    }

    pub fn resource_snapshot(&self, id: ResourceId) -> ResourceSnapshot {
        self.read_state(|state| lookup(&state.resources, id).snapshot())
    }

    pub fn num_resources(&self) -> usize {
        self.read_state(|state| state.resources.len())
    }

    pub fn in_use_by_consumer(&self, id: ResourceId) -> bool {
        self.read_state(|state| {
            let resource = lookup(&state.resources, id);
            resource.is_busy() || resource.lost
        })
    }

    pub fn is_lost(&self, id: ResourceId) -> bool {
        self.read_state(|state| lookup(&state.resources, id).lost)
    }

    pub fn resource_size(&self, id: ResourceId) -> Size {
        self.read_state(|state| lookup(&state.resources, id).size)
    }

    pub fn resource_format(&self, id: ResourceId) -> ResourceFormat {
        self.read_state(|state| lookup(&state.resources, id).format)
    }

    pub fn resource_backing_kind(&self, id: ResourceId) -> BackingKind {
        self.read_state(|state| lookup(&state.resources, id).backing_kind())
    }

    pub fn allocate_for_testing(&self, id: ResourceId) {
        self.with_state(|state, _| {
            let resource = lookup_mut(&mut state.resources, id);
            state.driver.lazy_allocate(resource);
        });
    }
}

impl Drop for ResourceProvider {
    fn drop(&mut self) {
        let mut notes = Notifications::default();
        self.state.get_mut().shutdown(&mut notes);
        notes.dispatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_source_honours_image_origin() {
        let image: Vec<u8> = (0..8).collect();
        let packed = packed_source(
            &image,
            Rect::new(10, 20, 2, 4),
            Rect::new(11, 21, 1, 2),
            ResourceFormat::Luminance8,
        );
        assert_eq!(packed, vec![3, 5]);
    }

    #[test]
    #[should_panic(expected = "uploaded whole")]
    fn packed_source_rejects_partial_compressed_upload() {
        let _ = packed_source(
            &[0; 8],
            Rect::new(0, 0, 4, 4),
            Rect::new(0, 0, 2, 2),
            ResourceFormat::Etc1,
        );
    }
}
