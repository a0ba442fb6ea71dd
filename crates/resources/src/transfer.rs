use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use resource_protocol::{
    ChildId, Filter, MailboxHolder, ResourceId, ReturnedResource, SharedBitmapId, SyncPoint,
    TextureTarget, TextureUsageHint, TransferableResource, WrapMode,
};

use crate::provider::{DeleteStyle, Driver, Notifications, ProviderState, lookup_mut};
use crate::resource::{
    Backing, BitmapBacking, Lifecycle, Origin, Resource, TextureBacking, WriteState,
};
use crate::{BackingKind, ResourceProvider};

pub type ReturnCallback = Arc<dyn Fn(Vec<ReturnedResource>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildState {
    Active,
    MarkedForDeletion,
}

pub(crate) struct Child {
    return_callback: ReturnCallback,
    child_to_parent: BTreeMap<ResourceId, ResourceId>,
    parent_to_child: BTreeMap<ResourceId, ResourceId>,
    in_use: BTreeSet<ResourceId>,
    state: ChildState,
}

fn child_mut(children: &mut HashMap<ChildId, Child>, child: ChildId) -> &mut Child {
    let Some(info) = children.get_mut(&child) else {
        panic!("{child} is not a child of this provider");
    };
    info
}

/// Wire record for one outgoing resource, producing a mailbox if it has
/// none yet. `None` when no mailbox could be generated.
fn transferable(
    driver: &mut Driver,
    id: ResourceId,
    resource: &mut Resource,
) -> Option<TransferableResource> {
    driver.lazy_allocate(resource);
    let (size, format) = (resource.size, resource.format);
    match &mut resource.backing {
        Backing::Bitmap(bitmap) => {
            let Some(shared) = bitmap.shared else {
                panic!("prepare_send_to_parent: {id} lives in heap memory and cannot be shared");
            };
            Some(TransferableResource {
                id,
                format,
                target: TextureTarget::Texture2D,
                filter: Filter::Linear,
                size,
                mailbox: shared.0,
                sync_point: SyncPoint::NONE,
                is_software: true,
            })
        }
        Backing::Texture(backing) => {
            let (mailbox, sync_point) = match backing.mailbox.as_mut() {
                // Already shared once, or received from elsewhere: forward
                // the sync point we were given.
                Some(holder) => (holder.mailbox, holder.take_sync_point()),
                None => {
                    let texture = backing.texture?;
                    let context = driver.live()?;
                    let mailbox = context.gen_mailbox();
                    if mailbox.is_zero() {
                        return None;
                    }
                    context.produce_texture(texture, backing.target, &mailbox);
                    backing.mailbox = Some(MailboxHolder::new(
                        mailbox,
                        backing.target,
                        SyncPoint::NONE,
                    ));
                    (mailbox, SyncPoint::NONE)
                }
            };
            Some(TransferableResource {
                id,
                format,
                target: backing.target,
                filter: backing.filter,
                size,
                mailbox,
                sync_point,
                is_software: false,
            })
        }
    }
}

fn lost_record(record: &TransferableResource) -> ReturnedResource {
    ReturnedResource {
        lost: true,
        ..record.to_returned()
    }
}

impl ProviderState {
    fn create_child(&mut self, return_callback: ReturnCallback) -> ChildId {
        self.next_child = self
            .next_child
            .checked_add(1)
            .expect("child id space exhausted");
        let child = ChildId(self.next_child);
        self.children.insert(
            child,
            Child {
                return_callback,
                child_to_parent: BTreeMap::new(),
                parent_to_child: BTreeMap::new(),
                in_use: BTreeSet::new(),
                state: ChildState::Active,
            },
        );
        tracing::debug!(%child, "child created");
        child
    }

    fn destroy_child(&mut self, notes: &mut Notifications, child: ChildId) {
        if child_mut(&mut self.children, child).state != ChildState::Active {
            panic!("destroy_child: {child} is already being destroyed");
        }
        self.destroy_child_internal(notes, child, DeleteStyle::Normal);
    }

    pub(crate) fn destroy_child_internal(
        &mut self,
        notes: &mut Notifications,
        child: ChildId,
        style: DeleteStyle,
    ) {
        let info = child_mut(&mut self.children, child);
        if style == DeleteStyle::Normal && info.state != ChildState::Active {
            panic!("{child} destroyed twice");
        }
        let resources: Vec<ResourceId> = info.parent_to_child.keys().copied().collect();
        info.in_use.clear();
        info.state = ChildState::MarkedForDeletion;
        tracing::debug!(%child, resources = resources.len(), ?style, "destroying child");
        self.delete_and_return_unused_resources_to_child(notes, child, style, resources);
    }

    /// Returns `unused` to `child`, or defers those a reader or a parent
    /// still holds. Erases the child once it is being destroyed and owns
    /// nothing.
    pub(crate) fn delete_and_return_unused_resources_to_child(
        &mut self,
        notes: &mut Notifications,
        child: ChildId,
        style: DeleteStyle,
        unused: Vec<ResourceId>,
    ) {
        if unused.is_empty() && child_mut(&mut self.children, child).state == ChildState::Active {
            return;
        }
        let driver_lost = self.driver.is_lost();
        let mut to_return = Vec::with_capacity(unused.len());
        let mut need_sync_point = Vec::new();

        for local_id in unused {
            let Some(&child_local_id) = child_mut(&mut self.children, child)
                .parent_to_child
                .get(&local_id)
            else {
                panic!("{local_id} was not received from {child}");
            };
            let resource = lookup_mut(&mut self.resources, local_id);
            let mut lost =
                resource.lost || (resource.backing_kind() == BackingKind::Texture && driver_lost);
            if resource.is_busy() {
                if style != DeleteStyle::ForShutdown {
                    resource.lifecycle = Lifecycle::MarkedForDeletion;
                    continue;
                }
                lost = true;
            }

            let mut sync_point = SyncPoint::NONE;
            if let Backing::Texture(backing) = &mut resource.backing {
                if let (Some(texture), Some(context)) = (backing.texture, self.driver.live()) {
                    if backing.filter != backing.original_filter {
                        context.set_texture_filter(texture, backing.target, backing.original_filter);
                        backing.filter = backing.original_filter;
                    }
                }
                sync_point = backing
                    .mailbox
                    .map_or(SyncPoint::NONE, |holder| holder.sync_point);
                if sync_point.is_none() {
                    need_sync_point.push(to_return.len());
                }
            }
            to_return.push(ReturnedResource {
                id: child_local_id,
                sync_point,
                count: resource.imported_count,
                lost,
            });
            resource.imported_count = 0;

            let info = child_mut(&mut self.children, child);
            info.parent_to_child.remove(&local_id);
            info.child_to_parent.remove(&child_local_id);
            info.in_use.remove(&local_id);
            self.delete_resource_internal(notes, local_id, style);
        }

        if !need_sync_point.is_empty() {
            if let Some(context) = self.driver.live() {
                let sync_point = context.insert_sync_point();
                for index in need_sync_point {
                    to_return[index].sync_point = sync_point;
                }
            }
        }

        let info = child_mut(&mut self.children, child);
        if !to_return.is_empty() {
            tracing::debug!(%child, count = to_return.len(), "returning resources to child");
            notes.return_to_child(info.return_callback.clone(), to_return);
        }
        if info.state == ChildState::MarkedForDeletion && info.parent_to_child.is_empty() {
            self.children.remove(&child);
            tracing::debug!(%child, "child erased");
        }
    }

    fn prepare_send_to_parent(&mut self, ids: &[ResourceId]) -> Vec<TransferableResource> {
        let mut list = Vec::with_capacity(ids.len());
        let mut need_sync_point = false;
        for &id in ids {
            let resource = lookup_mut(&mut self.resources, id);
            if resource.write != WriteState::Unlocked {
                panic!("prepare_send_to_parent: {id} is locked for write");
            }
            if resource.lock_for_read_count > 0 {
                panic!("prepare_send_to_parent: {id} is locked for read");
            }
            if resource.is_marked_for_deletion() {
                panic!("prepare_send_to_parent: {id} is marked for deletion");
            }
            let Some(record) = transferable(&mut self.driver, id, resource) else {
                resource.lost = true;
                tracing::warn!(%id, "no mailbox for outgoing resource; dropped from transfer");
                continue;
            };
            if record.sync_point.is_none() && !record.is_software {
                need_sync_point = true;
            }
            resource.exported_count = resource
                .exported_count
                .checked_add(1)
                .expect("export count overflow");
            list.push(record);
        }
        if need_sync_point {
            if let Some(context) = self.driver.live() {
                let sync_point = context.insert_sync_point();
                for record in list
                    .iter_mut()
                    .filter(|record| record.sync_point.is_none() && !record.is_software)
                {
                    record.sync_point = sync_point;
                }
            }
        }
        tracing::debug!(count = list.len(), need_sync_point, "prepared resources for parent");
        list
    }

    fn receive_from_child(
        &mut self,
        notes: &mut Notifications,
        child: ChildId,
        resources: &[TransferableResource],
    ) {
        let info = child_mut(&mut self.children, child);
        if info.state != ChildState::Active {
            panic!("receive_from_child: {child} is being destroyed");
        }
        let return_callback = info.return_callback.clone();
        let mut rejected = Vec::new();

        for record in resources {
            let existing = child_mut(&mut self.children, child)
                .child_to_parent
                .get(&record.id)
                .copied();
            if let Some(local_id) = existing {
                let resource = lookup_mut(&mut self.resources, local_id);
                resource.imported_count = resource
                    .imported_count
                    .checked_add(1)
                    .expect("import count overflow");
                continue;
            }

            let size = record.size;
            if size.is_empty()
                || size.width > self.max_texture_size
                || size.height > self.max_texture_size
            {
                rejected.push(lost_record(record));
                continue;
            }
            let backing = if record.is_software {
                let bitmap = self.bitmap_manager.as_ref().and_then(|manager| {
                    manager.shared_bitmap_from_id(record.size, SharedBitmapId(record.mailbox))
                });
                let Some(bitmap) = bitmap else {
                    rejected.push(lost_record(record));
                    continue;
                };
                Backing::Bitmap(BitmapBacking {
                    pixels: bitmap.pixels().clone(),
                    shared: Some(bitmap.id()),
                })
            } else {
                if !self.driver.has_context() || record.mailbox.is_zero() {
                    rejected.push(lost_record(record));
                    continue;
                }
                Backing::Texture(TextureBacking::from_mailbox(
                    MailboxHolder::new(record.mailbox, record.target, record.sync_point),
                    record.filter,
                ))
            };
            let mut resource = Resource::new(
                record.size,
                record.format,
                WrapMode::ClampToEdge,
                TextureUsageHint::Any,
                backing,
                Origin::Imported(child),
            );
            resource.imported_count = 1;
            let local_id = self.insert(resource);
            let info = child_mut(&mut self.children, child);
            info.parent_to_child.insert(local_id, record.id);
            info.child_to_parent.insert(record.id, local_id);
        }

        if !rejected.is_empty() {
            tracing::warn!(%child, count = rejected.len(), "returning unusable resources to child as lost");
            notes.return_to_child(return_callback, rejected);
        }
    }

    fn declare_used_resources_from_child(
        &mut self,
        notes: &mut Notifications,
        child: ChildId,
        in_use: &[ResourceId],
    ) {
        let info = child_mut(&mut self.children, child);
        if info.state != ChildState::Active {
            panic!("declare_used_resources_from_child: {child} is being destroyed");
        }
        for id in in_use {
            if !info.parent_to_child.contains_key(id) {
                panic!("declare_used_resources_from_child: {id} was not received from {child}");
            }
        }
        info.in_use = in_use.iter().copied().collect();
        let unused: Vec<ResourceId> = info
            .child_to_parent
            .values()
            .copied()
            .filter(|local_id| !info.in_use.contains(local_id))
            .collect();
        self.delete_and_return_unused_resources_to_child(notes, child, DeleteStyle::Normal, unused);
    }

    fn receive_returns_from_parent(
        &mut self,
        notes: &mut Notifications,
        returned: &[ReturnedResource],
    ) {
        let mut sorted = returned.to_vec();
        sorted.sort_by_key(|returned| returned.id);
        let mut by_child: BTreeMap<ChildId, Vec<ResourceId>> = BTreeMap::new();

        for returned in sorted {
            let Some(resource) = self.resources.get_mut(&returned.id) else {
                tracing::trace!(id = %returned.id, "return for a resource no longer in the table");
                continue;
            };
            if resource.exported_count < returned.count {
                panic!(
                    "{} returned {} times but exported {} times",
                    returned.id, returned.count, resource.exported_count
                );
            }
            resource.exported_count -= returned.count;
            resource.lost |= returned.lost;
            if resource.exported_count > 0 {
                continue;
            }

            if let Backing::Texture(backing) = &mut resource.backing {
                match backing.texture {
                    Some(_) if !returned.sync_point.is_none() => {
                        if let Some(context) = self.driver.live() {
                            context.wait_sync_point(returned.sync_point);
                        }
                    }
                    Some(_) => {}
                    None => {
                        if let Some(holder) = backing.mailbox.as_mut() {
                            holder.sync_point = returned.sync_point;
                        }
                    }
                }
            }

            if !resource.is_marked_for_deletion() {
                continue;
            }
            match resource.child() {
                None => self.delete_resource_internal(notes, returned.id, DeleteStyle::Normal),
                Some(child) => by_child.entry(child).or_default().push(returned.id),
            }
        }

        for (child, ids) in by_child {
            self.delete_and_return_unused_resources_to_child(notes, child, DeleteStyle::Normal, ids);
        }
    }
}

impl ResourceProvider {
    pub fn create_child(&self, return_callback: ReturnCallback) -> ChildId {
        self.with_state(|state, _| state.create_child(return_callback))
    }

    /// Returns every resource of `child` that nobody holds; the rest follow
    /// as they are released, and the child is erased after the last one.
    pub fn destroy_child(&self, child: ChildId) {
        self.with_state(|state, notes| state.destroy_child(notes, child));
    }

    pub fn num_children(&self) -> usize {
        self.read_state(|state| state.children.len())
    }

    pub fn child_to_parent_map(&self, child: ChildId) -> BTreeMap<ResourceId, ResourceId> {
        self.read_state(|state| {
            let Some(info) = state.children.get(&child) else {
                panic!("{child} is not a child of this provider");
            };
            info.child_to_parent.clone()
        })
    }

    /// Wire records for `ids`, each counted as exported once more. Resources
    /// that lacked a sync point share a single fresh one.
    pub fn prepare_send_to_parent(&self, ids: &[ResourceId]) -> Vec<TransferableResource> {
        self.with_state(|state, _| state.prepare_send_to_parent(ids))
    }

    /// Adds `resources` to the working set of `child` without declaring them
    /// in use; follow with [`ResourceProvider::declare_used_resources_from_child`].
    pub fn receive_from_child(&self, child: ChildId, resources: &[TransferableResource]) {
        self.with_state(|state, notes| state.receive_from_child(notes, child, resources));
    }

    pub fn declare_used_resources_from_child(&self, child: ChildId, in_use: &[ResourceId]) {
        self.with_state(|state, notes| {
            state.declare_used_resources_from_child(notes, child, in_use)
        });
    }

    pub fn receive_returns_from_parent(&self, returned: &[ReturnedResource]) {
        self.with_state(|state, notes| state.receive_returns_from_parent(notes, returned));
    }
}
