use std::collections::VecDeque;

use gpu_context::{BufferId, QueryId};
use resource_protocol::{ResourceFormat, ResourceId, Size};

use crate::ResourceProvider;
use crate::provider::{Driver, Notifications, ProviderState, lookup_mut};
use crate::resource::Backing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReadbackId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadbackResult {
    Pixels {
        size: Size,
        format: ResourceFormat,
        pixels: Vec<u8>,
    },
    /// The readback could not produce pixels: the resource or the context
    /// was lost, or the provider shut down first.
    Empty,
}

pub type ReadbackCallback = Box<dyn FnOnce(ReadbackResult) + Send>;

enum Source {
    Driver { buffer: BufferId, query: QueryId },
    Ready(ReadbackResult),
}

struct PendingReadback {
    id: ReadbackId,
    size: Size,
    format: ResourceFormat,
    source: Source,
    /// `None` once canceled. The entry keeps its place until its query
    /// retires.
    callback: Option<ReadbackCallback>,
}

/// In-flight readbacks in submission order. Completions are delivered from
/// the front only, whatever order the driver finishes them in.
#[derive(Default)]
pub(crate) struct ReadbackQueue {
    pending: VecDeque<PendingReadback>,
    next_id: u32,
}

impl ReadbackQueue {
    fn push(
        &mut self,
        size: Size,
        format: ResourceFormat,
        source: Source,
        callback: ReadbackCallback,
    ) -> ReadbackId {
        self.next_id = self
            .next_id
            .checked_add(1)
            .expect("readback id space exhausted");
        let id = ReadbackId(self.next_id);
        self.pending.push_back(PendingReadback {
            id,
            size,
            format,
            source,
            callback: Some(callback),
        });
        id
    }

    fn cancel(&mut self, id: ReadbackId) -> bool {
        self.pending
            .iter_mut()
            .find(|entry| entry.id == id)
            .and_then(|entry| entry.callback.take())
            .is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Delivers every completed readback at the front of the queue and
    /// returns how many callbacks ran.
    fn poll(&mut self, driver: &mut Driver, notes: &mut Notifications) -> usize {
        if driver.is_lost() {
            return self.abandon(driver, notes);
        }
        let mut delivered = 0;
        loop {
            let Some(front) = self.pending.front() else {
                break;
            };
            if let Source::Driver { query, .. } = front.source {
                let complete = driver
                    .live()
                    .is_some_and(|context| context.is_query_complete(query));
                if !complete {
                    break;
                }
            }
            let Some(entry) = self.pending.pop_front() else {
                break;
            };
            let result = match entry.source {
                Source::Driver { buffer, query } => match driver.live() {
                    Some(context) => {
                        context.delete_query(query);
                        match context.take_readback_buffer(buffer) {
                            Some(pixels) => ReadbackResult::Pixels {
                                size: entry.size,
                                format: entry.format,
                                pixels,
                            },
                            None => ReadbackResult::Empty,
                        }
                    }
                    None => ReadbackResult::Empty,
                },
                Source::Ready(result) => result,
            };
            match entry.callback {
                Some(callback) => {
                    notes.readback(callback, result);
                    delivered += 1;
                }
                None => tracing::trace!(id = ?entry.id, "canceled readback retired"),
            }
        }
        delivered
    }

    /// Answers every outstanding readback with `Empty`, in order.
    pub(crate) fn abandon(&mut self, driver: &mut Driver, notes: &mut Notifications) -> usize {
        let mut delivered = 0;
        for entry in self.pending.drain(..) {
            if let (Source::Driver { buffer, query }, Some(context)) = (&entry.source, driver.live())
            {
                context.delete_query(*query);
                context.delete_buffer(*buffer);
            }
            if let Some(callback) = entry.callback {
                notes.readback(callback, ReadbackResult::Empty);
                delivered += 1;
            }
        }
        if delivered > 0 {
            tracing::debug!(delivered, "abandoned pending readbacks");
        }
        delivered
    }
}

impl ProviderState {
    fn request_async_readback(&mut self, id: ResourceId, callback: ReadbackCallback) -> ReadbackId {
        let resource = lookup_mut(&mut self.resources, id);
        let (size, format) = (resource.size, resource.format);
        if format.is_compressed() {
            panic!("request_async_readback: {id} is {format:?}, which cannot be read back");
        }
        if !resource.admits_readers() {
            panic!("request_async_readback: {id} is locked for write");
        }
        if resource.is_internal() {
            self.driver.lazy_allocate(resource);
        }
        self.driver.consume_mailbox(resource);

        let source = if resource.lost {
            Source::Ready(ReadbackResult::Empty)
        } else {
            match &resource.backing {
                Backing::Bitmap(bitmap) => Source::Ready(ReadbackResult::Pixels {
                    size,
                    format,
                    pixels: bitmap.pixels.to_vec(),
                }),
                Backing::Texture(backing) => match (backing.texture, self.driver.live()) {
                    (Some(texture), Some(context)) => {
                        let (buffer, query) = context.begin_async_readback(texture, size, format);
                        Source::Driver { buffer, query }
                    }
                    _ => Source::Ready(ReadbackResult::Empty),
                },
            }
        };
        let readback = self.readbacks.push(size, format, source, callback);
        tracing::trace!(%id, ?readback, "readback requested");
        readback
    }
}

impl ResourceProvider {
    /// Queues a readback of the full resource. Callbacks run from
    /// [`ResourceProvider::poll_async_readbacks`] in request order.
    pub fn request_async_readback(
        &self,
        id: ResourceId,
        callback: ReadbackCallback,
    ) -> ReadbackId {
        self.with_state(|state, _| state.request_async_readback(id, callback))
    }

    /// Drops the callback of a queued readback. Returns false when it has
    /// already been delivered or canceled.
    pub fn cancel_async_readback(&self, readback: ReadbackId) -> bool {
        self.with_state(|state, _| state.readbacks.cancel(readback))
    }

    pub fn poll_async_readbacks(&self) -> usize {
        self.with_state(|state, notes| state.readbacks.poll(&mut state.driver, notes))
    }

    pub fn pending_readback_count(&self) -> usize {
        self.read_state(|state| state.readbacks.len())
    }
}
