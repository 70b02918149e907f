//! Client-side object representation and the object table.

use std::borrow::Borrow;
use std::cmp;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::num::NonZeroU32;
use std::sync::Weak;

use crate::connection::{DetachReason, RawHandler};
use crate::event_fut::Cancellable;
use crate::protocol::WlDisplay;

pub use wlkit_core::ObjectId;
use wlkit_core::{Interface, Message, MessageBuffersPool};

/// A Wayland protocol object: id, interface and bound version.
///
/// The [`Debug`] representation is `<interface>@<id>v<version>`.
///
/// [`Eq`], [`Ord`] and [`Hash`] are delegated to the id; two live objects
/// never share one.
#[derive(Clone, Copy)]
pub struct Object {
    pub id: ObjectId,
    pub interface: &'static Interface,
    pub version: u32,
}

impl PartialEq for Object {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Object {}

impl PartialOrd for Object {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Object {
    #[inline]
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Object {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Borrow<ObjectId> for Object {
    #[inline]
    fn borrow(&self) -> &ObjectId {
        &self.id
    }
}

impl Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}v{}",
            self.interface.name.to_string_lossy(),
            self.id,
            self.version
        )
    }
}

/// The event payload could not be decoded against the interface signature.
#[doc(hidden)]
#[derive(Debug)]
pub struct BadMessage;

/// Error of the `Proxy: TryFrom<Object>` conversion.
#[derive(Debug)]
pub struct WrongObject;

/// A typed Wayland proxy.
///
/// Implemented by generated code; do not implement manually.
pub trait Proxy: TryFrom<Object, Error = WrongObject> + Copy {
    type Event;

    const INTERFACE: &'static Interface;

    #[doc(hidden)]
    fn new(id: ObjectId, version: u32) -> Self;

    #[doc(hidden)]
    fn parse_event(
        event: Message,
        version: u32,
        pool: &mut MessageBuffersPool,
    ) -> Result<Self::Event, BadMessage>;

    fn id(&self) -> ObjectId;

    fn version(&self) -> u32;
}

impl<P: Proxy> From<P> for Object {
    fn from(value: P) -> Self {
        Self {
            id: value.id(),
            interface: P::INTERFACE,
            version: value.version(),
        }
    }
}

/// Per-object state tracked by the connection.
pub(crate) struct ObjectState<D> {
    pub object: Object,
    /// Set once the id has been announced to the peer (encoded into a
    /// `new_id` argument, or created by the server).
    pub is_attached: bool,
    /// The destructor request was sent; the id is recycled only once the
    /// peer acknowledges with `delete_id`.
    pub is_destroyed: bool,
    pub is_detached: bool,
    /// One handler slot per event opcode.
    pub handlers: Box<[Option<RawHandler<D>>]>,
    /// Pending event futures, cancelled on detach.
    pub futures: Vec<Weak<dyn Cancellable + Send + Sync>>,
}

impl<D> ObjectState<D> {
    fn new(object: Object, is_attached: bool) -> Self {
        Self {
            object,
            is_attached,
            is_destroyed: false,
            is_detached: false,
            handlers: std::iter::repeat_with(|| None)
                .take(object.interface.events.len())
                .collect(),
            futures: Vec::new(),
        }
    }

    /// Idempotent: cancel pending futures with `reason`, drop all handlers
    /// and refuse further use.
    pub fn detach(&mut self, reason: &DetachReason) {
        if self.is_detached {
            return;
        }
        self.is_detached = true;

        for fut in self.futures.drain(..) {
            if let Some(fut) = fut.upgrade() {
                fut.cancel_with(reason);
            }
        }
        for slot in self.handlers.iter_mut() {
            *slot = None;
        }
    }
}

pub(crate) struct IdCollision;

/// The object table: id allocation and the id→object mapping.
///
/// Client ids index one slab (slot 0 is the null id, slot 1 the display),
/// server-created ids (0xFF000000 and up) a second one. Freed client ids
/// go onto a stack and are handed out again before the slab grows.
pub(crate) struct ObjectManager<D> {
    vacant_ids: Vec<ObjectId>,
    client_objects: Vec<Option<ObjectState<D>>>,
    server_objects: Vec<Option<ObjectState<D>>>,
}

impl<D> ObjectManager<D> {
    pub fn new() -> Self {
        let mut this = Self {
            vacant_ids: Vec::new(),
            client_objects: Vec::with_capacity(16),
            server_objects: Vec::new(),
        };

        // Null id.
        this.client_objects.push(None);
        // The display exists from the start and is always attached.
        this.client_objects
            .push(Some(ObjectState::new(WlDisplay::INSTANCE.into(), true)));

        this
    }

    /// Allocate a fresh client object: the most recently freed id, or the
    /// next unused one.
    pub fn alloc_client_object(
        &mut self,
        interface: &'static Interface,
        version: u32,
    ) -> &mut ObjectState<D> {
        let id = self.vacant_ids.pop().unwrap_or_else(|| {
            let id = self.client_objects.len() as u32;
            self.client_objects.push(None);
            ObjectId(NonZeroU32::new(id).unwrap())
        });

        assert!(id.created_by_client(), "client id space exhausted");
        let slot = self.client_objects.get_mut(id.as_u32() as usize).unwrap();
        assert!(slot.is_none());

        slot.insert(ObjectState::new(
            Object {
                id,
                interface,
                version,
            },
            false,
        ))
    }

    /// Insert an object announced by the server. Fails if the id is taken.
    pub fn register_server_object(
        &mut self,
        object: Object,
    ) -> Result<&mut ObjectState<D>, IdCollision> {
        if !object.id.created_by_server() {
            return Err(IdCollision);
        }

        let index = (object.id.as_u32() - ObjectId::MIN_SERVER.as_u32()) as usize;
        while index >= self.server_objects.len() {
            self.server_objects.push(None);
        }

        let slot = &mut self.server_objects[index];
        if slot.is_some() {
            return Err(IdCollision);
        }
        Ok(slot.insert(ObjectState::new(object, true)))
    }

    pub fn get_object(&self, id: ObjectId) -> Option<&ObjectState<D>> {
        if id.created_by_client() {
            self.client_objects.get(id.as_u32() as usize)?.as_ref()
        } else {
            self.server_objects
                .get((id.as_u32() - ObjectId::MIN_SERVER.as_u32()) as usize)?
                .as_ref()
        }
    }

    pub fn get_object_mut(&mut self, id: ObjectId) -> Option<&mut ObjectState<D>> {
        if id.created_by_client() {
            self.client_objects.get_mut(id.as_u32() as usize)?.as_mut()
        } else {
            self.server_objects
                .get_mut((id.as_u32() - ObjectId::MIN_SERVER.as_u32()) as usize)?
                .as_mut()
        }
    }

    /// Finalize an object in response to `wl_display.delete_id`: detach it
    /// and recycle the id. Only now may the id be allocated again.
    pub fn delete_object(&mut self, id: ObjectId, reason: &DetachReason) {
        if id.created_by_client() {
            let Some(slot) = self.client_objects.get_mut(id.as_u32() as usize) else {
                return;
            };
            if let Some(state) = slot {
                state.detach(reason);
                *slot = None;
                self.vacant_ids.push(id);
            }
        } else {
            let index = (id.as_u32() - ObjectId::MIN_SERVER.as_u32()) as usize;
            if let Some(slot) = self.server_objects.get_mut(index) {
                if let Some(state) = slot {
                    state.detach(reason);
                }
                *slot = None;
            }
        }
    }

    /// Detach without recycling: the peer never acknowledges these (e.g. a
    /// proxy bound to a removed global), so the id stays burned.
    pub fn detach_object(&mut self, id: ObjectId, reason: &DetachReason) {
        if let Some(state) = self.get_object_mut(id) {
            state.detach(reason);
        }
    }

    /// Drop an allocated-but-never-sent object; the peer has not seen the
    /// id, so it is immediately reusable.
    pub fn discard_unsent(&mut self, id: ObjectId) {
        let Some(slot) = self.client_objects.get_mut(id.as_u32() as usize) else {
            return;
        };
        if let Some(state) = slot {
            assert!(!state.is_attached, "cannot discard an attached object");
            *slot = None;
            self.vacant_ids.push(id);
        }
    }

    pub fn detach_all(&mut self, reason: &DetachReason) {
        for state in self
            .client_objects
            .iter_mut()
            .chain(&mut self.server_objects)
            .flatten()
        {
            state.detach(reason);
        }
    }
}
