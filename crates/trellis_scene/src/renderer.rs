//! Renderer boundary
//!
//! The scene never draws anything itself. It drives an external scene-graph
//! renderer through [`Renderer`]: every entity owns one root object that is
//! parented under its parent entity's object, components may hang further
//! objects off it, and once per frame the scene asks for
//! `render(root, camera)`.
//!
//! [`HeadlessRenderer`] records the object graph and every call made on it,
//! for tests and for hosts that run scenes without a GPU.

use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use std::any::Any;
use trellis_core::Vec3;

new_key_type! {
    /// Handle to a renderer-side object
    pub struct ObjectHandle;
}

/// Transform and visibility of an entity's root object
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Object3D {
    pub position: Vec3,
    /// Euler angles in radians
    pub rotation: Vec3,
    pub scale: Vec3,
    pub visible: bool,
}

impl Default for Object3D {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 0.0),
            rotation: Vec3::new(0.0, 0.0, 0.0),
            scale: Vec3::new(1.0, 1.0, 1.0),
            visible: true,
        }
    }
}

/// Downcasting support for trait objects
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// An opaque retained-mode scene-graph renderer
pub trait Renderer: AsAny {
    /// Create a detached object; `kind` is a hint such as `"group"` or `"mesh"`
    fn create_object(&mut self, kind: &str) -> ObjectHandle;

    /// Parent `child` under `parent`
    fn add(&mut self, parent: ObjectHandle, child: ObjectHandle);

    /// Detach `child` from `parent`
    fn remove(&mut self, parent: ObjectHandle, child: ObjectHandle);

    /// Push transform and visibility changes to an object
    fn sync_transform(&mut self, object: ObjectHandle, transform: &Object3D);

    /// Release an object; the handle must not be used afterwards
    fn dispose(&mut self, object: ObjectHandle);

    /// Draw the graph below `root` from `camera`
    fn render(&mut self, root: ObjectHandle, camera: Option<ObjectHandle>);
}

// ─────────────────────────────────────────────────────────────────────────────
// Headless renderer
// ─────────────────────────────────────────────────────────────────────────────

/// A call recorded by [`HeadlessRenderer`]
#[derive(Clone, Debug, PartialEq)]
pub enum RenderCommand {
    Create(ObjectHandle),
    Add {
        parent: ObjectHandle,
        child: ObjectHandle,
    },
    Remove {
        parent: ObjectHandle,
        child: ObjectHandle,
    },
    Sync(ObjectHandle),
    Dispose(ObjectHandle),
    Render {
        root: ObjectHandle,
        camera: Option<ObjectHandle>,
    },
}

/// A recorded renderer object
#[derive(Clone, Debug)]
pub struct RecordedObject {
    pub kind: String,
    pub parent: Option<ObjectHandle>,
    pub children: SmallVec<[ObjectHandle; 4]>,
    pub transform: Object3D,
}

/// Renderer that records the object graph instead of drawing
#[derive(Debug, Default)]
pub struct HeadlessRenderer {
    objects: SlotMap<ObjectHandle, RecordedObject>,
    commands: Vec<RenderCommand>,
    frames: u64,
}

impl HeadlessRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A live object
    pub fn object(&self, handle: ObjectHandle) -> Option<&RecordedObject> {
        self.objects.get(handle)
    }

    /// Number of live (not disposed) objects
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn parent(&self, handle: ObjectHandle) -> Option<ObjectHandle> {
        self.objects.get(handle).and_then(|o| o.parent)
    }

    pub fn children(&self, handle: ObjectHandle) -> &[ObjectHandle] {
        self.objects
            .get(handle)
            .map(|o| o.children.as_slice())
            .unwrap_or(&[])
    }

    /// Number of `render` calls so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Get the recorded commands
    pub fn commands(&self) -> &[RenderCommand] {
        &self.commands
    }

    /// Take the recorded commands
    pub fn take_commands(&mut self) -> Vec<RenderCommand> {
        std::mem::take(&mut self.commands)
    }

    fn detach(&mut self, child: ObjectHandle) {
        let Some(parent) = self.objects.get_mut(child).and_then(|o| o.parent.take()) else {
            return;
        };
        if let Some(p) = self.objects.get_mut(parent) {
            p.children.retain(|c| *c != child);
        }
    }
}

impl Renderer for HeadlessRenderer {
    fn create_object(&mut self, kind: &str) -> ObjectHandle {
        let handle = self.objects.insert(RecordedObject {
            kind: kind.to_string(),
            parent: None,
            children: SmallVec::new(),
            transform: Object3D::default(),
        });
        self.commands.push(RenderCommand::Create(handle));
        handle
    }

    fn add(&mut self, parent: ObjectHandle, child: ObjectHandle) {
        if !self.objects.contains_key(parent) || !self.objects.contains_key(child) {
            tracing::warn!("add() on a disposed object");
            return;
        }
        self.detach(child);
        if let Some(c) = self.objects.get_mut(child) {
            c.parent = Some(parent);
        }
        if let Some(p) = self.objects.get_mut(parent) {
            p.children.push(child);
        }
        self.commands.push(RenderCommand::Add { parent, child });
    }

    fn remove(&mut self, parent: ObjectHandle, child: ObjectHandle) {
        if self.parent(child) == Some(parent) {
            self.detach(child);
        }
        self.commands.push(RenderCommand::Remove { parent, child });
    }

    fn sync_transform(&mut self, object: ObjectHandle, transform: &Object3D) {
        if let Some(o) = self.objects.get_mut(object) {
            o.transform = *transform;
        }
        self.commands.push(RenderCommand::Sync(object));
    }

    fn dispose(&mut self, object: ObjectHandle) {
        self.detach(object);
        if let Some(removed) = self.objects.remove(object) {
            for child in removed.children {
                if let Some(c) = self.objects.get_mut(child) {
                    c.parent = None;
                }
            }
        }
        self.commands.push(RenderCommand::Dispose(object));
    }

    fn render(&mut self, root: ObjectHandle, camera: Option<ObjectHandle>) {
        self.frames += 1;
        self.commands.push(RenderCommand::Render { root, camera });
    }
}
