//! # Component Registry
//!
//! Components are pure data records with no behavior. Each type is described
//! once at startup by a [`ComponentDescriptor`]; the resulting
//! [`ComponentRegistry`] is immutable and shared by the storage and the
//! scheduler.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};

use crate::error::{RuntimeError, RuntimeResult};
use crate::memory::StoreHandle;

/// Identifier of a component type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentTypeId(u32);

impl ComponentTypeId {
    /// The implicit identity component carried by every group.
    pub const IDENTITY: Self = Self(0);

    /// Creates an id. Zero is reserved for the identity component.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Marker trait for typed components.
///
/// Components must be:
/// - `Pod`: Plain old data, safe to view as bytes
/// - `Default`: Used to build the default record of new groups
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Clone, Copy, Default, Pod, Zeroable)]
/// #[repr(C)]
/// struct Position {
///     x: f32,
///     y: f32,
///     z: f32,
/// }
///
/// impl Component for Position {
///     const ID: ComponentTypeId = ComponentTypeId::new(1);
///     const NAME: &'static str = "Position";
/// }
/// ```
pub trait Component: Copy + Pod + Zeroable + Default + Send + Sync + 'static {
    /// Registry id of this component type.
    const ID: ComponentTypeId;
    /// Human-readable name.
    const NAME: &'static str;
}

/// Where a buffered component keeps its store header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferLayout {
    /// Byte offset of the [`StoreHandle`] header inside the record.
    pub header_offset: usize,
    /// Length of the zero-filled store created with the component.
    pub initial_len: usize,
}

/// Layout and initialization data for one component type.
#[derive(Clone, Debug)]
pub struct ComponentDescriptor {
    id: ComponentTypeId,
    name: String,
    size: usize,
    align: usize,
    default_bytes: Box<[u8]>,
    buffer: Option<BufferLayout>,
}

impl ComponentDescriptor {
    /// Describes a typed component.
    #[must_use]
    pub fn of<C: Component>() -> Self {
        Self {
            id: C::ID,
            name: C::NAME.to_string(),
            size: std::mem::size_of::<C>(),
            align: std::mem::align_of::<C>(),
            default_bytes: bytemuck::bytes_of(&C::default()).into(),
            buffer: None,
        }
    }

    /// Describes an untyped component from raw layout data.
    #[must_use]
    pub fn raw(
        id: ComponentTypeId,
        name: impl Into<String>,
        size: usize,
        align: usize,
        default_bytes: impl Into<Box<[u8]>>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            size,
            align,
            default_bytes: default_bytes.into(),
            buffer: None,
        }
    }

    /// Marks the component as buffered.
    #[must_use]
    pub fn with_buffer(mut self, layout: BufferLayout) -> Self {
        self.buffer = Some(layout);
        self
    }

    /// Returns the component id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> ComponentTypeId {
        self.id
    }

    /// Returns the name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of one record in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Alignment of one record.
    #[inline]
    #[must_use]
    pub const fn align(&self) -> usize {
        self.align
    }

    /// Bytes written into freshly allocated records.
    #[inline]
    #[must_use]
    pub fn default_bytes(&self) -> &[u8] {
        &self.default_bytes
    }

    /// Buffer layout, if the component owns an out-of-line store.
    #[inline]
    #[must_use]
    pub const fn buffer(&self) -> Option<BufferLayout> {
        self.buffer
    }

    /// Checks if the component owns an out-of-line store.
    #[inline]
    #[must_use]
    pub const fn is_buffered(&self) -> bool {
        self.buffer.is_some()
    }

    fn validate(&self) -> RuntimeResult<()> {
        let invalid = |reason: String| RuntimeError::InvalidLayout {
            component: self.id,
            reason,
        };
        if !self.align.is_power_of_two() {
            return Err(invalid(format!("alignment {} is not a power of two", self.align)));
        }
        if self.size % self.align != 0 {
            return Err(invalid(format!(
                "size {} is not a multiple of alignment {}",
                self.size, self.align
            )));
        }
        if self.default_bytes.len() != self.size {
            return Err(invalid(format!(
                "default record has {} bytes, expected {}",
                self.default_bytes.len(),
                self.size
            )));
        }
        if let Some(buffer) = self.buffer {
            let end = buffer.header_offset.checked_add(StoreHandle::SIZE);
            if !matches!(end, Some(end) if end <= self.size) {
                return Err(invalid(format!(
                    "buffer header at offset {} does not fit in {} bytes",
                    buffer.header_offset, self.size
                )));
            }
        }
        Ok(())
    }
}

/// Immutable table of component descriptors and named group templates.
#[derive(Debug)]
pub struct ComponentRegistry {
    descriptors: HashMap<ComponentTypeId, ComponentDescriptor>,
    templates: HashMap<String, Vec<ComponentTypeId>>,
}

impl ComponentRegistry {
    /// Starts a registry. The identity component is pre-registered.
    #[must_use]
    pub fn builder() -> ComponentRegistryBuilder {
        let identity = ComponentDescriptor::of::<super::entity::GroupId>();
        let mut descriptors = HashMap::new();
        descriptors.insert(identity.id, identity);
        ComponentRegistryBuilder {
            descriptors,
            templates: HashMap::new(),
        }
    }

    /// Looks up a descriptor.
    ///
    /// # Errors
    ///
    /// `UnknownComponent` if the type was never registered.
    pub fn get(&self, id: ComponentTypeId) -> RuntimeResult<&ComponentDescriptor> {
        self.descriptors
            .get(&id)
            .ok_or(RuntimeError::UnknownComponent(id))
    }

    /// Checks whether a type is registered.
    #[must_use]
    pub fn contains(&self, id: ComponentTypeId) -> bool {
        self.descriptors.contains_key(&id)
    }

    /// Looks up a named group template.
    ///
    /// # Errors
    ///
    /// `UnknownTemplate` if no template has this name.
    pub fn template(&self, name: &str) -> RuntimeResult<&[ComponentTypeId]> {
        self.templates
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| RuntimeError::UnknownTemplate(name.to_string()))
    }

    /// Number of registered component types, identity included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Always false: the identity component is always registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Collects descriptors before freezing them into a [`ComponentRegistry`].
#[derive(Debug)]
pub struct ComponentRegistryBuilder {
    descriptors: HashMap<ComponentTypeId, ComponentDescriptor>,
    templates: HashMap<String, Vec<ComponentTypeId>>,
}

impl ComponentRegistryBuilder {
    /// Registers a typed component.
    ///
    /// # Errors
    ///
    /// `DuplicateComponent` if the id is taken.
    pub fn register<C: Component>(self) -> RuntimeResult<Self> {
        self.register_descriptor(ComponentDescriptor::of::<C>())
    }

    /// Registers a typed component that owns an out-of-line store.
    ///
    /// # Errors
    ///
    /// `DuplicateComponent` if the id is taken, `InvalidLayout` if the
    /// header does not fit in the record.
    pub fn register_buffered<C: Component>(self, layout: BufferLayout) -> RuntimeResult<Self> {
        self.register_descriptor(ComponentDescriptor::of::<C>().with_buffer(layout))
    }

    /// Registers any descriptor.
    ///
    /// # Errors
    ///
    /// `DuplicateComponent` if the id is taken, `InvalidLayout` if the
    /// descriptor is inconsistent.
    pub fn register_descriptor(mut self, descriptor: ComponentDescriptor) -> RuntimeResult<Self> {
        descriptor.validate()?;
        if self.descriptors.contains_key(&descriptor.id) {
            return Err(RuntimeError::DuplicateComponent(descriptor.id));
        }
        self.descriptors.insert(descriptor.id, descriptor);
        Ok(self)
    }

    /// Registers a named component list for `create_group_from_template`.
    ///
    /// # Errors
    ///
    /// `UnknownComponent` for unregistered members, `InvalidConfig` if the
    /// name is taken.
    pub fn template(mut self, name: &str, components: &[ComponentTypeId]) -> RuntimeResult<Self> {
        if let Some(&missing) = components.iter().find(|c| !self.descriptors.contains_key(c)) {
            return Err(RuntimeError::UnknownComponent(missing));
        }
        if self.templates.contains_key(name) {
            return Err(RuntimeError::InvalidConfig(format!(
                "group template {name:?} registered twice"
            )));
        }
        self.templates.insert(name.to_string(), components.to_vec());
        Ok(self)
    }

    /// Freezes the registry.
    #[must_use]
    pub fn build(self) -> ComponentRegistry {
        ComponentRegistry {
            descriptors: self.descriptors,
            templates: self.templates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::GroupId;

    #[allow(dead_code)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
        z: f32,
        _padding: f32,
    }

    impl Component for Position {
        const ID: ComponentTypeId = ComponentTypeId::new(1);
        const NAME: &'static str = "Position";
    }

    #[allow(dead_code)]
    #[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
    #[repr(C)]
    struct Mesh {
        store: [u32; 2],
        lod: u32,
        _padding: u32,
    }

    impl Component for Mesh {
        const ID: ComponentTypeId = ComponentTypeId::new(2);
        const NAME: &'static str = "Mesh";
    }

    #[test]
    fn test_identity_is_preregistered() {
        let registry = ComponentRegistry::builder().build();
        let identity = registry.get(ComponentTypeId::IDENTITY).unwrap();
        assert_eq!(identity.size(), std::mem::size_of::<GroupId>());
        assert_eq!(identity.default_bytes(), &u64::MAX.to_ne_bytes());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ComponentRegistry::builder()
            .register::<Position>()
            .unwrap()
            .register_buffered::<Mesh>(BufferLayout {
                header_offset: 0,
                initial_len: 32,
            })
            .unwrap()
            .template("prop", &[Position::ID, Mesh::ID])
            .unwrap()
            .build();

        let pos = registry.get(Position::ID).unwrap();
        assert_eq!(pos.size(), 16);
        assert!(!pos.is_buffered());
        assert!(registry.get(Mesh::ID).unwrap().is_buffered());
        assert_eq!(registry.template("prop").unwrap(), &[Position::ID, Mesh::ID]);
        assert!(registry.template("ship").is_err());
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = ComponentRegistry::builder()
            .register::<Position>()
            .unwrap()
            .register::<Position>()
            .unwrap_err();
        assert_eq!(err, RuntimeError::DuplicateComponent(Position::ID));
    }

    #[test]
    fn test_identity_id_is_reserved() {
        let err = ComponentRegistry::builder()
            .register_descriptor(ComponentDescriptor::raw(
                ComponentTypeId::IDENTITY,
                "Fake",
                8,
                8,
                vec![0u8; 8],
            ))
            .unwrap_err();
        assert_eq!(err, RuntimeError::DuplicateComponent(ComponentTypeId::IDENTITY));
    }

    #[test]
    fn test_buffer_header_must_fit() {
        let err = ComponentRegistry::builder()
            .register_buffered::<Mesh>(BufferLayout {
                header_offset: 12,
                initial_len: 0,
            })
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidLayout { .. }));

        let err = ComponentRegistry::builder()
            .register_buffered::<Mesh>(BufferLayout {
                header_offset: usize::MAX - 2,
                initial_len: 0,
            })
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidLayout { .. }));
    }

    #[test]
    fn test_raw_descriptor_validation() {
        let bad = ComponentDescriptor::raw(ComponentTypeId::new(9), "Bad", 6, 4, vec![0u8; 6]);
        assert!(ComponentRegistry::builder().register_descriptor(bad).is_err());

        let short = ComponentDescriptor::raw(ComponentTypeId::new(9), "Short", 4, 4, vec![0u8; 2]);
        assert!(ComponentRegistry::builder().register_descriptor(short).is_err());
    }

    #[test]
    fn test_template_requires_registered_members() {
        let err = ComponentRegistry::builder()
            .template("ghost", &[ComponentTypeId::new(42)])
            .unwrap_err();
        assert_eq!(err, RuntimeError::UnknownComponent(ComponentTypeId::new(42)));
    }
}
