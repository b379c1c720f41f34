// Copyright 2025 John Brosnihan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Geometry references consumed by collision constraints
//!
//! Geometry is owned by the broader solver. The allocator only records
//! which implicit object, shape instance and optional complex mesh each side
//! of a contact refers to, along with the shape's body-local transform.

/// Identifier of an implicit geometry object (sphere, box, convex, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImplicitId(pub u32);

/// Identifier of a shape instance on a particle
///
/// A particle with a single primitive may have no shape instance at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(pub u32);

/// Identifier of complex or deformable mesh data attached to a shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComplexId(pub u32);

/// Rigid body-local transform of a shape
///
/// Translation in meters plus a unit quaternion `[x, y, z, w]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    translation: [f64; 3],
    rotation: [f64; 4],
}

impl RigidTransform {
    /// Create a transform from a translation and a rotation quaternion
    pub fn new(translation: [f64; 3], rotation: [f64; 4]) -> Self {
        RigidTransform { translation, rotation }
    }

    /// The identity transform
    pub fn identity() -> Self {
        RigidTransform::new([0.0; 3], [0.0, 0.0, 0.0, 1.0])
    }

    /// A pure translation
    pub fn from_translation(translation: [f64; 3]) -> Self {
        RigidTransform::new(translation, [0.0, 0.0, 0.0, 1.0])
    }

    /// Get the translation
    pub fn translation(&self) -> [f64; 3] {
        self.translation
    }

    /// Get the rotation quaternion
    pub fn rotation(&self) -> [f64; 4] {
        self.rotation
    }

    /// Check that every component is finite and the rotation is normalized
    pub fn is_valid(&self) -> bool {
        if !self.translation.iter().chain(self.rotation.iter()).all(|v| v.is_finite()) {
            return false;
        }
        let norm_sq: f64 = self.rotation.iter().map(|v| v * v).sum();
        (norm_sq - 1.0).abs() < 1e-6
    }
}

impl Default for RigidTransform {
    fn default() -> Self {
        RigidTransform::identity()
    }
}

/// Classification of the geometry pair a constraint resolves
///
/// The narrow phase picks a specialized contact routine per pair type.
/// The allocator only stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ShapePairType {
    /// Not yet classified
    #[default]
    Unknown,
    /// Sphere against sphere
    SphereSphere,
    /// Sphere against capsule
    SphereCapsule,
    /// Sphere against box
    SphereBox,
    /// Sphere against a convex hull
    SphereConvex,
    /// Sphere against a triangle mesh
    SphereTriMesh,
    /// Sphere against a height field
    SphereHeightField,
    /// Sphere against a plane
    SpherePlane,
    /// Capsule against capsule
    CapsuleCapsule,
    /// Capsule against box
    CapsuleBox,
    /// Capsule against a convex hull
    CapsuleConvex,
    /// Capsule against a triangle mesh
    CapsuleTriMesh,
    /// Capsule against a height field
    CapsuleHeightField,
    /// Box against box
    BoxBox,
    /// Box against a convex hull
    BoxConvex,
    /// Box against a triangle mesh
    BoxTriMesh,
    /// Box against a height field
    BoxHeightField,
    /// Box against a plane
    BoxPlane,
    /// Convex hull against convex hull
    ConvexConvex,
    /// Convex hull against a triangle mesh
    ConvexTriMesh,
    /// Convex hull against a height field
    ConvexHeightField,
    /// Fallback GJK/EPA path for any convex pair
    GenericConvexConvex,
    /// Two level sets
    LevelSetLevelSet,
}

/// One side of a contact: which geometry on the particle is colliding
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollisionShape {
    /// Implicit geometry
    pub implicit: ImplicitId,
    /// Shape instance; `None` for simple primitive-only particles
    pub shape: Option<ShapeId>,
    /// Complex/deformable mesh data; `None` when there is none
    pub complex: Option<ComplexId>,
    /// Shape transform relative to the particle
    pub local_transform: RigidTransform,
}

impl CollisionShape {
    /// A primitive-only shape with no shape instance or complex data
    pub fn primitive(implicit: ImplicitId) -> Self {
        CollisionShape {
            implicit,
            shape: None,
            complex: None,
            local_transform: RigidTransform::identity(),
        }
    }

    /// Attach a shape instance
    pub fn with_shape(mut self, shape: ShapeId) -> Self {
        self.shape = Some(shape);
        self
    }

    /// Attach complex mesh data
    pub fn with_complex(mut self, complex: ComplexId) -> Self {
        self.complex = Some(complex);
        self
    }

    /// Set the body-local transform
    pub fn with_local_transform(mut self, transform: RigidTransform) -> Self {
        self.local_transform = transform;
        self
    }

    /// Stable identity of this side, used to tell constraints within one
    /// midphase apart
    pub fn identity(&self) -> ShapeIdentity {
        ShapeIdentity {
            implicit: self.implicit,
            shape: self.shape,
        }
    }
}

/// Which geometry on a particle a contact side refers to
///
/// Complex data and the local transform do not take part: two sides with
/// the same implicit and shape instance are the same side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeIdentity {
    implicit: ImplicitId,
    shape: Option<ShapeId>,
}
