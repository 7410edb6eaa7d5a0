//! Bounding volume hierarchies over triangle meshes.
//!
//! The input is a flat slice of `Vec4` vertices, three consecutive entries
//! per triangle (the `w` lane is padding). [`Bvh::build`] runs a binned-SAH
//! builder, [`Bvh::build_hq`] a spatial-split builder that may duplicate
//! primitives for tighter trees. The resulting 32-byte-node tree can be
//! converted to alternative layouts ([`Layout`]) for different traversal
//! strategies, refitted after vertex animation, or reorganized with the
//! insertion-based optimizer.
//!
//! ```
//! use glam::{Vec3, Vec4};
//! use raybvh::{Bvh, Layout, Ray};
//!
//! let tri = [
//!     Vec4::new(0.0, 0.0, 0.0, 0.0),
//!     Vec4::new(1.0, 0.0, 0.0, 0.0),
//!     Vec4::new(0.0, 1.0, 0.0, 0.0),
//! ];
//! let mut bvh = Bvh::new();
//! bvh.build(&tri, 1);
//!
//! let mut ray = Ray::new(Vec3::new(0.25, 0.25, -1.0), Vec3::Z);
//! bvh.intersect(&mut ray, Layout::Wald32);
//! assert_eq!(ray.hit.prim, 0);
//! ```

mod bvh;
mod math;
mod ray;

pub use bvh::layout::{AltNode, SoaNode, VerboseNode, WideNode, NO_PARENT};
pub use bvh::{Aabb, Bvh, BvhNode, Fragment, Layout, SAH_BINS};
pub use ray::{Intersection, Ray, MISS};
