mod builder;
mod convert;
pub(crate) mod layout;
mod optimize;
mod packet;
mod sbvh;
mod traverse;

use glam::{Vec3, Vec4};

use crate::math::half_area;
use crate::ray::MISS;
use self::layout::{AltNode, SoaNode, VerboseNode, WideNode};

/// Bin count of the SAH split evaluator. Also baked into the quantized GPU
/// node format, so changing it is a format change.
pub const SAH_BINS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Aabb {
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(MISS),
        max: Vec3::splat(-MISS),
    };

    #[inline]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn grow(&mut self, other: &Aabb) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    #[inline]
    pub fn grow_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    #[inline]
    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    #[inline]
    pub fn half_area(&self) -> f32 {
        half_area(self.extent())
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn contains(&self, other: &Aabb) -> bool {
        self.min.cmple(other.min).all() && self.max.cmpge(other.max).all()
    }
}

/// The bounds of one input primitive, or of a piece of one after spatial
/// clipping. Builders bin and partition fragments, never triangles.
#[derive(Clone, Copy, Debug)]
pub struct Fragment {
    pub bmin: Vec3,
    /// Index of the original primitive.
    pub prim: u32,
    pub bmax: Vec3,
    /// Non-zero when this fragment is the result of clipping.
    pub clipped: u32,
}

impl Fragment {
    #[inline]
    pub fn bounds(&self) -> Aabb {
        Aabb::new(self.bmin, self.bmax)
    }

    #[inline]
    pub fn valid_box(&self) -> bool {
        self.bmin.x < MISS
    }
}

/// 32-byte node. Two fit in a cache line; the root lives at index 0 and
/// index 1 stays unused so each child pair shares a line.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct BvhNode {
    pub aabb_min: Vec3,
    /// Leaf: first entry in the primitive index array. Interior: left child
    /// node index; the right child is always `left_first + 1`.
    pub left_first: u32,
    pub aabb_max: Vec3,
    pub tri_count: u32,
}

impl BvhNode {
    /// Empty leaves do not exist, so a zero count means interior.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.tri_count > 0
    }

    #[inline]
    pub fn aabb(&self) -> Aabb {
        Aabb::new(self.aabb_min, self.aabb_max)
    }

    #[inline]
    pub fn half_area(&self) -> f32 {
        half_area(self.aabb_max - self.aabb_min)
    }

    /// Cost of keeping this node a leaf, in the same unweighted half-area
    /// metric the split sweep uses.
    #[inline]
    pub fn leaf_cost(&self) -> f32 {
        self.half_area() * self.tri_count as f32
    }
}

/// The node layouts a tree can be stored in. `Wald32` is what the builders
/// produce; everything else is reached through [`Bvh::convert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    /// Canonical 32-byte nodes.
    Wald32,
    /// 64-byte nodes storing both children's bounds, saving one indirection.
    Alt,
    /// Like `Alt` but with child bounds in SIMD-friendly SoA lanes.
    AltSoa,
    /// 48-byte nodes with parent and sibling links, for the optimizer.
    Verbose,
    /// Collapsed 4-wide nodes.
    Wide4,
    /// Collapsed 8-wide nodes.
    Wide8,
    /// Quantized 4-wide blob with inlined triangles, for GPU upload.
    Gpu4,
}

/// A bounding volume hierarchy over a borrowed triangle vertex array.
///
/// The vertex slice holds three consecutive `Vec4`s per triangle and stays
/// borrowed for the whole build + traverse lifetime. Node pools, fragment
/// and index arrays are owned; their buffers are reused across rebuilds.
pub struct Bvh<'a> {
    pub(crate) verts: &'a [Vec4],
    pub(crate) tri_count: usize,
    pub(crate) nodes: Vec<BvhNode>,
    pub(crate) tri_idx: Vec<u32>,
    pub(crate) fragments: Vec<Fragment>,
    pub(crate) alt_nodes: Vec<AltNode>,
    pub(crate) soa_nodes: Vec<SoaNode>,
    pub(crate) verbose: Vec<VerboseNode>,
    pub(crate) wide4: Vec<WideNode<4>>,
    pub(crate) wide8: Vec<WideNode<8>>,
    pub(crate) gpu4: Vec<Vec4>,
    /// Cleared by layout conversions: rebuilding over converted pools is a
    /// programmer error.
    pub(crate) rebuildable: bool,
    /// Cleared by `build_hq`: clipped fragments no longer map 1:1 to
    /// triangles, so refit cannot recover leaf bounds.
    pub(crate) refittable: bool,
    pub(crate) opt_seed: u32,
}

impl Default for Bvh<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Bvh<'a> {
    pub fn new() -> Self {
        Bvh {
            verts: &[],
            tri_count: 0,
            nodes: Vec::new(),
            tri_idx: Vec::new(),
            fragments: Vec::new(),
            alt_nodes: Vec::new(),
            soa_nodes: Vec::new(),
            verbose: Vec::new(),
            wide4: Vec::new(),
            wide8: Vec::new(),
            gpu4: Vec::new(),
            rebuildable: true,
            refittable: true,
            opt_seed: 0x12345678,
        }
    }

    #[inline]
    pub fn prim_count(&self) -> usize {
        self.tri_count
    }

    #[inline]
    pub fn nodes(&self) -> &[BvhNode] {
        &self.nodes
    }

    #[inline]
    pub fn tri_indices(&self) -> &[u32] {
        &self.tri_idx
    }

    #[inline]
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    #[inline]
    pub fn alt_nodes(&self) -> &[AltNode] {
        &self.alt_nodes
    }

    #[inline]
    pub fn soa_nodes(&self) -> &[SoaNode] {
        &self.soa_nodes
    }

    #[inline]
    pub fn verbose_nodes(&self) -> &[VerboseNode] {
        &self.verbose
    }

    #[inline]
    pub fn wide4_nodes(&self) -> &[WideNode<4>] {
        &self.wide4
    }

    #[inline]
    pub fn wide8_nodes(&self) -> &[WideNode<8>] {
        &self.wide8
    }

    /// The quantized 4-wide blob, 16-byte blocks ready for GPU upload.
    #[inline]
    pub fn gpu4_data(&self) -> &[Vec4] {
        &self.gpu4
    }

    #[inline]
    pub fn is_refittable(&self) -> bool {
        self.refittable
    }

    #[inline]
    pub fn is_rebuildable(&self) -> bool {
        self.rebuildable
    }

    /// SAH cost of the subtree under `node_idx`; the tree total (index 0)
    /// is normalized by the root area. Lower is better.
    pub fn sah_cost(&self, node_idx: u32) -> f32 {
        let node = &self.nodes[node_idx as usize];
        if node.is_leaf() {
            return node.half_area() * node.tri_count as f32;
        }
        let cost = 3.0 * node.half_area()
            + self.sah_cost(node.left_first)
            + self.sah_cost(node.left_first + 1);
        if node_idx == 0 {
            cost / node.half_area()
        } else {
            cost
        }
    }

    /// Number of nodes in the subtree under `node_idx`.
    pub fn node_count(&self, node_idx: u32) -> u32 {
        let node = &self.nodes[node_idx as usize];
        let mut total = 1;
        if !node.is_leaf() {
            total += self.node_count(node.left_first) + self.node_count(node.left_first + 1);
        }
        total
    }

    /// Recompute all AABBs bottom-up after the vertices moved, keeping the
    /// tree topology. Only valid while the leaf/triangle mapping is intact,
    /// i.e. not after a spatial-split build.
    pub fn refit(&mut self) {
        assert!(
            self.refittable,
            "refit is not valid after a spatial-split build"
        );
        for i in (0..self.nodes.len()).rev() {
            if i == 1 {
                continue; // reserved slot
            }
            let node = self.nodes[i];
            if node.is_leaf() {
                let mut bounds = Aabb::EMPTY;
                for j in 0..node.tri_count {
                    let (bmin, bmax) =
                        tri_bounds(self.verts, self.tri_idx[(node.left_first + j) as usize] as usize);
                    bounds.grow_point(bmin);
                    bounds.grow_point(bmax);
                }
                self.nodes[i].aabb_min = bounds.min;
                self.nodes[i].aabb_max = bounds.max;
            } else {
                let left = self.nodes[node.left_first as usize];
                let right = self.nodes[node.left_first as usize + 1];
                self.nodes[i].aabb_min = left.aabb_min.min(right.aabb_min);
                self.nodes[i].aabb_max = left.aabb_max.max(right.aabb_max);
            }
        }
    }
}

/// Bounds of the three vertices of primitive `prim`.
#[inline]
pub(crate) fn tri_bounds(verts: &[Vec4], prim: usize) -> (Vec3, Vec3) {
    let v0 = verts[prim * 3].truncate();
    let v1 = verts[prim * 3 + 1].truncate();
    let v2 = verts[prim * 3 + 2].truncate();
    (v0.min(v1).min(v2), v0.max(v1).max(v2))
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Small xorshift generator so test scenes are reproducible.
    pub struct Rng {
        state: u64,
    }

    impl Rng {
        pub fn new(seed: u64) -> Self {
            Rng {
                state: seed.wrapping_add(0x9E3779B97F4A7C15),
            }
        }

        pub fn next(&mut self) -> f32 {
            self.state ^= self.state >> 12;
            self.state ^= self.state << 25;
            self.state ^= self.state >> 27;
            let bits = self.state.wrapping_mul(0x2545F4914F6CDD1D);
            (bits >> 40) as f32 / (1u64 << 24) as f32
        }

        pub fn next_range(&mut self, lo: f32, hi: f32) -> f32 {
            lo + (hi - lo) * self.next()
        }
    }

    /// Random triangle soup: `count` triangles with centers in
    /// `[-extent, extent]^3` and edges up to `size` long.
    pub fn triangle_soup(count: usize, extent: f32, size: f32, seed: u64) -> Vec<Vec4> {
        let mut rng = Rng::new(seed);
        let mut verts = Vec::with_capacity(count * 3);
        for _ in 0..count {
            let c = Vec3::new(
                rng.next_range(-extent, extent),
                rng.next_range(-extent, extent),
                rng.next_range(-extent, extent),
            );
            for _ in 0..3 {
                let p = c + Vec3::new(
                    rng.next_range(-size, size),
                    rng.next_range(-size, size),
                    rng.next_range(-size, size),
                );
                verts.push(p.extend(0.0));
            }
        }
        verts
    }

    /// Axis-aligned unit cube as 12 triangles.
    pub fn cube() -> Vec<Vec4> {
        let p = |x: f32, y: f32, z: f32| Vec3::new(x, y, z);
        let corners = [
            p(0., 0., 0.),
            p(1., 0., 0.),
            p(1., 1., 0.),
            p(0., 1., 0.),
            p(0., 0., 1.),
            p(1., 0., 1.),
            p(1., 1., 1.),
            p(0., 1., 1.),
        ];
        let faces: [[usize; 4]; 6] = [
            [0, 1, 2, 3], // z = 0
            [5, 4, 7, 6], // z = 1
            [4, 0, 3, 7], // x = 0
            [1, 5, 6, 2], // x = 1
            [4, 5, 1, 0], // y = 0
            [3, 2, 6, 7], // y = 1
        ];
        let mut verts = Vec::with_capacity(36);
        for f in faces {
            for tri in [[f[0], f[1], f[2]], [f[0], f[2], f[3]]] {
                for idx in tri {
                    verts.push(corners[idx].extend(0.0));
                }
            }
        }
        verts
    }

    /// Checks the structural invariants of the canonical tree: ordered
    /// bounds, child containment, non-empty leaves, and full coverage of
    /// the input primitives by the leaf index ranges.
    pub fn check_tree(bvh: &Bvh) {
        let mut seen = vec![0u32; bvh.prim_count()];
        let mut stack = vec![0u32];
        while let Some(idx) = stack.pop() {
            let node = &bvh.nodes()[idx as usize];
            assert!(
                node.aabb_min.cmple(node.aabb_max).all(),
                "node {idx} has unordered bounds"
            );
            if node.is_leaf() {
                for i in 0..node.tri_count {
                    let entry = bvh.tri_indices()[(node.left_first + i) as usize] as usize;
                    let prim = if bvh.is_refittable() {
                        bvh.fragments()[entry].prim as usize
                    } else {
                        entry // spatial-split builds remap to primitive ids
                    };
                    assert!(prim < bvh.prim_count(), "leaf references primitive {prim}");
                    seen[prim] += 1;
                }
            } else {
                let eps = Vec3::splat(1e-4);
                for child_idx in [node.left_first, node.left_first + 1] {
                    let child = &bvh.nodes()[child_idx as usize];
                    assert!(
                        (node.aabb_min - eps).cmple(child.aabb_min).all()
                            && (node.aabb_max + eps).cmpge(child.aabb_max).all(),
                        "node {idx} does not contain child {child_idx}"
                    );
                    stack.push(child_idx);
                }
            }
        }
        for (prim, &count) in seen.iter().enumerate() {
            assert!(count > 0, "primitive {prim} is missing from every leaf");
        }
    }
}
