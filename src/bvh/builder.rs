use glam::{IVec3, Vec3, Vec4};

use super::{tri_bounds, Aabb, Bvh, BvhNode, Fragment, SAH_BINS};
use crate::ray::MISS;

/// Split candidate produced by the bin sweep.
pub(crate) struct Split {
    pub cost: f32,
    pub axis: usize,
    pub pos: usize,
    pub left: Aabb,
    pub right: Aabb,
}

impl Split {
    pub fn none() -> Self {
        Split {
            cost: MISS,
            axis: 0,
            pos: 0,
            left: Aabb::EMPTY,
            right: Aabb::EMPTY,
        }
    }
}

impl<'a> Bvh<'a> {
    /// Binned-SAH construction. This is the reference builder: a decent
    /// tree at a fraction of the cost of [`Bvh::build_hq`].
    ///
    /// `verts` holds three consecutive entries per triangle and must stay
    /// alive and unchanged for as long as the tree is traversed.
    pub fn build(&mut self, verts: &'a [Vec4], prim_count: usize) {
        assert!(prim_count > 0, "cannot build over zero primitives");
        assert!(
            verts.len() >= prim_count * 3,
            "vertex array too short for {prim_count} triangles"
        );
        assert!(
            self.rebuildable,
            "tree was layout-converted; rebuilds require a fresh instance"
        );
        self.verts = verts;
        self.tri_count = prim_count;
        self.nodes.clear();
        self.tri_idx.clear();
        self.fragments.clear();

        // one fragment per input triangle, root bounds on the fly
        let mut root_bounds = Aabb::EMPTY;
        for i in 0..prim_count {
            let (bmin, bmax) = tri_bounds(verts, i);
            self.fragments.push(Fragment {
                bmin,
                prim: i as u32,
                bmax,
                clipped: 0,
            });
            root_bounds.grow_point(bmin);
            root_bounds.grow_point(bmax);
            self.tri_idx.push(i as u32);
        }
        self.nodes.push(BvhNode {
            aabb_min: root_bounds.min,
            left_first: 0,
            aabb_max: root_bounds.max,
            tri_count: prim_count as u32,
        });
        self.nodes.push(BvhNode::default()); // slot 1 stays unused

        let min_dim = root_bounds.extent() * 1e-20;
        let mut task = [0u32; 256];
        let mut task_count = 0;
        let mut node_idx = 0usize;
        loop {
            loop {
                let node = self.nodes[node_idx];
                let split = self.find_object_split(&node, min_dim);
                if split.cost >= node.leaf_cost() {
                    break; // not splitting is better
                }

                // in-place partition of the node's index range
                let rpd = SAH_BINS as f32 / (node.aabb_max[split.axis] - node.aabb_min[split.axis]);
                let nmin = node.aabb_min[split.axis];
                let mut src = node.left_first;
                let mut j = node.left_first + node.tri_count;
                for _ in 0..node.tri_count {
                    let frag = &self.fragments[self.tri_idx[src as usize] as usize];
                    let centroid = (frag.bmin[split.axis] + frag.bmax[split.axis]) * 0.5;
                    let bin = (((centroid - nmin) * rpd) as i32).clamp(0, SAH_BINS as i32 - 1);
                    if bin as usize <= split.pos {
                        src += 1;
                    } else {
                        j -= 1;
                        self.tri_idx.swap(src as usize, j as usize);
                    }
                }

                let left_count = src - node.left_first;
                let right_count = node.tri_count - left_count;
                if left_count == 0 || right_count == 0 {
                    break; // degenerate partition, keep the leaf
                }
                let left_child = self.nodes.len() as u32;
                self.nodes.push(BvhNode {
                    aabb_min: split.left.min,
                    left_first: node.left_first,
                    aabb_max: split.left.max,
                    tri_count: left_count,
                });
                self.nodes.push(BvhNode {
                    aabb_min: split.right.min,
                    left_first: j,
                    aabb_max: split.right.max,
                    tri_count: right_count,
                });
                self.nodes[node_idx].left_first = left_child;
                self.nodes[node_idx].tri_count = 0;

                debug_assert!(task_count < task.len());
                task[task_count] = left_child + 1;
                task_count += 1;
                node_idx = left_child as usize;
            }
            if task_count == 0 {
                break;
            }
            task_count -= 1;
            node_idx = task[task_count] as usize;
        }
        self.refittable = true;
    }

    /// Bin the node's fragments over all three axes at once and sweep for
    /// the cheapest object split. Axes thinner than `min_dim` are skipped.
    pub(crate) fn find_object_split(&self, node: &BvhNode, min_dim: Vec3) -> Split {
        let mut bins = [[Aabb::EMPTY; SAH_BINS]; 3];
        let mut counts = [[0u32; SAH_BINS]; 3];
        let rpd = Vec3::splat(SAH_BINS as f32) / (node.aabb_max - node.aabb_min);
        for i in 0..node.tri_count {
            let frag = &self.fragments[self.tri_idx[(node.left_first + i) as usize] as usize];
            let bin = (((frag.bmin + frag.bmax) * 0.5 - node.aabb_min) * rpd)
                .as_ivec3()
                .clamp(IVec3::ZERO, IVec3::splat(SAH_BINS as i32 - 1));
            for a in 0..3 {
                let b = bin[a] as usize;
                bins[a][b].grow(&frag.bounds());
                counts[a][b] += 1;
            }
        }

        let mut best = Split::none();
        for a in 0..3 {
            if node.aabb_max[a] - node.aabb_min[a] <= min_dim[a] {
                continue;
            }
            // prefix sweeps from both ends
            let mut left_bounds = [Aabb::EMPTY; SAH_BINS - 1];
            let mut right_bounds = [Aabb::EMPTY; SAH_BINS - 1];
            let mut cost_left = [MISS; SAH_BINS - 1];
            let mut cost_right = [MISS; SAH_BINS - 1];
            let mut l = Aabb::EMPTY;
            let mut r = Aabb::EMPTY;
            let (mut ln, mut rn) = (0u32, 0u32);
            for i in 0..SAH_BINS - 1 {
                l.grow(&bins[a][i]);
                left_bounds[i] = l;
                r.grow(&bins[a][SAH_BINS - 1 - i]);
                right_bounds[SAH_BINS - 2 - i] = r;
                ln += counts[a][i];
                rn += counts[a][SAH_BINS - 1 - i];
                cost_left[i] = if ln == 0 { MISS } else { l.half_area() * ln as f32 };
                cost_right[SAH_BINS - 2 - i] =
                    if rn == 0 { MISS } else { r.half_area() * rn as f32 };
            }
            for i in 0..SAH_BINS - 1 {
                let cost = cost_left[i] + cost_right[i];
                if cost < best.cost {
                    best = Split {
                        cost,
                        axis: a,
                        pos: i,
                        left: left_bounds[i],
                        right: right_bounds[i],
                    };
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;

    #[test]
    fn single_triangle_builds_a_leaf_root() {
        let verts = vec![
            Vec4::new(0.0, 0.0, 0.0, 0.0),
            Vec4::new(1.0, 0.0, 0.0, 0.0),
            Vec4::new(0.0, 1.0, 0.0, 0.0),
        ];
        let mut bvh = Bvh::new();
        bvh.build(&verts, 1);
        let root = &bvh.nodes()[0];
        assert!(root.is_leaf());
        assert_eq!(root.tri_count, 1);
        assert_eq!(root.aabb_min, Vec3::ZERO);
        assert_eq!(root.aabb_max, Vec3::new(1.0, 1.0, 0.0));
        check_tree(&bvh);
    }

    #[test]
    fn two_separated_triangles_split_into_leaf_children() {
        let verts = vec![
            Vec4::new(0.0, 0.0, 0.0, 0.0),
            Vec4::new(1.0, 0.0, 0.0, 0.0),
            Vec4::new(0.0, 1.0, 0.0, 0.0),
            Vec4::new(2.0, 0.0, 0.0, 0.0),
            Vec4::new(3.0, 0.0, 0.0, 0.0),
            Vec4::new(2.0, 1.0, 0.0, 0.0),
        ];
        let mut bvh = Bvh::new();
        bvh.build(&verts, 2);
        let root = &bvh.nodes()[0];
        assert!(!root.is_leaf());
        let left = &bvh.nodes()[root.left_first as usize];
        let right = &bvh.nodes()[root.left_first as usize + 1];
        assert!(left.is_leaf() && right.is_leaf());
        assert_eq!(left.tri_count + right.tri_count, 2);
        check_tree(&bvh);
    }

    #[test]
    fn soup_build_covers_every_primitive() {
        let verts = triangle_soup(500, 20.0, 1.0, 42);
        let mut bvh = Bvh::new();
        bvh.build(&verts, 500);
        check_tree(&bvh);
        // node pool usage never exceeds 2N
        assert!(bvh.nodes().len() <= 1000);
    }

    #[test]
    fn rebuild_reuses_the_instance() {
        let verts_a = triangle_soup(80, 10.0, 1.0, 1);
        let verts_b = triangle_soup(120, 10.0, 1.0, 2);
        let mut bvh = Bvh::new();
        bvh.build(&verts_a, 80);
        bvh.build(&verts_b, 120);
        assert_eq!(bvh.prim_count(), 120);
        check_tree(&bvh);
    }

    #[test]
    fn planar_scene_builds_despite_zero_extent_axis() {
        // all triangles in the z = 0 plane
        let mut verts = Vec::new();
        for i in 0..16 {
            let x = i as f32 * 2.0;
            verts.push(Vec4::new(x, 0.0, 0.0, 0.0));
            verts.push(Vec4::new(x + 1.0, 0.0, 0.0, 0.0));
            verts.push(Vec4::new(x, 1.0, 0.0, 0.0));
        }
        let mut bvh = Bvh::new();
        bvh.build(&verts, 16);
        check_tree(&bvh);
        assert!(!bvh.nodes()[0].is_leaf());
    }
}
