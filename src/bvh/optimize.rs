use glam::Vec3;

use super::layout::NO_PARENT;
use super::Bvh;
use crate::math::half_area;
use crate::ray::MISS;

fn sa(min: Vec3, max: Vec3) -> f32 {
    half_area(max - min)
}

impl Bvh<'_> {
    /// One pass of insertion-based reorganization, after "Fast
    /// Insertion-Based Optimization of Bounding Volume Hierarchies"
    /// (Bittner et al.). Requires the verbose layout. A random interior
    /// node is cut out and its two subtrees are reinserted wherever they
    /// grow the tree least; call repeatedly to drive the SAH cost down.
    pub fn optimize(&mut self) {
        assert!(
            !self.verbose.is_empty(),
            "optimize requires the verbose layout"
        );
        let used = self.verbose.len() as u32;
        // pick a random node that is neither a leaf nor one of the two
        // levels directly under the root
        let nid = loop {
            self.opt_seed ^= self.opt_seed << 13;
            self.opt_seed ^= self.opt_seed >> 17;
            self.opt_seed ^= self.opt_seed << 5;
            let nid = 2 + self.opt_seed % (used - 2);
            let node = &self.verbose[nid as usize];
            if node.parent == 0 || node.is_leaf() {
                continue;
            }
            if self.verbose[node.parent as usize].parent == 0 {
                continue;
            }
            break nid;
        };
        // snip: the grandparent adopts the sibling, freeing P and N
        let pid = self.verbose[nid as usize].parent;
        let p = self.verbose[pid as usize];
        let x1 = p.parent;
        let x2 = if p.left == nid { p.right } else { p.left };
        if self.verbose[x1 as usize].left == pid {
            self.verbose[x1 as usize].left = x2;
        } else {
            self.verbose[x1 as usize].right = x2;
        }
        self.verbose[x2 as usize].parent = x1;
        let x2_sibling = if self.verbose[x1 as usize].left == x2 {
            self.verbose[x1 as usize].right
        } else {
            self.verbose[x1 as usize].left
        };
        self.verbose[x2 as usize].sibling = x2_sibling;
        self.verbose[x2_sibling as usize].sibling = x2;
        let left = self.verbose[nid as usize].left;
        let right = self.verbose[nid as usize].right;
        self.refit_up_verbose(x1);
        // the freed slots P and N become the new interior nodes
        self.reinsert_node(left, pid, x1);
        self.reinsert_node(right, nid, x1);
    }

    /// Recompute ancestor bounds from `node_idx` up to the root.
    fn refit_up_verbose(&mut self, mut node_idx: u32) {
        while node_idx != NO_PARENT {
            let node = self.verbose[node_idx as usize];
            let left = self.verbose[node.left as usize];
            let right = self.verbose[node.right as usize];
            self.verbose[node_idx as usize].aabb_min = left.aabb_min.min(right.aabb_min);
            self.verbose[node_idx as usize].aabb_max = left.aabb_max.max(right.aabb_max);
            node_idx = node.parent;
        }
    }

    /// Branch-and-bound search for the subtree whose pairing with `lid`
    /// grows the tree least: direct cost is the merged surface area, the
    /// induced cost is the growth forced onto the ancestors. Candidates
    /// are expanded best-first on a bounded task list.
    fn find_best_position(&self, lid: u32) -> u32 {
        let l = &self.verbose[lid as usize];
        let sa_l = sa(l.aabb_min, l.aabb_max);
        let epsilon = 1e-10f32;
        let mut task_node = [0u32; 512];
        let mut task_ci = [0f32; 512];
        let mut task_inv_ci = [0f32; 512];
        let mut tasks = 1usize;
        task_node[0] = 0; // root
        task_ci[0] = 0.0;
        task_inv_ci[0] = 1.0 / epsilon;
        let mut best = 0u32;
        let mut best_cost = MISS;
        while tasks > 0 {
            // extract the task with the smallest induced cost
            let mut pick = 0usize;
            let mut max_inv = 0.0f32;
            for (i, &inv) in task_inv_ci[..tasks].iter().enumerate() {
                if inv > max_inv {
                    max_inv = inv;
                    pick = i;
                }
            }
            let xid = task_node[pick];
            let ci = task_ci[pick];
            tasks -= 1;
            task_node[pick] = task_node[tasks];
            task_ci[pick] = task_ci[tasks];
            task_inv_ci[pick] = task_inv_ci[tasks];

            if ci + sa_l >= best_cost {
                break; // no remaining candidate can win
            }
            let x = &self.verbose[xid as usize];
            let direct = sa(
                l.aabb_min.min(x.aabb_min),
                l.aabb_max.max(x.aabb_max),
            );
            let cost = ci + direct;
            if cost < best_cost {
                best_cost = cost;
                best = xid;
            }
            let induced = cost - sa(x.aabb_min, x.aabb_max);
            if induced + sa_l < best_cost && !x.is_leaf() && tasks + 2 <= task_node.len() {
                for child in [x.left, x.right] {
                    task_node[tasks] = child;
                    task_ci[tasks] = induced;
                    task_inv_ci[tasks] = 1.0 / (induced + epsilon);
                    tasks += 1;
                }
            }
        }
        best
    }

    /// Splice `lid` back into the tree as the sibling of the best position
    /// found, reusing the freed slot `nid` as their new shared parent.
    fn reinsert_node(&mut self, lid: u32, nid: u32, origin: u32) {
        let mut best = self.find_best_position(lid);
        if best == 0 || self.verbose[best as usize].parent == 0 {
            best = origin; // never pair up with the root or its children
        }
        let x1 = self.verbose[best as usize].parent;
        let best_node = self.verbose[best as usize];
        let l_node = self.verbose[lid as usize];
        let n = &mut self.verbose[nid as usize];
        n.left = best;
        n.right = lid;
        n.aabb_min = best_node.aabb_min.min(l_node.aabb_min);
        n.aabb_max = best_node.aabb_max.max(l_node.aabb_max);
        n.parent = x1;
        if self.verbose[x1 as usize].left == best {
            self.verbose[x1 as usize].left = nid;
        } else {
            self.verbose[x1 as usize].right = nid;
        }
        let n_sibling = if self.verbose[x1 as usize].left == nid {
            self.verbose[x1 as usize].right
        } else {
            self.verbose[x1 as usize].left
        };
        self.verbose[nid as usize].sibling = n_sibling;
        self.verbose[n_sibling as usize].sibling = nid;
        self.verbose[best as usize].parent = nid;
        self.verbose[best as usize].sibling = lid;
        self.verbose[lid as usize].parent = nid;
        self.verbose[lid as usize].sibling = best;
        self.refit_up_verbose(nid);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use crate::{Layout, Ray};
    use glam::Vec3;

    fn verify_verbose(bvh: &Bvh) {
        let verbose = bvh.verbose_nodes();
        let mut stack = vec![0u32];
        let mut leaf_tris = 0;
        while let Some(idx) = stack.pop() {
            let node = &verbose[idx as usize];
            assert!(node.aabb_min.cmple(node.aabb_max).all());
            if node.is_leaf() {
                leaf_tris += node.tri_count;
                continue;
            }
            for (child, sibling) in [(node.left, node.right), (node.right, node.left)] {
                let c = &verbose[child as usize];
                assert_eq!(c.parent, idx);
                assert_eq!(c.sibling, sibling);
                let eps = Vec3::splat(1e-4);
                assert!(
                    (node.aabb_min - eps).cmple(c.aabb_min).all()
                        && (node.aabb_max + eps).cmpge(c.aabb_max).all(),
                    "node {idx} does not bound child {child}"
                );
                stack.push(child);
            }
        }
        assert_eq!(leaf_tris as usize, bvh.prim_count());
    }

    #[test]
    fn passes_keep_the_tree_valid() {
        let verts = triangle_soup(200, 10.0, 1.0, 101);
        let mut bvh = Bvh::new();
        bvh.build(&verts, 200);
        bvh.convert(Layout::Wald32, Layout::Verbose);
        for _ in 0..500 {
            bvh.optimize();
        }
        verify_verbose(&bvh);
        bvh.convert(Layout::Verbose, Layout::Wald32);
        check_tree(&bvh);
    }

    #[test]
    fn many_passes_reduce_the_sah_cost() {
        // a soup of stretched triangles leaves plenty of overlap to fix
        let verts = triangle_soup(250, 8.0, 2.5, 77);
        let mut bvh = Bvh::new();
        bvh.build(&verts, 250);
        let before = bvh.sah_cost(0);
        bvh.convert(Layout::Wald32, Layout::Verbose);
        for _ in 0..3000 {
            bvh.optimize();
        }
        bvh.convert(Layout::Verbose, Layout::Wald32);
        let after = bvh.sah_cost(0);
        println!("sah cost {before} -> {after}");
        assert!(after < before);
        check_tree(&bvh);
    }

    #[test]
    fn optimized_tree_returns_the_same_hits() {
        let verts = triangle_soup(150, 6.0, 1.5, 13);
        let mut bvh = Bvh::new();
        bvh.build(&verts, 150);
        let mut reference = Bvh::new();
        reference.build(&verts, 150);

        bvh.convert(Layout::Wald32, Layout::Verbose);
        for _ in 0..800 {
            bvh.optimize();
        }
        bvh.convert(Layout::Verbose, Layout::Wald32);

        let mut rng = Rng::new(9);
        for _ in 0..100 {
            let origin = Vec3::new(0.0, 0.0, -20.0);
            let target = Vec3::new(
                rng.next_range(-6.0, 6.0),
                rng.next_range(-6.0, 6.0),
                rng.next_range(-6.0, 6.0),
            );
            let mut a = Ray::new(origin, target - origin);
            let mut b = Ray::new(origin, target - origin);
            reference.intersect(&mut a, Layout::Wald32);
            bvh.intersect(&mut b, Layout::Wald32);
            assert_eq!(a.hit.is_hit(), b.hit.is_hit());
            if a.hit.is_hit() {
                assert_eq!(a.hit.prim, b.hit.prim);
                assert!((a.hit.t - b.hit.t).abs() <= 1e-4 * a.hit.t);
            }
        }
    }

    #[test]
    fn fixed_seed_makes_passes_reproducible() {
        let verts = triangle_soup(120, 6.0, 1.0, 55);
        let run = || {
            let mut bvh = Bvh::new();
            bvh.build(&verts, 120);
            bvh.convert(Layout::Wald32, Layout::Verbose);
            for _ in 0..200 {
                bvh.optimize();
            }
            bvh.convert(Layout::Verbose, Layout::Wald32);
            bvh.sah_cost(0)
        };
        assert_eq!(run(), run());
    }
}
